//! Node tuning parameters.

use std::time::Duration;

use crate::dedup::DEFAULT_DEDUP_CAPACITY;

/// Per-frame write deadline. A slower peer is disconnected.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per peer before writes to it start failing.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Largest accepted frame. Inbound frames above this close the connection.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Router command channel depth.
pub const DEFAULT_COMMAND_BUFFER: usize = 1000;

/// Depth of the transport event and UI event channels.
pub const DEFAULT_EVENT_BUFFER: usize = 1000;

/// Message logs untouched for this long are swept from disk.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(36 * 60 * 60);

/// How often the expiry sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Envelope ids remembered for flood suppression.
    pub dedup_capacity: usize,
    pub write_timeout: Duration,
    pub outbound_queue: usize,
    pub max_frame_size: usize,
    pub command_buffer: usize,
    pub event_buffer: usize,
    pub message_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            message_ttl: DEFAULT_MESSAGE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}
