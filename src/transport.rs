//! # QUIC Peer Transport
//!
//! One QUIC connection per peer, mutually authenticated with self-signed
//! Ed25519 certificates (see [`crypto`](crate::crypto)). The verified
//! certificate key is the peer's [`Identity`].
//!
//! ## Connection Layout
//!
//! ```text
//!            ┌────────────── QUIC connection ──────────────┐
//!  writer ──►│ uni stream (ours)   [len u32 BE][json] ...  │
//!  reader ◄──│ uni stream (theirs) [len u32 BE][json] ...  │
//!            └─────────────────────────────────────────────┘
//! ```
//!
//! Each side opens exactly one unidirectional stream and writes
//! length-prefixed envelopes to it in order. Per connection:
//!
//! - a **writer task** drains the [`PeerLink`] queue; every frame must be
//!   written within `write_timeout` or the connection is closed. Frames over
//!   `max_frame_size` are dropped unsent, since the peer would close on them
//! - a **reader task** forwards complete frames to the router as
//!   [`TransportEvent::Data`], in arrival order
//!
//! When the router drops a link (peer unregistered, or a duplicate connection
//! refused) the writer closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use quinn::{ClientConfig, Connection, Endpoint};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::crypto::{
    create_client_config, create_server_config, extract_verified_identity, generate_ed25519_cert,
    identity_to_sni,
};
use crate::identity::{Identity, Keypair};
use crate::protocols::TransportEvent;
use crate::registry::{ConnectionId, Frame, PeerLink};

/// Application close codes.
const CLOSE_NORMAL: u32 = 0;
const CLOSE_WRITE_FAILED: u32 = 1;
const CLOSE_FRAME_TOO_LARGE: u32 = 2;
const CLOSE_UNVERIFIED: u32 = 3;

/// Time allowed for the QUIC handshake when dialing.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct QuicTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    events: mpsc::Sender<TransportEvent>,
    next_connection: AtomicU64,
    write_timeout: Duration,
    outbound_queue: usize,
    max_frame_size: usize,
}

impl QuicTransport {
    /// Bind a QUIC endpoint on `addr`. Must be called inside a Tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        keypair: &Keypair,
        config: &NodeConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<Self>> {
        let (server_certs, server_key) = generate_ed25519_cert(keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(keypair)?;

        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;

        Ok(Arc::new(Self {
            endpoint,
            client_config,
            events,
            next_connection: AtomicU64::new(1),
            write_timeout: config.write_timeout,
            outbound_queue: config.outbound_queue.max(1),
            max_frame_size: config.max_frame_size,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to read local address")
    }

    /// Accept inbound connections until the endpoint is closed.
    pub fn spawn_accept_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(incoming) = transport.endpoint.accept().await {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let remote = incoming.remote_address();
                    match incoming.await {
                        Ok(connection) => {
                            if let Err(e) = transport.attach(connection).await {
                                debug!(remote = %remote, error = %e, "inbound connection dropped");
                            }
                        }
                        Err(e) => debug!(remote = %remote, error = %e, "inbound handshake failed"),
                    }
                });
            }
            debug!("accept loop finished");
        })
    }

    /// Connect to `peer` at `addr`. The handshake fails unless the remote
    /// certificate carries `peer`'s key.
    pub async fn dial(&self, peer: Identity, addr: SocketAddr) -> Result<Identity> {
        let sni = identity_to_sni(&peer);
        debug!(addr = %addr, peer = %peer.short(), "dialing");

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)
            .with_context(|| format!("failed to initiate connection to {}", addr))?;
        let connection = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("connection to {} timed out", addr))?
            .with_context(|| format!("failed to establish connection to {}", addr))?;

        let verified = self.attach(connection).await?;
        if verified != peer {
            bail!("peer at {} presented identity {}", addr, verified.short());
        }
        Ok(verified)
    }

    /// Close every connection and stop accepting.
    pub fn close(&self) {
        self.endpoint.close(CLOSE_NORMAL.into(), b"shutdown");
    }

    /// Hand a verified connection to the router and start its I/O tasks.
    ///
    /// `Connected` is delivered before the reader starts, so the router has
    /// registered (or refused) the connection before any of its frames arrive.
    async fn attach(&self, connection: Connection) -> Result<Identity> {
        let remote = connection.remote_address();
        let Some(peer) = extract_verified_identity(&connection) else {
            warn!(remote = %remote, "rejecting connection: could not verify peer identity");
            connection.close(CLOSE_UNVERIFIED.into(), b"unverified");
            bail!("could not verify peer identity from certificate");
        };

        let id: ConnectionId = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (link, frames) = PeerLink::channel(id, self.outbound_queue);

        tokio::spawn(write_frames(
            connection.clone(),
            frames,
            self.write_timeout,
            self.max_frame_size,
        ));

        self.events
            .send(TransportEvent::Connected { peer, link })
            .await
            .map_err(|_| anyhow::anyhow!("router is gone"))?;
        info!(remote = %remote, peer = %peer.short(), connection = id, "peer link up");

        tokio::spawn(read_frames(
            connection,
            peer,
            id,
            self.max_frame_size,
            self.events.clone(),
        ));
        Ok(peer)
    }
}

impl std::fmt::Debug for QuicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport")
            .field("local_addr", &self.endpoint.local_addr().ok())
            .finish_non_exhaustive()
    }
}

async fn write_frames(
    connection: Connection,
    mut frames: mpsc::Receiver<Frame>,
    write_timeout: Duration,
    max_frame_size: usize,
) {
    let mut send = match connection.open_uni().await {
        Ok(send) => send,
        Err(e) => {
            debug!(error = %e, "failed to open outbound stream");
            return;
        }
    };

    while let Some(frame) = frames.recv().await {
        if frame.len() > max_frame_size {
            warn!(
                remote = %connection.remote_address(),
                bytes = frame.len(),
                limit = max_frame_size,
                "outbound frame over limit, dropped"
            );
            continue;
        }
        let len = frame.len() as u32;
        let written = tokio::time::timeout(write_timeout, async {
            send.write_all(&len.to_be_bytes()).await?;
            send.write_all(&frame).await
        })
        .await;

        match written {
            Ok(Ok(())) => trace!(bytes = frame.len(), "frame written"),
            Ok(Err(e)) => {
                debug!(remote = %connection.remote_address(), error = %e, "write failed");
                connection.close(CLOSE_WRITE_FAILED.into(), b"write failed");
                return;
            }
            Err(_) => {
                warn!(remote = %connection.remote_address(), "write timed out, closing connection");
                connection.close(CLOSE_WRITE_FAILED.into(), b"write timeout");
                return;
            }
        }
    }

    // Link dropped by the router.
    let _ = send.finish();
    connection.close(CLOSE_NORMAL.into(), b"closed");
}

async fn read_frames(
    connection: Connection,
    peer: Identity,
    id: ConnectionId,
    max_frame_size: usize,
    events: mpsc::Sender<TransportEvent>,
) {
    let end = read_loop(&connection, peer, id, max_frame_size, &events).await;
    let event = match end {
        Ok(()) => TransportEvent::Closed {
            peer,
            connection: id,
        },
        Err(error) => TransportEvent::Error {
            peer,
            connection: id,
            error,
        },
    };
    let _ = events.send(event).await;
}

/// Read frames until the stream or connection ends. `Err` carries the reason
/// for an abnormal end.
async fn read_loop(
    connection: &Connection,
    peer: Identity,
    id: ConnectionId,
    max_frame_size: usize,
    events: &mpsc::Sender<TransportEvent>,
) -> Result<(), String> {
    let mut recv = match connection.accept_uni().await {
        Ok(recv) => recv,
        Err(e) if is_normal_close(&e) => return Ok(()),
        Err(e) => return Err(e.to_string()),
    };

    loop {
        let mut len_buf = [0u8; 4];
        match recv.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(()),
            Err(quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(e)))
                if is_normal_close(&e) =>
            {
                return Ok(());
            }
            Err(e) => return Err(e.to_string()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_frame_size {
            connection.close(CLOSE_FRAME_TOO_LARGE.into(), b"frame too large");
            return Err(format!("frame of {} bytes exceeds limit {}", len, max_frame_size));
        }

        let mut bytes = vec![0u8; len];
        recv.read_exact(&mut bytes).await.map_err(|e| e.to_string())?;

        let event = TransportEvent::Data {
            peer,
            connection: id,
            bytes,
        };
        if events.send(event).await.is_err() {
            return Ok(());
        }
    }
}

fn is_normal_close(error: &quinn::ConnectionError) -> bool {
    matches!(
        error,
        quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::LocallyClosed
            | quinn::ConnectionError::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound() -> (Arc<QuicTransport>, mpsc::Receiver<TransportEvent>, Keypair) {
        bound_with(&NodeConfig::default()).await
    }

    async fn bound_with(
        config: &NodeConfig,
    ) -> (Arc<QuicTransport>, mpsc::Receiver<TransportEvent>, Keypair) {
        let keypair = Keypair::generate();
        let (tx, rx) = mpsc::channel(16);
        let transport =
            QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &keypair, config, tx).unwrap();
        transport.spawn_accept_loop();
        (transport, rx, keypair)
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn frames_cross_a_connection() {
        let (a, mut a_events, a_key) = bound().await;
        let (b, mut b_events, b_key) = bound().await;

        let dialed = a.dial(b_key.identity(), b.local_addr().unwrap()).await.unwrap();
        assert_eq!(dialed, b_key.identity());

        let TransportEvent::Connected { peer, link } = next_event(&mut a_events).await else {
            panic!("expected Connected on dialer");
        };
        assert_eq!(peer, b_key.identity());

        let TransportEvent::Connected { peer, link: _b_link } = next_event(&mut b_events).await else {
            panic!("expected Connected on listener");
        };
        assert_eq!(peer, a_key.identity());

        assert!(link.try_send(Arc::from(&b"first"[..])));
        assert!(link.try_send(Arc::from(&b"second"[..])));

        for expected in [&b"first"[..], &b"second"[..]] {
            match next_event(&mut b_events).await {
                TransportEvent::Data { peer, bytes, .. } => {
                    assert_eq!(peer, a_key.identity());
                    assert_eq!(bytes, expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn dial_rejects_wrong_identity() {
        let (a, _a_events, _) = bound().await;
        let (b, _b_events, _) = bound().await;

        let impostor = Keypair::generate().identity();
        assert!(a.dial(impostor, b.local_addr().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn dropping_link_closes_connection() {
        let (a, mut a_events, _) = bound().await;
        let (b, mut b_events, b_key) = bound().await;

        a.dial(b_key.identity(), b.local_addr().unwrap()).await.unwrap();
        let TransportEvent::Connected { link, .. } = next_event(&mut a_events).await else {
            panic!("expected Connected");
        };
        let TransportEvent::Connected { .. } = next_event(&mut b_events).await else {
            panic!("expected Connected");
        };

        drop(link);
        assert!(matches!(
            next_event(&mut b_events).await,
            TransportEvent::Closed { .. }
        ));
    }

    /// Dial `b` from `a` and return both ends' links, dialer first.
    async fn linked(
        a: &QuicTransport,
        a_events: &mut mpsc::Receiver<TransportEvent>,
        b: &QuicTransport,
        b_events: &mut mpsc::Receiver<TransportEvent>,
        b_key: &Keypair,
    ) -> (PeerLink, PeerLink) {
        a.dial(b_key.identity(), b.local_addr().unwrap()).await.unwrap();
        let TransportEvent::Connected { link, .. } = next_event(a_events).await else {
            panic!("expected Connected on dialer");
        };
        let TransportEvent::Connected { link: b_link, .. } = next_event(b_events).await else {
            panic!("expected Connected on listener");
        };
        (link, b_link)
    }

    #[tokio::test]
    async fn stalled_reader_trips_write_timeout() {
        let config = NodeConfig {
            write_timeout: Duration::from_millis(300),
            outbound_queue: 256,
            ..NodeConfig::default()
        };
        let (a, mut a_events, _) = bound_with(&config).await;
        let (b, mut b_events, b_key) = bound().await;
        let (link, _b_link) = linked(&a, &mut a_events, &b, &mut b_events, &b_key).await;
        let connection = link.id();

        // b's event channel is never drained, so its reader stops pulling
        // from the stream and flow control eventually blocks a's writer.
        let frame: Frame = Arc::from(vec![7u8; 512 * 1024]);
        for _ in 0..200 {
            if !link.try_send(frame.clone()) {
                break;
            }
        }

        let closed = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                match a_events.recv().await {
                    Some(TransportEvent::Closed { connection: c, .. })
                    | Some(TransportEvent::Error { connection: c, .. })
                        if c == connection =>
                    {
                        return true;
                    }
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .expect("write timeout never closed the connection");
        assert!(closed);
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn oversized_inbound_frame_closes_connection() {
        let small = NodeConfig {
            max_frame_size: 1024,
            ..NodeConfig::default()
        };
        let (a, mut a_events, _) = bound().await;
        let (b, mut b_events, b_key) = bound_with(&small).await;
        let (link, _b_link) = linked(&a, &mut a_events, &b, &mut b_events, &b_key).await;

        assert!(link.try_send(Arc::from(vec![1u8; 4096])));
        match next_event(&mut b_events).await {
            TransportEvent::Error { error, .. } => assert!(error.contains("exceeds limit")),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_outbound_frame_is_not_sent() {
        let small = NodeConfig {
            max_frame_size: 1024,
            ..NodeConfig::default()
        };
        let (a, mut a_events, _) = bound_with(&small).await;
        let (b, mut b_events, b_key) = bound().await;
        let (link, _b_link) = linked(&a, &mut a_events, &b, &mut b_events, &b_key).await;

        assert!(link.try_send(Arc::from(vec![1u8; 4096])));
        assert!(link.try_send(Arc::from(&b"fits"[..])));

        match next_event(&mut b_events).await {
            TransportEvent::Data { bytes, .. } => assert_eq!(bytes, b"fits"),
            other => panic!("expected Data, got {:?}", other),
        }
        assert!(!link.is_closed());
    }
}
