//! # Storage Backends
//!
//! Implementations of [`Persistence`] plus the local user profile.
//!
//! ## On-disk Layout
//!
//! ```text
//! <data-dir>/
//!   forums.json                      forum directory
//!   <name>_<hash>_msg.json           one message log per forum
//!   profile.json                     local user profile
//!   node.key                         transport keypair (see identity)
//! ```
//!
//! The forum name is sanitized for the file name (anything outside
//! `[A-Za-z0-9-]` becomes `_`) and suffixed with a short BLAKE3 hash of the
//! raw name, so names that sanitize alike do not share a file.
//!
//! Writes go to a temporary file that is then renamed over the target, so a
//! crash mid-write leaves the previous version intact.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::identity::now_ms;
use crate::messages::{Forum, Message};
use crate::protocols::Persistence;

const DIRECTORY_FILE: &str = "forums.json";
const PROFILE_FILE: &str = "profile.json";
const MESSAGE_FILE_SUFFIX: &str = "_msg.json";

/// File name of the message log for `forum`.
pub fn message_file_name(forum: &str) -> String {
    let sanitized: String = forum
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let digest = blake3::hash(forum.as_bytes());
    format!(
        "{}_{}{}",
        sanitized,
        &digest.to_hex()[..8],
        MESSAGE_FILE_SUFFIX
    )
}

/// JSON files under one data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete message logs not written for longer than `ttl`.
    ///
    /// Returns the number of files removed. The directory itself and the
    /// profile are never swept.
    pub fn sweep_expired(&self, ttl: Duration) -> Result<usize> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(MESSAGE_FILE_SUFFIX) {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            if let Some(age) = age
                && age > ttl
            {
                fs::remove_file(entry.path())
                    .with_context(|| format!("failed to remove {}", name))?;
                info!(file = %name, age_secs = age.as_secs(), "removed expired message log");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn load_profile(&self) -> Result<Option<UserProfile>> {
        let path = self.dir.join(PROFILE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        write_json(&self.dir.join(PROFILE_FILE), profile)
    }

    fn message_path(&self, forum: &str) -> PathBuf {
        self.dir.join(message_file_name(forum))
    }
}

impl Persistence for JsonFileStore {
    fn load_directory(&self) -> Result<Vec<Forum>> {
        let path = self.dir.join(DIRECTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    fn save_directory(&self, forums: &[Forum]) -> Result<()> {
        write_json(&self.dir.join(DIRECTORY_FILE), &forums)
    }

    fn load_messages(&self, forum: &str) -> Result<Vec<Message>> {
        let path = self.message_path(forum);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    fn save_messages(&self, forum: &str, messages: &[Message]) -> Result<()> {
        write_json(&self.message_path(forum), &messages)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    debug!(path = %path.display(), "wrote");
    Ok(())
}

/// Local user settings for the interactive shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// `usr-<unix ms>` assigned on first save.
    pub id: String,
    pub username: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Name of the forum joined most recently, if any.
    #[serde(default)]
    pub last_forum: Option<String>,
}

impl UserProfile {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: format!("usr-{}", now_ms()),
            username: username.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            last_forum: None,
        }
    }
}

/// In-memory [`Persistence`] for tests and ephemeral nodes.
///
/// [`set_failing`](Self::set_failing) makes every write fail, for exercising
/// the persistence-failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    directory: Mutex<Vec<Forum>>,
    logs: Mutex<HashMap<String, Vec<Message>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("memory store is set to fail writes");
        }
        Ok(())
    }
}

impl Persistence for MemoryStore {
    fn load_directory(&self) -> Result<Vec<Forum>> {
        let directory = self
            .directory
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(directory.clone())
    }

    fn save_directory(&self, forums: &[Forum]) -> Result<()> {
        self.check_writable()?;
        let mut directory = self
            .directory
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *directory = forums.to_vec();
        Ok(())
    }

    fn load_messages(&self, forum: &str) -> Result<Vec<Message>> {
        let logs = self
            .logs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(logs.get(forum).cloned().unwrap_or_default())
    }

    fn save_messages(&self, forum: &str, messages: &[Message]) -> Result<()> {
        self.check_writable()?;
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        logs.insert(forum.to_string(), messages.to_vec());
        Ok(())
    }
}
