//! Durable snapshots of stream records, keyed by message id.
//!
//! The snapshot is the write-ahead copy of a record: the state machine saves it
//! before touching its in-memory table. Live-only parts of a record (the abort
//! handle, an attached renderer) are never serialised.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::{FsyncPolicy, PersistenceCfg};
use crate::error::{ChatStreamError, CoreResult};
use crate::model::{StreamStatus, ToolCall};

/// Key prefix in the shared snapshot key space.
pub const STREAM_STATE_PREFIX: &str = "stream_state_";

/// Plain-data projection of a stream record, in its on-disk shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub content: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub speed: f64,
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the generation started (ms since epoch).
    pub timestamp: i64,
    #[serde(rename = "savedAt")]
    pub saved_at: i64,
    #[serde(rename = "pausedAt", default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
    #[serde(rename = "completedAt", default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(rename = "isContentComplete", default)]
    pub is_content_complete: bool,
    #[serde(rename = "isPausedForUI", default)]
    pub is_paused_for_ui: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Flat string key/value space, the moral equivalent of browser local storage.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> CoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> CoreResult<()>;
    fn remove(&self, key: &str) -> CoreResult<()>;
    fn keys(&self) -> CoreResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn keys(&self) -> CoreResult<Vec<String>> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// One JSON file per key under `dir`, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    fsync: FsyncPolicy,
}

impl FileSnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, fsync: FsyncPolicy) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, fsync })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

const FILE_SUFFIX: &str = ".json";

// Keys are message ids chosen by the caller; anything outside a safe charset is hex-escaped.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl SnapshotStore for FileSnapshotStore {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value.as_bytes())?;
        if self.fsync != FsyncPolicy::Off {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(self.path_for(key))
            .map_err(|e| ChatStreamError::Storage(format!("persist {key}: {}", e.error)))?;
        if self.fsync == FsyncPolicy::Always {
            fs::File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> CoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(FILE_SUFFIX)
                && let Some(key) = decode_key(stem)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Typed access to snapshots under the stream-state prefix.
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn SnapshotStore>,
    prefix: String,
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_prefix(store, STREAM_STATE_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn SnapshotStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()))
    }

    /// Build the adapter described by config: file-backed when a directory is set.
    pub fn from_config(cfg: &PersistenceCfg) -> CoreResult<Self> {
        let store: Arc<dyn SnapshotStore> = match &cfg.dir {
            Some(dir) => Arc::new(FileSnapshotStore::open(dir, cfg.fsync)?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Ok(Self::with_prefix(store, cfg.key_prefix.clone()))
    }

    pub fn key(&self, message_id: &str) -> String {
        format!("{}{}", self.prefix, message_id)
    }

    pub fn save(&self, message_id: &str, snapshot: &StreamSnapshot) -> CoreResult<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| ChatStreamError::Storage(format!("encode snapshot: {e}")))?;
        self.store.set(&self.key(message_id), &json)
    }

    /// A snapshot that fails to decode is reported and treated as absent.
    pub fn load(&self, message_id: &str) -> CoreResult<Option<StreamSnapshot>> {
        let Some(raw) = self.store.get(&self.key(message_id))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(message_id, error = %e, "discarding corrupt stream snapshot");
                Ok(None)
            }
        }
    }

    pub fn remove(&self, message_id: &str) -> CoreResult<()> {
        self.store.remove(&self.key(message_id))
    }

    /// Message ids that currently have a snapshot.
    pub fn message_ids(&self) -> CoreResult<Vec<String>> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}
