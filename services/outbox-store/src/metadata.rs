//! Metadata: durable key-value state of the store session
//!
//! Counters and small values (sequence, pending offset, accepted types,
//! server identity) live in memory and reach stable storage only on an
//! explicit `commit`. A crash between a mutation and the next commit loses
//! that mutation, which the next reconciliation with the peer recomputes.

use serde_json::{Map, Value as JsonValue};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed metadata file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ── Metadata Store ──────────────────────────────────────────────────

/// Key-value collaborator holding the store's session state.
pub trait MetadataStore: Send {
    /// Current value of `key`, if set.
    fn get(&self, key: &str) -> Option<JsonValue>;

    /// Set `key` in memory; durable only after [`commit`](Self::commit).
    fn set(&mut self, key: &str, value: JsonValue);

    /// Remove `key` in memory.
    fn remove(&mut self, key: &str);

    /// Flush the current state to stable storage.
    fn commit(&mut self) -> Result<(), MetadataError>;
}

/// In-memory metadata, for tests and ephemeral stores.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetadata {
    values: Map<String, JsonValue>,
    commits: usize,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `commit` has been called.
    pub fn commit_count(&self) -> usize {
        self.commits
    }
}

impl MetadataStore for MemoryMetadata {
    fn get(&self, key: &str) -> Option<JsonValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: JsonValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn commit(&mut self) -> Result<(), MetadataError> {
        self.commits += 1;
        Ok(())
    }
}

/// Metadata persisted as a single JSON object on disk.
#[derive(Debug)]
pub struct JsonFileMetadata {
    path: PathBuf,
    values: Map<String, JsonValue>,
}

impl JsonFileMetadata {
    /// Open the metadata file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|source| MetadataError::Malformed {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(MetadataError::Io(e)),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for JsonFileMetadata {
    fn get(&self, key: &str) -> Option<JsonValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: JsonValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Atomic write: write to tmp, fsync, rename.
    fn commit(&mut self) -> Result<(), MetadataError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = serde_json::to_vec_pretty(&self.values)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), keys = self.values.len(), "Metadata committed");
        Ok(())
    }
}
