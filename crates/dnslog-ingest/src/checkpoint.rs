//! Durable read position for the tailed log file.
//!
//! One JSON file per agent (`checkpoint-node-<id>.json`) in the state
//! directory. Writes go to a temp file that is renamed over the old one, so a
//! crash mid-write leaves the previous checkpoint intact.
//!
//! [`resolve_start_offset`] decides where the tailer starts on cold start by
//! comparing the stored checkpoint with the file as it is now.

use std::fs::{self, Metadata};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Persisted tailer position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Path of the tailed file when the checkpoint was taken.
    pub file_path: PathBuf,

    /// Byte offset of the first line not yet delivered.
    pub last_position: u64,

    /// File mtime when the checkpoint was taken.
    pub last_mod_time: DateTime<Utc>,

    /// File size when the checkpoint was taken.
    pub file_size: u64,

    /// When the checkpoint was written.
    pub updated_at: DateTime<Utc>,
}

/// Size and mtime of the tailed file at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileSnapshot {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Self {
            size: metadata.len(),
            modified,
        }
    }

    /// Stand-in for a file that does not exist: empty, never modified.
    pub fn absent() -> Self {
        Self {
            size: 0,
            modified: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Why the tailer starts where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReason {
    /// No usable checkpoint; backlog is skipped.
    NoCheckpoint,
    /// The checkpoint belongs to a different file path.
    PathChanged,
    /// The file is shorter than the stored position.
    Truncated,
    /// The file was replaced by a newer, smaller one.
    Recreated,
    /// The file does not exist yet.
    FileMissing,
    /// Continue from the stored position.
    Resumed,
}

/// Start offset chosen on cold start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPosition {
    pub offset: u64,
    pub reason: StartReason,
}

/// Pick the cold-start offset for `path`.
///
/// `current` is `None` when the file does not exist.
pub fn resolve_start_offset(
    checkpoint: Option<&Checkpoint>,
    path: &Path,
    current: Option<FileSnapshot>,
) -> StartPosition {
    let at = |offset, reason| StartPosition { offset, reason };

    let Some(current) = current else {
        return at(0, StartReason::FileMissing);
    };

    let Some(cp) = checkpoint else {
        return at(current.size, StartReason::NoCheckpoint);
    };

    if cp.file_path != path {
        return at(current.size, StartReason::PathChanged);
    }

    if current.size < cp.last_position {
        return at(0, StartReason::Truncated);
    }

    if current.modified > cp.last_mod_time && current.size < cp.file_size {
        return at(0, StartReason::Recreated);
    }

    at(cp.last_position, StartReason::Resumed)
}

/// File-backed checkpoint storage.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Open the store for `node_id` under `state_dir`.
    ///
    /// Falls back to `<tmp>/dnslog` if `state_dir` cannot be created.
    pub fn open(state_dir: &Path, node_id: u32) -> Result<Self> {
        let dir = match fs::create_dir_all(state_dir) {
            Ok(()) => state_dir.to_path_buf(),
            Err(e) => {
                let fallback = std::env::temp_dir().join("dnslog");
                tracing::warn!(
                    preferred = %state_dir.display(),
                    fallback = %fallback.display(),
                    error = %e,
                    "State directory unavailable, using fallback"
                );
                fs::create_dir_all(&fallback).map_err(|e| {
                    Error::Checkpoint(format!(
                        "cannot create state directory {}: {e}",
                        fallback.display()
                    ))
                })?;
                fallback
            }
        };

        Ok(Self {
            path: dir.join(format!("checkpoint-node-{node_id}.json")),
        })
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored checkpoint. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Persist `checkpoint` atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        metrics::counter!(dnslog_core::metrics::CHECKPOINT_WRITES).increment(1);
        Ok(())
    }
}
