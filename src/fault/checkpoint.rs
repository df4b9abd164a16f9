//! Checkpoint persistence
//!
//! Stores one JSON file per checkpoint under a configurable directory.
//! Writes go to a temp file in the same directory followed by an atomic
//! rename, so a reader (or a crash-recovery scan) never observes a partial
//! record. For a given operation the record with the greatest timestamp is
//! authoritative; undecodable files are skipped with a log line rather
//! than failing the scan.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Checkpoint errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record failed to encode.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No checkpoint with the requested id exists.
    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// A persisted progress snapshot of a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Unique id of this record.
    pub id: Uuid,
    /// Operation the record belongs to.
    pub operation: String,
    /// Application-defined resume state.
    pub state: HashMap<String, String>,
    /// Progress in 0.0..=1.0.
    pub progress: f64,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Free-form annotations.
    pub metadata: HashMap<String, String>,
}

/// Statistics over the checkpoint directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointStats {
    /// Decodable checkpoint files.
    pub total_checkpoints: usize,
    /// Distinct operations with at least one checkpoint.
    pub operations: usize,
    /// Bytes across all checkpoint files.
    pub total_bytes: u64,
}

/// Persists and retrieves [`Checkpoint`] records.
pub struct CheckpointManager {
    dir: PathBuf,
    max_checkpoints: Option<usize>,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> CheckpointResult<Self> {
        Self::with_limit(dir, None)
    }

    /// Create a manager keeping at most `max_checkpoints` records per
    /// operation; older records are deleted on overflow.
    pub fn with_limit(
        dir: impl Into<PathBuf>,
        max_checkpoints: Option<usize>,
    ) -> CheckpointResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_checkpoints,
        })
    }

    /// The directory checkpoints are stored in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(checkpoint: &Checkpoint) -> String {
        let safe_op: String = checkpoint
            .operation
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!(
            "{}-{}-{}.json",
            safe_op,
            checkpoint.timestamp.timestamp_millis(),
            checkpoint.id.simple()
        )
    }

    /// Write a checkpoint for `operation`. The record lands under its
    /// final name only via rename, so readers see it atomically.
    pub fn save_checkpoint(
        &self,
        operation: &str,
        state: HashMap<String, String>,
        progress: f64,
        metadata: HashMap<String, String>,
    ) -> CheckpointResult<Checkpoint> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            state,
            progress: progress.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            metadata,
        };

        let final_path = self.dir.join(Self::file_name(&checkpoint));
        let tmp_path = final_path.with_extension("tmp");

        let encoded = serde_json::to_vec_pretty(&checkpoint)?;
        fs::write(&tmp_path, encoded)?;
        fs::rename(&tmp_path, &final_path)?;

        log::debug!(
            "saved checkpoint {} for {} at {:.1}%",
            checkpoint.id,
            operation,
            checkpoint.progress * 100.0
        );

        if let Some(limit) = self.max_checkpoints {
            self.prune(operation, limit)?;
        }
        Ok(checkpoint)
    }

    /// All decodable records with their backing files, unordered.
    fn scan(&self) -> CheckpointResult<Vec<(PathBuf, Checkpoint)>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match fs::read(&path).map_err(CheckpointError::from).and_then(|b| {
                serde_json::from_slice::<Checkpoint>(&b).map_err(CheckpointError::from)
            }) {
                Ok(checkpoint) => records.push((path, checkpoint)),
                Err(err) => {
                    log::warn!("skipping corrupt checkpoint {}: {}", path.display(), err);
                }
            }
        }
        Ok(records)
    }

    /// Records, newest first, optionally filtered to one operation.
    pub fn list_checkpoints(&self, operation: Option<&str>) -> CheckpointResult<Vec<Checkpoint>> {
        let mut records: Vec<Checkpoint> = self
            .scan()?
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| operation.map(|op| c.operation == op).unwrap_or(true))
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// The authoritative (greatest-timestamp) record for `operation`.
    pub fn get_latest_checkpoint(&self, operation: &str) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self.list_checkpoints(Some(operation))?.into_iter().next())
    }

    /// Load a record by id.
    pub fn restore_checkpoint(&self, id: Uuid) -> CheckpointResult<Checkpoint> {
        self.scan()?
            .into_iter()
            .map(|(_, c)| c)
            .find(|c| c.id == id)
            .ok_or(CheckpointError::NotFound(id))
    }

    /// Delete every record for `operation`. Returns how many were removed.
    pub fn delete_operation(&self, operation: &str) -> CheckpointResult<usize> {
        let mut removed = 0;
        for (path, checkpoint) in self.scan()? {
            if checkpoint.operation == operation {
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Directory statistics.
    pub fn get_stats(&self) -> CheckpointResult<CheckpointStats> {
        let records = self.scan()?;
        let operations: HashSet<&str> =
            records.iter().map(|(_, c)| c.operation.as_str()).collect();
        let mut total_bytes = 0;
        for (path, _) in &records {
            total_bytes += fs::metadata(path)?.len();
        }
        Ok(CheckpointStats {
            total_checkpoints: records.len(),
            operations: operations.len(),
            total_bytes,
        })
    }

    /// Drop the oldest records of `operation` beyond `limit`.
    fn prune(&self, operation: &str, limit: usize) -> CheckpointResult<()> {
        let mut records: Vec<(PathBuf, Checkpoint)> = self
            .scan()?
            .into_iter()
            .filter(|(_, c)| c.operation == operation)
            .collect();
        if records.len() <= limit {
            return Ok(());
        }

        records.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        for (path, checkpoint) in records.split_off(limit) {
            log::debug!("pruning old checkpoint {}", checkpoint.id);
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Throttled checkpoint writer: saves at most once per interval unless
/// forced.
pub struct AutoCheckpoint {
    manager: Arc<CheckpointManager>,
    operation: String,
    interval: Duration,
    last_saved: Mutex<Option<Instant>>,
}

impl AutoCheckpoint {
    /// Wrap `manager` for `operation` with a minimum save interval.
    pub fn new(manager: Arc<CheckpointManager>, operation: impl Into<String>, interval: Duration) -> Self {
        Self {
            manager,
            operation: operation.into(),
            interval,
            last_saved: Mutex::new(None),
        }
    }

    /// Save if the interval has elapsed since the previous save. Returns
    /// the record when one was written.
    pub fn maybe_checkpoint(
        &self,
        state: HashMap<String, String>,
        progress: f64,
    ) -> CheckpointResult<Option<Checkpoint>> {
        {
            let last = self.last_saved.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.interval {
                    return Ok(None);
                }
            }
        }
        self.force_checkpoint(state, progress).map(Some)
    }

    /// Save unconditionally and reset the throttle.
    pub fn force_checkpoint(
        &self,
        state: HashMap<String, String>,
        progress: f64,
    ) -> CheckpointResult<Checkpoint> {
        let checkpoint =
            self.manager
                .save_checkpoint(&self.operation, state, progress, HashMap::new())?;
        *self.last_saved.lock() = Some(Instant::now());
        Ok(checkpoint)
    }
}
