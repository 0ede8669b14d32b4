//! Checkpoint management for training runs.
//!
//! Each completed epoch is persisted as `snapshot_<epoch>.json` holding
//! `{epoch, network, optimizer}`, plus an entry in `checkpoints.json` with the
//! snapshot's SHA-256 and size. Both files are written atomically, so a crash
//! can never leave a half-written snapshot that `load` would accept.

use crate::error::CheckpointError;
use crate::persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const MANIFEST_FILENAME: &str = "checkpoints.json";
const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_EXT: &str = "json";

/// The full resumable state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    #[serde(rename = "epoch")]
    pub current_epoch: usize,
    #[serde(rename = "network")]
    pub model_parameters: serde_json::Value,
    #[serde(rename = "optimizer")]
    pub optimizer_state: serde_json::Value,
}

/// Borrowed view written to disk, so saving never clones parameter blobs.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    epoch: usize,
    network: &'a serde_json::Value,
    optimizer: &'a serde_json::Value,
}

/// A manifest entry for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: usize,
    pub file: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_keep: Option<usize>,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_keep: None,
        }
    }

    /// Keep at most `max_keep` snapshots, pruning the oldest epochs.
    pub fn with_max_keep(mut self, max_keep: Option<usize>) -> Self {
        self.max_keep = max_keep.filter(|n| *n > 0);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn snapshot_path(&self, epoch: usize) -> PathBuf {
        self.base_dir
            .join(format!("{SNAPSHOT_PREFIX}{epoch}.{SNAPSHOT_EXT}"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.base_dir.join(MANIFEST_FILENAME)
    }

    /// Persist `state` as the checkpoint for `epoch`.
    pub fn save(
        &self,
        state: &TrainingState,
        epoch: usize,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let path = self.snapshot_path(epoch);
        let bytes = serde_json::to_vec_pretty(&SnapshotRef {
            epoch,
            network: &state.model_parameters,
            optimizer: &state.optimizer_state,
        })
        .map_err(|e| io_error(&path, std::io::Error::other(e)))?;

        persistence::atomic_write(&path, &bytes).map_err(|e| io_error(&path, e))?;

        let record = CheckpointRecord {
            epoch,
            file: file_name(&path),
            sha256: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut records = self.list()?;
        records.retain(|r| r.epoch != epoch);
        records.push(record.clone());
        records.sort_by_key(|r| r.epoch);

        if let Some(limit) = self.max_keep {
            while records.len() > limit {
                let victim = records.remove(0);
                let victim_path = self.base_dir.join(&victim.file);
                if let Err(e) = std::fs::remove_file(&victim_path) {
                    tracing::warn!(path = %victim_path.display(), error = %e, "Failed to prune checkpoint");
                }
            }
        }

        let manifest = self.manifest_path();
        persistence::atomic_write_json(&manifest, &records).map_err(|e| io_error(&manifest, e))?;

        tracing::info!(epoch, path = %path.display(), bytes = record.size_bytes, "Checkpoint saved");
        Ok(record)
    }

    /// Load the snapshot at `path`.
    ///
    /// When the manifest has a hash for this file it must match.
    pub fn load(&self, path: &Path) -> Result<TrainingState, CheckpointError> {
        if !path.is_file() {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = std::fs::read(path).map_err(|e| io_error(path, e))?;

        let name = file_name(path);
        if let Some(record) = self.list()?.into_iter().find(|r| r.file == name) {
            let actual = sha256_hex(&bytes);
            if actual != record.sha256 {
                return Err(CheckpointError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("sha256 {actual} does not match recorded {}", record.sha256),
                });
            }
        }

        let state: TrainingState =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        tracing::debug!(epoch = state.current_epoch, path = %path.display(), "Checkpoint loaded");
        Ok(state)
    }

    pub fn load_epoch(&self, epoch: usize) -> Result<TrainingState, CheckpointError> {
        self.load(&self.snapshot_path(epoch))
    }

    /// Path of the snapshot with the highest epoch, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>, CheckpointError> {
        Ok(self
            .snapshot_epochs()?
            .into_iter()
            .max()
            .map(|epoch| self.snapshot_path(epoch)))
    }

    /// Load the newest snapshot; an empty directory is `NotFound`.
    pub fn load_latest(&self) -> Result<TrainingState, CheckpointError> {
        match self.latest()? {
            Some(path) => self.load(&path),
            None => Err(CheckpointError::NotFound {
                path: self.base_dir.clone(),
            }),
        }
    }

    /// Manifest entries, oldest epoch first.
    pub fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let manifest = self.manifest_path();
        match persistence::load_json::<Vec<CheckpointRecord>>(&manifest) {
            Ok(records) => Ok(records.unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(CheckpointError::Corrupt {
                    path: manifest,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(io_error(&manifest, e)),
        }
    }

    /// Epochs that have a snapshot file on disk.
    fn snapshot_epochs(&self) -> Result<Vec<usize>, CheckpointError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.base_dir).map_err(|e| io_error(&self.base_dir, e))?;
        let mut epochs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.base_dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let epoch = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(&format!(".{SNAPSHOT_EXT}")))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(epoch) = epoch {
                epochs.push(epoch);
            }
        }
        Ok(epochs)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}
