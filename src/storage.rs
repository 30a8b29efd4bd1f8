use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::discovery::DiscoveryRecord;
use crate::error::StorageError;
use crate::pending::PendingTransaction;

const SNAPSHOT_FILE: &str = "snapshot.json";

/// Everything the wallet session knows, as written to disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub discovery: Vec<DiscoveryRecord>,
    pub pending: Vec<PendingTransaction>,
    pub saved_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SnapshotStore {
    base_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    fn snapshot_path(&self) -> PathBuf {
        self.base_path.join(SNAPSHOT_FILE)
    }

    /// Write the snapshot as pretty JSON, stamping `saved_at`
    pub fn save(&self, snapshot: &WalletSnapshot) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_path)?;
        let stamped = WalletSnapshot {
            saved_at: Some(Utc::now()),
            ..snapshot.clone()
        };
        let json = serde_json::to_string_pretty(&stamped)?;
        fs::write(self.snapshot_path(), json)?;
        log::debug!(
            "Saved {} discovery records, {} pending transactions",
            stamped.discovery.len(),
            stamped.pending.len()
        );
        Ok(())
    }

    /// Load the last snapshot; a missing file is an empty snapshot
    pub fn load(&self) -> Result<WalletSnapshot, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(WalletSnapshot::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let path = self.snapshot_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
