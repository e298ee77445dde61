//! Ledger Persistence
//!
//! The ledger is snapshotted to a JSON object keyed `provider:model:credential`.
//! Writes go to a sibling temp file that is renamed over the target, so a
//! crash mid-write leaves the previous snapshot intact. A background
//! checkpointer writes only when the ledger changed since the last write,
//! bounding loss on crash to one checkpoint interval.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::ledger::{CandidateKey, PerformanceLedger, PerformanceRecord};
use crate::backend::FailureKind;

/// Errors raised while loading or saving the ledger
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed performance snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed candidate key '{0}'")]
    MalformedKey(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk shape of one record
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    ema_latency: f64,
    success_count: u64,
    failure_count: u64,
    #[serde(default)]
    failure_reasons: BTreeMap<FailureKind, u64>,
    #[serde(default)]
    total_calls: u64,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

impl From<&PerformanceRecord> for StoredRecord {
    fn from(record: &PerformanceRecord) -> Self {
        Self {
            ema_latency: record.ema_latency_ms,
            success_count: record.success_count,
            failure_count: record.failure_count,
            failure_reasons: record.failure_reasons.clone(),
            total_calls: record.total_calls(),
            last_seen: record.last_seen,
        }
    }
}

impl From<StoredRecord> for PerformanceRecord {
    fn from(stored: StoredRecord) -> Self {
        Self {
            ema_latency_ms: stored.ema_latency,
            success_count: stored.success_count,
            failure_count: stored.failure_count,
            failure_reasons: stored.failure_reasons,
            last_seen: stored.last_seen,
        }
    }
}

/// Serialize a snapshot to the persisted JSON form
pub fn encode_snapshot(
    records: &BTreeMap<CandidateKey, PerformanceRecord>,
) -> Result<String, PersistenceError> {
    let stored: BTreeMap<String, StoredRecord> = records
        .iter()
        .map(|(key, record)| (key.to_string(), StoredRecord::from(record)))
        .collect();
    Ok(serde_json::to_string_pretty(&stored)?)
}

/// Parse the persisted JSON form
pub fn decode_snapshot(
    raw: &str,
) -> Result<BTreeMap<CandidateKey, PerformanceRecord>, PersistenceError> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let stored: BTreeMap<String, StoredRecord> = serde_json::from_str(raw)?;
    stored
        .into_iter()
        .map(|(raw_key, record)| {
            CandidateKey::parse(&raw_key)
                .map(|key| (key, PerformanceRecord::from(record)))
                .ok_or(PersistenceError::MalformedKey(raw_key))
        })
        .collect()
}

impl PerformanceLedger {
    /// Load a ledger from disk; a missing file yields an empty ledger
    pub async fn load(path: &Path, alpha: f64) -> Result<Self, PersistenceError> {
        let ledger = Self::new(alpha);
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let records = decode_snapshot(&raw)?;
                tracing::info!(
                    path = %path.display(),
                    records = records.len(),
                    "Loaded performance ledger"
                );
                ledger.restore(records);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No performance ledger on disk");
            }
            Err(e) => return Err(PersistenceError::io(path, e)),
        }
        Ok(ledger)
    }

    /// Write the ledger if it changed since the last checkpoint
    ///
    /// Returns whether a write happened. On failure the ledger stays dirty
    /// so the next checkpoint retries.
    pub async fn checkpoint(&self, path: &Path) -> Result<bool, PersistenceError> {
        if !self.take_dirty() {
            return Ok(false);
        }
        match self.save(path).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    /// Unconditionally write the ledger
    pub async fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let encoded = encode_snapshot(&self.snapshot())?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::io(parent, e))?;
        }

        let tmp = temp_path(path);
        tokio::fs::write(&tmp, encoded.as_bytes())
            .await
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PersistenceError::io(path, e))?;

        tracing::debug!(path = %path.display(), "Performance ledger checkpointed");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Spawn the periodic checkpoint task
pub fn spawn_checkpointer(
    ledger: Arc<PerformanceLedger>,
    path: PathBuf,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = ledger.checkpoint(&path).await {
                tracing::warn!(error = %e, path = %path.display(), "Ledger checkpoint failed");
            }
        }
    })
}
