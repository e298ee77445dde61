//! Performance Ledger
//!
//! Rolling per-candidate statistics: EMA latency, success and failure counts
//! and a histogram of failure reasons. Records are created lazily on the
//! first attempt and never removed. Durability lives in
//! [`super::persistence`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backend::FailureKind;

/// Latency assumed for a candidate that has never been called
pub const DEFAULT_LATENCY_MS: f64 = 500.0;

/// Success rate assumed for a candidate that has never been called
pub const DEFAULT_SUCCESS_RATE: f64 = 0.9;

/// Call count at which confidence saturates
const CONFIDENCE_SATURATION_CALLS: f64 = 100.0;

// ============================================================================
// Candidate Key
// ============================================================================

/// Identity of a (provider, model, credential) candidate
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub provider: String,
    pub model: String,
    /// Credential fingerprint, never the secret
    pub credential: String,
}

impl CandidateKey {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            credential: credential.into(),
        }
    }

    /// Parse `provider:model:credential`
    ///
    /// Model names may themselves contain `:`, so the provider is taken from
    /// the left and the credential from the right.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, rest) = raw.split_once(':')?;
        let (model, credential) = rest.rsplit_once(':')?;
        if provider.is_empty() || model.is_empty() || credential.is_empty() {
            return None;
        }
        Some(Self::new(provider, model, credential))
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.model, self.credential)
    }
}

// ============================================================================
// Records
// ============================================================================

/// Accumulated statistics for one candidate
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub ema_latency_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub failure_reasons: BTreeMap<FailureKind, u64>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PerformanceRecord {
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.success_count + self.failure_count
    }

    fn observe(&mut self, alpha: f64, latency_ms: f64, failure: Option<FailureKind>) {
        let latency_ms = latency_ms.max(0.0);
        self.ema_latency_ms = if self.total_calls() == 0 {
            latency_ms
        } else {
            alpha * latency_ms + (1.0 - alpha) * self.ema_latency_ms
        };

        match failure {
            None => self.success_count += 1,
            Some(kind) => {
                self.failure_count += 1;
                *self.failure_reasons.entry(kind).or_insert(0) += 1;
            }
        }
        self.last_seen = Some(Utc::now());
    }
}

/// Derived metrics the policy engine scores with
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CandidateMetrics {
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub total_calls: u64,
    /// `ln(1 + n) / ln(101)`, capped at 1
    pub confidence: f64,
    pub failure_profile: BTreeMap<FailureKind, u64>,
}

impl CandidateMetrics {
    /// Metrics reported for a candidate with no history
    #[must_use]
    pub fn unseen() -> Self {
        Self {
            avg_latency_ms: DEFAULT_LATENCY_MS,
            success_rate: DEFAULT_SUCCESS_RATE,
            total_calls: 0,
            confidence: 0.0,
            failure_profile: BTreeMap::new(),
        }
    }

    fn from_record(record: &PerformanceRecord) -> Self {
        let total = record.total_calls();
        if total == 0 {
            return Self::unseen();
        }
        Self {
            avg_latency_ms: record.ema_latency_ms,
            success_rate: record.success_count as f64 / total as f64,
            total_calls: total,
            confidence: confidence(total),
            failure_profile: record.failure_reasons.clone(),
        }
    }
}

fn confidence(total_calls: u64) -> f64 {
    ((1.0 + total_calls as f64).ln() / (1.0 + CONFIDENCE_SATURATION_CALLS).ln()).min(1.0)
}

// ============================================================================
// Ledger
// ============================================================================

/// Concurrent store of performance records
#[derive(Debug)]
pub struct PerformanceLedger {
    records: DashMap<CandidateKey, PerformanceRecord>,
    alpha: f64,
    dirty: AtomicBool,
}

impl PerformanceLedger {
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self {
            records: DashMap::new(),
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Record one attempt; `failure` is `None` for a success
    pub fn record(&self, key: &CandidateKey, latency_ms: f64, failure: Option<FailureKind>) {
        self.records
            .entry(key.clone())
            .or_default()
            .observe(self.alpha, latency_ms, failure);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn record_success(&self, key: &CandidateKey, latency_ms: f64) {
        self.record(key, latency_ms, None);
    }

    pub fn record_failure(&self, key: &CandidateKey, latency_ms: f64, kind: FailureKind) {
        self.record(key, latency_ms, Some(kind));
    }

    #[must_use]
    pub fn metrics(&self, key: &CandidateKey) -> CandidateMetrics {
        self.records
            .get(key)
            .map_or_else(CandidateMetrics::unseen, |record| {
                CandidateMetrics::from_record(&record)
            })
    }

    #[must_use]
    pub fn record_for(&self, key: &CandidateKey) -> Option<PerformanceRecord> {
        self.records.get(key).map(|record| record.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ordered copy of every record
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<CandidateKey, PerformanceRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Replace records with a previously saved snapshot
    pub fn restore(&self, records: impl IntoIterator<Item = (CandidateKey, PerformanceRecord)>) {
        self.records.clear();
        for (key, record) in records {
            self.records.insert(key, record);
        }
        self.dirty.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning whether it was set
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Default for PerformanceLedger {
    fn default() -> Self {
        Self::new(0.1)
    }
}
