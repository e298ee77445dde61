//! Credential Governor
//!
//! Each provider owns one governor holding its pool of API credentials.
//! The governor decides which credential is handed out next and how a
//! failure changes that credential's health:
//!
//! ```text
//!            transient failure (backoff)
//!   ┌────────┐ ───────────────────────▶ ┌──────────┐
//!   │ Active │                          │ Impaired │
//!   └────────┘ ◀─────────────────────── └──────────┘
//!       │        timer expired / reset        │
//!       │  auth failure                       │ auth failure
//!       ▼                                     ▼
//!   ┌───────────────────────────────────────────────┐
//!   │              Quarantined (terminal)            │
//!   └───────────────────────────────────────────────┘
//! ```
//!
//! Backoff escalates with the consecutive failure count and is capped:
//! rate limits wait `60s × min(5, n)`, other transient failures wait
//! `30s × min(3, n)`. Request-caused failures (content policy, context
//! length) are not the credential's fault and only relax the count.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::FailureKind;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
const RATE_LIMIT_MAX_MULTIPLIER: u32 = 5;
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(30);
const TRANSIENT_MAX_MULTIPLIER: u32 = 3;

// ============================================================================
// Credential
// ============================================================================

/// An API secret plus the fingerprint used to refer to it everywhere else
///
/// The fingerprint is what appears in logs, candidate keys and the
/// persisted ledger; the secret itself only reaches adapters.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: Arc<str>,
    fingerprint: Arc<str>,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret: String = secret.into();
        let fingerprint = fingerprint(&secret);
        Self {
            secret: Arc::from(secret),
            fingerprint: Arc::from(fingerprint),
        }
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Stable 8-hex-digit identifier for a secret
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    format!("{:08x}", crc32fast::hash(secret.as_bytes()))
}

// ============================================================================
// Credential State
// ============================================================================

/// Health of a single credential
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Impaired,
    Quarantined,
}

#[derive(Debug)]
struct CredentialRecord {
    credential: Credential,
    status: CredentialStatus,
    impaired_until: Option<Instant>,
    failure_count: u32,
}

impl CredentialRecord {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            status: CredentialStatus::Active,
            impaired_until: None,
            failure_count: 0,
        }
    }

    fn is_usable(&self, now: Instant) -> bool {
        match self.status {
            CredentialStatus::Active => true,
            CredentialStatus::Impaired => self.impaired_until.map_or(true, |until| now > until),
            CredentialStatus::Quarantined => false,
        }
    }

    /// Reactivate if the impairment timer has run out
    fn refresh(&mut self, now: Instant) {
        if self.status == CredentialStatus::Impaired && self.is_usable(now) {
            self.status = CredentialStatus::Active;
            self.impaired_until = None;
        }
    }

    fn impair(&mut self, now: Instant, base: Duration, max_multiplier: u32) -> Duration {
        let backoff = base * self.failure_count.clamp(1, max_multiplier);
        self.status = CredentialStatus::Impaired;
        self.impaired_until = Some(now + backoff);
        backoff
    }
}

/// Point-in-time view of one credential, safe to log or serialize
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialSnapshot {
    pub fingerprint: String,
    pub status: CredentialStatus,
    pub failure_count: u32,
    /// Time left before an impaired credential becomes usable again
    pub impaired_for_ms: Option<u64>,
}

// ============================================================================
// Governor
// ============================================================================

#[derive(Debug, Default)]
struct GovernorInner {
    records: Vec<CredentialRecord>,
    /// Index of the record the next rotation starts from
    cursor: usize,
}

impl GovernorInner {
    fn refresh_all(&mut self, now: Instant) {
        for record in &mut self.records {
            record.refresh(now);
        }
    }

    /// Indices of usable records in rotation order starting at the cursor
    fn rotation(&self, now: Instant) -> impl Iterator<Item = usize> + '_ {
        let len = self.records.len();
        let start = if len == 0 { 0 } else { self.cursor % len };
        (0..len)
            .map(move |offset| (start + offset) % len)
            .filter(move |idx| self.records[*idx].is_usable(now))
    }

    fn find(&mut self, fingerprint: &str) -> Option<(usize, &mut CredentialRecord)> {
        self.records
            .iter_mut()
            .enumerate()
            .find(|(_, record)| record.credential.fingerprint() == fingerprint)
    }
}

/// Credential pool and health tracker for one provider
#[derive(Debug)]
pub struct CredentialGovernor {
    provider: String,
    inner: Mutex<GovernorInner>,
}

impl CredentialGovernor {
    /// Build a governor from raw secrets
    ///
    /// Duplicate secrets collapse into one record. Distinct secrets are
    /// always kept, even when their fingerprints collide; outcomes reported
    /// against a shared fingerprint then apply to all of them.
    pub fn new<I, S>(provider: impl Into<String>, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = provider.into();
        let mut records: Vec<CredentialRecord> = Vec::new();
        for secret in secrets {
            let credential = Credential::new(secret);
            if records
                .iter()
                .any(|r| r.credential.secret() == credential.secret())
            {
                continue;
            }
            if records
                .iter()
                .any(|r| r.credential.fingerprint() == credential.fingerprint())
            {
                tracing::warn!(
                    provider = %provider,
                    credential = %credential.fingerprint(),
                    "Distinct credentials share a fingerprint; their health and ledger history are merged"
                );
            }
            records.push(CredentialRecord::new(credential));
        }

        Self {
            provider,
            inner: Mutex::new(GovernorInner { records, cursor: 0 }),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next usable credential in round-robin order
    ///
    /// Expired impairments are reactivated first. Returns `None` when every
    /// credential is impaired or quarantined.
    pub fn select_credential(&self) -> Option<Credential> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh_all(now);

        let idx = inner.rotation(now).next()?;
        inner.cursor = idx + 1;
        Some(inner.records[idx].credential.clone())
    }

    /// Every usable credential, in the order `select_credential` would hand
    /// them out, without advancing the rotation
    pub fn usable_credentials(&self) -> Vec<Credential> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refresh_all(now);

        let indices: Vec<usize> = inner.rotation(now).collect();
        indices
            .into_iter()
            .map(|idx| inner.records[idx].credential.clone())
            .collect()
    }

    /// Advance the rotation past a credential chosen elsewhere
    pub fn note_selected(&self, fingerprint: &str) {
        let mut inner = self.inner.lock();
        if let Some((idx, _)) = inner.find(fingerprint) {
            inner.cursor = idx + 1;
        }
    }

    #[must_use]
    pub fn has_usable_credential(&self) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .records
            .iter()
            .any(|record| record.is_usable(now))
    }

    /// Apply the health transition for a failed call
    pub fn report_outcome(&self, fingerprint: &str, kind: FailureKind) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut matched = false;

        for record in inner
            .records
            .iter_mut()
            .filter(|record| record.credential.fingerprint() == fingerprint)
        {
            matched = true;
            self.apply_failure(record, kind, now);
        }

        if !matched {
            tracing::debug!(
                provider = %self.provider,
                credential = %fingerprint,
                "Outcome reported for unknown credential"
            );
        }
    }

    fn apply_failure(&self, record: &mut CredentialRecord, kind: FailureKind, now: Instant) {
        let fingerprint = record.credential.fingerprint().to_string();
        if record.status == CredentialStatus::Quarantined {
            return;
        }

        match kind {
            FailureKind::InvalidCredential => {
                record.status = CredentialStatus::Quarantined;
                record.impaired_until = None;
                tracing::warn!(
                    provider = %self.provider,
                    credential = %fingerprint,
                    "Credential quarantined after authentication failure"
                );
            }
            FailureKind::ContentPolicy | FailureKind::ContextTooLong => {
                record.failure_count = record.failure_count.saturating_sub(1);
            }
            FailureKind::RateLimit => {
                record.failure_count = record.failure_count.saturating_add(1);
                let backoff = record.impair(now, RATE_LIMIT_BACKOFF, RATE_LIMIT_MAX_MULTIPLIER);
                tracing::warn!(
                    provider = %self.provider,
                    credential = %fingerprint,
                    failures = record.failure_count,
                    backoff_secs = backoff.as_secs(),
                    "Credential rate limited"
                );
            }
            FailureKind::Timeout | FailureKind::Other => {
                record.failure_count = record.failure_count.saturating_add(1);
                let backoff = record.impair(now, TRANSIENT_BACKOFF, TRANSIENT_MAX_MULTIPLIER);
                tracing::warn!(
                    provider = %self.provider,
                    credential = %fingerprint,
                    kind = %kind,
                    failures = record.failure_count,
                    backoff_secs = backoff.as_secs(),
                    "Credential impaired"
                );
            }
        }
    }

    /// A healthy call restarts backoff escalation
    pub fn report_success(&self, fingerprint: &str) {
        let mut inner = self.inner.lock();
        for record in inner
            .records
            .iter_mut()
            .filter(|record| record.credential.fingerprint() == fingerprint)
        {
            record.failure_count = 0;
        }
    }

    /// Reactivate every credential that is not quarantined
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock();
        for record in &mut inner.records {
            if record.status != CredentialStatus::Quarantined {
                record.status = CredentialStatus::Active;
                record.impaired_until = None;
                record.failure_count = 0;
            }
        }
        inner.cursor = 0;
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        self.inner
            .lock()
            .records
            .iter()
            .map(|record| CredentialSnapshot {
                fingerprint: record.credential.fingerprint().to_string(),
                status: record.status,
                failure_count: record.failure_count,
                impaired_for_ms: record.impaired_until.map(|until| {
                    u64::try_from(until.saturating_duration_since(now).as_millis())
                        .unwrap_or(u64::MAX)
                }),
            })
            .collect()
    }
}
