//! Request Orchestrator
//!
//! Composes the policy engine, performance ledger, credential governors and
//! connection pool into the request path:
//!
//! 1. Reject immediately while cooling down; wake (and reset every
//!    governor) once the cool-down has elapsed.
//! 2. Ask the policy engine for the best candidate not yet tried in this
//!    request, acquire its adapter, and call it under the attempt timeout.
//! 3. Feed the outcome back into the ledger and governor; on failure move
//!    to the next candidate.
//! 4. When no candidate is left or the attempt budget is spent, enter sleep
//!    mode so every caller backs off without touching the network.
//!
//! Attempts within a request are strictly sequential. No lock is held
//! while an adapter call is in flight.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{Intent, PersistenceSettings, PolicyWeights, RouterConfig, RouterTuning};
use super::connection_pool::{AdapterFactory, ConnectionPool};
use super::credentials::CredentialSnapshot;
use super::ledger::{CandidateKey, PerformanceLedger};
use super::persistence::{spawn_checkpointer, PersistenceError};
use super::policy::{PolicyEngine, ScoredCandidate, StressSignal, StressSource};
use crate::backend::{ChatMessage, FailureKind};

// ============================================================================
// Request / Response
// ============================================================================

/// A generation request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub intent: Intent,
    /// Overall budget for the request, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl GenerateRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            intent: Intent::Default,
            deadline_ms: None,
        }
    }

    /// Single user message
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    #[must_use]
    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Outcome of one attempt within a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "kind")]
pub enum AttemptOutcome {
    Success,
    Failed(FailureKind),
}

/// One entry of the fallback path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    /// Credential fingerprint
    pub credential: String,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
}

/// Terminal request failures
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RouterError {
    #[error("router is cooling down after repeated failures, retry in about {} minute(s)", minutes_ceil(*remaining_ms))]
    CoolingDown { remaining_ms: u64 },

    #[error("no viable provider candidate is available")]
    NoViableCandidate,

    #[error("all {attempts} attempt(s) failed")]
    AttemptsExhausted { attempts: usize },

    #[error("request was cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

fn minutes_ceil(ms: u64) -> u64 {
    ms.div_ceil(60_000).max(1)
}

/// Result of a generation request; failures are values, never panics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub content: Option<String>,
    pub provider_used: Option<String>,
    pub model_used: Option<String>,
    /// Wall time for the whole request
    pub latency_ms: u64,
    pub fallback_path: Vec<AttemptRecord>,
    pub error: Option<RouterError>,
}

impl GenerateResponse {
    fn failure(error: RouterError, fallback_path: Vec<AttemptRecord>, started: Instant) -> Self {
        Self {
            success: false,
            content: None,
            provider_used: None,
            model_used: None,
            latency_ms: elapsed_ms(started),
            fallback_path,
            error: Some(error),
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Router State
// ============================================================================

/// Process-wide backpressure state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterState {
    Active,
    Sleeping { until: Instant },
}

impl RouterState {
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        matches!(self, Self::Sleeping { .. })
    }
}

/// How a single attempt ended
enum AttemptResult {
    Completed(String),
    Failed(FailureKind),
    Cancelled,
    DeadlineExceeded,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Adaptive multi-provider request router
pub struct Orchestrator {
    policy: Arc<PolicyEngine>,
    ledger: Arc<PerformanceLedger>,
    pool: Arc<ConnectionPool>,
    tuning: RouterTuning,
    persistence: PersistenceSettings,
    prune_interval: Duration,
    state: Mutex<RouterState>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: &RouterConfig,
        ledger: Arc<PerformanceLedger>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            factory,
            config.pool.scope,
            config.pool.dormancy,
        ));
        Self::with_pool(config, ledger, pool)
    }

    /// Build around an existing pool
    pub fn with_pool(
        config: &RouterConfig,
        ledger: Arc<PerformanceLedger>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let policy = Arc::new(PolicyEngine::new(config, Arc::clone(&ledger)));
        tracing::info!(
            providers = config.providers.len(),
            scope = ?pool.scope(),
            max_attempts = config.tuning.max_attempts_per_request,
            "Orchestrator created"
        );
        Self {
            policy,
            ledger,
            pool,
            tuning: config.tuning.clone(),
            persistence: config.persistence.clone(),
            prune_interval: config.pool.prune_interval,
            state: Mutex::new(RouterState::Active),
            background: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn state(&self) -> RouterState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.state().is_sleeping()
    }

    /// Health of every credential, keyed by provider
    #[must_use]
    pub fn credential_snapshot(&self) -> Vec<(String, Vec<CredentialSnapshot>)> {
        self.policy
            .governors()
            .into_iter()
            .map(|gov| (gov.provider().to_string(), gov.snapshot()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------------

    /// Route a request to the best available provider
    pub async fn generate_text(&self, request: GenerateRequest) -> GenerateResponse {
        self.generate_text_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Route a request, aborting promptly if `cancel` fires
    pub async fn generate_text_with_cancel(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> GenerateResponse {
        let started = Instant::now();
        let deadline = request.deadline().map(|budget| started + budget);

        if let Err(error) = self.check_sleep(started) {
            tracing::debug!(error = %error, "Request rejected while cooling down");
            return GenerateResponse::failure(error, Vec::new(), started);
        }

        let mut fallback_path: Vec<AttemptRecord> = Vec::new();
        let mut tried: HashSet<CandidateKey> = HashSet::new();
        let max_attempts = self.tuning.max_attempts_per_request.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return GenerateResponse::failure(RouterError::Cancelled, fallback_path, started);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return GenerateResponse::failure(
                    RouterError::DeadlineExceeded,
                    fallback_path,
                    started,
                );
            }

            let Some(candidate) = self.policy.select(request.intent, &tried) else {
                self.enter_sleep("no viable candidate");
                return GenerateResponse::failure(
                    RouterError::NoViableCandidate,
                    fallback_path,
                    started,
                );
            };
            tried.insert(candidate.key.clone());

            tracing::debug!(
                attempt,
                candidate = %candidate.key,
                score = candidate.score,
                intent = %request.intent,
                "Attempting candidate"
            );

            let attempt_started = Instant::now();
            let result = self
                .attempt(&candidate, &request.messages, deadline, cancel)
                .await;
            let latency = attempt_started.elapsed();
            let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

            match result {
                AttemptResult::Completed(content) => {
                    self.record_success(&candidate, latency);
                    fallback_path.push(attempt_record(&candidate, AttemptOutcome::Success, latency_ms));
                    tracing::info!(
                        provider = %candidate.key.provider,
                        model = %candidate.key.model,
                        attempt,
                        latency_ms,
                        "Request served"
                    );
                    return GenerateResponse {
                        success: true,
                        content: Some(content),
                        provider_used: Some(candidate.key.provider.clone()),
                        model_used: Some(candidate.key.model.clone()),
                        latency_ms: elapsed_ms(started),
                        fallback_path,
                        error: None,
                    };
                }
                AttemptResult::Failed(kind) => {
                    self.record_failure(&candidate, latency, kind);
                    fallback_path.push(attempt_record(
                        &candidate,
                        AttemptOutcome::Failed(kind),
                        latency_ms,
                    ));
                }
                AttemptResult::Cancelled => {
                    tracing::debug!(candidate = %candidate.key, "Request cancelled mid-attempt");
                    return GenerateResponse::failure(
                        RouterError::Cancelled,
                        fallback_path,
                        started,
                    );
                }
                AttemptResult::DeadlineExceeded => {
                    tracing::debug!(candidate = %candidate.key, "Request deadline hit mid-attempt");
                    return GenerateResponse::failure(
                        RouterError::DeadlineExceeded,
                        fallback_path,
                        started,
                    );
                }
            }
        }

        self.enter_sleep("attempts exhausted");
        GenerateResponse::failure(
            RouterError::AttemptsExhausted {
                attempts: fallback_path.len(),
            },
            fallback_path,
            started,
        )
    }

    async fn attempt(
        &self,
        candidate: &ScoredCandidate,
        messages: &[ChatMessage],
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let Some(provider) = self.policy.provider(&candidate.key.provider) else {
            return AttemptResult::Failed(FailureKind::Other);
        };

        let adapter = match self
            .pool
            .acquire(&provider, &candidate.key.model, &candidate.credential)
        {
            Ok(adapter) => adapter,
            Err(_) => return AttemptResult::Failed(FailureKind::Other),
        };

        let budget = match deadline {
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .min(self.tuning.attempt_timeout),
            None => self.tuning.attempt_timeout,
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return AttemptResult::Cancelled,
            outcome = tokio::time::timeout(budget, adapter.process(messages)) => outcome,
        };

        match outcome {
            Ok(Ok(completion)) => AttemptResult::Completed(completion.content),
            Ok(Err(error)) => {
                tracing::warn!(
                    provider = %candidate.key.provider,
                    model = %candidate.key.model,
                    credential = %candidate.key.credential,
                    kind = %error.kind,
                    error = %error.message,
                    "Candidate failed"
                );
                AttemptResult::Failed(error.kind)
            }
            Err(_elapsed) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    AttemptResult::DeadlineExceeded
                } else {
                    tracing::warn!(
                        provider = %candidate.key.provider,
                        model = %candidate.key.model,
                        credential = %candidate.key.credential,
                        timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                        "Candidate timed out"
                    );
                    AttemptResult::Failed(FailureKind::Timeout)
                }
            }
        }
    }

    fn record_success(&self, candidate: &ScoredCandidate, latency: Duration) {
        self.ledger
            .record_success(&candidate.key, latency.as_secs_f64() * 1000.0);
        if let Some(governor) = self.policy.governor(&candidate.key.provider) {
            governor.note_selected(&candidate.key.credential);
            governor.report_success(&candidate.key.credential);
        }
    }

    fn record_failure(&self, candidate: &ScoredCandidate, latency: Duration, kind: FailureKind) {
        self.ledger
            .record_failure(&candidate.key, latency.as_secs_f64() * 1000.0, kind);
        if let Some(governor) = self.policy.governor(&candidate.key.provider) {
            governor.note_selected(&candidate.key.credential);
            governor.report_outcome(&candidate.key.credential, kind);
        }
    }

    // ------------------------------------------------------------------------
    // Sleep mode
    // ------------------------------------------------------------------------

    /// Reject while sleeping; wake and reset governors once the timer is up
    fn check_sleep(&self, now: Instant) -> Result<(), RouterError> {
        let woke = {
            let mut state = self.state.lock();
            match *state {
                RouterState::Active => false,
                RouterState::Sleeping { until } if now < until => {
                    let remaining = until.saturating_duration_since(now);
                    return Err(RouterError::CoolingDown {
                        remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                RouterState::Sleeping { .. } => {
                    // Governors are reset before any other request can see
                    // `Active`; lock order is always state, then governor
                    self.reset_governors();
                    *state = RouterState::Active;
                    true
                }
            }
        };

        if woke {
            tracing::info!("Cool-down elapsed, router active again");
        }
        Ok(())
    }

    fn enter_sleep(&self, reason: &str) {
        let until = Instant::now() + self.tuning.sleep_duration;
        {
            let mut state = self.state.lock();
            *state = match *state {
                RouterState::Sleeping { until: existing } if existing > until => *state,
                _ => RouterState::Sleeping { until },
            };
        }
        tracing::error!(
            reason,
            sleep_secs = self.tuning.sleep_duration.as_secs(),
            "Entering sleep mode, all requests rejected until cool-down ends"
        );
    }

    /// Operator reset: leave sleep mode and reactivate non-quarantined
    /// credentials
    pub fn wake(&self) {
        {
            let mut state = self.state.lock();
            self.reset_governors();
            *state = RouterState::Active;
        }
        tracing::info!("Router woken by operator");
    }

    fn reset_governors(&self) {
        for governor in self.policy.governors() {
            governor.reset_all();
        }
    }

    // ------------------------------------------------------------------------
    // Learning and modulation hooks
    // ------------------------------------------------------------------------

    /// Feed an outcome into the intent's weight adaptation
    ///
    /// The quality proxy comes from the model's rank and the cost proxy from
    /// its configured cost; unknown providers use neutral defaults.
    pub fn update_heuristics(
        &self,
        intent: Intent,
        success: bool,
        latency_ms: f64,
        provider: &str,
        model: &str,
    ) -> PolicyWeights {
        let (quality_proxy, cost_proxy) = match self.policy.provider(provider) {
            Some(config) => (config.model_quality_proxy(model), config.cost(model)),
            None => (
                super::config::UNKNOWN_MODEL_QUALITY_PROXY,
                super::config::DEFAULT_COST_PER_UNIT,
            ),
        };
        self.policy
            .update_heuristics(intent, success, latency_ms, cost_proxy, quality_proxy)
    }

    /// Recompute provider weights from a stress signal
    pub fn ingest_stress(&self, signal: StressSignal) {
        self.policy.apply_stress(signal);
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Start the adapter pruner and, when persistence is configured, the
    /// ledger checkpointer
    pub fn spawn_background(&self) {
        let mut handles = self.background.lock();
        handles.push(self.pool.spawn_pruner(self.prune_interval));
        if let Some(path) = self.persistence.path.clone() {
            handles.push(spawn_checkpointer(
                Arc::clone(&self.ledger),
                path,
                self.persistence.checkpoint_interval,
            ));
        }
    }

    /// Poll a stress source alongside the other background tasks
    pub fn spawn_stress_tick(&self, source: Arc<dyn StressSource>, period: Duration) {
        let handle = self.policy.spawn_stress_tick(source, period);
        self.background.lock().push(handle);
    }

    /// Stop background tasks and write a final checkpoint
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        // An aborted checkpoint may already have cleared the dirty flag
        for handle in handles {
            let _ = handle.await;
        }
        self.pool.clear();

        if let Some(path) = self.persistence_path() {
            self.ledger.save(&path).await?;
            tracing::info!(path = %path.display(), "Final ledger checkpoint written");
        }
        Ok(())
    }

    #[must_use]
    pub fn persistence_path(&self) -> Option<PathBuf> {
        self.persistence.path.clone()
    }
}

fn attempt_record(candidate: &ScoredCandidate, outcome: AttemptOutcome, latency_ms: u64) -> AttemptRecord {
    AttemptRecord {
        provider: candidate.key.provider.clone(),
        model: candidate.key.model.clone(),
        credential: candidate.key.credential.clone(),
        outcome,
        latency_ms,
    }
}
