//! Routing Policy Engine
//!
//! Scores every (provider, model, credential) candidate for an intent and
//! adapts the per-intent weights from outcome feedback.
//!
//! # Scoring
//!
//! ```text
//! modelQualityProxy = 1 - rank / modelCount
//! quality           = modelQualityProxy * providerQuality * 0.4 + successRate * 0.6
//! normLatency       = min(avgLatency, latencyCap) / latencyCap
//! normCost          = min(cost, costCap) / costCap
//! score             = w_q * quality
//!                   - w_l * normLatency * providerLatency
//!                   - w_c * normCost * providerCost
//! ```
//!
//! Candidates tripped by the circuit breaker (enough calls, too few
//! successes) are excluded before scoring.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::config::{Intent, PolicyWeights, ProviderConfig, ProviderWeights, RouterConfig, RouterTuning};
use super::credentials::{Credential, CredentialGovernor};
use super::ledger::{CandidateKey, CandidateMetrics, PerformanceLedger};

const QUALITY_PROXY_SHARE: f64 = 0.4;
const SUCCESS_RATE_SHARE: f64 = 0.6;

/// Failure penalty baseline in the weight update rule
const FAILURE_QUALITY_BASELINE: f64 = 1.5;
/// Cost proxy scale in the weight update rule
const COST_PROXY_SCALE: f64 = 0.01;

const PROVIDER_WEIGHT_MIN: f64 = 0.1;
const PROVIDER_WEIGHT_MAX: f64 = 2.0;

// ============================================================================
// Stress Modulation
// ============================================================================

/// External instability signal
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StressSignal {
    /// 0 (fractured) ..= 1 (pristine)
    pub purity: f64,
    pub instability_count: u32,
}

impl Default for StressSignal {
    fn default() -> Self {
        Self::calm()
    }
}

impl StressSignal {
    #[must_use]
    pub const fn calm() -> Self {
        Self {
            purity: 1.0,
            instability_count: 0,
        }
    }

    /// `(1 - purity) + 0.1 * instability_count`
    #[must_use]
    pub fn stress(&self) -> f64 {
        let purity = if self.purity.is_finite() {
            self.purity.clamp(0.0, 1.0)
        } else {
            1.0
        };
        (1.0 - purity) + 0.1 * f64::from(self.instability_count)
    }
}

/// Anything that can report the current stress level
pub trait StressSource: Send + Sync {
    fn current(&self) -> StressSignal;
}

/// Provider weights under a given stress: quality is damped, latency and
/// cost are amplified, all clamped to `[0.1, 2.0]`
#[must_use]
pub fn modulate_weights(base: ProviderWeights, stress: f64) -> ProviderWeights {
    let stress = stress.max(0.0);
    ProviderWeights {
        quality: (base.quality / (1.0 + stress)).clamp(PROVIDER_WEIGHT_MIN, PROVIDER_WEIGHT_MAX),
        latency: (base.latency * (1.0 + 0.5 * stress))
            .clamp(PROVIDER_WEIGHT_MIN, PROVIDER_WEIGHT_MAX),
        cost: (base.cost * (1.0 + 0.5 * stress)).clamp(PROVIDER_WEIGHT_MIN, PROVIDER_WEIGHT_MAX),
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Score one candidate
#[must_use]
pub fn score_candidate(
    policy: &PolicyWeights,
    provider: &ProviderWeights,
    quality_proxy: f64,
    cost_per_unit: f64,
    metrics: &CandidateMetrics,
    tuning: &RouterTuning,
) -> f64 {
    let quality =
        quality_proxy * provider.quality * QUALITY_PROXY_SHARE + metrics.success_rate * SUCCESS_RATE_SHARE;

    let latency_cap = tuning.max_latency_consideration_ms.max(f64::EPSILON);
    let cost_cap = tuning.max_cost_consideration_per_unit.max(f64::EPSILON);
    let norm_latency = metrics.avg_latency_ms.clamp(0.0, latency_cap) / latency_cap;
    let norm_cost = cost_per_unit.clamp(0.0, cost_cap) / cost_cap;

    policy.w_q * quality
        - policy.w_l * norm_latency * provider.latency
        - policy.w_c * norm_cost * provider.cost
}

/// A scored candidate ready to be attempted
#[derive(Clone, Debug)]
pub struct ScoredCandidate {
    pub key: CandidateKey,
    pub credential: Credential,
    pub score: f64,
    pub metrics: CandidateMetrics,
}

// ============================================================================
// Policy Engine
// ============================================================================

struct ProviderSlot {
    config: Arc<ProviderConfig>,
    governor: Arc<CredentialGovernor>,
    weights: RwLock<ProviderWeights>,
}

/// Candidate ranking and weight adaptation
pub struct PolicyEngine {
    tuning: RouterTuning,
    base_policies: HashMap<Intent, PolicyWeights>,
    policies: RwLock<HashMap<Intent, PolicyWeights>>,
    providers: Vec<ProviderSlot>,
    ledger: Arc<PerformanceLedger>,
}

impl PolicyEngine {
    pub fn new(config: &RouterConfig, ledger: Arc<PerformanceLedger>) -> Self {
        let mut base_policies: HashMap<Intent, PolicyWeights> = config
            .policies
            .iter()
            .map(|(intent, weights)| {
                let weights = weights
                    .normalized()
                    .unwrap_or_else(|| intent.builtin_weights());
                (*intent, weights)
            })
            .collect();
        base_policies
            .entry(Intent::Default)
            .or_insert_with(|| Intent::Default.builtin_weights());

        let providers = config
            .providers
            .iter()
            .map(|provider| {
                let governor =
                    CredentialGovernor::new(provider.name.clone(), provider.credentials.iter().cloned());
                if governor.is_empty() {
                    tracing::warn!(provider = %provider.name, "Provider has no credentials");
                }
                ProviderSlot {
                    config: Arc::new(provider.clone()),
                    governor: Arc::new(governor),
                    weights: RwLock::new(provider.weights),
                }
            })
            .collect();

        Self {
            tuning: config.tuning.clone(),
            policies: RwLock::new(base_policies.clone()),
            base_policies,
            providers,
            ledger,
        }
    }

    #[must_use]
    pub fn tuning(&self) -> &RouterTuning {
        &self.tuning
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    /// Current weights for an intent, falling back to the default policy
    #[must_use]
    pub fn policy(&self, intent: Intent) -> PolicyWeights {
        let policies = self.policies.read();
        policies
            .get(&intent)
            .or_else(|| policies.get(&Intent::Default))
            .copied()
            .unwrap_or_else(|| Intent::Default.builtin_weights())
    }

    #[must_use]
    pub fn policies(&self) -> HashMap<Intent, PolicyWeights> {
        self.policies.read().clone()
    }

    fn base_policy(&self, intent: Intent) -> PolicyWeights {
        self.base_policies
            .get(&intent)
            .or_else(|| self.base_policies.get(&Intent::Default))
            .copied()
            .unwrap_or_else(|| Intent::Default.builtin_weights())
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<ProviderConfig>> {
        self.slot(name).map(|slot| Arc::clone(&slot.config))
    }

    #[must_use]
    pub fn governor(&self, name: &str) -> Option<Arc<CredentialGovernor>> {
        self.slot(name).map(|slot| Arc::clone(&slot.governor))
    }

    #[must_use]
    pub fn governors(&self) -> Vec<Arc<CredentialGovernor>> {
        self.providers
            .iter()
            .map(|slot| Arc::clone(&slot.governor))
            .collect()
    }

    #[must_use]
    pub fn provider_weights(&self, name: &str) -> Option<ProviderWeights> {
        self.slot(name).map(|slot| *slot.weights.read())
    }

    fn slot(&self, name: &str) -> Option<&ProviderSlot> {
        self.providers.iter().find(|slot| slot.config.name == name)
    }

    /// Whether the circuit breaker excludes a candidate
    #[must_use]
    pub fn is_broken(&self, metrics: &CandidateMetrics) -> bool {
        metrics.total_calls > self.tuning.min_calls_for_circuit_breaker
            && metrics.success_rate < self.tuning.min_success_rate
    }

    /// Every viable candidate for an intent, best first
    ///
    /// Candidates in `exclude` and candidates tripped by the circuit breaker
    /// are left out. Ties keep provider, then model, then credential
    /// rotation order.
    #[must_use]
    pub fn rank(&self, intent: Intent, exclude: &HashSet<CandidateKey>) -> Vec<ScoredCandidate> {
        let policy = self.policy(intent);
        let mut candidates = Vec::new();

        for slot in &self.providers {
            let credentials = slot.governor.usable_credentials();
            if credentials.is_empty() {
                continue;
            }
            let weights = *slot.weights.read();

            for model in &slot.config.models {
                let quality_proxy = slot.config.model_quality_proxy(model);
                let cost = slot.config.cost(model);

                for credential in &credentials {
                    let key = CandidateKey::new(&slot.config.name, model, credential.fingerprint());
                    if exclude.contains(&key) {
                        continue;
                    }

                    let metrics = self.ledger.metrics(&key);
                    if self.is_broken(&metrics) {
                        tracing::debug!(
                            candidate = %key,
                            success_rate = metrics.success_rate,
                            total_calls = metrics.total_calls,
                            "Circuit breaker excludes candidate"
                        );
                        continue;
                    }

                    let score =
                        score_candidate(&policy, &weights, quality_proxy, cost, &metrics, &self.tuning);
                    candidates.push(ScoredCandidate {
                        key,
                        credential: credential.clone(),
                        score,
                        metrics,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.key.provider.cmp(&b.key.provider))
                .then_with(|| a.key.model.cmp(&b.key.model))
        });
        candidates
    }

    /// Best viable candidate for an intent
    #[must_use]
    pub fn select(&self, intent: Intent, exclude: &HashSet<CandidateKey>) -> Option<ScoredCandidate> {
        self.rank(intent, exclude).into_iter().next()
    }

    /// Online adjustment of an intent's weights from one outcome
    ///
    /// Weights are clamped to be non-negative and renormalized to sum to 1.
    /// If every weight collapses to zero the intent falls back to its base
    /// weights. Returns the new weights.
    pub fn update_heuristics(
        &self,
        intent: Intent,
        success: bool,
        latency_ms: f64,
        cost_proxy: f64,
        quality_proxy: f64,
    ) -> PolicyWeights {
        let lr = self.tuning.learning_rate;
        let latency_term = lr * (latency_ms.max(0.0) / 1000.0);
        let cost_term = lr * (cost_proxy.max(0.0) / COST_PROXY_SCALE);

        let mut policies = self.policies.write();
        let current = policies
            .get(&intent)
            .copied()
            .unwrap_or_else(|| self.base_policy(intent));

        let adjusted = if success {
            PolicyWeights::new(
                current.w_q + lr * quality_proxy,
                current.w_l - latency_term,
                current.w_c - cost_term,
            )
        } else {
            PolicyWeights::new(
                current.w_q - lr * (FAILURE_QUALITY_BASELINE - quality_proxy),
                current.w_l + latency_term,
                current.w_c + cost_term,
            )
        };

        let updated = adjusted.normalized().unwrap_or_else(|| {
            tracing::warn!(intent = %intent, "Policy weights collapsed, restoring base weights");
            self.base_policy(intent)
        });
        policies.insert(intent, updated);

        tracing::debug!(
            intent = %intent,
            success,
            w_q = updated.w_q,
            w_l = updated.w_l,
            w_c = updated.w_c,
            "Policy weights updated"
        );
        updated
    }

    /// Recompute every provider's weights from its base and a stress signal
    pub fn apply_stress(&self, signal: StressSignal) {
        let stress = signal.stress();
        for slot in &self.providers {
            let modulated = modulate_weights(slot.config.weights, stress);
            *slot.weights.write() = modulated;
        }
        tracing::debug!(
            stress,
            purity = signal.purity,
            instability = signal.instability_count,
            "Provider weights modulated"
        );
    }

    /// Poll a stress source on a timer and apply it
    pub fn spawn_stress_tick(
        self: &Arc<Self>,
        source: Arc<dyn StressSource>,
        period: Duration,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.apply_stress(source.current());
            }
        })
    }
}
