//! Routing Configuration
//!
//! Typed configuration for providers, intents, scoring policies and router
//! tunables. Everything here is plain data; loading from TOML and the
//! environment lives in [`crate::config`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::connection_pool::AdapterScope;

// ============================================================================
// Intents
// ============================================================================

/// Classification of a request's purpose, used to pick a scoring policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Intent {
    #[default]
    Default,
    ChitChat,
    QuestionAnswering,
    CodeGeneration,
    CreativeRequest,
    PersonalVent,
    ImageGeneration,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::Default,
        Intent::ChitChat,
        Intent::QuestionAnswering,
        Intent::CodeGeneration,
        Intent::CreativeRequest,
        Intent::PersonalVent,
        Intent::ImageGeneration,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ChitChat => "chit_chat",
            Self::QuestionAnswering => "question_answering",
            Self::CodeGeneration => "code_generation",
            Self::CreativeRequest => "creative_request",
            Self::PersonalVent => "personal_vent",
            Self::ImageGeneration => "image_generation",
        }
    }

    /// Parse a label, mapping anything unknown to [`Intent::Default`]
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }

    /// Weights used when no configuration overrides them
    #[must_use]
    pub fn builtin_weights(&self) -> PolicyWeights {
        match self {
            Self::Default => PolicyWeights::new(0.6, 0.3, 0.1),
            Self::ChitChat => PolicyWeights::new(0.2, 0.7, 0.1),
            Self::QuestionAnswering => PolicyWeights::new(0.7, 0.2, 0.1),
            Self::CodeGeneration => PolicyWeights::new(0.8, 0.1, 0.1),
            Self::CreativeRequest => PolicyWeights::new(0.9, 0.0, 0.1),
            Self::PersonalVent => PolicyWeights::new(0.5, 0.4, 0.1),
            Self::ImageGeneration => PolicyWeights::new(0.7, 0.1, 0.2),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `chit_chat`, `ChitChat`, `chit-chat` and friends
impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();

        Intent::ALL
            .into_iter()
            .find(|intent| intent.as_str().replace('_', "") == normalized)
            .ok_or_else(|| format!("unknown intent '{s}'"))
    }
}

impl Serialize for Intent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Intent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Intent::from_label(&label))
    }
}

// ============================================================================
// Policy Weights
// ============================================================================

/// Quality / latency / cost weight triple for one intent
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyWeights {
    pub w_q: f64,
    pub w_l: f64,
    pub w_c: f64,
}

impl PolicyWeights {
    #[must_use]
    pub const fn new(w_q: f64, w_l: f64, w_c: f64) -> Self {
        Self { w_q, w_l, w_c }
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.w_q + self.w_l + self.w_c
    }

    /// Clamp negatives to zero and scale to sum 1
    ///
    /// Returns `None` when nothing positive is left to scale.
    #[must_use]
    pub fn normalized(&self) -> Option<Self> {
        let clamped = Self::new(self.w_q.max(0.0), self.w_l.max(0.0), self.w_c.max(0.0));
        let total = clamped.sum();
        if !total.is_finite() || total <= f64::EPSILON {
            return None;
        }
        Some(Self::new(
            clamped.w_q / total,
            clamped.w_l / total,
            clamped.w_c / total,
        ))
    }
}

/// Built-in policy table with every intent populated
#[must_use]
pub fn builtin_policies() -> HashMap<Intent, PolicyWeights> {
    Intent::ALL
        .into_iter()
        .map(|intent| (intent, intent.builtin_weights()))
        .collect()
}

// ============================================================================
// Providers
// ============================================================================

/// Wire protocol spoken by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    /// `POST {base_url}/chat/completions` with bearer auth
    #[default]
    OpenaiCompatible,
    /// `POST {base_url}/models/{model}:generateContent`
    Gemini,
}

impl ApiKind {
    #[must_use]
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "https://api.openai.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

/// Per-provider multipliers applied inside the scoring formula
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderWeights {
    pub quality: f64,
    pub latency: f64,
    pub cost: f64,
}

impl Default for ProviderWeights {
    fn default() -> Self {
        Self {
            quality: 1.0,
            latency: 1.0,
            cost: 1.0,
        }
    }
}

pub const DEFAULT_COST_PER_UNIT: f64 = 0.001;

/// Quality proxy for a model the provider does not list
pub const UNKNOWN_MODEL_QUALITY_PROXY: f64 = 0.5;

/// Static description of one provider
#[derive(Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub api: ApiKind,
    pub base_url: String,
    /// Models in configuration order
    pub models: Vec<String>,
    /// Explicit ranks; lower means presumed higher quality
    pub model_order: HashMap<String, u32>,
    pub cost_per_unit: HashMap<String, f64>,
    /// Base weights before stress modulation
    pub weights: ProviderWeights,
    /// Resolved secrets, in rotation order
    pub credentials: Vec<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api", &self.api)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .field("model_order", &self.model_order)
            .field("cost_per_unit", &self.cost_per_unit)
            .field("weights", &self.weights)
            .field("credentials", &format_args!("[{} redacted]", self.credentials.len()))
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, api: ApiKind) -> Self {
        Self {
            name: name.into(),
            api,
            base_url: api.default_base_url().to_string(),
            models: Vec::new(),
            model_order: HashMap::new(),
            cost_per_unit: HashMap::new(),
            weights: ProviderWeights::default(),
            credentials: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    #[must_use]
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_rank(mut self, model: impl Into<String>, rank: u32) -> Self {
        self.model_order.insert(model.into(), rank);
        self
    }

    #[must_use]
    pub fn with_cost(mut self, model: impl Into<String>, cost: f64) -> Self {
        self.cost_per_unit.insert(model.into(), cost);
        self
    }

    #[must_use]
    pub fn with_weights(mut self, quality: f64, latency: f64, cost: f64) -> Self {
        self.weights = ProviderWeights {
            quality,
            latency,
            cost,
        };
        self
    }

    #[must_use]
    pub fn with_credential(mut self, secret: impl Into<String>) -> Self {
        self.credentials.push(secret.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Rank of a model: explicit `model_order`, else its list position
    #[must_use]
    pub fn rank(&self, model: &str) -> Option<u32> {
        if let Some(rank) = self.model_order.get(model) {
            return Some(*rank);
        }
        self.models
            .iter()
            .position(|m| m == model)
            .and_then(|idx| u32::try_from(idx).ok())
    }

    /// `1 - rank / model_count` clamped to `[0, 1]`, or 0.5 for unlisted
    /// models
    #[must_use]
    pub fn model_quality_proxy(&self, model: &str) -> f64 {
        match self.rank(model) {
            Some(rank) if !self.models.is_empty() => {
                (1.0 - f64::from(rank) / self.models.len() as f64).clamp(0.0, 1.0)
            }
            _ => UNKNOWN_MODEL_QUALITY_PROXY,
        }
    }

    #[must_use]
    pub fn cost(&self, model: &str) -> f64 {
        self.cost_per_unit
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_COST_PER_UNIT)
    }

    #[must_use]
    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

// ============================================================================
// Router Tunables
// ============================================================================

/// Numeric knobs for selection, retry and learning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterTuning {
    pub max_attempts_per_request: usize,
    pub sleep_duration: Duration,
    /// Upper bound on a single adapter call
    pub attempt_timeout: Duration,
    pub min_calls_for_circuit_breaker: u64,
    pub min_success_rate: f64,
    pub max_latency_consideration_ms: f64,
    pub max_cost_consideration_per_unit: f64,
    pub learning_rate: f64,
    pub ema_alpha: f64,
}

impl Default for RouterTuning {
    fn default() -> Self {
        Self {
            max_attempts_per_request: 5,
            sleep_duration: Duration::from_secs(5 * 60),
            attempt_timeout: Duration::from_secs(60),
            min_calls_for_circuit_breaker: 10,
            min_success_rate: 0.2,
            max_latency_consideration_ms: 5000.0,
            max_cost_consideration_per_unit: 0.05,
            learning_rate: 0.01,
            ema_alpha: 0.1,
        }
    }
}

/// Adapter cache behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub scope: AdapterScope,
    pub prune_interval: Duration,
    pub dormancy: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            scope: AdapterScope::default(),
            prune_interval: Duration::from_secs(10 * 60),
            dormancy: Duration::from_secs(15 * 60),
        }
    }
}

/// Where and how often the performance ledger is written
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// `None` keeps the ledger in memory only
    pub path: Option<PathBuf>,
    pub checkpoint_interval: Duration,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data").join("performance_db.json")),
            checkpoint_interval: Duration::from_secs(5),
        }
    }
}

/// Complete router configuration
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub tuning: RouterTuning,
    pub pool: PoolSettings,
    pub persistence: PersistenceSettings,
    /// Always contains [`Intent::Default`]
    pub policies: HashMap<Intent, PolicyWeights>,
    pub providers: Vec<ProviderConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tuning: RouterTuning::default(),
            pool: PoolSettings::default(),
            persistence: PersistenceSettings::default(),
            policies: builtin_policies(),
            providers: Vec::new(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: RouterTuning) -> Self {
        self.tuning = tuning;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, intent: Intent, weights: PolicyWeights) -> Self {
        self.policies.insert(intent, weights);
        self
    }

    /// Disable ledger persistence
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.persistence.path = None;
        self
    }

    /// Policy for an intent, falling back to the default entry
    #[must_use]
    pub fn policy_for(&self, intent: Intent) -> PolicyWeights {
        self.policies
            .get(&intent)
            .or_else(|| self.policies.get(&Intent::Default))
            .copied()
            .unwrap_or_else(|| Intent::Default.builtin_weights())
    }
}
