//! TOML Configuration File Support
//!
//! Centralized configuration loading for the router, from a TOML file at
//! `~/.config/nexus/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/nexus/router.toml` (typically `~/.config/nexus/router.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [router]
//! max_attempts_per_request = 5
//! sleep_duration_ms = 300000
//! attempt_timeout_ms = 60000
//!
//! [pool]
//! scope = "per_credential"
//! dormancy_secs = 900
//!
//! [persistence]
//! path = "data/performance_db.json"
//! checkpoint_interval_secs = 5
//!
//! [policies.code_generation]
//! w_q = 0.8
//! w_l = 0.1
//! w_c = 0.1
//!
//! [providers.openai]
//! api = "openai_compatible"
//! models = ["gpt-4o", "gpt-4-turbo", "gpt-3.5-turbo"]
//! credential_env = ["OPENAI_API_KEY_1", "OPENAI_API_KEY_2"]
//! ```
//!
//! # Credentials
//!
//! Secrets are normally referenced by environment variable name
//! (`credential_env`, or `credential_env_prefix` which reads `PREFIX_1`,
//! `PREFIX_2`, ... until the first gap). Empty values and unfilled
//! placeholders containing `YOUR_` are dropped. When the file declares no
//! providers at all, the built-in OpenAI, Gemini and Groq entries are used.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{
    AdapterScope, ApiKind, Intent, PolicyWeights, ProviderConfig, ProviderWeights, RouterConfig,
};

/// Upper bound on `credential_env_prefix` expansion
const MAX_PREFIXED_CREDENTIALS: usize = 64;

/// Marker left in unfilled sample keys
const PLACEHOLDER_MARKER: &str = "YOUR_";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Cli,
    Env,
    File,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[router]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    pub max_attempts_per_request: Option<usize>,
    pub sleep_duration_ms: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
    pub min_calls_for_circuit_breaker: Option<u64>,
    pub min_success_rate: Option<f64>,
    pub max_latency_consideration_ms: Option<f64>,
    pub max_cost_consideration_per_unit: Option<f64>,
    pub learning_rate: Option<f64>,
    pub ema_alpha: Option<f64>,
}

/// `[pool]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    pub scope: Option<AdapterScope>,
    pub prune_interval_secs: Option<u64>,
    pub dormancy_secs: Option<u64>,
}

/// `[persistence]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceToml {
    pub path: Option<PathBuf>,
    /// `false` keeps the ledger in memory only
    pub enabled: Option<bool>,
    pub checkpoint_interval_secs: Option<u64>,
}

/// One `[policies.<intent>]` table; missing weights take the built-in value
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyToml {
    pub w_q: Option<f64>,
    pub w_l: Option<f64>,
    pub w_c: Option<f64>,
}

/// One `[providers.<name>]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    pub api: Option<ApiKind>,
    pub base_url: Option<String>,
    pub models: Vec<String>,
    pub model_order: BTreeMap<String, u32>,
    pub cost_per_unit: BTreeMap<String, f64>,
    pub quality_weight: Option<f64>,
    pub latency_weight: Option<f64>,
    pub cost_weight: Option<f64>,
    /// Literal secrets; prefer `credential_env`
    pub credentials: Vec<String>,
    pub credential_env: Vec<String>,
    pub credential_env_prefix: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusToml {
    pub router: RouterToml,
    pub pool: PoolToml,
    pub persistence: PersistenceToml,
    pub policies: BTreeMap<String, PolicyToml>,
    pub providers: BTreeMap<String, ProviderToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Fully resolved configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct NexusConfig {
    pub router: RouterConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl NexusConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }
}

// =============================================================================
// Built-in Providers
// =============================================================================

/// Providers used when the configuration file declares none
#[must_use]
pub fn builtin_providers() -> BTreeMap<String, ProviderToml> {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderToml {
            api: Some(ApiKind::OpenaiCompatible),
            models: vec!["gpt-4o".into(), "gpt-4-turbo".into(), "gpt-3.5-turbo".into()],
            credential_env: vec!["OPENAI_API_KEY_1".into(), "OPENAI_API_KEY_2".into()],
            ..ProviderToml::default()
        },
    );
    providers.insert(
        "gemini".to_string(),
        ProviderToml {
            api: Some(ApiKind::Gemini),
            models: vec!["gemini-1.5-pro-latest".into(), "gemini-pro".into()],
            quality_weight: Some(0.9),
            credential_env: vec!["GEMINI_API_KEY_1".into(), "GEMINI_API_KEY_2".into()],
            ..ProviderToml::default()
        },
    );
    providers.insert(
        "groq".to_string(),
        ProviderToml {
            api: Some(ApiKind::OpenaiCompatible),
            base_url: Some("https://api.groq.com/openai/v1".into()),
            models: vec!["llama3-8b-8192".into(), "llama3-70b-8192".into()],
            quality_weight: Some(0.8),
            latency_weight: Some(0.5),
            credential_env: vec!["GROQ_API_KEY_1".into()],
            ..ProviderToml::default()
        },
    );
    providers
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/nexus/router.toml` or
/// `~/.config/nexus/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("nexus").join("router.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration fails validation. A missing config file is not
/// an error (defaults are used).
pub fn load_config() -> Result<NexusConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<NexusConfig, ConfigError> {
    let mut toml_config = NexusToml::default();
    let mut config = NexusConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml_config = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    let env = |name: &str| std::env::var(name).ok();
    apply_toml_config(&mut config.router, &toml_config, &env)?;
    if apply_env_config(&mut config.router, &env) {
        config.source = ConfigSource::Env;
    }
    validate(&config.router)?;

    Ok(config)
}

/// Parse a TOML string into a resolved router configuration
///
/// Credentials are resolved through `env`, which makes this usable without
/// touching the process environment.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or the result is invalid.
pub fn parse_router_config(
    toml_content: &str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<RouterConfig, ConfigError> {
    let toml_config: NexusToml = toml::from_str(toml_content)?;
    let mut router = RouterConfig::default();
    apply_toml_config(&mut router, &toml_config, env)?;
    validate(&router)?;
    Ok(router)
}

/// Apply TOML configuration values to the router config
fn apply_toml_config(
    config: &mut RouterConfig,
    toml: &NexusToml,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    // Router tunables
    let router = &toml.router;
    let tuning = &mut config.tuning;
    if let Some(n) = router.max_attempts_per_request {
        tuning.max_attempts_per_request = n;
    }
    if let Some(ms) = router.sleep_duration_ms {
        tuning.sleep_duration = Duration::from_millis(ms);
    }
    if let Some(ms) = router.attempt_timeout_ms {
        tuning.attempt_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = router.min_calls_for_circuit_breaker {
        tuning.min_calls_for_circuit_breaker = n;
    }
    if let Some(rate) = router.min_success_rate {
        tuning.min_success_rate = rate;
    }
    if let Some(cap) = router.max_latency_consideration_ms {
        tuning.max_latency_consideration_ms = cap;
    }
    if let Some(cap) = router.max_cost_consideration_per_unit {
        tuning.max_cost_consideration_per_unit = cap;
    }
    if let Some(lr) = router.learning_rate {
        tuning.learning_rate = lr;
    }
    if let Some(alpha) = router.ema_alpha {
        tuning.ema_alpha = alpha;
    }

    // Pool settings
    if let Some(scope) = toml.pool.scope {
        config.pool.scope = scope;
    }
    if let Some(secs) = toml.pool.prune_interval_secs {
        config.pool.prune_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.pool.dormancy_secs {
        config.pool.dormancy = Duration::from_secs(secs);
    }

    // Persistence settings
    if let Some(ref path) = toml.persistence.path {
        config.persistence.path = Some(path.clone());
    }
    if toml.persistence.enabled == Some(false) {
        config.persistence.path = None;
    }
    if let Some(secs) = toml.persistence.checkpoint_interval_secs {
        config.persistence.checkpoint_interval = Duration::from_secs(secs);
    }

    // Policies
    for (label, policy) in &toml.policies {
        let intent: Intent = label
            .parse()
            .map_err(|e: String| invalid(format!("policies.{label}: {e}")))?;
        let weights = resolve_policy(intent, policy)
            .map_err(|e| invalid(format!("policies.{label}: {e}")))?;
        config.policies.insert(intent, weights);
    }

    // Providers
    let declared = if toml.providers.is_empty() {
        tracing::debug!("No providers configured, using built-in provider table");
        builtin_providers()
    } else {
        toml.providers.clone()
    };
    config.providers = declared
        .iter()
        .map(|(name, provider)| resolve_provider(name, provider, env))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(())
}

fn resolve_policy(intent: Intent, policy: &PolicyToml) -> Result<PolicyWeights, String> {
    let builtin = intent.builtin_weights();
    let raw = PolicyWeights::new(
        policy.w_q.unwrap_or(builtin.w_q),
        policy.w_l.unwrap_or(builtin.w_l),
        policy.w_c.unwrap_or(builtin.w_c),
    );
    for (name, value) in [("w_q", raw.w_q), ("w_l", raw.w_l), ("w_c", raw.w_c)] {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("{name} must be a non-negative number, got {value}"));
        }
    }
    raw.normalized()
        .ok_or_else(|| "weights must have a positive sum".to_string())
}

fn resolve_provider(
    name: &str,
    toml: &ProviderToml,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ProviderConfig, ConfigError> {
    if toml.models.is_empty() {
        return Err(invalid(format!("provider '{name}' lists no models")));
    }

    let api = toml.api.unwrap_or_default();
    let mut provider = ProviderConfig::new(name, api).with_models(toml.models.iter().cloned());
    if let Some(ref base_url) = toml.base_url {
        provider = provider.with_base_url(base_url.clone());
    }

    for (model, rank) in &toml.model_order {
        if !provider.has_model(model) {
            return Err(invalid(format!(
                "provider '{name}' ranks unlisted model '{model}'"
            )));
        }
        provider.model_order.insert(model.clone(), *rank);
    }
    for (model, cost) in &toml.cost_per_unit {
        if !provider.has_model(model) {
            return Err(invalid(format!(
                "provider '{name}' prices unlisted model '{model}'"
            )));
        }
        if !cost.is_finite() || *cost < 0.0 {
            return Err(invalid(format!(
                "provider '{name}' cost for '{model}' must be a non-negative number"
            )));
        }
        provider.cost_per_unit.insert(model.clone(), *cost);
    }

    let defaults = ProviderWeights::default();
    provider.weights = ProviderWeights {
        quality: toml.quality_weight.unwrap_or(defaults.quality),
        latency: toml.latency_weight.unwrap_or(defaults.latency),
        cost: toml.cost_weight.unwrap_or(defaults.cost),
    };

    provider.credentials = resolve_credentials(toml, env);
    if provider.credentials.is_empty() {
        tracing::warn!(
            provider = %name,
            "Provider has no usable credentials and will not receive requests"
        );
    } else {
        tracing::debug!(
            provider = %name,
            credentials = provider.credentials.len(),
            "Resolved provider credentials"
        );
    }

    Ok(provider)
}

/// Collect secrets from literals, named env vars and a numbered prefix
fn resolve_credentials(toml: &ProviderToml, env: &dyn Fn(&str) -> Option<String>) -> Vec<String> {
    let mut secrets: Vec<String> = toml.credentials.clone();
    secrets.extend(toml.credential_env.iter().filter_map(|var| env(var)));

    if let Some(ref prefix) = toml.credential_env_prefix {
        for idx in 1..=MAX_PREFIXED_CREDENTIALS {
            match env(&format!("{prefix}_{idx}")) {
                Some(secret) => secrets.push(secret),
                None => break,
            }
        }
    }

    let mut usable: Vec<String> = Vec::with_capacity(secrets.len());
    for secret in secrets {
        let secret = secret.trim().to_string();
        if secret.is_empty() || secret.contains(PLACEHOLDER_MARKER) || usable.contains(&secret) {
            continue;
        }
        usable.push(secret);
    }
    usable
}

/// Apply environment variable overrides; returns whether any applied
fn apply_env_config(config: &mut RouterConfig, env: &dyn Fn(&str) -> Option<String>) -> bool {
    let mut applied = false;

    if let Some(n) = env("NEXUS_MAX_ATTEMPTS").and_then(|v| v.parse::<usize>().ok()) {
        config.tuning.max_attempts_per_request = n;
        applied = true;
    }
    if let Some(ms) = env("NEXUS_SLEEP_DURATION_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.tuning.sleep_duration = Duration::from_millis(ms);
        applied = true;
    }
    if let Some(ms) = env("NEXUS_ATTEMPT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.tuning.attempt_timeout = Duration::from_millis(ms);
        applied = true;
    }
    if let Some(lr) = env("NEXUS_LEARNING_RATE").and_then(|v| v.parse::<f64>().ok()) {
        config.tuning.learning_rate = lr;
        applied = true;
    }
    if let Some(path) = env("NEXUS_PERFORMANCE_DB").filter(|p| !p.is_empty()) {
        config.persistence.path = Some(PathBuf::from(path));
        applied = true;
    }

    applied
}

/// Check tunables and provider settings for sane ranges
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] naming the first bad value.
pub fn validate(config: &RouterConfig) -> Result<(), ConfigError> {
    let tuning = &config.tuning;
    if tuning.max_attempts_per_request < 1 {
        return Err(invalid("max_attempts_per_request must be at least 1"));
    }
    if !(0.0..=1.0).contains(&tuning.min_success_rate) {
        return Err(invalid("min_success_rate must be within [0, 1]"));
    }
    if !(tuning.max_latency_consideration_ms.is_finite() && tuning.max_latency_consideration_ms > 0.0)
    {
        return Err(invalid("max_latency_consideration_ms must be positive"));
    }
    if !(tuning.max_cost_consideration_per_unit.is_finite()
        && tuning.max_cost_consideration_per_unit > 0.0)
    {
        return Err(invalid("max_cost_consideration_per_unit must be positive"));
    }
    if !(tuning.learning_rate.is_finite() && tuning.learning_rate >= 0.0) {
        return Err(invalid("learning_rate must be a non-negative number"));
    }
    if !(tuning.ema_alpha > 0.0 && tuning.ema_alpha <= 1.0) {
        return Err(invalid("ema_alpha must be within (0, 1]"));
    }
    if tuning.attempt_timeout.is_zero() {
        return Err(invalid("attempt_timeout_ms must be positive"));
    }

    if !config.policies.contains_key(&Intent::Default) {
        return Err(invalid("a default policy is required"));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for provider in &config.providers {
        if !seen.insert(provider.name.as_str()) {
            return Err(invalid(format!("provider '{}' declared twice", provider.name)));
        }
        let model_count = provider.models.len();
        for (model, rank) in &provider.model_order {
            if usize::try_from(*rank).map_or(true, |r| r >= model_count) {
                return Err(invalid(format!(
                    "provider '{}' rank {rank} for '{model}' must be below the model count {model_count}",
                    provider.name
                )));
            }
        }
        let weights = provider.weights;
        for (name, value) in [
            ("quality_weight", weights.quality),
            ("latency_weight", weights.latency),
            ("cost_weight", weights.cost),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!(
                    "provider '{}' {name} must be positive, got {value}",
                    provider.name
                )));
            }
        }
    }

    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub performance_db: Option<PathBuf>,
    pub max_attempts: Option<usize>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_performance_db(mut self, path: PathBuf) -> Self {
        self.performance_db = Some(path);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut NexusConfig) {
        if self.performance_db.is_some() || self.max_attempts.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.performance_db {
            config.router.persistence.path = Some(path.clone());
        }

        if let Some(attempts) = self.max_attempts {
            config.router.tuning.max_attempts_per_request = attempts.max(1);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
