//! Adaptive Multi-Provider Routing
//!
//! Routes each generation request to the best available (provider, model,
//! credential) candidate, learns from every outcome, and backs off globally
//! when the whole fleet is failing.
//!
//! # Architecture
//!
//! ```text
//! +--------------------+
//! |    Orchestrator    |  <-- Entry point, sleep mode, attempt loop
//! +---------+----------+
//!           |
//!           v
//! +--------------------+       +----------------------+
//! |    PolicyEngine    | ----> |  PerformanceLedger   |  <-- EMA latency,
//! +---------+----------+       +----------+-----------+      success rates
//!           |                             |
//!           v                             v
//! +--------------------+       +----------------------+
//! | CredentialGovernor |       |  persistence (JSON)  |
//! +---------+----------+       +----------------------+
//!           |
//!           v
//! +--------------------+
//! |   ConnectionPool   |  <-- Cached adapters, dormancy pruning
//! +---------+----------+
//!           |
//!      +----+----+
//!      |         |
//!      v         v
//!  +------+  +------+
//!  |OpenAI|  |Gemini|  <-- HTTP adapters
//!  +------+  +------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Score, don't guess**: every candidate is ranked by the intent's
//!    quality/latency/cost weights against observed performance
//! 2. **Credential isolation**: a rate-limited or revoked key is benched
//!    without taking its provider down
//! 3. **Global backpressure**: when nothing works, stop calling out for a
//!    while instead of hammering providers

pub mod config;
pub mod connection_pool;
pub mod credentials;
pub mod ledger;
pub mod persistence;
pub mod policy;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use config::{
    builtin_policies, ApiKind, Intent, PersistenceSettings, PolicyWeights, PoolSettings,
    ProviderConfig, ProviderWeights, RouterConfig, RouterTuning,
};
pub use connection_pool::{AdapterFactory, AdapterScope, ConnectionPool, PoolError, PoolStats};
pub use credentials::{
    fingerprint, Credential, CredentialGovernor, CredentialSnapshot, CredentialStatus,
};
pub use ledger::{CandidateKey, CandidateMetrics, PerformanceLedger, PerformanceRecord};
pub use persistence::{spawn_checkpointer, PersistenceError};
pub use policy::{
    modulate_weights, score_candidate, PolicyEngine, ScoredCandidate, StressSignal, StressSource,
};
pub use router::{
    AttemptOutcome, AttemptRecord, GenerateRequest, GenerateResponse, Orchestrator, RouterError,
    RouterState,
};
