//! Nexus Core - Adaptive Multi-Provider LLM Routing
//!
//! This crate routes text-generation requests across several hosted model
//! providers, each with several models and several API credentials. It
//! learns from every call which (provider, model, credential) combination
//! serves a given kind of request best, and keeps serving when individual
//! keys or whole providers fail.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Callers                                 │
//! │        nexus-daemon (JSON lines)  ·  embedding applications       │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ GenerateRequest
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                        NEXUS CORE                                 │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                      Orchestrator                            │  │
//! │  │  ┌──────────┐  ┌────────────┐  ┌───────────┐  ┌──────────┐  │  │
//! │  │  │  Policy  │  │ Credential │  │  Ledger   │  │   Pool   │  │  │
//! │  │  │  Engine  │  │ Governors  │  │ (+ disk)  │  │          │  │  │
//! │  │  └──────────┘  └────────────┘  └───────────┘  └────┬─────┘  │  │
//! │  └──────────────────────────────────────────────────────┼───────┘  │
//! └─────────────────────────────────────────────────────────┼─────────┘
//!                                                           │ HTTP
//!                                       OpenAI · Groq · Gemini · ...
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: request entry point, retry loop and sleep mode
//! - [`PolicyEngine`]: candidate scoring and online weight adaptation
//! - [`CredentialGovernor`]: per-provider credential health and rotation
//! - [`PerformanceLedger`]: per-candidate latency and success history
//! - [`ConnectionPool`]: cached provider adapters
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use nexus_core::{load_config, GenerateRequest, HttpAdapterFactory, Orchestrator, PerformanceLedger};
//!
//! let config = load_config()?;
//! let ledger = Arc::new(PerformanceLedger::new(config.router.tuning.ema_alpha));
//! let factory = Arc::new(HttpAdapterFactory::new()?);
//! let router = Orchestrator::new(&config.router, ledger, factory);
//! router.spawn_background();
//!
//! let response = router.generate_text(GenerateRequest::prompt("Hello!")).await;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: provider adapter trait, failure taxonomy and HTTP adapters
//! - [`routing`]: ledger, governors, pool, policy engine and orchestrator
//! - [`config`]: TOML, environment and CLI configuration loading

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod routing;

// Backend exports
pub use backend::{
    AdapterError, ChatMessage, ChatRole, Completion, FailureKind, HttpAdapterFactory,
    ProviderAdapter,
};

// Routing exports
pub use routing::{
    AdapterFactory, AdapterScope, ApiKind, AttemptOutcome, AttemptRecord, CandidateKey,
    ConnectionPool, CredentialGovernor, CredentialStatus, GenerateRequest, GenerateResponse,
    Intent, Orchestrator, PerformanceLedger, PolicyEngine, PolicyWeights, ProviderConfig,
    RouterConfig, RouterError, RouterState, RouterTuning, StressSignal, StressSource,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, NexusConfig, NexusToml,
};
