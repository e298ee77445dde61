//! Provider Backends
//!
//! Adapters that turn a chat request into one HTTP call against a hosted
//! model provider, behind the common [`ProviderAdapter`] trait.
//!
//! # Available Backends
//!
//! - **OpenAI-compatible**: OpenAI, Groq and any `/chat/completions` gateway
//! - **Gemini**: Google Generative Language API
//!
//! # Usage
//!
//! ```ignore
//! use nexus_core::backend::HttpAdapterFactory;
//! use nexus_core::routing::{Orchestrator, PerformanceLedger};
//!
//! let factory = Arc::new(HttpAdapterFactory::new()?);
//! let router = Orchestrator::new(&config, Arc::new(PerformanceLedger::default()), factory);
//! ```

mod factory;
mod gemini;
mod openai;
mod traits;

pub use factory::HttpAdapterFactory;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiCompatibleAdapter;
pub use traits::{
    classify_http_failure, AdapterError, ChatMessage, ChatRole, Completion, FailureKind,
    ProviderAdapter,
};
