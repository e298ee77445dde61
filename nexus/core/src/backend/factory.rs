//! HTTP adapter construction
//!
//! All adapters built here share one `reqwest::Client`, so connection reuse
//! happens at the HTTP layer regardless of the pool scope.

use std::sync::Arc;
use std::time::Duration;

use super::gemini::GeminiAdapter;
use super::openai::OpenAiCompatibleAdapter;
use super::traits::{AdapterError, ProviderAdapter};
use crate::routing::config::{ApiKind, ProviderConfig};
use crate::routing::connection_pool::AdapterFactory;
use crate::routing::credentials::Credential;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds real network adapters, dispatching on [`ApiKind`]
#[derive(Clone)]
pub struct HttpAdapterFactory {
    http_client: reqwest::Client,
}

impl HttpAdapterFactory {
    /// Create a factory with its own HTTP client
    ///
    /// Per-call timeouts are enforced by the router, so the client only
    /// bounds connection setup.
    pub fn new() -> Result<Self, AdapterError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { http_client })
    }

    #[must_use]
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(
        &self,
        provider: &ProviderConfig,
        model: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
        if credential.secret().trim().is_empty() {
            return Err(AdapterError::other(format!(
                "empty credential for provider {}",
                provider.name
            )));
        }

        tracing::debug!(
            provider = %provider.name,
            model,
            credential = %credential.fingerprint(),
            api = ?provider.api,
            "Building provider adapter"
        );

        let adapter: Arc<dyn ProviderAdapter> = match provider.api {
            ApiKind::OpenaiCompatible => Arc::new(OpenAiCompatibleAdapter::new(
                provider.name.clone(),
                model,
                provider.base_url.clone(),
                credential.clone(),
                self.http_client.clone(),
            )),
            ApiKind::Gemini => Arc::new(GeminiAdapter::new(
                provider.name.clone(),
                model,
                provider.base_url.clone(),
                credential.clone(),
                self.http_client.clone(),
            )),
        };
        Ok(adapter)
    }
}
