//! Provider Adapter Traits
//!
//! Trait definitions for provider adapters. An adapter is bound to one
//! (provider, model, credential) triple and performs a single chat
//! completion per call. The router never sees provider-specific errors:
//! every failure is normalized into a [`FailureKind`] before it leaves the
//! adapter.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Messages
// ============================================================================

/// Role of a chat message author
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation sent to a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Successful completion returned by an adapter
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text
    pub content: String,
    /// Provider-reported stop reason, if any
    pub finish_reason: Option<String>,
    /// Total tokens billed for the call, if reported
    pub usage_tokens: Option<u32>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Failure Taxonomy
// ============================================================================

/// Normalized failure classes shared by every provider
///
/// The credential governor keys its state transitions on these, and the
/// performance ledger keeps a histogram per candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    RateLimit,
    InvalidCredential,
    ContentPolicy,
    ContextTooLong,
    Timeout,
    Other,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::ContentPolicy => "CONTENT_POLICY",
            Self::ContextTooLong => "CONTEXT_TOO_LONG",
            Self::Timeout => "TIMEOUT",
            Self::Other => "OTHER",
        }
    }

    /// Failures caused by the request itself rather than the credential
    #[must_use]
    pub fn is_request_fault(&self) -> bool {
        matches!(self, Self::ContentPolicy | Self::ContextTooLong)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a provider adapter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: FailureKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    /// Build an error from a non-success HTTP response
    pub fn from_http(status: u16, body: &str) -> Self {
        let kind = classify_http_failure(status, body);
        let mut message = format!("HTTP {status}");
        let snippet: String = body.chars().take(200).collect();
        if !snippet.trim().is_empty() {
            message.push_str(": ");
            message.push_str(snippet.trim());
        }
        Self::new(kind, message)
    }

    /// Build an error from a transport-level reqwest failure
    ///
    /// The request URL is stripped first; Gemini carries the key in the
    /// query string.
    pub fn from_transport(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Self::new(FailureKind::Timeout, err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_http(status.as_u16(), &err.to_string())
        } else {
            Self::other(err.to_string())
        }
    }
}

/// Map an HTTP status and response body to a failure class
///
/// Providers disagree on status codes for the same condition, so the body
/// text is consulted as well (Gemini reports quota exhaustion as 400 with a
/// message, OpenAI reports bad keys as 401).
#[must_use]
pub fn classify_http_failure(status: u16, body: &str) -> FailureKind {
    let body = body.to_ascii_lowercase();

    if status == 429
        || body.contains("rate limit")
        || body.contains("rate_limit")
        || body.contains("quota exceeded")
        || body.contains("resource_exhausted")
    {
        return FailureKind::RateLimit;
    }

    if status == 401
        || status == 403
        || body.contains("incorrect api key")
        || body.contains("invalid api key")
        || body.contains("api key not valid")
        || body.contains("authentication failed")
    {
        return FailureKind::InvalidCredential;
    }

    if body.contains("context_length_exceeded")
        || body.contains("maximum context length")
        || body.contains("context length")
        || body.contains("too many tokens")
    {
        return FailureKind::ContextTooLong;
    }

    if body.contains("content_policy")
        || body.contains("content policy")
        || body.contains("safety")
        || body.contains("content_filter")
    {
        return FailureKind::ContentPolicy;
    }

    if status == 408 || status == 504 {
        return FailureKind::Timeout;
    }

    FailureKind::Other
}

// ============================================================================
// Adapter Trait
// ============================================================================

/// A ready-to-call client for one provider model under one credential
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name this adapter talks to
    fn provider(&self) -> &str;

    /// Model identifier sent with every request
    fn model(&self) -> &str;

    /// Perform one completion
    async fn process(&self, messages: &[ChatMessage]) -> Result<Completion, AdapterError>;

    /// Called when the pool evicts this adapter
    fn release(&self) {}
}
