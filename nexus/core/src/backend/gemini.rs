//! Gemini Adapter
//!
//! Calls the Generative Language REST API directly:
//! `POST {base_url}/models/{model}:generateContent?key=<key>`.
//!
//! Gemini has no system role in `contents`; system messages are folded into
//! `systemInstruction`, and the assistant role is called `model`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::traits::{AdapterError, ChatMessage, ChatRole, Completion, FailureKind, ProviderAdapter};
use crate::routing::credentials::Credential;

/// Adapter for Google Gemini models
pub struct GeminiAdapter {
    provider: String,
    model: String,
    base_url: String,
    credential: Credential,
    http_client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        credential: Credential,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            base_url: base_url.into(),
            credential,
            http_client,
        }
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u32>,
}

pub(crate) fn build_request(messages: &[ChatMessage]) -> GenerateContentRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        let role = match message.role {
            ChatRole::System => {
                system_parts.push(Part {
                    text: message.content.clone(),
                });
                continue;
            }
            ChatRole::User => "user",
            ChatRole::Assistant => "model",
        };
        contents.push(Content {
            role: Some(role.to_string()),
            parts: vec![Part {
                text: message.content.clone(),
            }],
        });
    }

    GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        }),
    }
}

pub(crate) fn parse_response(body: GenerateContentResponse) -> Result<Completion, AdapterError> {
    if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(AdapterError::new(
            FailureKind::ContentPolicy,
            format!("prompt blocked: {reason}"),
        ));
    }

    let usage_tokens = body.usage_metadata.and_then(|u| u.total_token_count);
    let Some(candidate) = body.candidates.into_iter().next() else {
        return Err(AdapterError::other("response contained no candidates"));
    };

    let content: String = candidate
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if content.is_empty() && candidate.finish_reason.as_deref() == Some("SAFETY") {
        return Err(AdapterError::new(
            FailureKind::ContentPolicy,
            "candidate withheld for safety",
        ));
    }

    Ok(Completion {
        content,
        finish_reason: candidate.finish_reason,
        usage_tokens,
    })
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn process(&self, messages: &[ChatMessage]) -> Result<Completion, AdapterError> {
        let response = self
            .http_client
            .post(self.generate_url())
            .query(&[("key", self.credential.secret())])
            .json(&build_request(messages))
            .send()
            .await
            .map_err(AdapterError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_http(status.as_u16(), &body));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(AdapterError::from_transport)?;
        parse_response(body)
    }
}
