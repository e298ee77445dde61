//! OpenAI-Compatible Adapter
//!
//! Speaks the `/chat/completions` dialect shared by OpenAI, Groq and most
//! hosted inference gateways.
//!
//! # API
//!
//! - `POST {base_url}/chat/completions` with `Authorization: Bearer <key>`
//! - Request: `{ "model", "messages": [{ "role", "content" }] }`
//! - Response: `choices[0].message.content`, `choices[0].finish_reason`,
//!   `usage.total_tokens`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::traits::{AdapterError, ChatMessage, Completion, FailureKind, ProviderAdapter};
use crate::routing::credentials::Credential;

/// Adapter for OpenAI-style chat completion endpoints
pub struct OpenAiCompatibleAdapter {
    provider: String,
    model: String,
    base_url: String,
    credential: Credential,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
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

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

pub(crate) fn build_request<'a>(
    model: &'a str,
    messages: &'a [ChatMessage],
) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest { model, messages }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: Option<u32>,
}

/// Turn a decoded response body into a completion
pub(crate) fn parse_response(body: ChatCompletionResponse) -> Result<Completion, AdapterError> {
    let usage_tokens = body.usage.and_then(|u| u.total_tokens);
    let Some(choice) = body.choices.into_iter().next() else {
        return Err(AdapterError::other("response contained no choices"));
    };

    let content = choice.message.and_then(|m| m.content).unwrap_or_default();
    if content.is_empty() && choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(AdapterError::new(
            FailureKind::ContentPolicy,
            "completion withheld by content filter",
        ));
    }

    Ok(Completion {
        content,
        finish_reason: choice.finish_reason,
        usage_tokens,
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn process(&self, messages: &[ChatMessage]) -> Result<Completion, AdapterError> {
        let response = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(self.credential.secret())
            .json(&build_request(&self.model, messages))
            .send()
            .await
            .map_err(AdapterError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_http(status.as_u16(), &body));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(AdapterError::from_transport)?;
        parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_body_shape() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
        ];
        let json = serde_json::to_value(build_request("gpt-4o-mini", &messages)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "hello" }
                ]
            })
        );
    }

    #[test]
    fn test_parse_first_choice() {
        let body: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": "hi there" }, "finish_reason": "stop" },
                { "index": 1, "message": { "role": "assistant", "content": "ignored" }, "finish_reason": "stop" }
            ],
            "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
        }))
        .unwrap();

        let completion = parse_response(body).unwrap();
        assert_eq!(completion.content, "hi there");
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage_tokens, Some(8));
    }

    #[test]
    fn test_no_choices_is_other() {
        let body: ChatCompletionResponse =
            serde_json::from_value(serde_json::json!({ "choices": [] })).unwrap();
        assert_eq!(parse_response(body).unwrap_err().kind, FailureKind::Other);
    }

    #[test]
    fn test_filtered_completion_is_content_policy() {
        let body: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{ "message": { "content": null }, "finish_reason": "content_filter" }]
        }))
        .unwrap();
        assert_eq!(
            parse_response(body).unwrap_err().kind,
            FailureKind::ContentPolicy
        );
    }

    #[test]
    fn test_completions_url_trims_slash() {
        let adapter = OpenAiCompatibleAdapter::new(
            "groq",
            "llama3-8b-8192",
            "https://api.groq.com/openai/v1/",
            Credential::new("k"),
            reqwest::Client::new(),
        );
        assert_eq!(
            adapter.completions_url(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }
}
