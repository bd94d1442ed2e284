use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Marker some serving stacks put before the user-visible answer segment.
pub const FINAL_CHANNEL_MARKER: &str = "<|channel|>final<|message|>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIConfig {
    /// Full URL of an OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for AIConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8085/v1/chat/completions".into(),
            model: "gpt-oss-20b".into(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model endpoint unreachable: {0}")]
    Transport(String),
    #[error("model response could not be parsed: {0}")]
    MalformedResponse(String),
}

impl ModelError {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::Transport(_) => "transport_failure",
            ModelError::MalformedResponse(_) => "malformed_model_response",
        }
    }
}

/// One prompt in, one completion out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    config: AIConfig,
    http_client: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(config: AIConfig) -> Result<Self, ModelError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        Ok(Self { config, http_client })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = self
            .http_client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let send = tokio::time::timeout(self.config.timeout, request.send());
        let resp = send
            .await
            .map_err(|_| ModelError::Transport(format!("no response within {:?}", self.config.timeout)))?
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ModelError::Transport(format!("model API error ({}): {}", status, text)));
        }

        debug!(bytes = text.len(), "model response received");
        let content = parse_completion(&text)?;
        Ok(extract_final_answer(&content).to_string())
    }
}

/// Pull `choices[0].message.content` out of a chat completions body.
pub fn parse_completion(body: &str) -> Result<String, ModelError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::MalformedResponse("response has no choices".into()))?
        .message
        .content
        .ok_or_else(|| ModelError::MalformedResponse("first choice has no content".into()))
}

/// Keep only the segment after the final-channel marker, when present.
pub fn extract_final_answer(content: &str) -> &str {
    match content.split_once(FINAL_CHANNEL_MARKER) {
        Some((_, answer)) => answer.trim_start(),
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_marker_discards_reasoning() {
        let content = "<|channel|>analysis<|message|>thinking...<|channel|>final<|message|>  SELECT 1";
        assert_eq!(extract_final_answer(content), "SELECT 1");
    }

    #[test]
    fn only_first_marker_splits() {
        let content = "a<|channel|>final<|message|>\nb<|channel|>final<|message|>c";
        assert_eq!(extract_final_answer(content), "b<|channel|>final<|message|>c");
    }

    #[test]
    fn content_without_marker_is_unchanged() {
        assert_eq!(extract_final_answer("  SELECT 1  "), "  SELECT 1  ");
    }

    #[test]
    fn parses_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"SELECT 1"}},{"message":{"content":"other"}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "SELECT 1");
    }

    #[test]
    fn malformed_bodies_are_reported() {
        for body in [
            "not json",
            r#"{"choices": []}"#,
            r#"{"choices": [{"message": {"content": null}}]}"#,
            r#"{"result": "SELECT 1"}"#,
        ] {
            let err = parse_completion(body).unwrap_err();
            assert_eq!(err.kind(), "malformed_model_response", "body: {body}");
        }
    }

    #[test]
    fn request_body_has_single_user_message() {
        let body = ChatRequest {
            model: "gpt-oss-20b",
            messages: [ChatMessage {
                role: "user",
                content: "hello",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"model": "gpt-oss-20b", "messages": [{"role": "user", "content": "hello"}]})
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let client = ChatCompletionsClient::new(AIConfig {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".into(),
            timeout: Duration::from_secs(2),
            ..AIConfig::default()
        })
        .unwrap();
        let err = client.generate("hi").await.unwrap_err();
        assert_eq!(err.kind(), "transport_failure");
    }
}
