//! LLM Provider trait and types
//!
//! Defines the wire types of the Ollama chat API and the interface the chat
//! session uses to talk to an inference server.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::ChatRole;

/// Error types for LLM operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// The server could not be reached at all (not running, wrong URL, ...)
    #[error("Cannot connect to Ollama at {url}: {message}")]
    Unreachable { url: String, message: String },
    /// Non-success HTTP status on model listing or chat initiation
    #[error("HTTP {status}: {body}")]
    Transport { status: u16, body: String },
    /// The response body broke off mid-stream
    #[error("Stream error: {0}")]
    Stream(String),
    /// The final buffered stream fragment was not valid JSON
    #[error("Error parsing final JSON chunk: {0}")]
    Decode(String),
    /// The server reported an error inside the stream
    #[error("{0}")]
    Inference(String),
    /// A non-streaming response body could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Model entry from `GET /api/tags`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: OllamaModelDetails,
}

impl OllamaModel {
    /// Short human-readable description, e.g. "llama - 3.2B - Q4_K_M"
    pub fn description(&self) -> String {
        [
            self.details.family.as_str(),
            self.details.parameter_size.as_str(),
            self.details.quantization_level.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" - ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OllamaModelDetails {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub families: Option<Vec<String>>,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

/// Ollama model list response
#[derive(Debug, Deserialize)]
pub(crate) struct OllamaTagResponse {
    pub models: Vec<OllamaModel>,
}

/// A message as sent to the chat endpoint (role and content only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ApiMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// A streaming chat request
    pub fn streaming(model: impl Into<String>, messages: Vec<ApiMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }
}

/// Content delta carried by a chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMessage {
    #[serde(default = "assistant_role")]
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
}

fn assistant_role() -> ChatRole {
    ChatRole::Assistant
}

/// One NDJSON record of the streaming chat response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatChunk {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

impl ChatChunk {
    /// The content fragment of this chunk ("" when absent)
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Lazy sequence of decoded chat chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// The interface the chat session needs from an inference server
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name (e.g., "ollama")
    fn provider_name(&self) -> &'static str;

    /// List the models available on the server
    async fn list_models(&self, base_url: &str) -> Result<Vec<OllamaModel>, LlmError>;

    /// Start a streaming chat completion.
    ///
    /// Fails before yielding anything on a non-success status. The returned
    /// stream ends after the record with `done = true`.
    async fn stream_chat(&self, base_url: &str, request: ChatRequest) -> Result<ChunkStream, LlmError>;

    /// Check the server is running and return its version
    async fn check_connection(&self, base_url: &str) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest::streaming(
            "llama3.2",
            vec![
                ApiMessage::new(ChatRole::System, "be nice"),
                ApiMessage::new(ChatRole::User, "hi"),
            ],
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "llama3.2",
                "messages": [
                    {"role": "system", "content": "be nice"},
                    {"role": "user", "content": "hi"}
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn test_chunk_deserialization() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"model":"llama3.2","created_at":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":"He"},"done":false}"#,
        ).unwrap();
        assert_eq!(chunk.content(), "He");
        assert!(!chunk.done);
        assert!(chunk.error.is_none());

        let last: ChatChunk = serde_json::from_str(
            r#"{"model":"llama3.2","created_at":"2024-01-01T00:00:01Z","message":{"role":"assistant","content":""},"done":true,"total_duration":12345,"eval_count":7}"#,
        ).unwrap();
        assert!(last.done);
        assert_eq!(last.eval_count, Some(7));
        assert_eq!(last.total_duration, Some(12345));
    }

    #[test]
    fn test_error_chunk_without_message() {
        let chunk: ChatChunk = serde_json::from_str(r#"{"error":"model 'nope' not found"}"#).unwrap();
        assert_eq!(chunk.content(), "");
        assert_eq!(chunk.error.as_deref(), Some("model 'nope' not found"));
    }

    #[test]
    fn test_tags_deserialization() {
        let tags: OllamaTagResponse = serde_json::from_str(
            r#"{"models":[{"name":"llama3.2:latest","model":"llama3.2:latest","modified_at":"2024-10-01T10:00:00Z","size":2019393189,"digest":"a80c4f17acd5","details":{"format":"gguf","family":"llama","families":["llama"],"parameter_size":"3.2B","quantization_level":"Q4_K_M"}}]}"#,
        ).unwrap();
        assert_eq!(tags.models.len(), 1);
        let model = &tags.models[0];
        assert_eq!(model.size, 2019393189);
        assert_eq!(model.details.families, Some(vec!["llama".to_string()]));
        assert_eq!(model.description(), "llama - 3.2B - Q4_K_M");
    }
}
