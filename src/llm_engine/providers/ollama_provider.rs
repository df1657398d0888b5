//! Ollama API provider
//!
//! Connects to a running Ollama server (default: localhost:11434)

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::llm_engine::provider::{
    ChatChunk, ChatRequest, ChunkStream, LlmError, LlmProvider, OllamaModel, OllamaTagResponse,
};
use crate::llm_engine::stream::decode_ndjson;

/// Ollama version response
#[derive(Debug, Deserialize)]
struct OllamaVersion {
    version: String,
}

/// Ollama HTTP client configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Timeout for non-streaming requests (model list, version)
    pub timeout_secs: u64,
    /// Connect timeout; chat streams have no overall timeout
    pub connect_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    config: OllamaConfig,
    client: Client,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn with_default_config() -> Result<Self, LlmError> {
        Self::new(OllamaConfig::default())
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.timeout_secs)
    }

    /// Turn a non-success response into a transport error carrying the body
    async fn transport_error(response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        log::warn!("Ollama returned HTTP {}: {}", status, body);
        LlmError::Transport { status, body }
    }

    fn unreachable(url: &str, e: reqwest::Error) -> LlmError {
        LlmError::Unreachable {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

/// Cut a decoded chunk sequence off after the terminal record.
///
/// A record carrying an `error` field fails the sequence with
/// [`LlmError::Inference`] instead of completing it.
pub(crate) fn until_done<S>(chunks: S) -> ChunkStream
where
    S: futures_util::Stream<Item = Result<ChatChunk, LlmError>> + Send + 'static,
{
    let chunks = Box::pin(chunks);
    Box::pin(stream::unfold(Some(chunks), |state| async move {
        let mut chunks = state?;
        match chunks.next().await? {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    log::error!("Ollama reported an error mid-stream: {}", error);
                    return Some((Err(LlmError::Inference(error)), None));
                }
                if chunk.done {
                    crate::stream_debug!(
                        "Chat stream done (eval_count: {:?}, total_duration: {:?})",
                        chunk.eval_count,
                        chunk.total_duration
                    );
                    // Terminal record: yield it, then end without reading further.
                    return Some((Ok(chunk), None));
                }
                Some((Ok(chunk), Some(chunks)))
            }
            Err(e) => Some((Err(e), None)),
        }
    }))
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_name(&self) -> &'static str {
        "ollama"
    }

    async fn list_models(&self, base_url: &str) -> Result<Vec<OllamaModel>, LlmError> {
        let url = Self::endpoint(base_url, "/api/tags");

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| Self::unreachable(&url, e))?;

        if !response.status().is_success() {
            return Err(Self::transport_error(response).await);
        }

        let tags: OllamaTagResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        log::info!("Fetched {} models from {}", tags.models.len(), base_url);
        Ok(tags.models)
    }

    async fn stream_chat(&self, base_url: &str, request: ChatRequest) -> Result<ChunkStream, LlmError> {
        let url = Self::endpoint(base_url, "/api/chat");

        log::info!(
            "Starting chat with model {} ({} messages)",
            request.model,
            request.messages.len()
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::unreachable(&url, e))?;

        if !response.status().is_success() {
            return Err(Self::transport_error(response).await);
        }

        Ok(until_done(decode_ndjson::<ChatChunk, _, _, _>(response.bytes_stream())))
    }

    async fn check_connection(&self, base_url: &str) -> Result<String, LlmError> {
        let url = Self::endpoint(base_url, "/api/version");

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| Self::unreachable(&url, e))?;

        if !response.status().is_success() {
            return Err(Self::transport_error(response).await);
        }

        let version: OllamaVersion = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(version.version)
    }
}
