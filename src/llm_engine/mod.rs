//! LLM Engine module: the inference-server side of the chat client
//!
//! - provider.rs: wire types, `LlmError`, and the `LlmProvider` trait
//! - stream.rs: NDJSON body decoder
//! - providers/: the Ollama HTTP client

pub mod provider;
pub mod stream;
pub mod providers;

pub use provider::{
    ApiMessage, ChatChunk, ChatRequest, ChunkMessage, ChunkStream, LlmError, LlmProvider,
    OllamaModel, OllamaModelDetails,
};
pub use providers::{OllamaConfig, OllamaProvider};
