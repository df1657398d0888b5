//! Chat types and structures

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::ChatMessage;
use crate::llm_engine::{LlmError, OllamaModel};

/// Where the current send operation is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Cancelling,
    Finalizing,
}

/// Observable chat state, published to views through a watch channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// `None` when the model list could not be fetched (server offline)
    pub models: Option<Vec<OllamaModel>>,
    pub selected_model: Option<String>,
    /// Finalized messages only
    pub chat_history: Vec<ChatMessage>,
    /// Partial assistant reply while a turn is in flight
    pub current_assistant_message: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub phase: TurnPhase,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            models: Some(Vec::new()),
            selected_model: None,
            chat_history: Vec::new(),
            current_assistant_message: None,
            is_loading: false,
            error: None,
            phase: TurnPhase::Idle,
        }
    }
}

impl SessionState {
    /// True when the last model fetch failed
    pub fn is_offline(&self) -> bool {
        self.models.is_none()
    }
}

/// How a send operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    /// The stream failed; the message explains why
    Failed(String),
}

/// Status of durable saves, shown as a non-fatal banner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStatus {
    pub last_saved_id: Option<i64>,
    pub last_error: Option<String>,
    pub saves: u64,
}

/// Errors surfaced by the chat session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChatError {
    /// Rejected before any network call
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("Failed to save chat history: {0}")]
    Persistence(String),
}
