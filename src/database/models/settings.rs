// Database models - Settings
use serde::{Deserialize, Serialize};

/// Default Ollama endpoint
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Default system prompt for new installs
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI coding assistant. Provide clear, concise, and correct code examples and explanations. Format code blocks appropriately for easy readability.";

/// Runtime chat settings loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSettings {
    pub base_url: String,
    pub system_prompt: String,
    pub streaming_sound: bool,
    pub selected_model: Option<String>,
    pub voice: Option<String>,
    pub auto_detect_voice: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            streaming_sound: false,
            selected_model: None,
            voice: None,
            auto_detect_voice: false,
        }
    }
}
