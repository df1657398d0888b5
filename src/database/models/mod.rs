// Database models - Re-exports all domain-specific models
//
// - settings.rs: Runtime chat settings
// - chat.rs: Conversations and their messages

mod settings;
mod chat;

pub use settings::{ChatSettings, DEFAULT_BASE_URL, DEFAULT_SYSTEM_PROMPT};
pub use chat::{ChatRole, ChatMessage, Conversation, ConversationSummary};
