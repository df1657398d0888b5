// Database module for ollama-chat
// Provides SQLite persistence for conversations and runtime settings

pub mod manager;
pub mod migrations;
pub mod models;
pub mod settings_repo;
pub mod conversation_repo;

pub use manager::DatabaseManager;
pub use conversation_repo::ConversationStore;
pub use models::*;
