// ollama-chat - chat with models served by a local Ollama instance
//
// - llm_engine: Ollama HTTP client and NDJSON stream decoding
// - chat: session state, send/stop lifecycle, debounced history saving
// - database: SQLite conversation store and settings
// - voice: optional speech output for replies

// Stream logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

pub mod database;
pub mod llm_engine;
pub mod chat;
pub mod voice;
pub mod state;

pub use chat::{ChatError, SessionController, SessionState, TurnOutcome, TurnPhase};
pub use state::{AppConfig, AppState};

/// Initialize env_logger to output to stderr (reads RUST_LOG env var)
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
