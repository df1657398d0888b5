// State management for ollama-chat

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::chat::{HistoryReconciler, SessionController, DEFAULT_QUIET_PERIOD};
use crate::database::{ChatSettings, DatabaseManager};
use crate::llm_engine::{OllamaConfig, OllamaProvider};
use crate::voice::{auto_select_voice, SpeechSynthesizer, SystemSpeech, TtsVoice};

/// Start-up configuration. Overrides apply to this run on top of the stored settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub ollama: OllamaConfig,
    pub quiet_period: Duration,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: DatabaseManager::default_path(),
            ollama: OllamaConfig::default(),
            quiet_period: DEFAULT_QUIET_PERIOD,
            base_url: None,
            model: None,
            system_prompt: None,
        }
    }
}

impl AppConfig {
    fn apply_overrides(&self, settings: &mut ChatSettings) {
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(model) = &self.model {
            settings.selected_model = Some(model.clone());
        }
        if let Some(prompt) = &self.system_prompt {
            settings.system_prompt = prompt.clone();
        }
    }
}

/// Everything the front end needs, built once at start-up
pub struct AppState {
    database: Arc<DatabaseManager>,
    session: Arc<SessionController>,
    speech: Arc<dyn SpeechSynthesizer>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_speech(config, Arc::new(SystemSpeech::default()))
    }

    pub fn with_speech(config: AppConfig, speech: Arc<dyn SpeechSynthesizer>) -> Result<Self> {
        let database = Arc::new(
            DatabaseManager::new(config.db_path.clone())
                .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
        );

        let mut settings = database.load_chat_settings()?;
        config.apply_overrides(&mut settings);
        log::info!("Using Ollama at {}", settings.base_url);

        let provider = Arc::new(
            OllamaProvider::new(config.ollama.clone()).context("Failed to build HTTP client")?,
        );
        let reconciler = HistoryReconciler::new(database.clone(), config.quiet_period);
        let session = Arc::new(SessionController::new(provider, reconciler, settings));

        Ok(Self {
            database,
            session,
            speech,
        })
    }

    pub fn db(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn session(&self) -> Arc<SessionController> {
        self.session.clone()
    }

    pub fn speech(&self) -> Arc<dyn SpeechSynthesizer> {
        self.speech.clone()
    }

    /// Persist the session's current settings
    pub fn save_settings(&self) -> Result<()> {
        self.database.save_chat_settings(&self.session.settings())
    }

    /// Voice to read `text` with: detected from the text when enabled, else the configured one
    pub fn voice_for(&self, text: &str) -> TtsVoice {
        let settings = self.session.settings();
        if settings.auto_detect_voice {
            return auto_select_voice(text);
        }
        settings
            .voice
            .as_deref()
            .map(TtsVoice::parse)
            .unwrap_or_default()
    }

    /// Stop any generation and flush pending history
    pub async fn shutdown(&self) -> Result<()> {
        self.session
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to flush chat history")
    }
}
