//! Session controller: owns the observable chat state and the send /
//! stop / clear lifecycle.
//!
//! At most one turn is in flight. A send issued while another is streaming
//! cancels that turn first and waits for it to finalize, so the previous
//! partial reply always lands in the history before the new user message.

use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::history::HistoryReconciler;
use super::task_registry::TaskRegistry;
use super::types::{ChatError, SessionState, TurnOutcome, TurnPhase};
use crate::database::{ChatMessage, ChatRole, ChatSettings, ConversationSummary};
use crate::llm_engine::{ApiMessage, ChatRequest, LlmError, LlmProvider, OllamaModel};

/// How the consume loop ended
enum StreamEnd {
    Completed,
    Cancelled,
    Failed(LlmError),
}

pub struct SessionController {
    provider: Arc<dyn LlmProvider>,
    reconciler: HistoryReconciler,
    settings: RwLock<ChatSettings>,
    state: watch::Sender<SessionState>,
    tasks: TaskRegistry,
    /// Held for the whole of a turn, including finalization
    turn_lock: Mutex<()>,
}

impl SessionController {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        reconciler: HistoryReconciler,
        settings: ChatSettings,
    ) -> Self {
        let initial = SessionState {
            selected_model: settings.selected_model.clone(),
            ..SessionState::default()
        };
        let (state, _) = watch::channel(initial);

        Self {
            provider,
            reconciler,
            settings: RwLock::new(settings),
            state,
            tasks: TaskRegistry::new(),
            turn_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn reconciler(&self) -> &HistoryReconciler {
        &self.reconciler
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// Current settings, with the selected model taken from the live state
    pub fn settings(&self) -> ChatSettings {
        let mut settings = self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        settings.selected_model = self.state.borrow().selected_model.clone();
        settings
    }

    fn update_settings(&self, f: impl FnOnce(&mut ChatSettings)) {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut settings);
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.update_settings(|s| s.system_prompt = prompt);
    }

    pub fn set_streaming_sound(&self, enabled: bool) {
        self.update_settings(|s| s.streaming_sound = enabled);
    }

    pub fn set_voice(&self, voice: Option<String>) {
        self.update_settings(|s| s.voice = voice);
    }

    pub fn set_auto_detect_voice(&self, enabled: bool) {
        self.update_settings(|s| s.auto_detect_voice = enabled);
    }

    /// Point the session at another server and refresh the model list
    pub async fn set_base_url(&self, base_url: impl Into<String>) -> Result<Vec<OllamaModel>, LlmError> {
        let base_url = base_url.into();
        log::info!("Switching Ollama server to {}", base_url);
        self.update_settings(|s| s.base_url = base_url);
        self.fetch_models().await
    }

    /// Refresh the model list. Failures mark the session offline and set the
    /// error banner; the error is also returned for callers that want it.
    pub async fn fetch_models(&self) -> Result<Vec<OllamaModel>, LlmError> {
        let base_url = self.settings().base_url;

        match self.provider.list_models(&base_url).await {
            Ok(models) => {
                log::info!("Found {} models on {}", models.len(), base_url);
                self.state.send_modify(|s| {
                    s.selected_model = match s.selected_model.take() {
                        Some(name) if models.iter().any(|m| m.name == name) => Some(name),
                        _ => models.first().map(|m| m.name.clone()),
                    };
                    s.models = Some(models.clone());
                    s.error = None;
                });
                Ok(models)
            }
            Err(e) => {
                log::error!("Failed to fetch models from {}: {}", base_url, e);
                let mut message = format!("Failed to fetch models: {}", e);
                if matches!(e, LlmError::Unreachable { .. }) {
                    message.push_str(&format!(
                        ". Make sure `ollama serve` is running and reachable at {}",
                        base_url
                    ));
                }
                self.state.send_modify(|s| {
                    s.models = None;
                    s.selected_model = None;
                    s.error = Some(message);
                });
                Err(e)
            }
        }
    }

    /// Ask the server for its version
    pub async fn check_connection(&self) -> Result<String, LlmError> {
        let base_url = self.settings().base_url;
        self.provider.check_connection(&base_url).await
    }

    pub fn select_model(&self, name: &str) -> Result<(), ChatError> {
        let known = match &self.state.borrow().models {
            Some(models) => models.iter().any(|m| m.name == name),
            None => true,
        };
        if !known {
            return Err(ChatError::Validation(format!("Unknown model: {}", name)));
        }

        let name = name.to_string();
        self.state.send_modify(|s| s.selected_model = Some(name));
        Ok(())
    }

    fn validate_send(&self, text: &str) -> Result<String, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("Message cannot be empty".to_string()));
        }
        self.state
            .borrow()
            .selected_model
            .clone()
            .ok_or_else(|| ChatError::Validation("Please select a model first".to_string()))
    }

    /// Send a user message and stream the reply into the state.
    ///
    /// Only validation failures are returned as errors. Transport and stream
    /// failures end the turn with [`TurnOutcome::Failed`] after recording a
    /// synthetic assistant message and the error banner.
    ///
    /// The turn runs on its own task. Dropping the returned future stops the
    /// generation, and the task still commits the partial reply.
    pub async fn send_message(self: &Arc<Self>, text: &str) -> Result<TurnOutcome, ChatError> {
        let model = match self.validate_send(text) {
            Ok(model) => model,
            Err(e) => {
                log::warn!("Rejected send: {}", e);
                let message = e.to_string();
                self.state.send_modify(|s| s.error = Some(message));
                return Err(e);
            }
        };

        // Registering cancels a turn still in flight
        let (turn_id, cancel_token) = self.tasks.register_task();
        let stop_on_drop = cancel_token.clone().drop_guard();

        let turn = tokio::spawn(Arc::clone(self).run_turn(
            turn_id,
            cancel_token,
            text.to_string(),
            model,
        ));
        let result = turn.await;
        stop_on_drop.disarm();

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!("Turn {} task failed: {}", turn_id, e);
                Ok(TurnOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn run_turn(
        self: Arc<Self>,
        turn_id: u64,
        cancel_token: CancellationToken,
        text: String,
        model: String,
    ) -> TurnOutcome {
        // Wait for the previous turn to finalize
        let _turn = self.turn_lock.lock().await;

        let settings = self.settings();
        let history = self.state.borrow().chat_history.clone();
        let messages = build_outgoing_messages(&settings.system_prompt, &history, &text);

        log::info!(
            "Turn {}: sending {} messages to {} via {}",
            turn_id,
            messages.len(),
            model,
            self.provider.provider_name()
        );

        let user_message = ChatMessage::user(text);
        self.state.send_modify(|s| {
            s.chat_history.push(user_message);
            s.current_assistant_message = Some(String::new());
            s.is_loading = true;
            s.error = None;
            s.phase = TurnPhase::Sending;
        });
        self.commit_history(&model);

        let request = ChatRequest::streaming(model.clone(), messages);
        let (content, end) = self
            .consume_stream(&settings.base_url, request, &cancel_token)
            .await;

        let outcome = self.finalize(turn_id, content, end, &model);
        self.tasks.remove_task(turn_id);
        outcome
    }

    async fn consume_stream(
        &self,
        base_url: &str,
        request: ChatRequest,
        cancel_token: &CancellationToken,
    ) -> (String, StreamEnd) {
        let mut content = String::new();

        let mut chunks = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return (content, StreamEnd::Cancelled),
            result = self.provider.stream_chat(base_url, request) => match result {
                Ok(chunks) => chunks,
                Err(e) => return (content, StreamEnd::Failed(e)),
            },
        };

        self.state.send_if_modified(|s| {
            if s.phase == TurnPhase::Sending {
                s.phase = TurnPhase::Streaming;
                true
            } else {
                false
            }
        });

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return (content, StreamEnd::Cancelled),
                next = chunks.next() => next,
            };

            match next {
                None => return (content, StreamEnd::Completed),
                Some(Ok(chunk)) => {
                    let fragment = chunk.content();
                    if !fragment.is_empty() {
                        stream_trace!("Received {} bytes", fragment.len());
                        content.push_str(fragment);
                        self.state.send_modify(|s| {
                            s.current_assistant_message
                                .get_or_insert_with(String::new)
                                .push_str(fragment);
                        });
                    }
                    if chunk.done {
                        stream_debug!("Stream finished, {} bytes total", content.len());
                        return (content, StreamEnd::Completed);
                    }
                }
                Some(Err(e)) => return (content, StreamEnd::Failed(e)),
            }
        }
    }

    fn finalize(&self, turn_id: u64, content: String, end: StreamEnd, model: &str) -> TurnOutcome {
        self.state.send_modify(|s| s.phase = TurnPhase::Finalizing);

        let (message, error, outcome) = match end {
            StreamEnd::Completed => {
                log::info!("Turn {} completed ({} bytes)", turn_id, content.len());
                (Some(ChatMessage::assistant(content)), None, TurnOutcome::Completed)
            }
            StreamEnd::Cancelled => {
                log::info!("Turn {} cancelled after {} bytes", turn_id, content.len());
                let message = (!content.is_empty()).then(|| ChatMessage::assistant(content));
                (message, None, TurnOutcome::Cancelled)
            }
            StreamEnd::Failed(e) => {
                log::error!("Turn {} failed: {}", turn_id, e);
                let reply = format!("Sorry, I encountered an error during the chat: {}", e);
                (
                    Some(ChatMessage::assistant(reply)),
                    Some(format!("Error communicating with Ollama: {}", e)),
                    TurnOutcome::Failed(e.to_string()),
                )
            }
        };

        let appended = message.is_some();
        self.state.send_modify(|s| {
            if let Some(message) = message {
                s.chat_history.push(message);
            }
            s.current_assistant_message = None;
            s.is_loading = false;
            s.error = error;
            s.phase = TurnPhase::Idle;
        });

        if appended {
            self.commit_history(model);
        }
        outcome
    }

    fn commit_history(&self, model: &str) {
        let history = self.state.borrow().chat_history.clone();
        self.reconciler.schedule_save(&history, model);
    }

    /// Request cancellation of the active turn.
    ///
    /// Returns false when idle or when the turn was already asked to stop.
    pub fn stop_generation(&self) -> bool {
        let cancelled = self.tasks.cancel_active();
        if cancelled {
            log::info!("Stopping generation");
            self.state.send_if_modified(|s| {
                if s.is_loading && s.phase != TurnPhase::Cancelling {
                    s.phase = TurnPhase::Cancelling;
                    true
                } else {
                    false
                }
            });
        }
        cancelled
    }

    /// Stop any generation, empty the chat and start a new conversation
    pub async fn clear_chat(&self) -> Result<(), ChatError> {
        self.stop_generation();
        let _turn = self.turn_lock.lock().await;

        self.state.send_modify(|s| {
            s.chat_history.clear();
            s.current_assistant_message = None;
            s.is_loading = false;
            s.error = None;
            s.phase = TurnPhase::Idle;
        });
        log::info!("Chat cleared");

        self.reconciler.reset()
    }

    /// Replace the live chat with a stored conversation.
    ///
    /// Returns false when no conversation has that id.
    pub async fn load_conversation(&self, id: i64) -> Result<bool, ChatError> {
        self.stop_generation();
        let _turn = self.turn_lock.lock().await;

        let conversation = match self.reconciler.load_conversation(id)? {
            Some(conversation) => conversation,
            None => return Ok(false),
        };

        let known = self
            .state
            .borrow()
            .models
            .as_ref()
            .map_or(true, |models| models.iter().any(|m| m.name == conversation.model_id));
        if !known {
            log::warn!(
                "Conversation {} uses model {} which is not installed",
                id,
                conversation.model_id
            );
        }

        self.state.send_modify(|s| {
            s.chat_history = conversation.messages;
            s.selected_model = Some(conversation.model_id);
            s.current_assistant_message = None;
            s.is_loading = false;
            s.error = None;
            s.phase = TurnPhase::Idle;
        });
        Ok(true)
    }

    /// Delete a stored conversation; deleting the live one also clears the chat
    pub async fn delete_conversation(&self, id: i64) -> Result<(), ChatError> {
        if self.reconciler.active_conversation_id() == Some(id) {
            self.stop_generation();
            let _turn = self.turn_lock.lock().await;

            self.reconciler.delete_conversation(id)?;
            self.state.send_modify(|s| {
                s.chat_history.clear();
                s.current_assistant_message = None;
                s.error = None;
            });
            return Ok(());
        }

        self.reconciler.delete_conversation(id)?;
        Ok(())
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        self.reconciler.list_conversations()
    }

    pub fn active_conversation_id(&self) -> Option<i64> {
        self.reconciler.active_conversation_id()
    }

    /// Stop generating and write any pending history
    pub async fn shutdown(&self) -> Result<(), ChatError> {
        self.stop_generation();
        let _turn = self.turn_lock.lock().await;
        self.reconciler.flush().map(|_| ())
    }
}

/// System prompt (when set), then the existing history, then the new user text
pub fn build_outgoing_messages(
    system_prompt: &str,
    history: &[ChatMessage],
    user_text: &str,
) -> Vec<ApiMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if !system_prompt.trim().is_empty() {
        messages.push(ApiMessage::new(ChatRole::System, system_prompt));
    }
    messages.extend(history.iter().map(|m| ApiMessage::new(m.role, m.content.as_str())));
    messages.push(ApiMessage::new(ChatRole::User, user_text));
    messages
}
