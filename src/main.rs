use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;

use ollama_chat::chat::{group_by_recency, ChatError, SessionController, TurnOutcome};
use ollama_chat::database::{ChatRole, ConversationStore, DatabaseManager};
use ollama_chat::voice::{speak_detached, TtsVoice};
use ollama_chat::{AppConfig, AppState};

#[derive(Parser)]
#[command(name = "ollama-chat", about = "Chat with models served by a local Ollama instance", version)]
struct Cli {
    /// Ollama server URL (default: stored setting, then http://localhost:11434)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Model to chat with
    #[arg(long, global = true)]
    model: Option<String>,

    /// System prompt for this run
    #[arg(long, global = true)]
    system_prompt: Option<String>,

    /// Quiet period before chat history is saved
    #[arg(long, global = true, default_value = "1000")]
    debounce_ms: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat (default)
    Chat,

    /// Send one prompt and print the reply
    Ask {
        /// Prompt text
        prompt: String,
    },

    /// List installed models
    Models,

    /// Check that the server is reachable
    Status,

    /// List saved conversations
    History,

    /// Print a saved conversation
    Show {
        /// Conversation id
        id: i64,
    },

    /// Delete a saved conversation
    Delete {
        /// Conversation id
        id: i64,
    },

    /// Read text aloud
    Speak {
        /// Text to speak
        text: String,
        /// Voice id (e.g. af_bella)
        #[arg(long)]
        voice: Option<String>,
    },
}

impl Cli {
    fn app_config(&self) -> AppConfig {
        AppConfig {
            db_path: self.db.clone().unwrap_or_else(DatabaseManager::default_path),
            quiet_period: Duration::from_millis(self.debounce_ms),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            ..AppConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ollama_chat::init_logging();

    let cli = Cli::parse();
    let state = AppState::new(cli.app_config())?;

    let result = match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(&state).await,
        Command::Ask { prompt } => run_ask(&state, &prompt).await,
        Command::Models => run_models(&state).await,
        Command::Status => run_status(&state).await,
        Command::History => print_history(&state.session()),
        Command::Show { id } => run_show(&state, id),
        Command::Delete { id } => {
            state.session().delete_conversation(id).await?;
            println!("Deleted conversation {}", id);
            Ok(())
        }
        Command::Speak { text, voice } => {
            let voice = voice
                .as_deref()
                .map(TtsVoice::parse)
                .unwrap_or_else(|| state.voice_for(&text));
            state.speech().speak(&text, voice).await?;
            Ok(())
        }
    };

    state.shutdown().await?;
    result
}

async fn run_models(state: &AppState) -> Result<()> {
    let session = state.session();
    let models = session.fetch_models().await?;
    let selected = session.snapshot().selected_model;

    if models.is_empty() {
        println!("No models installed. Try `ollama pull llama3.2`.");
    }
    for model in &models {
        let marker = if selected.as_deref() == Some(model.name.as_str()) { "*" } else { " " };
        println!("{} {:<32} {}", marker, model.name, model.description());
    }
    Ok(())
}

async fn run_status(state: &AppState) -> Result<()> {
    let session = state.session();
    let base_url = session.settings().base_url;
    match session.check_connection().await {
        Ok(version) => {
            println!("Ollama {} at {}", version, base_url);
            Ok(())
        }
        Err(e) => bail!("Ollama is not reachable at {}: {}", base_url, e),
    }
}

fn run_show(state: &AppState, id: i64) -> Result<()> {
    let conversation = state
        .db()
        .get_conversation(id)?
        .with_context(|| format!("No conversation with id {}", id))?;

    println!("# {} ({})", conversation.title, conversation.model_id);
    for message in &conversation.messages {
        println!("\n[{}] {}", message.role.as_str(), message.content);
    }
    Ok(())
}

fn print_history(session: &SessionController) -> Result<()> {
    let conversations = session.list_conversations()?;
    if conversations.is_empty() {
        println!("No saved conversations");
        return Ok(());
    }

    let active = session.active_conversation_id();
    for (bucket, items) in group_by_recency(&conversations, Local::now()) {
        if items.is_empty() {
            continue;
        }
        println!("{}", bucket.label());
        for item in items {
            let marker = if active == Some(item.id) { "*" } else { " " };
            println!(
                " {}[{}] {} ({}, {} messages)",
                marker, item.id, item.title, item.model_id, item.message_count
            );
        }
    }
    Ok(())
}

/// Make sure a model is selected before chatting
async fn prepare_session(session: &SessionController) -> Result<()> {
    if let Err(e) = session.fetch_models().await {
        let message = session.snapshot().error.unwrap_or_else(|| e.to_string());
        bail!(message);
    }
    if session.snapshot().selected_model.is_none() {
        bail!("No models installed. Try `ollama pull llama3.2`.");
    }
    Ok(())
}

async fn run_ask(state: &AppState, prompt: &str) -> Result<()> {
    let session = state.session();
    prepare_session(&session).await?;

    let mut interrupts = watch_interrupts()?;
    match stream_turn(&session, prompt, &mut interrupts).await? {
        TurnOutcome::Failed(e) => bail!("Error communicating with Ollama: {}", e),
        _ => Ok(()),
    }
}

/// Forward Ctrl-C presses for the rest of the program.
///
/// Installing the listener replaces the default handler, so every prompt
/// that should react to Ctrl-C reads from the returned channel.
fn watch_interrupts() -> std::io::Result<mpsc::UnboundedReceiver<()>> {
    #[cfg(unix)]
    let mut listener =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    #[cfg(windows)]
    let mut listener = tokio::signal::windows::ctrl_c()?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while listener.recv().await.is_some() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Next line of input; `None` on end of input or Ctrl-C
async fn next_input<R>(
    lines: &mut Lines<R>,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        biased;
        Some(()) = interrupts.recv() => Ok(None),
        line = lines.next_line() => line,
    }
}

/// Run one turn, printing the reply as it streams. Ctrl-C stops the generation.
async fn stream_turn(
    session: &Arc<SessionController>,
    text: &str,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Result<TurnOutcome, ChatError> {
    let mut updates = session.subscribe();
    let streaming_sound = session.settings().streaming_sound;
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    let send = session.send_message(text);
    tokio::pin!(send);

    let outcome = loop {
        tokio::select! {
            result = &mut send => break result?,
            changed = updates.changed() => {
                if changed.is_err() {
                    continue;
                }
                let partial = updates.borrow_and_update().current_assistant_message.clone();
                if let Some(partial) = partial {
                    if let Some(fresh) = partial.get(printed..).filter(|s| !s.is_empty()) {
                        if printed == 0 && streaming_sound {
                            print!("\x07");
                        }
                        print!("{}", fresh);
                        let _ = stdout.flush();
                        printed = partial.len();
                    }
                }
            }
            Some(()) = interrupts.recv() => {
                session.stop_generation();
            }
        }
    };
    // Presses during the turn do not carry over to the prompt
    while interrupts.try_recv().is_ok() {}

    let state = session.snapshot();
    match &outcome {
        TurnOutcome::Completed | TurnOutcome::Cancelled => {
            if let Some(last) = state.chat_history.last().filter(|m| m.role == ChatRole::Assistant) {
                print!("{}", last.content.get(printed..).unwrap_or_default());
            }
            if outcome == TurnOutcome::Cancelled {
                print!(" [stopped]");
            }
            println!();
        }
        TurnOutcome::Failed(_) => {
            if printed > 0 {
                println!();
            }
            if let Some(error) = &state.error {
                eprintln!("{}", error);
            }
        }
    }
    Ok(outcome)
}

fn parse_command(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('/')?;
    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Some((name, arg.trim()))
}

const HELP: &str = "\
Commands:
  /clear            start a new chat
  /models           list models
  /model <name>     switch model
  /system <prompt>  set the system prompt
  /url <base>       switch Ollama server
  /history          list saved chats
  /load <id>        open a saved chat
  /delete <id>      delete a saved chat
  /speak            read the last reply aloud
  /voice <id|auto>  choose a voice
  /sound on|off     bell when a reply starts
  /quit             exit
Ctrl-C stops a reply in progress.";

async fn run_chat(state: &AppState) -> Result<()> {
    let session = state.session();
    if let Err(e) = prepare_session(&session).await {
        eprintln!("{}", e);
    }

    if let Some(model) = session.snapshot().selected_model {
        println!("Chatting with {} (type /help for commands)", model);
    }

    let mut persistence = session.reconciler().subscribe_status();
    let mut interrupts = watch_interrupts()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = match next_input(&mut lines, &mut interrupts).await? {
            Some(line) => line,
            None => {
                println!();
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Some(("quit", _)) | Some(("exit", _)) => break,
            Some((name, arg)) => {
                if let Err(e) = handle_command(state, &session, name, arg).await {
                    eprintln!("{}", e);
                }
            }
            None => match stream_turn(&session, line, &mut interrupts).await {
                Ok(_) => {}
                Err(e) => eprintln!("{}", e),
            },
        }

        if persistence.has_changed().unwrap_or(false) {
            if let Some(error) = &persistence.borrow_and_update().last_error {
                eprintln!("Warning: failed to save chat history: {}", error);
            }
        }
    }

    Ok(())
}

async fn handle_command(
    state: &AppState,
    session: &Arc<SessionController>,
    name: &str,
    arg: &str,
) -> Result<()> {
    match name {
        "help" => println!("{}", HELP),
        "clear" => {
            session.clear_chat().await?;
            println!("Started a new chat");
        }
        "models" => {
            let models = session.fetch_models().await?;
            let selected = session.snapshot().selected_model;
            for model in models {
                let marker = if selected.as_deref() == Some(model.name.as_str()) { "*" } else { " " };
                println!("{} {}", marker, model.name);
            }
        }
        "model" => {
            if arg.is_empty() {
                bail!("Usage: /model <name>");
            }
            session.select_model(arg)?;
            save_settings(state);
            println!("Using {}", arg);
        }
        "system" => {
            session.set_system_prompt(arg);
            save_settings(state);
            println!("System prompt {}", if arg.is_empty() { "cleared" } else { "updated" });
        }
        "url" => {
            if arg.is_empty() {
                bail!("Usage: /url <base url>");
            }
            let result = session.set_base_url(arg).await;
            save_settings(state);
            let models = result.map_err(|_| {
                anyhow::anyhow!(session.snapshot().error.unwrap_or_default())
            })?;
            println!("Connected to {} ({} models)", arg, models.len());
        }
        "history" => print_history(session)?,
        "load" => {
            let id: i64 = arg.parse().context("Usage: /load <id>")?;
            if !session.load_conversation(id).await? {
                bail!("No conversation with id {}", id);
            }
            let snapshot = session.snapshot();
            for message in &snapshot.chat_history {
                println!("[{}] {}", message.role.as_str(), message.content);
            }
        }
        "delete" => {
            let id: i64 = arg.parse().context("Usage: /delete <id>")?;
            session.delete_conversation(id).await?;
            println!("Deleted conversation {}", id);
        }
        "speak" => {
            let reply = session
                .snapshot()
                .chat_history
                .iter()
                .rev()
                .find(|m| m.role == ChatRole::Assistant)
                .map(|m| m.content.clone())
                .context("Nothing to speak yet")?;
            let voice = state.voice_for(&reply);
            speak_detached(state.speech(), reply, voice);
        }
        "voice" => {
            if arg == "auto" {
                session.set_auto_detect_voice(true);
                println!("Voice follows the reply's language");
            } else {
                let voice = TtsVoice::parse(arg);
                session.set_auto_detect_voice(false);
                session.set_voice(Some(voice.id().to_string()));
                println!("Voice set to {}", voice);
            }
            save_settings(state);
        }
        "sound" => {
            let enabled = match arg {
                "on" => true,
                "off" => false,
                _ => bail!("Usage: /sound on|off"),
            };
            session.set_streaming_sound(enabled);
            save_settings(state);
        }
        other => bail!("Unknown command /{} (try /help)", other),
    }
    Ok(())
}

fn save_settings(state: &AppState) {
    if let Err(e) = state.save_settings() {
        log::warn!("Failed to save settings: {:#}", e);
    }
}
