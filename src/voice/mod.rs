//! Voice output for assistant replies
//!
//! Speech is fire-and-forget from the chat's point of view: a failure is
//! logged and returned through the task handle, and never touches the
//! session state.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;

/// espeak's default rate in words per minute
const BASE_WORDS_PER_MINUTE: f32 = 175.0;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpeechError {
    #[error("Invalid text input")]
    InvalidInput,
    #[error("Speech program not available: {0}")]
    Unavailable(String),
    #[error("Speech program failed: {0}")]
    Failed(String),
}

/// Kokoro voice identifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsVoice {
    // American female
    #[default]
    AfBella,
    AfNova,
    AfAlloy,
    AfAoede,
    AfJessica,
    AfKore,
    AfNicole,
    AfRiver,
    AfSarah,
    AfSky,
    // American male
    AmAdam,
    AmEcho,
    AmEric,
    AmFenrir,
    AmLiam,
    AmMichael,
    AmOnyx,
    AmPuck,
    // Japanese
    JfAlpha,
    JfGongitsune,
    JfNezumi,
    JfTebukuro,
    JmKumo,
}

impl TtsVoice {
    pub const ALL: [TtsVoice; 23] = [
        TtsVoice::AfBella,
        TtsVoice::AfNova,
        TtsVoice::AfAlloy,
        TtsVoice::AfAoede,
        TtsVoice::AfJessica,
        TtsVoice::AfKore,
        TtsVoice::AfNicole,
        TtsVoice::AfRiver,
        TtsVoice::AfSarah,
        TtsVoice::AfSky,
        TtsVoice::AmAdam,
        TtsVoice::AmEcho,
        TtsVoice::AmEric,
        TtsVoice::AmFenrir,
        TtsVoice::AmLiam,
        TtsVoice::AmMichael,
        TtsVoice::AmOnyx,
        TtsVoice::AmPuck,
        TtsVoice::JfAlpha,
        TtsVoice::JfGongitsune,
        TtsVoice::JfNezumi,
        TtsVoice::JfTebukuro,
        TtsVoice::JmKumo,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            TtsVoice::AfBella => "af_bella",
            TtsVoice::AfNova => "af_nova",
            TtsVoice::AfAlloy => "af_alloy",
            TtsVoice::AfAoede => "af_aoede",
            TtsVoice::AfJessica => "af_jessica",
            TtsVoice::AfKore => "af_kore",
            TtsVoice::AfNicole => "af_nicole",
            TtsVoice::AfRiver => "af_river",
            TtsVoice::AfSarah => "af_sarah",
            TtsVoice::AfSky => "af_sky",
            TtsVoice::AmAdam => "am_adam",
            TtsVoice::AmEcho => "am_echo",
            TtsVoice::AmEric => "am_eric",
            TtsVoice::AmFenrir => "am_fenrir",
            TtsVoice::AmLiam => "am_liam",
            TtsVoice::AmMichael => "am_michael",
            TtsVoice::AmOnyx => "am_onyx",
            TtsVoice::AmPuck => "am_puck",
            TtsVoice::JfAlpha => "jf_alpha",
            TtsVoice::JfGongitsune => "jf_gongitsune",
            TtsVoice::JfNezumi => "jf_nezumi",
            TtsVoice::JfTebukuro => "jf_tebukuro",
            TtsVoice::JmKumo => "jm_kumo",
        }
    }

    /// Unknown identifiers fall back to the default voice
    pub fn parse(id: &str) -> Self {
        let id = id.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.id().eq_ignore_ascii_case(id))
            .unwrap_or_else(|| {
                log::warn!("Unknown voice '{}', using {}", id, TtsVoice::default());
                TtsVoice::default()
            })
    }

    pub fn is_japanese(&self) -> bool {
        self.id().starts_with('j')
    }

    pub fn is_male(&self) -> bool {
        self.id().as_bytes().get(1) == Some(&b'm')
    }

    /// espeak voice name closest to this voice
    fn espeak_voice(&self) -> &'static str {
        match (self.is_japanese(), self.is_male()) {
            (true, _) => "ja",
            (false, true) => "en-us+m3",
            (false, false) => "en-us+f3",
        }
    }
}

impl fmt::Display for TtsVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn is_japanese_char(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF | 0x31F0..=0x31FF | 0x3400..=0x4DBF | 0x4E00..=0x9FAF)
}

fn is_cyrillic_char(c: char) -> bool {
    matches!(c, 'а'..='я' | 'А'..='Я' | 'ё' | 'Ё')
}

/// Pick a voice from the script the text is written in
pub fn auto_select_voice(text: &str) -> TtsVoice {
    if text.chars().any(is_japanese_char) {
        TtsVoice::JfAlpha
    } else if text.chars().any(is_cyrillic_char) {
        TtsVoice::AmMichael
    } else {
        TtsVoice::AfBella
    }
}

pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_nan() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn speak(&self, text: &str, voice: TtsVoice) -> Result<(), SpeechError>;
}

/// Speak in the background. The outcome is logged and available from the handle.
pub fn speak_detached(
    synth: Arc<dyn SpeechSynthesizer>,
    text: String,
    voice: TtsVoice,
) -> JoinHandle<Result<(), SpeechError>> {
    tokio::spawn(async move {
        let result = synth.speak(&text, voice).await;
        if let Err(e) = &result {
            log::warn!("{} could not speak reply: {}", synth.name(), e);
        }
        result
    })
}

/// Speaks through a local speech program such as espeak
pub struct SystemSpeech {
    program: String,
    speed: f32,
}

impl SystemSpeech {
    pub const DEFAULT_PROGRAM: &'static str = "espeak";

    pub fn new(program: impl Into<String>, speed: f32) -> Self {
        Self {
            program: program.into(),
            speed: clamp_speed(speed),
        }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    fn find_program(&self) -> Result<PathBuf, SpeechError> {
        which::which(&self.program)
            .map_err(|e| SpeechError::Unavailable(format!("{}: {}", self.program, e)))
    }

    pub fn is_available(&self) -> bool {
        self.find_program().is_ok()
    }
}

impl Default for SystemSpeech {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PROGRAM, 1.0)
    }
}

#[async_trait]
impl SpeechSynthesizer for SystemSpeech {
    fn name(&self) -> &'static str {
        "system speech"
    }

    async fn speak(&self, text: &str, voice: TtsVoice) -> Result<(), SpeechError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SpeechError::InvalidInput);
        }

        let program = self.find_program()?;
        let words_per_minute = (BASE_WORDS_PER_MINUTE * self.speed).round() as u32;
        log::debug!("Speaking {} chars with {} ({})", text.len(), program.display(), voice);

        let output = Command::new(&program)
            .arg("-v")
            .arg(voice.espeak_voice())
            .arg("-s")
            .arg(words_per_minute.to_string())
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SpeechError::Failed(format!("Failed to start {}: {}", program.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SpeechError::Failed(format!("{}: {}", output.status, stderr.trim())));
        }
        Ok(())
    }
}
