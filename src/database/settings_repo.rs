// Settings repository for ollama-chat
// Handles CRUD operations for runtime chat settings

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::ChatSettings;
use super::DatabaseManager;

impl DatabaseManager {
    /// Set a single setting
    pub fn set_setting(&self, key: &str, value: &str, value_type: &str) -> Result<()> {
        self.with_connection(|conn| {
            set_setting_impl(conn, key, value, value_type)
        })
    }

    /// Set a boolean setting
    pub fn set_bool_setting(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "true" } else { "false" }, "boolean")
    }

    /// Delete a setting by key
    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            delete_setting_impl(conn, key)
        })
    }

    /// Load the chat settings, falling back to defaults for missing keys
    pub fn load_chat_settings(&self) -> Result<ChatSettings> {
        self.with_connection(|conn| {
            load_chat_settings_impl(conn)
        })
    }

    /// Persist every chat setting
    pub fn save_chat_settings(&self, settings: &ChatSettings) -> Result<()> {
        self.set_setting("base_url", &settings.base_url, "string")?;
        self.set_setting("system_prompt", &settings.system_prompt, "string")?;
        self.set_bool_setting("streaming_sound", settings.streaming_sound)?;
        self.set_bool_setting("auto_detect_voice", settings.auto_detect_voice)?;

        match &settings.selected_model {
            Some(model) => self.set_setting("selected_model", model, "string")?,
            None => self.delete_setting("selected_model")?,
        }
        match &settings.voice {
            Some(voice) => self.set_setting("voice", voice, "string")?,
            None => self.delete_setting("voice")?,
        }

        Ok(())
    }
}

fn set_setting_impl(conn: &Connection, key: &str, value: &str, value_type: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO settings (key, value, value_type, updated_at)
        VALUES (?1, ?2, ?3, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            value_type = excluded.value_type,
            updated_at = datetime('now')
        "#,
        params![key, value, value_type],
    ).context("Failed to set setting")?;

    Ok(())
}

fn load_chat_settings_impl(conn: &Connection) -> Result<ChatSettings> {
    let mut settings = ChatSettings::default();

    let mut stmt = conn.prepare(
        "SELECT key, value FROM settings"
    ).context("Failed to prepare load_chat_settings query")?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
        ))
    }).context("Failed to query settings")?;

    for row in rows {
        let (key, value) = row.context("Failed to read setting row")?;

        match key.as_str() {
            "base_url" => settings.base_url = value,
            "system_prompt" => settings.system_prompt = value,
            "streaming_sound" => settings.streaming_sound = value == "true",
            "auto_detect_voice" => settings.auto_detect_voice = value == "true",
            "selected_model" => settings.selected_model = Some(value),
            "voice" => settings.voice = Some(value),
            _ => {
                log::debug!("Unknown setting key: {}", key);
            }
        }
    }

    Ok(settings)
}

fn delete_setting_impl(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM settings WHERE key = ?",
        params![key],
    ).context("Failed to delete setting")?;

    Ok(())
}
