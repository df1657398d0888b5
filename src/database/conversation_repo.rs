// Conversation repository for ollama-chat
// Handles CRUD operations for persisted conversations and their messages

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};

use super::models::{ChatMessage, ChatRole, Conversation, ConversationSummary};
use super::DatabaseManager;

/// Durable keyed storage of conversations.
///
/// Each operation is atomic from the caller's perspective. Implemented by
/// [`DatabaseManager`]; the history reconciler only sees this contract.
pub trait ConversationStore: Send + Sync {
    /// Insert (no id) or overwrite (id present) a conversation.
    ///
    /// Refreshes `last_updated` and writes the allocated id and the new
    /// `last_updated` back into `conversation`.
    fn save_conversation(&self, conversation: &mut Conversation) -> Result<i64>;

    /// All conversations, most recently updated first
    fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    fn get_conversation(&self, id: i64) -> Result<Option<Conversation>>;

    /// Deleting an unknown id is not an error
    fn delete_conversation(&self, id: i64) -> Result<()>;
}

impl ConversationStore for DatabaseManager {
    fn save_conversation(&self, conversation: &mut Conversation) -> Result<i64> {
        self.with_connection(|conn| {
            save_conversation_impl(conn, conversation)
        })
    }

    fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.with_connection(list_conversations_impl)
    }

    fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        self.with_connection(|conn| {
            get_conversation_impl(conn, id)
        })
    }

    fn delete_conversation(&self, id: i64) -> Result<()> {
        self.with_connection(|conn| {
            delete_conversation_impl(conn, id)
        })
    }
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn save_conversation_impl(conn: &Connection, conversation: &mut Conversation) -> Result<i64> {
    // Never move last_updated backwards, even if the wall clock does.
    let now = Utc::now().max(conversation.last_updated);
    let now_str = format_timestamp(&now);

    let tx = conn.unchecked_transaction()
        .context("Failed to begin conversation transaction")?;

    let id = match conversation.id {
        None => {
            tx.execute(
                r#"
                INSERT INTO conversations (title, model_id, created_at, last_updated)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    conversation.title,
                    conversation.model_id,
                    format_timestamp(&conversation.created_at),
                    now_str,
                ],
            ).context("Failed to create conversation")?;
            tx.last_insert_rowid()
        }
        Some(id) => {
            tx.execute(
                r#"
                INSERT INTO conversations (id, title, model_id, created_at, last_updated)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    model_id = excluded.model_id,
                    last_updated = excluded.last_updated
                "#,
                params![
                    id,
                    conversation.title,
                    conversation.model_id,
                    format_timestamp(&conversation.created_at),
                    now_str,
                ],
            ).context("Failed to update conversation")?;
            id
        }
    };

    tx.execute(
        "DELETE FROM conversation_messages WHERE conversation_id = ?",
        params![id],
    ).context("Failed to clear conversation messages")?;

    {
        let mut stmt = tx.prepare(
            r#"
            INSERT INTO conversation_messages (conversation_id, position, id, role, content, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#
        ).context("Failed to prepare message insert")?;

        for (position, message) in conversation.messages.iter().enumerate() {
            stmt.execute(params![
                id,
                position as i64,
                message.id,
                message.role.as_str(),
                message.content,
                format_timestamp(&message.timestamp),
            ]).context("Failed to save conversation message")?;
        }
    }

    tx.commit().context("Failed to commit conversation")?;

    conversation.id = Some(id);
    conversation.last_updated = now;

    log::debug!(
        "Saved conversation {} ({} messages)",
        id,
        conversation.messages.len()
    );

    Ok(id)
}

fn list_conversations_impl(conn: &Connection) -> Result<Vec<ConversationSummary>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT c.id, c.title, c.model_id, c.created_at, c.last_updated,
               (SELECT COUNT(*) FROM conversation_messages m WHERE m.conversation_id = c.id)
        FROM conversations c
        ORDER BY c.last_updated DESC, c.id DESC
        "#
    ).context("Failed to prepare list_conversations query")?;

    let rows = stmt.query_map([], |row| {
        Ok(ConversationSummary {
            id: row.get(0)?,
            title: row.get(1)?,
            model_id: row.get(2)?,
            created_at: parse_timestamp(3, row.get(3)?)?,
            last_updated: parse_timestamp(4, row.get(4)?)?,
            message_count: row.get::<_, i64>(5)? as usize,
        })
    }).context("Failed to query conversations")?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect conversations")
}

fn get_conversation_impl(conn: &Connection, id: i64) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, title, model_id, created_at, last_updated
        FROM conversations
        WHERE id = ?
        "#
    ).context("Failed to prepare get_conversation query")?;

    let result = stmt.query_row(params![id], |row| {
        Ok(Conversation {
            id: Some(row.get(0)?),
            title: row.get(1)?,
            model_id: row.get(2)?,
            created_at: parse_timestamp(3, row.get(3)?)?,
            last_updated: parse_timestamp(4, row.get(4)?)?,
            messages: Vec::new(),
        })
    });

    let mut conversation = match result {
        Ok(conversation) => conversation,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(e).context("Failed to get conversation"),
    };

    conversation.messages = get_messages_impl(conn, id)?;
    Ok(Some(conversation))
}

fn get_messages_impl(conn: &Connection, conversation_id: i64) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, role, content, timestamp
        FROM conversation_messages
        WHERE conversation_id = ?
        ORDER BY position ASC
        "#
    ).context("Failed to prepare get_messages query")?;

    let messages = stmt.query_map(params![conversation_id], |row| {
        Ok(ChatMessage {
            id: row.get(0)?,
            role: ChatRole::from_str(&row.get::<_, String>(1)?),
            content: row.get(2)?,
            timestamp: parse_timestamp(3, row.get(3)?)?,
        })
    }).context("Failed to query conversation messages")?;

    messages.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect conversation messages")
}

fn delete_conversation_impl(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM conversation_messages WHERE conversation_id = ?",
        params![id],
    ).context("Failed to delete conversation messages")?;

    conn.execute(
        "DELETE FROM conversations WHERE id = ?",
        params![id],
    ).context("Failed to delete conversation")?;

    Ok(())
}
