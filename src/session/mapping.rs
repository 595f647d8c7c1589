//! Domain ↔ row mapping. Lossless for every field; message order is carried
//! by `position`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{ChatMessage, ChatSession};
use crate::db::models::{ChatMessageRow, ChatSessionRow};
use crate::error::AppError;

fn parse_timestamp(raw: &str, what: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Validation(format!("Invalid {what} timestamp '{raw}': {e}")))
}

pub(super) fn message_to_row(
    message: &ChatMessage,
    session_id: &str,
    position: i64,
) -> Result<ChatMessageRow, AppError> {
    Ok(ChatMessageRow {
        id: message.id.clone(),
        session_id: session_id.to_string(),
        position,
        role: message.role.as_str().to_string(),
        author_name: message.author_name.clone(),
        text: message.text.clone(),
        properties: serde_json::to_string(&message.properties)?,
        created_at: message.created_at.to_rfc3339(),
    })
}

pub(super) fn message_from_row(row: ChatMessageRow) -> Result<ChatMessage, AppError> {
    let properties = match serde_json::from_str::<Value>(&row.properties)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(AppError::Validation(format!(
                "Message {} properties must be a JSON object, got {other}",
                row.id
            )))
        }
    };

    Ok(ChatMessage {
        role: row.role.parse()?,
        created_at: parse_timestamp(&row.created_at, "message")?,
        id: row.id,
        author_name: row.author_name,
        text: row.text,
        properties,
    })
}

pub(super) fn session_to_rows(
    session: &ChatSession,
    updated_at: DateTime<Utc>,
) -> Result<(ChatSessionRow, Vec<ChatMessageRow>), AppError> {
    let row = ChatSessionRow {
        id: session.id.clone(),
        title: session.title.clone(),
        created_at: session.created_at.to_rfc3339(),
        updated_at: updated_at.to_rfc3339(),
    };
    let messages = session
        .messages
        .iter()
        .enumerate()
        .map(|(i, m)| message_to_row(m, &session.id, i as i64))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((row, messages))
}

pub(super) fn session_from_rows(
    row: ChatSessionRow,
    mut messages: Vec<ChatMessageRow>,
) -> Result<ChatSession, AppError> {
    messages.sort_by_key(|m| m.position);
    Ok(ChatSession {
        created_at: parse_timestamp(&row.created_at, "session")?,
        id: row.id,
        title: row.title,
        messages: messages
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?,
    })
}
