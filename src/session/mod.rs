//! Chat sessions and the persistent store behind them.

mod mapping;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::repos::sessions as session_repo;
use crate::db::{migrations, DbPool};
use crate::error::AppError;

// ============================================================================
// Domain types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ChatRole::System),
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            "tool" => Ok(ChatRole::Tool),
            other => Err(AppError::Validation(format!("Unknown chat role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub author_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            author_name: None,
            text: text.into(),
            properties: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author_name = Some(author.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// A conversation. `messages` is in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }
}

// ============================================================================
// Store contract
// ============================================================================

/// Persistent chat-session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Prepare the backing storage. Safe to call on every process start,
    /// including when data already exists.
    async fn initialize(&self) -> Result<(), AppError>;

    async fn list_session_ids(&self) -> Result<Vec<String>, AppError>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Run a blocking repo call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&DbPool) -> Result<T, AppError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || f(&pool)).await?
    }

    pub async fn create_session(&self, title: &str) -> Result<ChatSession, AppError> {
        let title = title.to_string();
        let row = self
            .blocking(move |pool| {
                session_repo::create(
                    pool,
                    session_repo::CreateSessionInput {
                        id: None,
                        title,
                        created_at: None,
                    },
                )
            })
            .await?;
        mapping::session_from_rows(row, Vec::new())
    }

    pub async fn load(&self, id: &str) -> Result<ChatSession, AppError> {
        let id = id.to_string();
        let (row, messages) = self
            .blocking(move |pool| {
                let row = session_repo::get_by_id(pool, &id)?;
                let messages = session_repo::get_messages(pool, &id)?;
                Ok((row, messages))
            })
            .await?;
        mapping::session_from_rows(row, messages)
    }

    /// Persist the whole session, replacing any stored messages.
    pub async fn save(&self, session: &ChatSession) -> Result<(), AppError> {
        let (row, messages) = mapping::session_to_rows(session, Utc::now())?;
        self.blocking(move |pool| session_repo::save_full(pool, &row, &messages))
            .await
    }

    /// Append one message at the end of the session and return its position.
    /// The message is stored exactly as given.
    pub async fn append(&self, session_id: &str, message: &ChatMessage) -> Result<i64, AppError> {
        let session_id = session_id.to_string();
        let input = session_repo::AppendMessageInput::from(mapping::message_to_row(message, &session_id, 0)?);
        let row = self
            .blocking(move |pool| session_repo::append_message(pool, &session_id, input))
            .await?;
        Ok(row.position)
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<(), AppError> {
        let (id, title) = (id.to_string(), title.to_string());
        self.blocking(move |pool| session_repo::rename(pool, &id, &title).map(|_| ()))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let id = id.to_string();
        self.blocking(move |pool| session_repo::delete(pool, &id)).await
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn initialize(&self) -> Result<(), AppError> {
        self.blocking(|pool| {
            let conn = pool.get()?;
            migrations::run(&conn)?;
            migrations::run_incremental(&conn)?;
            Ok(())
        })
        .await
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, AppError> {
        self.blocking(session_repo::list_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_empty_test_db;
    use serde_json::json;

    async fn ready_store() -> SqliteSessionStore {
        let store = SqliteSessionStore::new(init_empty_test_db().unwrap());
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_initialize_twice_keeps_sessions() {
        let store = ready_store().await;
        let a = store.create_session("First").await.unwrap();
        let b = store.create_session("Second").await.unwrap();

        let once = store.list_session_ids().await.unwrap();
        store.initialize().await.unwrap();
        let twice = store.list_session_ids().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
        assert!(once.contains(&a.id) && once.contains(&b.id));
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_every_field() {
        let store = ready_store().await;
        let mut session = ChatSession::new("Recipes");
        session.messages = vec![
            ChatMessage::new(ChatRole::System, "You are a cook."),
            ChatMessage::new(ChatRole::User, "Pasta?").with_property("lang", json!("en")),
            ChatMessage::new(ChatRole::Tool, "{\"results\":3}")
                .with_author("recipe_search")
                .with_property("call", json!({"id": "c1", "args": [1, 2]})),
            ChatMessage::new(ChatRole::Assistant, "Try carbonara."),
        ];

        store.save(&session).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();

        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn test_append_extends_in_order() {
        let store = ready_store().await;
        let session = store.create_session("Chat").await.unwrap();

        let p0 = store
            .append(&session.id, &ChatMessage::new(ChatRole::User, "one"))
            .await
            .unwrap();
        let p1 = store
            .append(&session.id, &ChatMessage::new(ChatRole::Assistant, "two"))
            .await
            .unwrap();
        assert_eq!((p0, p1), (0, 1));

        let loaded = store.load(&session.id).await.unwrap();
        let texts: Vec<&str> = loaded.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_append_then_load_returns_same_message() {
        let store = ready_store().await;
        let session = store.create_session("Chat").await.unwrap();
        let message = ChatMessage::new(ChatRole::Tool, "3 results")
            .with_author("search")
            .with_property("call_id", json!("c7"));

        store.append(&session.id, &message).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();

        assert_eq!(loaded.messages, vec![message]);
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let store = ready_store().await;
        let session = store.create_session("Draft").await.unwrap();

        store.rename(&session.id, "Final").await.unwrap();
        assert_eq!(store.load(&session.id).await.unwrap().title, "Final");

        assert!(store.delete(&session.id).await.unwrap());
        assert!(matches!(store.load(&session.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_before_initialize_fails() {
        let store = SqliteSessionStore::new(init_empty_test_db().unwrap());
        assert!(store.list_session_ids().await.is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("tool".parse::<ChatRole>().unwrap(), ChatRole::Tool);
        assert!(matches!("robot".parse::<ChatRole>(), Err(AppError::Validation(_))));
    }
}
