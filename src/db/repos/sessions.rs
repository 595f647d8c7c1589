use rusqlite::{params, Row};

use crate::db::models::{ChatMessageRow, ChatSessionRow};
use crate::db::DbPool;
use crate::error::AppError;

// ============================================================================
// Row Mappers
// ============================================================================

fn row_to_session(row: &Row) -> rusqlite::Result<ChatSessionRow> {
    Ok(ChatSessionRow {
        id: row.get("id")?,
        title: row.get("title")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<ChatMessageRow> {
    Ok(ChatMessageRow {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        position: row.get("position")?,
        role: row.get("role")?,
        author_name: row.get("author_name")?,
        text: row.get("text")?,
        properties: row.get("properties")?,
        created_at: row.get("created_at")?,
    })
}

// ============================================================================
// Inputs
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateSessionInput {
    /// Caller-chosen id; a v4 UUID when absent.
    pub id: Option<String>,
    pub title: String,
    /// RFC 3339; defaults to now.
    pub created_at: Option<String>,
}

/// A message to append. Id and timestamp are kept as given; only the
/// position is assigned on insert.
#[derive(Debug, Clone)]
pub struct AppendMessageInput {
    pub id: String,
    pub role: String,
    pub author_name: Option<String>,
    pub text: String,
    pub properties: String,
    pub created_at: String,
}

impl From<ChatMessageRow> for AppendMessageInput {
    fn from(row: ChatMessageRow) -> Self {
        Self {
            id: row.id,
            role: row.role,
            author_name: row.author_name,
            text: row.text,
            properties: row.properties,
            created_at: row.created_at,
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

pub fn list_ids(pool: &DbPool) -> Result<Vec<String>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT id FROM chat_sessions ORDER BY created_at ASC, id ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let ids = rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)?;
    Ok(ids)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<ChatSessionRow, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM chat_sessions WHERE id = ?1",
        params![id],
        row_to_session,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("ChatSession {id}")),
        other => AppError::Database(other),
    })
}

pub fn create(pool: &DbPool, input: CreateSessionInput) -> Result<ChatSessionRow, AppError> {
    if input.title.trim().is_empty() {
        return Err(AppError::Validation("Session title cannot be empty".into()));
    }
    let id = input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = chrono::Utc::now().to_rfc3339();
    let created_at = input.created_at.unwrap_or_else(|| now.clone());

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO chat_sessions (id, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, input.title, created_at, now],
    )?;

    get_by_id(pool, &id)
}

pub fn rename(pool: &DbPool, id: &str, title: &str) -> Result<ChatSessionRow, AppError> {
    if title.trim().is_empty() {
        return Err(AppError::Validation("Session title cannot be empty".into()));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE chat_sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
        params![title, now, id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("ChatSession {id}")));
    }
    drop(conn);
    get_by_id(pool, id)
}

/// Delete a session; its messages go with it (FK cascade).
pub fn delete(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// ============================================================================
// Messages
// ============================================================================

pub fn get_messages(pool: &DbPool, session_id: &str) -> Result<Vec<ChatMessageRow>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM chat_messages
         WHERE session_id = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![session_id], row_to_message)?;
    let messages = rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)?;
    Ok(messages)
}

/// Append at the end of the session. Position is assigned inside the write
/// transaction so concurrent appends cannot collide.
pub fn append_message(
    pool: &DbPool,
    session_id: &str,
    input: AppendMessageInput,
) -> Result<ChatMessageRow, AppError> {
    let now = chrono::Utc::now().to_rfc3339();

    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let exists: i64 = tx.query_row(
        "SELECT COUNT(*) FROM chat_sessions WHERE id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(AppError::NotFound(format!("ChatSession {session_id}")));
    }

    let position: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM chat_messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO chat_messages
         (id, session_id, position, role, author_name, text, properties, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            input.id,
            session_id,
            position,
            input.role,
            input.author_name,
            input.text,
            input.properties,
            input.created_at,
        ],
    )?;
    tx.execute(
        "UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2",
        params![now, session_id],
    )?;
    tx.commit()?;

    Ok(ChatMessageRow {
        id: input.id,
        session_id: session_id.to_string(),
        position,
        role: input.role,
        author_name: input.author_name,
        text: input.text,
        properties: input.properties,
        created_at: input.created_at,
    })
}

/// Upsert a session and replace its full message list in one transaction.
pub fn save_full(
    pool: &DbPool,
    session: &ChatSessionRow,
    messages: &[ChatMessageRow],
) -> Result<(), AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO chat_sessions (id, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
        params![session.id, session.title, session.created_at, session.updated_at],
    )?;
    tx.execute(
        "DELETE FROM chat_messages WHERE session_id = ?1",
        params![session.id],
    )?;
    for m in messages {
        tx.execute(
            "INSERT INTO chat_messages
             (id, session_id, position, role, author_name, text, properties, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                m.id,
                session.id,
                m.position,
                m.role,
                m.author_name,
                m.text,
                m.properties,
                m.created_at,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    fn session(pool: &DbPool, id: &str) -> ChatSessionRow {
        create(
            pool,
            CreateSessionInput {
                id: Some(id.into()),
                title: format!("Session {id}"),
                created_at: None,
            },
        )
        .unwrap()
    }

    fn msg(role: &str, text: &str) -> AppendMessageInput {
        AppendMessageInput {
            id: uuid::Uuid::new_v4().to_string(),
            role: role.into(),
            author_name: None,
            text: text.into(),
            properties: "{}".into(),
            created_at: "2024-03-01T12:00:00Z".into(),
        }
    }

    #[test]
    fn test_create_and_get_session() {
        let pool = init_test_db().unwrap();
        let s = session(&pool, "s1");
        assert_eq!(s.title, "Session s1");

        let fetched = get_by_id(&pool, "s1").unwrap();
        assert_eq!(fetched, s);
    }

    #[test]
    fn test_create_rejects_empty_title() {
        let pool = init_test_db().unwrap();
        let result = create(
            &pool,
            CreateSessionInput {
                id: None,
                title: "  ".into(),
                created_at: None,
            },
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_get_by_id_not_found() {
        let pool = init_test_db().unwrap();
        assert!(matches!(get_by_id(&pool, "nope"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_list_ids_in_creation_order() {
        let pool = init_test_db().unwrap();
        for (id, ts) in [("s2", "2024-01-02T00:00:00Z"), ("s1", "2024-01-01T00:00:00Z")] {
            create(
                &pool,
                CreateSessionInput {
                    id: Some(id.into()),
                    title: id.into(),
                    created_at: Some(ts.into()),
                },
            )
            .unwrap();
        }
        assert_eq!(list_ids(&pool).unwrap(), vec!["s1", "s2"]);
    }

    #[test]
    fn test_append_assigns_sequential_positions() {
        let pool = init_test_db().unwrap();
        session(&pool, "s1");

        let a = append_message(&pool, "s1", msg("user", "hi")).unwrap();
        let b = append_message(&pool, "s1", msg("assistant", "hello")).unwrap();
        let c = append_message(&pool, "s1", msg("user", "bye")).unwrap();
        assert_eq!((a.position, b.position, c.position), (0, 1, 2));

        let texts: Vec<String> = get_messages(&pool, "s1")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["hi", "hello", "bye"]);
    }

    #[test]
    fn test_append_keeps_id_and_timestamp() {
        let pool = init_test_db().unwrap();
        session(&pool, "s1");
        let mut input = msg("tool", "42");
        input.id = "m-fixed".into();
        input.created_at = "2023-12-31T23:59:59.123456789Z".into();

        append_message(&pool, "s1", input).unwrap();

        let stored = &get_messages(&pool, "s1").unwrap()[0];
        assert_eq!(stored.id, "m-fixed");
        assert_eq!(stored.created_at, "2023-12-31T23:59:59.123456789Z");
    }

    #[test]
    fn test_append_to_missing_session() {
        let pool = init_test_db().unwrap();
        let result = append_message(&pool, "ghost", msg("user", "anyone?"));
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_rename_and_delete_cascades() {
        let pool = init_test_db().unwrap();
        session(&pool, "s1");
        append_message(&pool, "s1", msg("user", "hi")).unwrap();

        let renamed = rename(&pool, "s1", "Trip planning").unwrap();
        assert_eq!(renamed.title, "Trip planning");
        assert!(matches!(rename(&pool, "s9", "x"), Err(AppError::NotFound(_))));

        assert!(delete(&pool, "s1").unwrap());
        assert!(!delete(&pool, "s1").unwrap());
        assert!(get_messages(&pool, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_save_full_replaces_messages() {
        let pool = init_test_db().unwrap();
        let s = session(&pool, "s1");
        append_message(&pool, "s1", msg("user", "old")).unwrap();

        let replacement = ChatMessageRow {
            id: "m-new".into(),
            session_id: "s1".into(),
            position: 0,
            role: "system".into(),
            author_name: Some("setup".into()),
            text: "new".into(),
            properties: r#"{"pinned":true}"#.into(),
            created_at: "2024-05-01T10:00:00Z".into(),
        };
        save_full(&pool, &s, std::slice::from_ref(&replacement)).unwrap();

        assert_eq!(get_messages(&pool, "s1").unwrap(), vec![replacement]);
    }
}
