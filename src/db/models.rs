use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Chat Sessions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChatSessionRow {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Chat Messages
// ============================================================================

/// Persisted shape of one message. `properties` holds a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChatMessageRow {
    pub id: String,
    pub session_id: String,
    pub position: i64,
    pub role: String,
    pub author_name: Option<String>,
    pub text: String,
    pub properties: String,
    pub created_at: String,
}

// ============================================================================
// Vector Collections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VectorCollectionRow {
    pub name: String,
    pub category: String,
    pub table_name: String,
    pub dimensions: i64,
    pub created_at: String,
}
