use rusqlite::{params, Connection, Row};

use crate::db::models::VectorCollectionRow;
use crate::db::DbPool;
use crate::error::AppError;

const CATALOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vector_collections (
    name        TEXT PRIMARY KEY,
    category    TEXT NOT NULL,
    table_name  TEXT NOT NULL UNIQUE,
    dimensions  INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);";

fn row_to_collection(row: &Row) -> rusqlite::Result<VectorCollectionRow> {
    Ok(VectorCollectionRow {
        name: row.get("name")?,
        category: row.get("category")?,
        table_name: row.get("table_name")?,
        dimensions: row.get("dimensions")?,
        created_at: row.get("created_at")?,
    })
}

/// Table names are interpolated into DDL, so only `[a-z0-9_]` is accepted.
fn validate_table_name(name: &str) -> Result<(), AppError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid collection table name '{name}'")))
    }
}

fn ensure_catalog(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(CATALOG_SCHEMA)?;
    Ok(())
}

/// Create the collection's item table and catalog row if absent.
///
/// Returns `true` when the collection was created by this call. An existing
/// collection with a different dimension count is rejected instead of being
/// silently reused.
pub fn ensure(
    pool: &DbPool,
    name: &str,
    category: &str,
    table_name: &str,
    dimensions: i64,
) -> Result<bool, AppError> {
    validate_table_name(table_name)?;
    if dimensions <= 0 {
        return Err(AppError::Validation(format!(
            "Collection '{name}' needs a positive dimension count"
        )));
    }

    let mut conn = pool.get()?;
    ensure_catalog(&conn)?;
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let existing = tx
        .query_row(
            "SELECT * FROM vector_collections WHERE name = ?1",
            params![name],
            row_to_collection,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(row) = &existing {
        if row.dimensions != dimensions {
            return Err(AppError::Validation(format!(
                "Collection '{name}' exists with {} dimensions, expected {dimensions}",
                row.dimensions
            )));
        }
    }

    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table_name} (
            id          TEXT PRIMARY KEY,
            source_id   TEXT NOT NULL,
            embedding   BLOB NOT NULL,
            payload     TEXT NOT NULL DEFAULT '{{}}',
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table_name}_source ON {table_name}(source_id);"
    ))?;

    let created = if existing.is_none() {
        tx.execute(
            "INSERT INTO vector_collections (name, category, table_name, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, category, table_name, dimensions, chrono::Utc::now().to_rfc3339()],
        )?;
        true
    } else {
        false
    };

    tx.commit()?;
    Ok(created)
}

pub fn get_all(pool: &DbPool) -> Result<Vec<VectorCollectionRow>, AppError> {
    let conn = pool.get()?;
    ensure_catalog(&conn)?;
    let mut stmt = conn.prepare("SELECT * FROM vector_collections ORDER BY name ASC")?;
    let rows = stmt.query_map([], row_to_collection)?;
    let collections = rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)?;
    Ok(collections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_empty_test_db;

    #[test]
    fn test_ensure_is_idempotent() {
        let pool = init_empty_test_db().unwrap();
        assert!(ensure(&pool, "documents", "documents", "vec_documents", 768).unwrap());
        assert!(!ensure(&pool, "documents", "documents", "vec_documents", 768).unwrap());

        let all = get_all(&pool).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].table_name, "vec_documents");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let pool = init_empty_test_db().unwrap();
        ensure(&pool, "memories", "memories", "vec_memories", 768).unwrap();
        let err = ensure(&pool, "memories", "memories", "vec_memories", 384).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let pool = init_empty_test_db().unwrap();
        let err = ensure(&pool, "x", "tools", "vec_x; DROP TABLE y", 8).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
