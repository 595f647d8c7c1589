pub mod migrations;
pub mod models;
pub mod repos;

use std::path::Path;
use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Open the connection pool and switch the file to WAL.
///
/// Schema creation is not done here: the session store and each vector
/// collection own their tables and create them during startup bring-up.
pub fn open_pool(db_path: &Path, connection_timeout: Duration) -> Result<DbPool, AppError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path.display(), "Opening database");

    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder()
        .max_size(8)
        .connection_timeout(connection_timeout)
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build_unchecked(manager);

    // Journal mode is database-wide; a failure here is non-fatal and will
    // resurface through the store's health entry on first real use.
    match pool.get() {
        Ok(conn) => {
            if let Err(e) = conn.execute_batch("PRAGMA journal_mode = WAL;") {
                tracing::warn!("Failed to enable WAL: {}", e);
            } else {
                tracing::debug!("SQLite pragmas configured (WAL, FK, busy_timeout)");
            }
        }
        Err(e) => tracing::warn!("Database not yet available: {}", e),
    }

    Ok(pool)
}

#[cfg(test)]
pub fn init_test_db() -> Result<DbPool, AppError> {
    // Use a unique temp file for each test to avoid in-memory connection issues with r2d2.
    let tmp = std::env::temp_dir().join(format!("assistant_test_{}.db", uuid::Uuid::new_v4()));
    let manager = SqliteConnectionManager::file(&tmp);
    let pool = Pool::builder()
        .max_size(2)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;
    migrations::run_incremental(&conn)?;
    drop(conn);
    Ok(pool)
}

/// Pool over a fresh temp file with no schema applied.
#[cfg(test)]
pub fn init_empty_test_db() -> Result<DbPool, AppError> {
    let tmp = std::env::temp_dir().join(format!("assistant_test_{}.db", uuid::Uuid::new_v4()));
    open_pool(&tmp, Duration::from_secs(5))
}
