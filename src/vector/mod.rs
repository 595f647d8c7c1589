//! Vector collections backing retrieval features.
//!
//! Only bring-up lives here: each collection owns an item table plus a row in
//! the `vector_collections` catalog. Similarity search is an external concern.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::db::repos::vector_collections as collection_repo;
use crate::db::DbPool;
use crate::error::AppError;
use crate::health::HealthDomain;
use crate::startup::DependentSubsystem;

/// Dimension of the default local embedding model.
pub const DEFAULT_DIMENSIONS: i64 = 768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionCategory {
    Documents,
    Memories,
    Tools,
    Conversations,
}

impl CollectionCategory {
    /// Declared bring-up order.
    pub const ALL: [CollectionCategory; 4] = [
        CollectionCategory::Documents,
        CollectionCategory::Memories,
        CollectionCategory::Tools,
        CollectionCategory::Conversations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CollectionCategory::Documents => "documents",
            CollectionCategory::Memories => "memories",
            CollectionCategory::Tools => "tools",
            CollectionCategory::Conversations => "conversations",
        }
    }
}

impl fmt::Display for CollectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown collection category '{s}'"))
    }
}

/// A named collection stored in the local SQLite database.
pub struct SqliteVectorCollection {
    pool: DbPool,
    category: CollectionCategory,
    name: String,
    dimensions: i64,
}

impl SqliteVectorCollection {
    pub fn new(pool: DbPool, category: CollectionCategory) -> Self {
        Self {
            pool,
            category,
            name: category.as_str().to_string(),
            dimensions: DEFAULT_DIMENSIONS,
        }
    }

    pub fn with_dimensions(mut self, dimensions: i64) -> Self {
        self.dimensions = dimensions;
        self
    }

    fn table_name(&self) -> String {
        format!("vec_{}", self.name)
    }
}

#[async_trait]
impl DependentSubsystem for SqliteVectorCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> HealthDomain {
        HealthDomain::VectorStore
    }

    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let pool = self.pool.clone();
        let name = self.name.clone();
        let category = self.category.as_str();
        let table = self.table_name();
        let dimensions = self.dimensions;

        let created = tokio::task::spawn_blocking(move || {
            collection_repo::ensure(&pool, &name, category, &table, dimensions)
        })
        .await??;

        if created {
            tracing::info!(collection = %self.name, dimensions, "Vector collection created");
        } else {
            tracing::debug!(collection = %self.name, "Vector collection already exists");
        }
        Ok(())
    }
}

/// One collection per configured category, in the given order.
pub fn build_collections(
    pool: &DbPool,
    categories: &[CollectionCategory],
) -> Vec<Arc<dyn DependentSubsystem>> {
    categories
        .iter()
        .map(|c| Arc::new(SqliteVectorCollection::new(pool.clone(), *c)) as Arc<dyn DependentSubsystem>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_empty_test_db;

    #[test]
    fn test_category_parse_is_case_insensitive() {
        assert_eq!("Tools".parse::<CollectionCategory>().unwrap(), CollectionCategory::Tools);
        assert!("images".parse::<CollectionCategory>().is_err());
    }

    #[tokio::test]
    async fn test_ensure_ready_twice_is_noop() {
        let pool = init_empty_test_db().unwrap();
        let collection = SqliteVectorCollection::new(pool.clone(), CollectionCategory::Memories);
        let cancel = CancellationToken::new();

        collection.ensure_ready(&cancel).await.unwrap();
        collection.ensure_ready(&cancel).await.unwrap();

        let rows = collection_repo::get_all(&pool).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "memories");
        assert_eq!(rows[0].dimensions, DEFAULT_DIMENSIONS);
    }

    #[tokio::test]
    async fn test_ensure_ready_respects_cancellation() {
        let pool = init_empty_test_db().unwrap();
        let collection = SqliteVectorCollection::new(pool.clone(), CollectionCategory::Tools);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = collection.ensure_ready(&cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(collection_repo::get_all(&pool).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_change_surfaces_error() {
        let pool = init_empty_test_db().unwrap();
        let cancel = CancellationToken::new();
        SqliteVectorCollection::new(pool.clone(), CollectionCategory::Documents)
            .ensure_ready(&cancel)
            .await
            .unwrap();

        let err = SqliteVectorCollection::new(pool, CollectionCategory::Documents)
            .with_dimensions(384)
            .ensure_ready(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_build_collections_keeps_order() {
        let pool = init_empty_test_db().unwrap();
        let built = build_collections(&pool, &[CollectionCategory::Tools, CollectionCategory::Documents]);
        let names: Vec<&str> = built.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["tools", "documents"]);
    }
}
