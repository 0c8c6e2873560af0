//! Durable storage behind a document-store contract.
//!
//! The broker persists three collections: `sessions` and `will_messages`
//! keyed by client id, and `subscriptions` holding topic-tree nodes keyed by
//! materialized path. [`DocumentStore`] is the full contract; the shipped
//! backends are [`FileStore`] (JSON documents on disk) and [`MemoryStore`]
//! (volatile, for tests). Indexes are dropped and recreated on every startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

mod cache;
mod file;
mod memory;

pub use cache::TtlCache;
pub use file::FileStore;
pub use memory::MemoryStore;

pub const SESSIONS: &str = "sessions";
pub const WILL_MESSAGES: &str = "will_messages";
pub const SUBSCRIPTIONS: &str = "subscriptions";

const COLLECTIONS: &[&str] = &[SESSIONS, WILL_MESSAGES, SUBSCRIPTIONS];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store is closed")]
    Closed,
}

/// An index over one field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexSpec {
    pub collection: String,
    pub field: String,
    pub unique: bool,
    pub name: String,
}

impl IndexSpec {
    fn unique_on(collection: &str, field: &str) -> IndexSpec {
        IndexSpec {
            collection: collection.into(),
            field: field.into(),
            unique: true,
            name: format!("{collection}_{field}_unique"),
        }
    }
}

/// The contract the broker requires from its durable backing store.
///
/// Documents are JSON values addressed by `(collection, field, value)`
/// point lookups; the broker only ever queries on uniquely indexed fields.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn find_one_by(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Insert or replace the document whose `field` equals `value`.
    /// Must be idempotent.
    async fn upsert(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        document: Value,
    ) -> Result<(), StoreError>;

    /// Returns `true` if a document was removed. Deleting a missing key is
    /// not an error.
    async fn delete_one(&self, collection: &str, field: &str, value: &str)
        -> Result<bool, StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError>;

    async fn create_index(&self, index: IndexSpec) -> Result<(), StoreError>;

    /// Flush and release the store. Further operations fail with
    /// [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

/// Run an operation against the store under the configured per-call deadline.
pub async fn with_timeout<T>(
    timeout: Duration,
    op: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Prepare the store for broker use: make sure all collections exist, then
/// drop and recreate the unique indexes.
pub async fn initialize(store: &Arc<dyn DocumentStore>) -> Result<(), StoreError> {
    let existing = store.list_collections().await?;

    for &collection in COLLECTIONS {
        if !existing.iter().any(|name| name == collection) {
            tracing::debug!(collection, "creating collection");
            store.create_collection(collection).await?;
        }

        store.drop_indexes(collection).await?;
    }

    store
        .create_index(IndexSpec::unique_on(SESSIONS, "client_id"))
        .await?;
    store
        .create_index(IndexSpec::unique_on(WILL_MESSAGES, "client_id"))
        .await?;
    store
        .create_index(IndexSpec::unique_on(SUBSCRIPTIONS, "path"))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn initialize_creates_collections_and_indexes() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        initialize(&store).await.unwrap();

        let mut collections = store.list_collections().await.unwrap();
        collections.sort();
        assert_eq!(collections, ["sessions", "subscriptions", "will_messages"]);

        // Initializing twice must be harmless.
        initialize(&store).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_find_delete_round_trip() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        initialize(&store).await.unwrap();

        let doc = json!({"client_id": "c1", "temp_session": false});

        store.upsert(SESSIONS, "client_id", "c1", doc.clone()).await.unwrap();
        assert_eq!(
            store.find_one_by(SESSIONS, "client_id", "c1").await.unwrap(),
            Some(doc)
        );

        assert!(store.delete_one(SESSIONS, "client_id", "c1").await.unwrap());
        assert!(!store.delete_one(SESSIONS, "client_id", "c1").await.unwrap());
        assert_eq!(
            store.find_one_by(SESSIONS, "client_id", "c1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn unknown_collection_is_an_error() {
        let store = MemoryStore::new();
        let err = store
            .find_one_by("nope", "client_id", "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection(_)));
    }

    #[tokio::test]
    async fn with_timeout_times_out() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
