use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{DocumentStore, IndexSpec, StoreError};

/// A [`DocumentStore`] that keeps each collection as one JSON file in a data
/// directory, with the whole data set mirrored in memory.
///
/// Writes go to a temporary file first and are renamed into place, so a crash
/// mid-write never leaves a half-written collection behind. Index metadata
/// lives in `indexes.json`; uniqueness itself is inherent to the layout, as
/// documents are keyed by their indexed field.
pub struct FileStore {
    base_dir: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, HashMap<String, Value>>,
    indexes: Vec<IndexSpec>,
    closed: bool,
}

const INDEXES_FILE: &str = "indexes.json";

impl FileStore {
    /// Open (or create) the store rooted at `base_dir`, loading every
    /// collection file found there.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<FileStore, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let mut inner = Inner::default();

        let mut entries = fs::read_dir(&base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let bytes = fs::read(&path).await?;

            if stem == "indexes" {
                inner.indexes = serde_json::from_slice(&bytes)?;
            } else {
                inner
                    .collections
                    .insert(stem.to_owned(), serde_json::from_slice(&bytes)?);
            }
        }

        tracing::info!(
            base_dir = %base_dir.display(),
            collections = inner.collections.len(),
            "opened document store"
        );

        Ok(FileStore {
            base_dir,
            inner: RwLock::new(inner),
        })
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json"))
    }

    /// Serialize to a sibling temp file, then rename over the target.
    async fn write_atomic<T: serde::Serialize>(
        &self,
        path: PathBuf,
        data: &T,
    ) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(data)?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn persist_collection(&self, name: &str) -> Result<(), StoreError> {
        let documents = {
            let inner = self.inner.read().await;
            inner
                .collections
                .get(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.into()))?
                .clone()
        };

        self.write_atomic(self.collection_path(name), &documents).await
    }

    async fn persist_indexes(&self) -> Result<(), StoreError> {
        let indexes = self.inner.read().await.indexes.clone();
        self.write_atomic(self.base_dir.join(INDEXES_FILE), &indexes).await
    }
}

impl Inner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn find_one_by(
        &self,
        collection: &str,
        _field: &str,
        value: &str,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().await;
        inner.check_open()?;

        let documents = inner
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.into()))?;

        Ok(documents.get(value).cloned())
    }

    async fn upsert(
        &self,
        collection: &str,
        _field: &str,
        value: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            inner.check_open()?;

            inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.into()))?
                .insert(value.into(), document);
        }

        self.persist_collection(collection).await
    }

    async fn delete_one(
        &self,
        collection: &str,
        _field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.check_open()?;

            inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.into()))?
                .remove(value)
                .is_some()
        };

        if removed {
            self.persist_collection(collection).await?;
        }

        Ok(removed)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        inner.check_open()?;

        Ok(inner.collections.keys().cloned().collect())
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            inner.check_open()?;
            inner.collections.entry(name.into()).or_default();
        }

        self.persist_collection(name).await
    }

    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            inner.check_open()?;
            inner.indexes.retain(|index| index.collection != collection);
        }

        self.persist_indexes().await
    }

    async fn create_index(&self, index: IndexSpec) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            inner.check_open()?;

            if !inner.collections.contains_key(&index.collection) {
                return Err(StoreError::UnknownCollection(index.collection));
            }

            inner.indexes.push(index);
        }

        self.persist_indexes().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.check_open()?;
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::initialize;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store: Arc<dyn DocumentStore> =
                Arc::new(FileStore::open(dir.path()).await.unwrap());
            initialize(&store).await.unwrap();

            store
                .upsert(
                    "sessions",
                    "client_id",
                    "c1",
                    json!({"client_id": "c1", "subscriptions": {"t": 1}}),
                )
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let doc = store
            .find_one_by("sessions", "client_id", "c1")
            .await
            .unwrap()
            .expect("document should persist");

        assert_eq!(doc["subscriptions"]["t"], 1);
    }

    #[tokio::test]
    async fn delete_persists() {
        let dir = tempfile::tempdir().unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
        initialize(&store).await.unwrap();

        store
            .upsert("will_messages", "client_id", "c1", json!({"topic": "t"}))
            .await
            .unwrap();
        assert!(store
            .delete_one("will_messages", "client_id", "c1")
            .await
            .unwrap());

        drop(store);

        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store
                .find_one_by("will_messages", "client_id", "c1")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn indexes_are_recreated_on_initialize() {
        let dir = tempfile::tempdir().unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
        initialize(&store).await.unwrap();
        // A second initialize drops and recreates; must not error or duplicate.
        initialize(&store).await.unwrap();
    }
}
