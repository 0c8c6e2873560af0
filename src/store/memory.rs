use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::{DocumentStore, IndexSpec, StoreError};

/// A purely in-memory [`DocumentStore`]. Nothing survives a restart; used by
/// tests and available as a backing store for throwaway deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, HashMap<String, Value>>,
    indexes: Vec<IndexSpec>,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl Inner {
    fn collection(&self, name: &str) -> Result<&HashMap<String, Value>, StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }

        self.collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.into()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut HashMap<String, Value>, StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }

        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.into()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one_by(
        &self,
        collection: &str,
        _field: &str,
        value: &str,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.collection(collection)?.get(value).cloned())
    }

    async fn upsert(
        &self,
        collection: &str,
        _field: &str,
        value: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.collection_mut(collection)?.insert(value.into(), document);
        Ok(())
    }

    async fn delete_one(
        &self,
        collection: &str,
        _field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner.collection_mut(collection)?.remove(value).is_some())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }

        Ok(inner.collections.keys().cloned().collect())
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }

        inner.collections.entry(name.into()).or_default();
        Ok(())
    }

    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.indexes.retain(|index| index.collection != collection);
        Ok(())
    }

    async fn create_index(&self, index: IndexSpec) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(StoreError::Closed);
        }

        if !inner.collections.contains_key(&index.collection) {
            return Err(StoreError::UnknownCollection(index.collection));
        }

        inner.indexes.push(index);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.write().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closed_store_refuses_operations() {
        let store = MemoryStore::new();
        store.create_collection("sessions").await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.find_one_by("sessions", "client_id", "c1").await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store
                .upsert("sessions", "client_id", "c1", json!({}))
                .await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn create_index_requires_collection() {
        let store = MemoryStore::new();
        let err = store
            .create_index(IndexSpec {
                collection: "sessions".into(),
                field: "client_id".into(),
                unique: true,
                name: "sessions_client_id_unique".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::UnknownCollection(_)));
    }
}
