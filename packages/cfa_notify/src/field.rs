use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{NotifyError, Result};
use crate::store::KeyValueStore;

/// One JSON-serialized value in the store. Every call round-trips the store.
pub struct Field<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("key", &self.key).finish()
    }
}

impl<T: Serialize + DeserializeOwned> Field<T> {
    /// Fails if the store cannot get and set values.
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self> {
        if !store.support().get_set {
            return Err(NotifyError::UnsupportedStore(
                "getValue and setValue not supported".to_string(),
            ));
        }
        Ok(Self {
            store,
            key: key.into(),
            _marker: PhantomData,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn get(&self) -> Result<Option<T>> {
        match self.store.get(&self.key).await? {
            Some(serialized) => Ok(serde_json::from_str(&serialized)?),
            None => Ok(None),
        }
    }

    /// Writes `value`, or removes the key for `None`.
    pub async fn set(&self, value: Option<&T>) -> Result<()> {
        match value {
            Some(value) => {
                let serialized = serde_json::to_string(value)?;
                self.store.set(&self.key, &serialized).await?;
            }
            None => self.store.remove(&self.key).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, StoreChange, StoreSupport};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct ReadOnlyStore;

    #[async_trait]
    impl KeyValueStore for ReadOnlyStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unsupported("get"))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unsupported("set"))
        }
        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unsupported("remove"))
        }
        fn support(&self) -> StoreSupport {
            StoreSupport {
                get_set: false,
                change_events: false,
            }
        }
        fn watch(&self) -> Option<broadcast::Receiver<StoreChange>> {
            None
        }
    }

    #[test]
    fn test_new_rejects_store_without_get_set() {
        let result = Field::<i64>::new(Arc::new(ReadOnlyStore), "fetchAfter");
        assert!(matches!(result, Err(NotifyError::UnsupportedStore(_))));
    }

    #[tokio::test]
    async fn test_unset_reads_none() {
        let field = Field::<i64>::new(Arc::new(MemoryStore::new()), "fetchAfter").unwrap();
        assert_eq!(field.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_clear() {
        let store = Arc::new(MemoryStore::new());
        let field = Field::<Vec<String>>::new(store.clone(), "names").unwrap();

        field
            .set(Some(&vec!["a".to_string(), "b".to_string()]))
            .await
            .unwrap();
        assert_eq!(
            store.get("names").await.unwrap().as_deref(),
            Some(r#"["a","b"]"#)
        );

        field.set(None).await.unwrap();
        assert_eq!(field.get().await.unwrap(), None);
        assert_eq!(store.get("names").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_value_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.set("n", "not json").await.unwrap();
        let field = Field::<i64>::new(store, "n").unwrap();
        assert!(matches!(field.get().await, Err(NotifyError::Serde(_))));
    }
}
