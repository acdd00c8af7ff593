//! Key/value store seam
//!
//! Everything the notifier persists goes through [`KeyValueStore`]. Values are
//! opaque strings; typed access lives in [`Field`](crate::Field). A store may
//! optionally publish change events, which is what
//! [`CrossInstanceSignal`](crate::CrossInstanceSignal) builds on.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// A value changed in the store. `new_value` is `None` for removals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub new_value: Option<String>,
}

/// Capabilities a store instance offers, checked once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreSupport {
    pub get_set: bool,
    pub change_events: bool,
}

impl StoreSupport {
    pub const FULL: StoreSupport = StoreSupport {
        get_set: true,
        change_events: true,
    };
}

/// Asynchronous string key/value store shared by every instance of one user
/// profile. Write visibility to other instances may lag.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn support(&self) -> StoreSupport;

    /// Subscribe to value changes. Returns `None` when the store has no
    /// change notification mechanism.
    fn watch(&self) -> Option<broadcast::Receiver<StoreChange>>;
}

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// In-process store. Cloning the `Arc` around it is how several instances
/// in one process share a profile.
#[derive(Debug)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    /// Snapshot of every stored key, mostly useful for inspection.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map is still a valid map
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, key: &str, new_value: Option<String>) {
        // No subscribers is fine
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            new_value,
        });
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), value.to_string());
        self.publish(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.lock().remove(key).is_some() {
            self.publish(key, None);
        }
        Ok(())
    }

    fn support(&self) -> StoreSupport {
        StoreSupport::FULL
    }

    fn watch(&self) -> Option<broadcast::Receiver<StoreChange>> {
        Some(self.changes.subscribe())
    }
}
