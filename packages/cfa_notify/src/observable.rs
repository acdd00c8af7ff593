use std::sync::{Arc, Mutex};

use crate::error::{NotifyError, Result};

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Single-callback observable.
///
/// At most one callback may be registered. Registering over an existing one
/// is an error so two owners can't silently replace each other.
pub struct Observable<T> {
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl<T> Observable<T> {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    /// Calls the registered callback, if any. Nothing is buffered.
    pub fn notify(&self, value: T) {
        // Call outside the lock so the callback may clear itself
        let callback = self.slot().clone();
        if let Some(callback) = callback {
            callback(value);
        }
    }

    pub fn set_callback<F>(&self, f: F) -> Result<()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(NotifyError::AlreadyRegistered);
        }
        *slot = Some(Arc::new(f));
        Ok(())
    }

    pub fn clear_callback(&self) {
        *self.slot() = None;
    }

    pub fn is_registered(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Callback<T>>> {
        self.callback.lock().unwrap_or_else(|e| e.into_inner())
    }
}
