//! Cross-instance wake-up signal
//!
//! Instances share nothing but the store, so the store's change notification
//! is the only event that crosses between them. [`CrossInstanceSignal`]
//! narrows that stream to one logical channel key and turns write events into
//! one-shot futures.
//!
//! Only the write matters, not the value: `signal()` writes a unique value,
//! then removes it shortly after so the key does not linger. Waiters only
//! learn that at least one signal happened since they started waiting.

use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{NotifyError, Result};
use crate::store::{KeyValueStore, StoreChange};

const KEY_PREFIX: &str = "cfa_broadcast_";

/// Delay before a signal's ephemeral value is removed again
pub const DEFAULT_CLEAR_DELAY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Waiters {
    pending: Vec<oneshot::Sender<()>>,
    /// Store listener, attached only while `pending` is non-empty
    listener: Option<JoinHandle<()>>,
}

pub struct CrossInstanceSignal {
    id: String,
    key: String,
    store: Arc<dyn KeyValueStore>,
    clear_delay: Duration,
    waiters: Arc<Mutex<Waiters>>,
}

impl std::fmt::Debug for CrossInstanceSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossInstanceSignal")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl CrossInstanceSignal {
    /// Fails if the store cannot publish change events.
    pub fn new(store: Arc<dyn KeyValueStore>, channel: &str) -> Result<Self> {
        let support = store.support();
        if !support.get_set || !support.change_events {
            return Err(NotifyError::UnsupportedStore(
                "store change events not supported".to_string(),
            ));
        }
        Ok(Self {
            id: random_id(),
            key: format!("{KEY_PREFIX}{channel}"),
            store,
            clear_delay: DEFAULT_CLEAR_DELAY,
            waiters: Arc::new(Mutex::new(Waiters::default())),
        })
    }

    pub fn with_clear_delay(mut self, clear_delay: Duration) -> Self {
        self.clear_delay = clear_delay;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wakes every waiter on this channel, in this instance and all others.
    pub async fn signal(&self) -> Result<()> {
        let value = format!("{}_{}", self.id, chrono::Utc::now().timestamp_millis());
        self.store.set(&self.key, &value).await?;
        debug!(key = %self.key, "Signal sent");

        let store = self.store.clone();
        let key = self.key.clone();
        let clear_delay = self.clear_delay;
        tokio::spawn(async move {
            tokio::time::sleep(clear_delay).await;
            if let Err(e) = store.remove(&key).await {
                warn!(key = %key, "Failed to clear signal value: {}", e);
            }
        });

        if let Some(listener) = resolve_pending(&self.waiters) {
            listener.abort();
        }
        Ok(())
    }

    /// Registers interest now and returns a future that completes on the
    /// next signal. Registration happens before this returns, so a signal
    /// sent after the call is never missed even if the future is polled late.
    pub fn await_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.waiters);
            if waiters.pending.is_empty() {
                waiters.listener = self.attach_listener();
            }
            waiters.pending.push(tx);
        }
        async move {
            // A dropped sender means the signal itself is gone; treat as woken
            let _ = rx.await;
        }
    }

    /// Number of waiters not yet resolved
    pub fn pending_count(&self) -> usize {
        lock(&self.waiters).pending.len()
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.waiters).listener.is_some()
    }

    fn attach_listener(&self) -> Option<JoinHandle<()>> {
        let Some(changes) = self.store.watch() else {
            warn!(key = %self.key, "Store stopped providing change events");
            return None;
        };
        Some(tokio::spawn(listen(
            self.key.clone(),
            changes,
            Arc::downgrade(&self.waiters),
        )))
    }
}

impl Drop for CrossInstanceSignal {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.waiters).listener.take() {
            listener.abort();
        }
    }
}

async fn listen(
    key: String,
    mut changes: broadcast::Receiver<StoreChange>,
    waiters: Weak<Mutex<Waiters>>,
) {
    loop {
        match changes.recv().await {
            Ok(change) if change.key == key && change.new_value.is_some() => break,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed events may have included a signal
                debug!(key = %key, skipped, "Change stream lagged, waking waiters");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => {
                // Wake everyone; the next registration attaches a fresh stream
                warn!(key = %key, "Store change stream closed, waking waiters");
                break;
            }
        }
    }

    debug!(key = %key, "Signal received");
    if let Some(waiters) = waiters.upgrade() {
        // Dropping our own handle detaches it; this task ends right after
        drop(resolve_pending(&waiters));
    }
}

/// Resolves all pending waiters and hands back the listener to detach.
fn resolve_pending(waiters: &Mutex<Waiters>) -> Option<JoinHandle<()>> {
    let mut waiters = lock(waiters);
    if waiters.pending.is_empty() {
        return None;
    }
    for tx in waiters.pending.drain(..) {
        let _ = tx.send(());
    }
    waiters.listener.take()
}

fn lock(waiters: &Mutex<Waiters>) -> std::sync::MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(|e| e.into_inner())
}

fn random_id() -> String {
    format!("{:06x}", rand::rng().random_range(0..0x100_0000u32))
}
