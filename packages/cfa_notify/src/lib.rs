//! cfa_notify - achievement change notifications across instances
//!
//! Several instances of the client (one per open profile page) run at once
//! for the same user. They share nothing but an asynchronous key/value store,
//! yet the user should be told about a change in their achievements once,
//! not once per instance. This crate provides the pieces for that:
//!
//! - [`Field`]: typed JSON access to one store key
//! - [`Observable`]: single-callback in-process event
//! - [`CrossInstanceSignal`]: wake-up broadcast over the store's change events
//! - [`AutoUpdater`]: cooldown-limited fetch loop sharing its cooldown via the store
//! - [`NotificationStateCoordinator`]: the replicated three-state machine
//!
//! It has no HTTP or terminal dependencies; the fetcher, store backend and
//! page are supplied by the caller.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cfa_notify::*;
//!
//! # async fn example(fetcher: Arc<dyn AchievementFetcher>, page: PageHandle) -> Result<()> {
//! let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
//! let storage = Storage::new(store.clone())?;
//! storage.reset_on_logged_in_user_change("tourist").await?;
//!
//! let updater = AutoUpdater::new(
//!     "tourist",
//!     fetcher,
//!     storage.fetch_after.clone(),
//!     Cooldown::with_slack_fraction(Duration::from_secs(3600), 0.2),
//!     Arc::new(SystemClock),
//! );
//! let coordinator = NotificationStateCoordinator::new(
//!     updater,
//!     storage,
//!     Arc::new(Observable::new()),
//!     CrossInstanceSignal::new(store, "stateChange")?,
//!     page,
//! );
//! coordinator.run().await
//! # }
//! ```

mod achievement;
mod clock;
mod error;
mod field;
mod notif_state;
mod notification;
mod observable;
mod signal;
mod storage;
mod store;
mod support;
mod updater;

pub use achievement::{Achievement, AchievementDiff, AchievementSnapshot, calculate_diffs};
pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{NotifyError, Result, StoreError, TransportError};
pub use field::Field;
pub use notif_state::{
    DEFAULT_SETTLE_DELAY, NOTIFICATION_MESSAGE, NotifState, NotificationStateCoordinator,
};
pub use notification::{PageHandle, PendingNotification, Toaster};
pub use observable::Observable;
pub use signal::{CrossInstanceSignal, DEFAULT_CLEAR_DELAY};
pub use storage::{
    FETCH_AFTER_KEY, LAST_VIEWED_KEY, LOGGED_IN_USER_KEY, NOTIF_STATE_KEY, Storage,
};
pub use store::{KeyValueStore, MemoryStore, StoreChange, StoreSupport};
pub use support::{SupportInfo, SupportItem, check_support};
pub use updater::{AchievementFetcher, AutoUpdater, Cooldown};
