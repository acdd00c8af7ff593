//! Notification state coordinator
//!
//! When the user is logged in and the store supports it, every instance runs
//! the same three-state machine. The state is stored, not held: each
//! iteration re-reads it, so all instances converge on whatever was written
//! last.
//!
//! - `NoNotif`: no change detected. The auto updater runs; a fetch that
//!   differs from the last viewed achievements moves to `PendingNotif`.
//! - `PendingNotif`: a change was detected. A notification is shown as soon
//!   as the page is visible, which moves to `ShownNotif`.
//! - `ShownNotif`: the user was told once; no repeats. Viewing the diff on
//!   the profile moves back to `NoNotif`.
//!
//! A transition writes the new state and then fires the cross-instance
//! signal. Every instance, including the one that transitioned, tears down
//! its current behavior, waits for the write to settle, and re-reads.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::achievement::AchievementSnapshot;
use crate::error::{NotifyError, Result};
use crate::field::Field;
use crate::notification::{PageHandle, PendingNotification};
use crate::observable::Observable;
use crate::signal::CrossInstanceSignal;
use crate::storage::Storage;
use crate::updater::AutoUpdater;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifState {
    #[default]
    NoNotif,
    PendingNotif,
    ShownNotif,
}

pub const NOTIFICATION_MESSAGE: &str =
    "Your achievements have been updated. Visit your profile to see the changes!";

/// Store writes are not visible to other readers right away, and the signal
/// usually arrives first. Re-reading too early sees the old state.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(2000);

/// Writes transitions and reports faults from detached tasks.
#[derive(Clone)]
struct Transitions {
    notif_state: Field<NotifState>,
    channel: Arc<CrossInstanceSignal>,
    faults: mpsc::UnboundedSender<NotifyError>,
}

impl Transitions {
    /// No compare-and-swap: every transition out of a state leads to the
    /// same next state, so racing writers agree.
    async fn change_state(&self, from: NotifState, to: NotifState) -> Result<()> {
        debug!("State change: {:?} to {:?}", from, to);
        self.notif_state.set(Some(&to)).await?;
        // Broadcast only after the write so a woken reader can see it
        self.channel.signal().await
    }

    fn spawn_change_state(&self, from: NotifState, to: NotifState) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.change_state(from, to).await {
                this.report(e);
            }
        });
    }

    fn report(&self, err: NotifyError) {
        error!("Notification state fault: {}", err);
        // Receiver gone means the loop already ended
        let _ = self.faults.send(err);
    }
}

/// Teardown handle for the behavior of the state being run.
enum ActiveBehavior {
    NoNotif,
    PendingNotif(Arc<PendingNotification>),
    ShownNotif,
}

/// Runs everything needed to detect achievement changes for the logged in
/// user and notify them once per change.
pub struct NotificationStateCoordinator {
    updater: AutoUpdater,
    storage: Storage,
    last_viewed_saved: Arc<Observable<()>>,
    channel: Arc<CrossInstanceSignal>,
    page: PageHandle,
    settle_delay: Duration,
}

impl NotificationStateCoordinator {
    pub fn new(
        updater: AutoUpdater,
        storage: Storage,
        last_viewed_saved: Arc<Observable<()>>,
        channel: CrossInstanceSignal,
        page: PageHandle,
    ) -> Self {
        Self {
            updater,
            storage,
            last_viewed_saved,
            channel: Arc::new(channel),
            page,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Runs until a storage failure or contract violation, which is
    /// returned. There is no correct way to continue after either.
    pub async fn run(&self) -> Result<()> {
        let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();
        let transitions = Transitions {
            notif_state: self.storage.notif_state.clone(),
            channel: self.channel.clone(),
            faults: faults_tx,
        };

        loop {
            let state = self.storage.notif_state.get().await?.unwrap_or_default();
            debug!("Current state: {:?}", state);

            // Register before entering, so our own transition can't be missed
            let state_changed = self.channel.await_signal();
            // A failed enter has already undone its own partial setup
            let behavior = self.enter(state, &transitions)?;

            let outcome = tokio::select! {
                _ = state_changed => {
                    debug!("Received state change signal");
                    Ok(())
                }
                Some(fault) = faults_rx.recv() => Err(fault),
            };
            self.exit(behavior);
            outcome?;

            tokio::time::sleep(self.settle_delay).await;
        }
    }

    fn enter(&self, state: NotifState, transitions: &Transitions) -> Result<ActiveBehavior> {
        match state {
            NotifState::NoNotif => self.run_for_no_notif(transitions),
            NotifState::PendingNotif => Ok(self.run_for_pending_notif(transitions)),
            NotifState::ShownNotif => self.run_for_shown_notif(transitions),
        }
    }

    fn exit(&self, behavior: ActiveBehavior) {
        match behavior {
            ActiveBehavior::NoNotif => {
                self.updater.on_fetch().clear_callback();
                self.updater.on_storage_error().clear_callback();
                self.updater.stop();
            }
            ActiveBehavior::PendingNotif(notification) => notification.cancel(),
            ActiveBehavior::ShownNotif => self.last_viewed_saved.clear_callback(),
        }
    }

    fn run_for_no_notif(&self, transitions: &Transitions) -> Result<ActiveBehavior> {
        let storage = self.storage.clone();
        let on_fetch_transitions = transitions.clone();
        self.updater.on_fetch().set_callback(move |snapshot| {
            let storage = storage.clone();
            let transitions = on_fetch_transitions.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_fetch(&storage, &transitions, &snapshot).await {
                    transitions.report(e);
                }
            });
        })?;

        let on_error_transitions = transitions.clone();
        if let Err(e) = self
            .updater
            .on_storage_error()
            .set_callback(move |e| on_error_transitions.report(e))
        {
            self.updater.on_fetch().clear_callback();
            return Err(e);
        }

        if let Err(e) = self.updater.start() {
            self.updater.on_fetch().clear_callback();
            self.updater.on_storage_error().clear_callback();
            return Err(e);
        }
        Ok(ActiveBehavior::NoNotif)
    }

    fn run_for_pending_notif(&self, transitions: &Transitions) -> ActiveBehavior {
        let notification = Arc::new(PendingNotification::new(
            NOTIFICATION_MESSAGE,
            self.page.clone(),
        ));

        let pending = notification.clone();
        let transitions = transitions.clone();
        tokio::spawn(async move {
            match pending.show().await {
                Ok(true) => {
                    transitions.spawn_change_state(NotifState::PendingNotif, NotifState::ShownNotif)
                }
                Ok(false) => {}
                Err(e) => transitions.report(e),
            }
        });

        ActiveBehavior::PendingNotif(notification)
    }

    fn run_for_shown_notif(&self, transitions: &Transitions) -> Result<ActiveBehavior> {
        let transitions = transitions.clone();
        self.last_viewed_saved.set_callback(move |()| {
            transitions.spawn_change_state(NotifState::ShownNotif, NotifState::NoNotif)
        })?;
        Ok(ActiveBehavior::ShownNotif)
    }
}

async fn handle_fetch(
    storage: &Storage,
    transitions: &Transitions,
    snapshot: &AchievementSnapshot,
) -> Result<()> {
    let diff = storage.diff_vs_last_viewed(snapshot).await?;
    if diff.is_some_and(|d| d.changed) {
        transitions
            .change_state(NotifState::NoNotif, NotifState::PendingNotif)
            .await?;
    }
    Ok(())
}
