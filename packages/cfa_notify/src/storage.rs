use std::sync::Arc;
use tracing::{debug, info};

use crate::achievement::{AchievementDiff, AchievementSnapshot, calculate_diffs};
use crate::error::Result;
use crate::field::Field;
use crate::notif_state::NotifState;
use crate::store::KeyValueStore;

pub const LOGGED_IN_USER_KEY: &str = "loggedInUser";
pub const LAST_VIEWED_KEY: &str = "lastViewedAchievements";
pub const FETCH_AFTER_KEY: &str = "fetchAfter";
pub const NOTIF_STATE_KEY: &str = "notifState";

/// The fixed set of persisted fields shared by every instance.
///
/// `fetch_after`, `notif_state` and `last_viewed` only describe the user in
/// `logged_in_user`; see [`Storage::reset_on_logged_in_user_change`].
#[derive(Clone, Debug)]
pub struct Storage {
    pub logged_in_user: Field<String>,
    pub last_viewed: Field<AchievementSnapshot>,
    pub fetch_after: Field<i64>,
    pub notif_state: Field<NotifState>,
}

impl Storage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Ok(Self {
            logged_in_user: Field::new(store.clone(), LOGGED_IN_USER_KEY)?,
            last_viewed: Field::new(store.clone(), LAST_VIEWED_KEY)?,
            fetch_after: Field::new(store.clone(), FETCH_AFTER_KEY)?,
            notif_state: Field::new(store, NOTIF_STATE_KEY)?,
        })
    }

    /// Clears per-user state if the logged in user differs from the one the
    /// state was recorded for. Returns true if a reset happened.
    ///
    /// The marker is written last: a crash part way leaves the old marker,
    /// and the next start resets again.
    pub async fn reset_on_logged_in_user_change(&self, logged_in_user: &str) -> Result<bool> {
        let last = self.logged_in_user.get().await?;
        if last.as_deref() == Some(logged_in_user) {
            debug!("No change in logged in user");
            return Ok(false);
        }

        self.clear_user_state().await?;
        self.logged_in_user
            .set(Some(&logged_in_user.to_string()))
            .await?;
        info!(
            "Logged in user updated: {:?} to {}",
            last.as_deref(),
            logged_in_user
        );
        Ok(true)
    }

    /// Forgets everything, marker last, so an interrupted clear is redone
    /// by the next start.
    pub async fn clear(&self) -> Result<()> {
        self.clear_user_state().await?;
        self.logged_in_user.set(None).await?;
        info!("Cleared stored state");
        Ok(())
    }

    async fn clear_user_state(&self) -> Result<()> {
        self.fetch_after.set(None).await?;
        self.notif_state.set(None).await?;
        self.last_viewed.set(None).await
    }

    /// Diffs `current` against the last viewed snapshot. With nothing viewed
    /// yet, `current` becomes the baseline and `None` is returned.
    pub async fn diff_vs_last_viewed(
        &self,
        current: &AchievementSnapshot,
    ) -> Result<Option<AchievementDiff>> {
        let Some(last_viewed) = self.last_viewed.get().await? else {
            self.last_viewed.set(Some(current)).await?;
            info!("Saved achievements for the first time");
            return Ok(None);
        };

        let diff = calculate_diffs(&last_viewed.achievements, &current.achievements);
        if diff.changed {
            debug!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "Achievements differ from last viewed"
            );
        } else {
            debug!("No change in achievements since last viewed");
        }
        Ok(Some(diff))
    }

    pub async fn save_viewed(&self, snapshot: &AchievementSnapshot) -> Result<()> {
        self.last_viewed.set(Some(snapshot)).await?;
        info!("Saved current achievements as viewed");
        Ok(())
    }
}
