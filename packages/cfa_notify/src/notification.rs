use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{NotifyError, Result};

/// Displays a short message to the user.
pub trait Toaster: Send + Sync {
    fn show_toast(&self, message: &str);
}

/// What the notifier needs from the page it runs on.
#[derive(Clone)]
pub struct PageHandle {
    /// Whether the page is currently visible to the user
    pub visible: watch::Receiver<bool>,
    pub toaster: Arc<dyn Toaster>,
}

/// A toast shown as soon as the page is visible.
///
/// Cancelling is sticky: a notification cancelled before `show()` is even
/// called never displays.
pub struct PendingNotification {
    message: String,
    page: PageHandle,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl PendingNotification {
    pub fn new(message: impl Into<String>, page: PageHandle) -> Self {
        Self {
            message: message.into(),
            page,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Shows the toast immediately if the page is visible, otherwise the next
    /// time it becomes visible. Returns `Ok(false)` if cancelled first.
    pub async fn show(&self) -> Result<bool> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NotifyError::AlreadyPending);
        }

        let mut visible = self.page.visible.clone();
        let shown = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            became_visible = visible.wait_for(|v| *v) => {
                // A closed channel means the page is gone
                became_visible.is_ok()
            }
        };

        if shown && !self.cancel.is_cancelled() {
            self.page.toaster.show_toast(&self.message);
            return Ok(true);
        }
        debug!("Notification cancelled");
        Ok(false)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
