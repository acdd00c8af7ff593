//! `cfa run`: one instance, the terminal analogue of one open profile tab.
//!
//! The primary feature is printing the achievements box for a profile. The
//! extra feature, when a logged in user is given and the shared store works,
//! is tracking that user's achievements and telling them once when they
//! change, across every running instance.

use anyhow::{Context, Result};
use cfa_notify::{
    AchievementDiff, AchievementFetcher, AchievementSnapshot, AutoUpdater, CrossInstanceSignal,
    KeyValueStore, NotificationStateCoordinator, Observable, Storage, SystemClock, check_support,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CfaConfig, RunConfig};
use crate::db::SqliteStore;
use crate::fetch::HttpAchievementFetcher;
use crate::page::{self, PageCommand, TerminalPage};

/// Broadcast channel name shared by every instance
const STATE_CHANGE_CHANNEL: &str = "stateChange";

pub struct RunArgs {
    /// Logged in user; without one only the profile box is shown
    pub user: Option<String>,
    /// Profile being viewed
    pub profile: Option<String>,
    pub hidden: bool,
}

/// Changes between the last viewed and the displayed achievements, acked at
/// most once per instance.
pub struct DiffView {
    diff: AchievementDiff,
    snapshot: AchievementSnapshot,
    saved_as_viewed: bool,
}

impl DiffView {
    /// Prints the diff. The first time only, also saves the displayed
    /// achievements as viewed and tells the coordinator about it.
    pub async fn open(&mut self, storage: &Storage, saved: &Observable<()>) -> Result<()> {
        print!("{}", page::render_diff(&self.diff));
        if !self.saved_as_viewed {
            storage.save_viewed(&self.snapshot).await?;
            self.saved_as_viewed = true;
            saved.notify(());
        }
        Ok(())
    }
}

pub async fn run_command(config: &CfaConfig, rc: &RunConfig, args: RunArgs) -> Result<()> {
    let fetcher = match HttpAchievementFetcher::new(rc.api_url_base.clone(), rc.api_timeout) {
        Ok(fetcher) => Some(Arc::new(fetcher)),
        Err(e) => {
            error!("{:#}", e);
            None
        }
    };

    let store = match SqliteStore::open(config, rc.poll_interval).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Shared store unavailable: {:#}", e);
            None
        }
    };
    let support = check_support(
        store.as_deref().map(|s| s as &dyn KeyValueStore),
        fetcher.is_some(),
    );
    let Some(fetcher) = fetcher.filter(|_| support.essential.ok) else {
        anyhow::bail!("{}", support.essential.msg.unwrap_or_default());
    };

    // Primary feature
    let details = match &args.profile {
        Some(handle) => show_profile(fetcher.as_ref(), handle).await,
        None => None,
    };

    // Extra feature
    let Some(user) = args.user else {
        debug!("No logged in user, not running auto updater");
        return Ok(());
    };
    let store = match store {
        Some(store) if support.auto_update.ok => store,
        _ => {
            if let Some(msg) = &support.auto_update.msg {
                info!("{}", msg);
            }
            return Ok(());
        }
    };
    let store: Arc<dyn KeyValueStore> = store;

    let storage = Storage::new(store.clone())?;
    storage.reset_on_logged_in_user_change(&user).await?;

    let last_viewed_saved = Arc::new(Observable::new());
    let diff_view = match details {
        Some(details) if details.handle == user => prepare_diff_view(&storage, details).await?,
        _ => None,
    };

    debug!(local = rc.local, cooldown = ?rc.cooldown, "Using refresh interval");
    let updater = AutoUpdater::new(
        user.clone(),
        fetcher,
        storage.fetch_after.clone(),
        rc.cooldown,
        Arc::new(SystemClock),
    );
    let page = TerminalPage::new(!args.hidden);
    let channel = CrossInstanceSignal::new(store, STATE_CHANGE_CHANNEL)?
        .with_clear_delay(rc.signal_clear_delay);
    let coordinator = NotificationStateCoordinator::new(
        updater,
        storage.clone(),
        last_viewed_saved.clone(),
        channel,
        page.handle(),
    )
    .with_settle_delay(rc.settle_delay);

    info!(user = %user, "Watching achievements");
    println!("{}", page::HELP);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
            shutdown.cancel();
        }
    });
    let commands = tokio::spawn(read_commands(
        page,
        diff_view,
        storage,
        last_viewed_saved,
        shutdown.clone(),
    ));

    let result = tokio::select! {
        result = coordinator.run() => result.context("Notification coordinator stopped"),
        _ = shutdown.cancelled() => Ok(()),
    };
    shutdown.cancel();
    commands.abort();
    result
}

/// Fetches and prints the achievements box. A failed fetch is logged and
/// shows nothing.
pub async fn show_profile(
    fetcher: &dyn AchievementFetcher,
    handle: &str,
) -> Option<AchievementSnapshot> {
    match fetcher.fetch_achievements(handle).await {
        Ok(details) => {
            println!("{}", page::render_box(&details));
            debug!("Printed achievements box");
            Some(details)
        }
        Err(e) => {
            error!(handle, "Failed to fetch achievements: {}", e);
            None
        }
    }
}

/// Only offers a diff view when the displayed achievements differ from the
/// last viewed ones. With none viewed yet they become the baseline.
async fn prepare_diff_view(
    storage: &Storage,
    details: AchievementSnapshot,
) -> Result<Option<DiffView>> {
    let diff = match storage.diff_vs_last_viewed(&details).await? {
        Some(diff) if diff.changed => diff,
        _ => return Ok(None),
    };
    println!("Your achievements changed since you last looked. Type `diff` to see.");
    Ok(Some(DiffView {
        diff,
        snapshot: details,
        saved_as_viewed: false,
    }))
}

async fn read_commands(
    page: TerminalPage,
    mut diff_view: Option<DiffView>,
    storage: Storage,
    last_viewed_saved: Arc<Observable<()>>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            // Detached stdin: keep the page alive and run without commands
            Ok(None) => {
                shutdown.cancelled().await;
                return;
            }
            Err(e) => {
                warn!("Failed to read command: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<PageCommand>() {
            Ok(PageCommand::Show) => page.set_visible(true),
            Ok(PageCommand::Hide) => page.set_visible(false),
            Ok(PageCommand::Diff) => match diff_view.as_mut() {
                Some(view) => {
                    if let Err(e) = view.open(&storage, &last_viewed_saved).await {
                        error!("Failed to save viewed achievements: {:#}", e);
                    }
                }
                None => println!("No changes to show"),
            },
            Ok(PageCommand::Help) => println!("{}", page::HELP),
            Ok(PageCommand::Quit) => {
                shutdown.cancel();
                return;
            }
            Err(msg) => println!("{}", msg),
        }
        debug!(visible = page.is_visible(), "Handled command");
    }
}
