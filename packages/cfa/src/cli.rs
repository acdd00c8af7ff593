//! One-shot subcommands: everything except `run`.

use anyhow::{Context, Result};
use cfa_notify::{AchievementFetcher, KeyValueStore, Storage};
use std::io::{self, Write};
use std::sync::Arc;

use crate::config::{CfaConfig, FileConfig, RunConfig};
use crate::db::SqliteStore;
use crate::fetch::HttpAchievementFetcher;
use crate::page;

/// Print a profile's achievements box once.
pub async fn show_command(rc: &RunConfig, handle: &str) -> Result<()> {
    let fetcher = HttpAchievementFetcher::new(rc.api_url_base.clone(), rc.api_timeout)?;
    let details = fetcher
        .fetch_achievements(handle)
        .await
        .with_context(|| format!("Failed to fetch achievements for {}", handle))?;
    print!("{}", page::render_box(&details));
    Ok(())
}

/// Print the persisted shared state.
pub async fn state_command(config: &CfaConfig, rc: &RunConfig, raw: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config, rc.poll_interval).await?);

    if raw {
        for (key, value) in store.entries().await? {
            println!("{} = {}", key, value);
        }
        return Ok(());
    }

    let storage = Storage::new(store.clone() as Arc<dyn KeyValueStore>)?;
    let user = storage.logged_in_user.get().await?;
    let notif_state = storage.notif_state.get().await?.unwrap_or_default();
    let fetch_after = storage.fetch_after.get().await?;
    let last_viewed = storage.last_viewed.get().await?;

    println!("Logged in user:  {}", user.as_deref().unwrap_or("-"));
    println!("Notif state:     {:?}", notif_state);
    println!(
        "Fetch after:     {}",
        fetch_after.map(format_millis).unwrap_or_else(|| "-".to_string())
    );
    match last_viewed {
        Some(snapshot) => println!(
            "Last viewed:     {} achievements of {}",
            snapshot.achievements.len(),
            snapshot.handle
        ),
        None => println!("Last viewed:     -"),
    }
    Ok(())
}

/// Clear the shared store. Running instances see the removals, unless `hard`
/// deletes the file from under them.
pub async fn reset_command(
    config: &CfaConfig,
    rc: &RunConfig,
    force: bool,
    hard: bool,
) -> Result<()> {
    if !force {
        println!("This will forget the logged in user, last viewed achievements and notification state!");
        print!("Are you sure? (yes/no): ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim() != "yes" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if hard {
        if config.reset_database()? {
            println!("Deleted {}", config.db_path.display());
        } else {
            println!("Nothing to delete.");
        }
        return Ok(());
    }

    let store = Arc::new(SqliteStore::open(config, rc.poll_interval).await?);
    let others = clear_store(store).await?;
    println!("Cleared stored state and {} other keys.", others);
    Ok(())
}

/// Known fields first, in reset order, then whatever else is left. Returns
/// how many other keys were removed.
async fn clear_store(store: Arc<SqliteStore>) -> Result<usize> {
    Storage::new(store.clone() as Arc<dyn KeyValueStore>)?
        .clear()
        .await?;
    store.clear().await
}

/// Print the effective configuration as TOML.
pub fn config_command(config: &CfaConfig, fc: &FileConfig) -> Result<()> {
    println!("# {}", config.config_toml_path().display());
    print!(
        "{}",
        toml::to_string_pretty(fc).context("Failed to serialize configuration")?
    );
    Ok(())
}

fn format_millis(millis: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(time) => format!("{} ({})", time.to_rfc3339(), millis),
        None => millis.to_string(),
    }
}
