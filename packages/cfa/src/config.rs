use anyhow::{Context, Result};
use cfa_notify::Cooldown;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [updater]
//                    refresh_secs = 600
//
//   env var:         CFA_UPDATER__REFRESH_SECS=600   (double underscore = nesting)
//
//   (single underscore stays within field names: CFA_API__TIMEOUT_SECS)

pub const PRODUCTION_API_URL_BASE: &str = "https://cfa-api.azurewebsites.net/api/ach/";
pub const LOCAL_API_URL_BASE: &str = "http://localhost:4908/ach/";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Talk to a locally running API and refresh every minute
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub updater: UpdaterFileConfig,
    #[serde(default)]
    pub coordinator: CoordinatorFileConfig,
    #[serde(default)]
    pub store: StoreFileConfig,
}

/// Achievements API (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    /// Handle is appended to this. Defaults depend on `local`.
    #[serde(default)]
    pub url_base: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            url_base: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Auto updater cadence (lives under `[updater]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdaterFileConfig {
    /// Defaults to 60 when `local`, else 3600
    #[serde(default)]
    pub refresh_secs: Option<u64>,
    #[serde(default = "default_slack_fraction")]
    pub slack_fraction: f64,
}

impl Default for UpdaterFileConfig {
    fn default() -> Self {
        Self {
            refresh_secs: None,
            slack_fraction: default_slack_fraction(),
        }
    }
}

/// Notification state machine timing (lives under `[coordinator]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorFileConfig {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_signal_clear_ms")]
    pub signal_clear_ms: u64,
}

impl Default for CoordinatorFileConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            signal_clear_ms: default_signal_clear_ms(),
        }
    }
}

/// Shared store tunables (lives under `[store]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreFileConfig {
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for StoreFileConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_slack_fraction() -> f64 {
    0.2
}
fn default_settle_ms() -> u64 {
    2000
}
fn default_signal_clear_ms() -> u64 {
    500
}
fn default_poll_ms() -> u64 {
    250
}

/// Build a figment that layers: defaults → config.toml → CFA_* env vars → CLI.
///
/// Env vars use double-underscore for nesting into sections:
///   `CFA_API__URL_BASE=http://...`  →  `api.url_base = "http://..."`
///   `CFA_STORE__POLL_MS=100`        →  `store.poll_ms = 100`
///
/// `--local` on the command line can only turn local mode on.
pub fn load_config(data_dir: &Path, cli_local: bool) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let figment = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CFA_").split("__"));

    if cli_local {
        figment.merge(("local", true))
    } else {
        figment
    }
}

// =============================================================================
// Runtime config (derived from FileConfig, used by the run flow)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub local: bool,
    pub api_url_base: String,
    pub api_timeout: Duration,
    pub cooldown: Cooldown,
    pub settle_delay: Duration,
    pub signal_clear_delay: Duration,
    pub poll_interval: Duration,
}

impl RunConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let api_url_base = fc.api.url_base.clone().unwrap_or_else(|| {
            if fc.local {
                LOCAL_API_URL_BASE.to_string()
            } else {
                PRODUCTION_API_URL_BASE.to_string()
            }
        });
        let refresh_secs = fc
            .updater
            .refresh_secs
            .unwrap_or(if fc.local { 60 } else { 60 * 60 });
        if !(0.0..=1.0).contains(&fc.updater.slack_fraction) {
            warn!(
                slack_fraction = fc.updater.slack_fraction,
                "updater.slack_fraction outside 0..=1, clamping"
            );
        }

        Self {
            local: fc.local,
            api_url_base,
            api_timeout: Duration::from_secs(fc.api.timeout_secs),
            cooldown: Cooldown::with_slack_fraction(
                Duration::from_secs(refresh_secs),
                fc.updater.slack_fraction,
            ),
            settle_delay: Duration::from_millis(fc.coordinator.settle_ms),
            signal_clear_delay: Duration::from_millis(fc.coordinator.signal_clear_ms),
            // Zero would make tokio's interval panic
            poll_interval: Duration::from_millis(fc.store.poll_ms.max(1)),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct CfaConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl CfaConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".cfa"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("cfa.db");

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// The database and its WAL side files.
    fn database_files(&self) -> [PathBuf; 3] {
        [
            self.db_path.clone(),
            self.db_path.with_extension("db-wal"),
            self.db_path.with_extension("db-shm"),
        ]
    }

    /// Deletes the store file from under any running instance, so only use
    /// it with none running. Returns whether there was anything to delete.
    pub fn reset_database(&self) -> Result<bool> {
        let mut deleted = false;
        for path in self.database_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => deleted = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete {}", path.display()));
                }
            }
        }
        if deleted {
            info!(path = %self.db_path.display(), "Store deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert!(!fc.local);
        assert!(fc.api.url_base.is_none());
        assert_eq!(fc.api.timeout_secs, 10);
        assert!(fc.updater.refresh_secs.is_none());
        assert_eq!(fc.updater.slack_fraction, 0.2);
        assert_eq!(fc.coordinator.settle_ms, 2000);
        assert_eq!(fc.coordinator.signal_clear_ms, 500);
        assert_eq!(fc.store.poll_ms, 250);
    }

    // ── RunConfig::from_file ────────────────────────────────────────────

    #[test]
    fn test_run_config_production() {
        let rc = RunConfig::from_file(&FileConfig::default());
        assert!(!rc.local);
        assert_eq!(rc.api_url_base, PRODUCTION_API_URL_BASE);
        assert_eq!(rc.cooldown.value, Duration::from_secs(3600));
        assert_eq!(rc.cooldown.slack, Duration::from_secs(720));
        assert_eq!(rc.api_timeout, Duration::from_secs(10));
        assert_eq!(rc.settle_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_run_config_local() {
        let fc = FileConfig {
            local: true,
            ..Default::default()
        };
        let rc = RunConfig::from_file(&fc);
        assert_eq!(rc.api_url_base, LOCAL_API_URL_BASE);
        assert_eq!(rc.cooldown.value, Duration::from_secs(60));
        assert_eq!(rc.cooldown.slack, Duration::from_secs(12));
    }

    #[test]
    fn test_run_config_explicit_values_win_over_local() {
        let fc = FileConfig {
            local: true,
            api: ApiFileConfig {
                url_base: Some("http://api.test/ach/".to_string()),
                ..Default::default()
            },
            updater: UpdaterFileConfig {
                refresh_secs: Some(5),
                slack_fraction: 0.0,
            },
            ..Default::default()
        };
        let rc = RunConfig::from_file(&fc);
        assert_eq!(rc.api_url_base, "http://api.test/ach/");
        assert_eq!(rc.cooldown.value, Duration::from_secs(5));
        assert_eq!(rc.cooldown.slack, Duration::ZERO);
    }

    #[test]
    fn test_run_config_huge_slack_fraction_is_clamped() {
        let fc = FileConfig {
            updater: UpdaterFileConfig {
                refresh_secs: Some(60),
                slack_fraction: 1e300,
            },
            ..Default::default()
        };
        let rc = RunConfig::from_file(&fc);
        assert_eq!(rc.cooldown.slack, Duration::from_secs(60));
    }

    #[test]
    fn test_run_config_zero_poll_is_clamped() {
        let fc = FileConfig {
            store: StoreFileConfig { poll_ms: 0 },
            ..Default::default()
        };
        assert_eq!(
            RunConfig::from_file(&fc).poll_interval,
            Duration::from_millis(1)
        );
    }

    // ── CfaConfig ───────────────────────────────────────────────────────

    #[test]
    fn test_cfa_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("nested");
        let config = CfaConfig::new(Some(data_dir.clone())).unwrap();

        assert_eq!(config.data_dir, data_dir);
        assert_eq!(config.db_path, data_dir.join("cfa.db"));
        assert_eq!(config.config_toml_path(), data_dir.join("config.toml"));
        assert!(data_dir.exists());
    }

    #[test]
    fn test_db_url() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CfaConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let url = config.db_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.contains("cfa.db"));
        assert!(url.ends_with("?mode=rwc"));
    }

    #[test]
    fn test_reset_database() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CfaConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        std::fs::write(&config.db_path, "fake db").unwrap();
        let wal = config.db_path.with_extension("db-wal");
        std::fs::write(&wal, "wal").unwrap();

        assert!(config.reset_database().unwrap());
        assert!(!config.db_path.exists());
        assert!(!wal.exists());

        // Nothing left to delete
        assert!(!config.reset_database().unwrap());
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path(), false).extract().unwrap();
        assert!(!fc.local);
        assert_eq!(fc.store.poll_ms, 250);
    }

    #[test]
    fn test_load_config_cli_local() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path(), true).extract().unwrap();
        assert!(fc.local);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "local = true\n[api]\nurl_base = \"http://10.0.0.2/ach/\"\n[coordinator]\nsettle_ms = 100\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path(), false).extract().unwrap();
        assert!(fc.local);
        assert_eq!(fc.api.url_base.as_deref(), Some("http://10.0.0.2/ach/"));
        assert_eq!(fc.coordinator.settle_ms, 100);
        // Untouched sections keep their defaults
        assert_eq!(fc.coordinator.signal_clear_ms, 500);
        assert_eq!(fc.api.timeout_secs, 10);
    }

    #[test]
    fn test_cli_local_cannot_be_turned_off_by_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "local = false\n").unwrap();
        let fc: FileConfig = load_config(tmp.path(), true).extract().unwrap();
        assert!(fc.local);
    }
}
