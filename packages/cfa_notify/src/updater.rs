//! Auto updater
//!
//! Fetches achievements for one user no more often than a cooldown. The
//! "fetch not before" time is persisted, so all instances share one cooldown
//! budget against the API instead of each fetching on its own schedule.
//! A random slack is added to every wait so instances that wake together
//! drift apart.

use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::achievement::AchievementSnapshot;
use crate::clock::Clock;
use crate::error::{NotifyError, Result, TransportError};
use crate::field::Field;
use crate::observable::Observable;

/// Remote achievement lookup for a handle.
#[async_trait]
pub trait AchievementFetcher: Send + Sync {
    async fn fetch_achievements(
        &self,
        handle: &str,
    ) -> std::result::Result<AchievementSnapshot, TransportError>;
}

/// Minimum interval between fetches plus the maximum random extra delay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cooldown {
    pub value: Duration,
    pub slack: Duration,
}

impl Cooldown {
    pub fn new(value: Duration, slack: Duration) -> Self {
        Self { value, slack }
    }

    /// Slack as a fraction of the interval, e.g. 0.2 for 20%. Clamped to
    /// `0.0..=1.0`; NaN means no slack.
    pub fn with_slack_fraction(value: Duration, fraction: f64) -> Self {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        Self {
            value,
            slack: value.mul_f64(fraction),
        }
    }

    fn random_delay(&self) -> Duration {
        let slack = self.slack.as_millis() as u64;
        if slack == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..slack))
    }
}

struct UpdaterShared {
    handle: String,
    fetcher: Arc<dyn AchievementFetcher>,
    fetch_after: Field<i64>,
    cooldown: Cooldown,
    clock: Arc<dyn Clock>,
    on_fetch: Observable<AchievementSnapshot>,
    on_storage_error: Observable<NotifyError>,
}

/// Auto fetches achievements at regular intervals for a particular user.
pub struct AutoUpdater {
    shared: Arc<UpdaterShared>,
    /// Token of the current run; `None` when stopped
    run: Mutex<Option<CancellationToken>>,
}

impl AutoUpdater {
    pub fn new(
        handle: impl Into<String>,
        fetcher: Arc<dyn AchievementFetcher>,
        fetch_after: Field<i64>,
        cooldown: Cooldown,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(UpdaterShared {
                handle: handle.into(),
                fetcher,
                fetch_after,
                cooldown,
                clock,
                on_fetch: Observable::new(),
                on_storage_error: Observable::new(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Notified with every successfully fetched snapshot
    pub fn on_fetch(&self) -> &Observable<AchievementSnapshot> {
        &self.shared.on_fetch
    }

    /// Notified when reading or writing the cooldown fails. The loop stops.
    pub fn on_storage_error(&self) -> &Observable<NotifyError> {
        &self.shared.on_storage_error
    }

    pub fn cooldown(&self) -> Cooldown {
        self.shared.cooldown
    }

    /// Starts the loop. The first attempt happens right away.
    pub fn start(&self) -> Result<()> {
        let mut run = self.lock_run();
        if run.is_some() {
            return Err(NotifyError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *run = Some(token.clone());

        let shared = self.shared.clone();
        tokio::spawn(async move { shared.run_loop(token).await });
        Ok(())
    }

    /// Cancels the pending wait. A fetch already in flight still completes
    /// and is delivered, but never schedules another attempt.
    pub fn stop(&self) {
        if let Some(token) = self.lock_run().take() {
            token.cancel();
            debug!(handle = %self.shared.handle, "Auto updater stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_run().is_some()
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for AutoUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}

impl UpdaterShared {
    async fn run_loop(&self, token: CancellationToken) {
        loop {
            let delay = match self.try_fetch().await {
                Ok(delay) => delay,
                Err(e) => {
                    error!("Auto updater storage error: {}", e);
                    self.on_storage_error.notify(e);
                    return;
                }
            };

            // Guard on this run's token, not just the timer, so a late
            // fetch can't resurrect a stopped loop
            if token.is_cancelled() {
                return;
            }
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One scheduling step. Returns how long to wait before the next one.
    async fn try_fetch(&self) -> Result<Duration> {
        let now = self.clock.now_millis();
        let fetch_after = self.fetch_after.get().await?.unwrap_or(0);

        if now < fetch_after {
            let delay =
                Duration::from_millis((fetch_after - now) as u64) + self.cooldown.random_delay();
            debug!(?delay, "Too early to fetch, rescheduling");
            return Ok(delay);
        }

        debug!(handle = %self.handle, "Auto fetching achievements");
        match self.fetcher.fetch_achievements(&self.handle).await {
            Ok(snapshot) => {
                let next = now + self.cooldown.value.as_millis() as i64;
                self.fetch_after.set(Some(&next)).await?;
                self.on_fetch.notify(snapshot);
                // Next step is expected to reschedule
                Ok(Duration::ZERO)
            }
            Err(e) => {
                error!("Auto fetching error: {}", e);
                // Full cooldown, no tight retry loop
                Ok(self.cooldown.value + self.cooldown.random_delay())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START: i64 = 1_700_000_000_000;

    /// Records the clock time of every fetch attempt.
    struct ScriptedFetcher {
        clock: TokioClock,
        fail: bool,
        latency: Duration,
        attempts: Mutex<Vec<i64>>,
    }

    impl ScriptedFetcher {
        fn new(clock: TokioClock, fail: bool) -> Self {
            Self {
                clock,
                fail,
                latency: Duration::ZERO,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<i64> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AchievementFetcher for ScriptedFetcher {
        async fn fetch_achievements(
            &self,
            handle: &str,
        ) -> std::result::Result<AchievementSnapshot, TransportError> {
            self.attempts.lock().unwrap().push(self.clock.now_millis());
            tokio::time::sleep(self.latency).await;
            if self.fail {
                return Err(TransportError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(AchievementSnapshot {
                handle: handle.to_string(),
                achievements: vec![],
            })
        }
    }

    fn updater(fetcher: Arc<ScriptedFetcher>, cooldown: Cooldown) -> (AutoUpdater, Field<i64>) {
        let clock = fetcher.clock;
        let fetch_after = Field::new(Arc::new(MemoryStore::new()), "fetchAfter").unwrap();
        let updater = AutoUpdater::new(
            "alice",
            fetcher,
            fetch_after.clone(),
            cooldown,
            Arc::new(clock),
        );
        (updater, fetch_after)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_persisted_fetch_after() {
        let clock = TokioClock::starting_at(START);
        let fetcher = Arc::new(ScriptedFetcher::new(clock, false));
        let (updater, fetch_after) = updater(fetcher.clone(), Cooldown::new(ms(1000), ms(0)));
        fetch_after.set(Some(&(START + 5000))).await.unwrap();

        updater.start().unwrap();
        tokio::time::sleep(ms(4999)).await;
        assert!(fetcher.attempts().is_empty());

        tokio::time::sleep(ms(2)).await;
        assert_eq!(fetcher.attempts(), vec![START + 5000]);
        assert_eq!(
            fetch_after.get().await.unwrap(),
            Some(START + 5000 + 1000)
        );
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slack_only_delays_further() {
        let clock = TokioClock::starting_at(START);
        let fetcher = Arc::new(ScriptedFetcher::new(clock, false));
        let (updater, fetch_after) = updater(fetcher.clone(), Cooldown::new(ms(1000), ms(300)));
        fetch_after.set(Some(&(START + 5000))).await.unwrap();

        updater.start().unwrap();
        tokio::time::sleep(ms(5400)).await;
        let attempts = fetcher.attempts();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0] >= START + 5000 && attempts[0] < START + 5300);
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_fetches_once_per_cooldown() {
        let clock = TokioClock::starting_at(START);
        let fetcher = Arc::new(ScriptedFetcher::new(clock, false));
        let (updater, _) = updater(fetcher.clone(), Cooldown::new(ms(1000), ms(0)));

        let fetched = Arc::new(AtomicUsize::new(0));
        let fetched_cb = fetched.clone();
        updater
            .on_fetch()
            .set_callback(move |_| {
                fetched_cb.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        updater.start().unwrap();
        tokio::time::sleep(ms(2500)).await;
        assert_eq!(fetcher.attempts(), vec![START, START + 1000, START + 2000]);
        assert_eq!(fetched.load(Ordering::SeqCst), 3);
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_waits_full_cooldown() {
        let clock = TokioClock::starting_at(START);
        let fetcher = Arc::new(ScriptedFetcher::new(clock, true));
        let (updater, fetch_after) = updater(fetcher.clone(), Cooldown::new(ms(1000), ms(0)));

        updater.start().unwrap();
        tokio::time::sleep(ms(999)).await;
        assert_eq!(fetcher.attempts(), vec![START]);

        tokio::time::sleep(ms(2)).await;
        assert_eq!(fetcher.attempts(), vec![START, START + 1000]);
        // Failures never push the shared cooldown forward
        assert_eq!(fetch_after.get().await.unwrap(), None);
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let clock = TokioClock::starting_at(START);
        let fetcher = Arc::new(ScriptedFetcher::new(clock, false));
        let (updater, _) = updater(fetcher, Cooldown::new(ms(1000), ms(0)));

        updater.start().unwrap();
        assert!(matches!(updater.start(), Err(NotifyError::AlreadyRunning)));
        updater.stop();
        updater.stop();
        updater.start().unwrap();
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_fetch_finish_without_rescheduling() {
        let clock = TokioClock::starting_at(START);
        let mut fetcher = ScriptedFetcher::new(clock, false);
        fetcher.latency = ms(100);
        let fetcher = Arc::new(fetcher);
        let (updater, fetch_after) = updater(fetcher.clone(), Cooldown::new(ms(1000), ms(0)));

        let fetched = Arc::new(AtomicUsize::new(0));
        let fetched_cb = fetched.clone();
        updater
            .on_fetch()
            .set_callback(move |_| {
                fetched_cb.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        updater.start().unwrap();
        tokio::time::sleep(ms(50)).await;
        updater.stop();
        assert!(!updater.is_running());

        tokio::time::sleep(ms(10_000)).await;
        assert_eq!(fetcher.attempts().len(), 1);
        assert_eq!(fetched.load(Ordering::SeqCst), 1);
        assert_eq!(fetch_after.get().await.unwrap(), Some(START + 1000));
    }

    #[test]
    fn test_slack_fraction() {
        let cooldown = Cooldown::with_slack_fraction(Duration::from_secs(3600), 0.2);
        assert_eq!(cooldown.slack, Duration::from_secs(720));
        assert_eq!(Cooldown::new(ms(1), ms(0)).random_delay(), Duration::ZERO);
    }

    #[test]
    fn test_slack_fraction_out_of_range_is_clamped() {
        let hour = Duration::from_secs(3600);
        assert_eq!(Cooldown::with_slack_fraction(hour, 1e300).slack, hour);
        assert_eq!(Cooldown::with_slack_fraction(hour, f64::INFINITY).slack, hour);
        assert_eq!(Cooldown::with_slack_fraction(hour, -0.5).slack, Duration::ZERO);
        assert_eq!(Cooldown::with_slack_fraction(hour, f64::NAN).slack, Duration::ZERO);
    }
}
