/// Wall-clock source in epoch milliseconds. Persisted timestamps are shared
/// between instances, so they must be wall-clock, not monotonic.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that follows tokio's timer, so it advances with paused test time.
#[derive(Clone, Copy, Debug)]
pub struct TokioClock {
    epoch_millis: i64,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(epoch_millis: i64) -> Self {
        Self {
            epoch_millis,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.epoch_millis + self.started.elapsed().as_millis() as i64
    }
}
