//! Scheduled work: a wall-aligned periodic runner for polling drivers
//! and heartbeats, and the reconnect backoff policy.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Runs a handler on wall-clock multiples of the period: the next fire
/// is at `ceil(now / period) * period`, so a 5 s periodic lands on
/// :00/:05/:10 regardless of start time or handler drift. Overruns skip
/// the missed ticks rather than backlogging.
pub struct Periodic {
    task: JoinHandle<()>,
}

impl Periodic {
    pub fn spawn<F, Fut>(period: Duration, mut handler: F) -> Periodic
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let period_us = period.as_micros().max(1) as u64;
        let task = tokio::spawn(async move {
            loop {
                let now_us = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_micros() as u64;
                let next_us = (now_us / period_us + 1) * period_us;
                sleep(Duration::from_micros(next_us - now_us)).await;
                handler().await;
            }
        });
        Periodic { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Full-jitter exponential backoff: each wait is uniform over zero to
/// the current cap, the cap doubling from `base` up to `max`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Backoff {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    /// The bus reconnect policy: 100 ms doubling to a 30 s cap.
    pub fn reconnect() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(30))
    }

    /// Next wait. Advances the attempt counter.
    pub fn next(&mut self) -> Duration {
        let cap = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let cap_us = cap.as_micros().max(1) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(0..=cap_us))
    }

    /// Call on success so the next failure starts from `base` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
