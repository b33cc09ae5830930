//! Background eviction for the list cache.
//!
//! Rows are removed only once they are past `expires_at` by more than a
//! grace period, and never more than `max_delete` per run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::shutdown::ShutdownSignal;
use crate::storage::{StorageHandle, now_secs};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Rows with `expires_at < threshold`
    pub expired: u64,
    pub deleted: u64,
    /// `now - grace`, epoch seconds
    pub threshold: i64,
}

/// Sweep timing and limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSchedule {
    pub interval: Duration,
    pub jitter: Duration,
    pub grace: Duration,
    pub max_delete: u32,
    pub min_delay: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for SweepSchedule {
    fn from(config: &CacheConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.sweep_interval_secs),
            jitter: Duration::from_secs(config.sweep_jitter_secs),
            grace: Duration::from_secs(config.sweep_grace_secs),
            max_delete: config.max_delete_per_sweep,
            min_delay: Duration::from_secs(config.min_sweep_delay_secs),
        }
    }
}

impl SweepSchedule {
    /// `interval +/- random jitter`, never below `min_delay`
    pub fn next_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        let base = self.interval.as_millis() as i64;
        let jitter = self.jitter.as_millis() as i64;
        let offset = if jitter > 0 {
            rng.random_range(-jitter..=jitter)
        } else {
            0
        };
        let delay = Duration::from_millis(base.saturating_add(offset).max(0) as u64);
        delay.max(self.min_delay)
    }
}

/// Evicts stale rows from `email_list_cache`
#[derive(Debug, Clone)]
pub struct CacheSweeper {
    storage: StorageHandle,
    schedule: SweepSchedule,
}

impl CacheSweeper {
    #[must_use]
    pub fn new(storage: StorageHandle, schedule: SweepSchedule) -> Self {
        Self { storage, schedule }
    }

    /// Delete up to `max_delete` rows with `expires_at < now_sec - grace_sec`
    pub async fn sweep(
        &self,
        now_sec: i64,
        grace_sec: u64,
        max_delete: u32,
    ) -> Result<SweepReport> {
        let grace = i64::try_from(grace_sec).unwrap_or(i64::MAX);
        let threshold = now_sec.saturating_sub(grace);
        let counts = self.storage.sweep_list_cache(threshold, max_delete).await?;

        debug!(
            table = "email_list_cache",
            expired = counts.expired,
            deleted = counts.deleted,
            threshold,
            grace_sec,
            max_delete,
            "cache sweep"
        );

        Ok(SweepReport {
            expired: counts.expired,
            deleted: counts.deleted,
            threshold,
        })
    }

    /// One sweep with the configured grace and cap
    pub async fn run_once(&self, now_sec: i64) -> Result<SweepReport> {
        self.sweep(now_sec, self.schedule.grace.as_secs(), self.schedule.max_delete)
            .await
    }
}

/// Cumulative counters for the background sweeper
#[derive(Debug, Default)]
pub struct SweeperStats {
    runs: AtomicU64,
    deleted: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of `SweeperStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperSnapshot {
    pub runs: u64,
    pub deleted: u64,
    pub failures: u64,
}

impl SweeperStats {
    #[must_use]
    pub fn snapshot(&self) -> SweeperSnapshot {
        SweeperSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<SweepReport>) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(report) => {
                self.deleted.fetch_add(report.deleted, Ordering::Relaxed);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug)]
pub struct CacheSweeperHandle {
    task: JoinHandle<()>,
    shutdown: ShutdownSignal,
    stats: Arc<SweeperStats>,
}

impl CacheSweeperHandle {
    pub fn signal_shutdown(&self) {
        self.shutdown.trigger();
    }

    #[must_use]
    pub fn stats(&self) -> SweeperSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the loop to exit and return the final counters
    pub async fn join(self) -> SweeperSnapshot {
        let _ = self.task.await;
        self.stats.snapshot()
    }
}

/// Run sweeps on a jittered timer until `shutdown` fires
pub fn spawn_cache_sweeper(sweeper: CacheSweeper, shutdown: ShutdownSignal) -> CacheSweeperHandle {
    let stats = Arc::new(SweeperStats::default());
    let loop_stats = Arc::clone(&stats);
    let loop_shutdown = shutdown.clone();

    info!(
        interval_secs = sweeper.schedule.interval.as_secs(),
        jitter_secs = sweeper.schedule.jitter.as_secs(),
        grace_secs = sweeper.schedule.grace.as_secs(),
        max_delete = sweeper.schedule.max_delete,
        "cache sweeper started"
    );

    let task = tokio::spawn(async move {
        loop {
            let delay = sweeper.schedule.next_delay(&mut rand::rng());
            tokio::select! {
                () = loop_shutdown.wait() => {
                    info!("cache sweeper: shutdown signal received");
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let result = sweeper.run_once(now_secs()).await;
            loop_stats.record(&result);
            if let Err(err) = result {
                warn!(error = %err, "cache sweep failed");
            }
        }
    });

    CacheSweeperHandle {
        task,
        shutdown,
        stats,
    }
}
