//! Expiry watcher: auto-cancels confirmations that were never executed.
//!
//! ```text
//! interval ──► tick(now)
//!               ├── find_expired_confirmed(now)
//!               └── for each: expire_if_confirmed ──applied──► notifier + log
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, LedgerError, Result};
use crate::ledger::ExecutionLedger;
use crate::shutdown::ShutdownSignal;
use crate::storage::now_ms;

/// Message for the chat layer after an auto-cancel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryNotice {
    pub trace_id: String,
    pub action: String,
    pub channel: String,
    /// Thread of the original confirmation message
    pub thread_ts: Option<String>,
    pub text: String,
}

/// Sink for expiry notices
pub trait ExpiryNotifier: Send + Sync {
    fn notify(&self, notice: ExpiryNotice) -> Result<()>;
}

/// Forwards notices over a channel to whoever posts chat messages
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ExpiryNotice>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExpiryNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExpiryNotifier for ChannelNotifier {
    fn notify(&self, notice: ExpiryNotice) -> Result<()> {
        self.tx
            .send(notice)
            .map_err(|_| Error::Runtime("expiry notice receiver dropped".to_string()))
    }
}

/// Logs notices only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ExpiryNotifier for LogNotifier {
    fn notify(&self, notice: ExpiryNotice) -> Result<()> {
        info!(
            trace_id = %notice.trace_id,
            channel = %notice.channel,
            thread_ts = notice.thread_ts.as_deref(),
            "{}",
            notice.text
        );
        Ok(())
    }
}

/// Counts from one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    /// Expired confirmed rows found
    pub scanned: usize,
    /// Rows this tick actually moved to canceled
    pub canceled: usize,
    pub notified: usize,
}

/// Periodic auto-cancel of stale confirmations
#[derive(Clone)]
pub struct ExpiryWatcher {
    ledger: ExecutionLedger,
    notifier: Arc<dyn ExpiryNotifier>,
}

impl std::fmt::Debug for ExpiryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryWatcher")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl ExpiryWatcher {
    #[must_use]
    pub fn new(ledger: ExecutionLedger, notifier: Arc<dyn ExpiryNotifier>) -> Self {
        Self { ledger, notifier }
    }

    /// Cancel every confirmed execution whose deadline is at or before `now_ms`
    ///
    /// Only rows this call actually transitions produce a notice, so a
    /// repeated tick over the same data does nothing.
    pub async fn tick(&self, now_ms: i64) -> Result<ExpiryReport> {
        let expired = self.ledger.find_expired_confirmed(now_ms).await?;
        let mut report = ExpiryReport {
            scanned: expired.len(),
            ..ExpiryReport::default()
        };

        for candidate in expired {
            let record = match self
                .ledger
                .expire_if_confirmed(&candidate.trace_id, now_ms)
                .await
            {
                Ok(record) => record,
                Err(Error::Ledger(LedgerError::NotApplicable { status, .. })) => {
                    debug!(trace_id = %candidate.trace_id, %status, "already settled before expiry");
                    continue;
                }
                Err(err) => {
                    warn!(trace_id = %candidate.trace_id, error = %err, "expiry transition failed");
                    continue;
                }
            };
            report.canceled += 1;

            info!(
                trace_id = %record.trace_id,
                action = %record.kind,
                expires_at = record.expires_at,
                "confirmation expired; execution auto-canceled"
            );

            let Some(channel) = record.channel.clone() else {
                continue;
            };
            let notice = ExpiryNotice {
                text: format!(
                    "Auto-canceled: confirmation window expired (trace_id=`{}`)",
                    record.trace_id
                ),
                trace_id: record.trace_id,
                action: record.kind.as_str().to_string(),
                channel,
                thread_ts: record.message_ts,
            };
            match self.notifier.notify(notice) {
                Ok(()) => report.notified += 1,
                Err(err) => warn!(error = %err, "expiry notice not delivered"),
            }
        }

        Ok(report)
    }
}

/// Handle for the background expiry loop
#[derive(Debug)]
pub struct ExpiryWatcherHandle {
    task: JoinHandle<()>,
    shutdown: ShutdownSignal,
}

impl ExpiryWatcherHandle {
    pub fn signal_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for the loop to exit
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Run `tick` every `interval` until `shutdown` fires
///
/// Tick failures are logged and the loop keeps going.
pub fn spawn_expiry_watcher(
    watcher: ExpiryWatcher,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> ExpiryWatcherHandle {
    let loop_shutdown = shutdown.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = loop_shutdown.wait() => {
                    info!("expiry watcher: shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match watcher.tick(now_ms()).await {
                Ok(report) if report.scanned > 0 => {
                    info!(
                        scanned = report.scanned,
                        canceled = report.canceled,
                        notified = report.notified,
                        "expiry sweep"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "expiry sweep failed"),
            }
        }
    });

    ExpiryWatcherHandle { task, shutdown }
}
