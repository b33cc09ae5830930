//! Execution ledger: the persisted confirmation state machine.
//!
//! Every status change is a single guarded statement on the writer thread.
//! A guard that does not hold surfaces as `LedgerError::NotApplicable` with
//! the status found, or `LedgerError::NotFound` when there is no row.

use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;

use crate::error::{Error, LedgerError, Result, StorageError};
use crate::execution::{
    CancelPatch, ConfirmPatch, ExecutionPatch, ExecutionRecord, NewExecution,
};
use crate::storage::{CasOutcome, StorageHandle, now_ms};

const TRACE_SUFFIX_LEN: usize = 8;

/// Handle over the `executions` table
#[derive(Debug, Clone)]
pub struct ExecutionLedger {
    storage: StorageHandle,
}

impl ExecutionLedger {
    #[must_use]
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// Record a new pending execution
    pub async fn create(&self, execution: NewExecution) -> Result<ExecutionRecord> {
        if execution.trace_id.trim().is_empty() {
            return Err(LedgerError::InvalidParams("trace_id must not be empty".to_string()).into());
        }
        execution
            .params
            .validate()
            .map_err(LedgerError::InvalidParams)?;

        let trace_id = execution.trace_id.clone();
        let record = self
            .storage
            .insert_execution(execution, now_ms())
            .await
            .map_err(|err| match err {
                Error::Storage(StorageError::Constraint(_)) => {
                    LedgerError::DuplicateTraceId(trace_id.clone()).into()
                }
                other => other,
            })?;

        tracing::info!(
            trace_id = %record.trace_id,
            action = %record.kind,
            status = %record.status,
            "execution proposed"
        );
        Ok(record)
    }

    pub async fn get_by_trace_id(&self, trace_id: &str) -> Result<Option<ExecutionRecord>> {
        self.storage.get_execution(trace_id).await
    }

    /// `pending -> confirmed`; of two racing confirms exactly one succeeds
    pub async fn confirm_if_pending(
        &self,
        trace_id: &str,
        patch: ConfirmPatch,
    ) -> Result<ExecutionRecord> {
        let outcome = self
            .storage
            .confirm_if_pending(trace_id, patch, now_ms())
            .await?;
        settle(trace_id, outcome, "execution confirmed")
    }

    /// `pending -> canceled`
    pub async fn cancel_if_pending(
        &self,
        trace_id: &str,
        patch: CancelPatch,
    ) -> Result<ExecutionRecord> {
        let outcome = self
            .storage
            .cancel_if_pending(trace_id, patch, now_ms())
            .await?;
        settle(trace_id, outcome, "execution canceled")
    }

    /// Confirm with an audit digest and a deadline `ttl` from now
    pub async fn confirm_with_ttl(
        &self,
        trace_id: &str,
        channel: Option<String>,
        message_ts: Option<String>,
        ttl: Duration,
    ) -> Result<ExecutionRecord> {
        let record = self
            .get_by_trace_id(trace_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(trace_id.to_string()))?;

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let patch = ConfirmPatch {
            channel,
            message_ts,
            expires_at: Some(now_ms().saturating_add(ttl_ms)),
            digest: Some(record.params.digest()),
        };
        self.confirm_if_pending(trace_id, patch).await
    }

    /// Unconditional merge of non-null fields
    pub async fn update(&self, trace_id: &str, patch: ExecutionPatch) -> Result<ExecutionRecord> {
        self.storage
            .update_execution(trace_id, patch, now_ms())
            .await?
            .ok_or_else(|| LedgerError::NotFound(trace_id.to_string()).into())
    }

    /// `confirmed -> executed`
    pub async fn mark_executed(&self, trace_id: &str) -> Result<ExecutionRecord> {
        let outcome = self
            .storage
            .complete_if_confirmed(trace_id, now_ms())
            .await?;
        settle(trace_id, outcome, "execution completed")
    }

    /// `confirmed -> canceled` after a failed attempt
    pub async fn mark_failed(&self, trace_id: &str, reason: &str) -> Result<ExecutionRecord> {
        let outcome = self
            .storage
            .fail_if_confirmed(trace_id, reason, now_ms())
            .await?;
        settle(trace_id, outcome, "execution failed")
    }

    /// `confirmed -> canceled` with reason `expired`, only once past `expires_at`
    pub async fn expire_if_confirmed(
        &self,
        trace_id: &str,
        now_ms: i64,
    ) -> Result<ExecutionRecord> {
        let outcome = self.storage.expire_if_confirmed(trace_id, now_ms).await?;
        settle(trace_id, outcome, "execution expired")
    }

    pub async fn find_expired_confirmed(&self, now_ms: i64) -> Result<Vec<ExecutionRecord>> {
        self.storage.find_expired_confirmed(now_ms).await
    }

    /// Newest first
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.storage.list_executions(limit).await
    }
}

fn settle(trace_id: &str, outcome: CasOutcome, message: &'static str) -> Result<ExecutionRecord> {
    match outcome {
        CasOutcome::Applied(record) => {
            tracing::info!(
                trace_id = %record.trace_id,
                action = %record.kind,
                status = %record.status,
                reason = record.reason.as_deref(),
                "{message}"
            );
            Ok(record)
        }
        CasOutcome::Missing => Err(LedgerError::NotFound(trace_id.to_string()).into()),
        CasOutcome::Rejected(status) => {
            tracing::debug!(trace_id, %status, "transition not applied");
            Err(LedgerError::NotApplicable {
                trace_id: trace_id.to_string(),
                status,
            }
            .into())
        }
    }
}

/// New trace id: `<prefix>_<base36 epoch ms>_<8 random alphanumerics>`
#[must_use]
pub fn generate_trace_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TRACE_SUFFIX_LEN)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("{prefix}_{}_{suffix}", to_base36(now_ms().max(0) as u64))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionParams, ExecutionStatus};
    use tempfile::TempDir;

    async fn temp_ledger() -> (TempDir, ExecutionLedger) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let storage = StorageHandle::new(path.to_str().unwrap()).await.unwrap();
        (dir, ExecutionLedger::new(storage))
    }

    fn proposal(trace_id: &str) -> NewExecution {
        NewExecution::new(
            trace_id,
            "U1",
            "send-mail",
            ExecutionParams::send_mail("x@example.com", "Hi", "hello"),
        )
    }

    #[test]
    fn trace_ids_have_three_parts() {
        let id = generate_trace_id("exec");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "exec");
        assert_eq!(parts[2].len(), TRACE_SUFFIX_LEN);
        assert_ne!(id, generate_trace_id("exec"));
    }

    #[test]
    fn base36_encodes() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[tokio::test]
    async fn create_starts_pending() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();

        let record = ledger.get_by_trace_id("exec_1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert!(record.expires_at.is_none());
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_bad_params() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();

        let dup = ledger.create(proposal("exec_1")).await.unwrap_err();
        assert!(matches!(
            dup,
            Error::Ledger(LedgerError::DuplicateTraceId(ref id)) if id == "exec_1"
        ));

        let bad = NewExecution::new(
            "exec_2",
            "U1",
            "send-mail",
            ExecutionParams::send_mail("", "Hi", "hello"),
        );
        assert!(matches!(
            ledger.create(bad).await.unwrap_err(),
            Error::Ledger(LedgerError::InvalidParams(_))
        ));
        assert!(ledger.get_by_trace_id("exec_2").await.unwrap().is_none());
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn confirm_then_cancel_is_not_applicable() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();

        ledger
            .confirm_if_pending("exec_1", ConfirmPatch::default())
            .await
            .unwrap();
        let err = ledger
            .cancel_if_pending("exec_1", CancelPatch::with_reason("user"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(LedgerError::NotApplicable {
                status: ExecutionStatus::Confirmed,
                ..
            })
        ));

        let record = ledger.get_by_trace_id("exec_1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Confirmed);
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_then_confirm_is_not_applicable() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();

        let canceled = ledger
            .cancel_if_pending("exec_1", CancelPatch::with_reason("user"))
            .await
            .unwrap();
        assert_eq!(canceled.reason.as_deref(), Some("user"));

        let err = ledger
            .confirm_if_pending("exec_1", ConfirmPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(LedgerError::NotApplicable {
                status: ExecutionStatus::Canceled,
                ..
            })
        ));
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_trace_id_is_not_found() {
        let (_dir, ledger) = temp_ledger().await;
        let err = ledger
            .confirm_if_pending("nope", ConfirmPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::NotFound(_))));

        let err = ledger
            .update("nope", ExecutionPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::NotFound(_))));
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn confirm_with_ttl_writes_digest_and_deadline() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();

        let before = now_ms();
        let record = ledger
            .confirm_with_ttl(
                "exec_1",
                Some("C1".to_string()),
                Some("1.2".to_string()),
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Confirmed);
        assert_eq!(
            record.digest.as_deref(),
            Some("to=x@example.com; subject=Hi; body_head=hello")
        );
        let deadline = record.expires_at.unwrap();
        assert!(deadline >= before + 600_000);
        assert_eq!(record.channel.as_deref(), Some("C1"));
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn completion_only_from_confirmed() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();

        let err = ledger.mark_executed("exec_1").await.unwrap_err();
        assert!(err.is_recoverable());

        ledger
            .confirm_if_pending("exec_1", ConfirmPatch::default())
            .await
            .unwrap();
        let done = ledger.mark_executed("exec_1").await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Executed);

        let late = ledger.mark_failed("exec_1", "smtp 550").await.unwrap_err();
        assert!(matches!(
            late,
            Error::Ledger(LedgerError::NotApplicable {
                status: ExecutionStatus::Executed,
                ..
            })
        ));
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn expiry_never_touches_executed_rows() {
        let (_dir, ledger) = temp_ledger().await;
        ledger.create(proposal("exec_1")).await.unwrap();
        ledger
            .confirm_if_pending(
                "exec_1",
                ConfirmPatch {
                    expires_at: Some(10),
                    ..ConfirmPatch::default()
                },
            )
            .await
            .unwrap();
        ledger.mark_executed("exec_1").await.unwrap();

        let err = ledger.expire_if_confirmed("exec_1", 1_000).await.unwrap_err();
        assert!(err.is_recoverable());
        let record = ledger.get_by_trace_id("exec_1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Executed);
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let (_dir, ledger) = temp_ledger().await;
        for id in ["a", "b", "c"] {
            ledger.create(proposal(id)).await.unwrap();
        }
        let recent = ledger.list_recent(2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        ledger.storage().shutdown().await.unwrap();
    }
}
