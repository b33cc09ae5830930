//! Confirmation gate: the last checkpoint before a dangerous side effect.
//!
//! A dangerous action passes only when the ledger holds a `confirmed` record
//! for its trace id whose deadline has not passed. The gate fails closed:
//! unknown action names count as dangerous and ledger errors propagate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::execution::{ExecutionKind, ExecutionStatus};
use crate::ledger::ExecutionLedger;
use crate::storage::now_ms;

/// Why a dangerous action was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    MissingTraceId,
    NoRecord,
    NotConfirmed { status: ExecutionStatus },
    /// Confirmed, but the confirmation window closed
    Expired { expires_at: i64 },
}

impl DenyReason {
    /// Stable identifier for logs and machine output
    #[must_use]
    pub const fn rule_id(&self) -> &'static str {
        match self {
            Self::MissingTraceId => "gate.missing_trace_id",
            Self::NoRecord => "gate.no_record",
            Self::NotConfirmed { .. } => "gate.not_confirmed",
            Self::Expired { .. } => "gate.expired",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTraceId => write!(f, "no trace id supplied"),
            Self::NoRecord => write!(f, "no execution record"),
            Self::NotConfirmed { status } => write!(f, "execution not confirmed (status={status})"),
            Self::Expired { expires_at } => {
                write!(f, "confirmation expired (expires_at={expires_at})")
            }
        }
    }
}

/// A refused dangerous action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub trace_id: Option<String>,
    pub action: String,
    pub reason: DenyReason,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Denied {} for {}: {}",
            self.action,
            self.trace_id.as_deref().unwrap_or("<none>"),
            self.reason
        )
    }
}

/// Input to `must_allow`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateRequest {
    pub trace_id: Option<String>,
    /// `None` is treated as dangerous
    pub action: Option<String>,
}

impl GateRequest {
    #[must_use]
    pub fn new(trace_id: Option<&str>, action: Option<&str>) -> Self {
        Self {
            trace_id: trace_id.map(str::to_string),
            action: action.map(str::to_string),
        }
    }
}

/// Anything that names the action it would perform
pub trait ToolCall {
    fn action_name(&self) -> Option<&str>;
}

impl ToolCall for String {
    fn action_name(&self) -> Option<&str> {
        Some(self.as_str())
    }
}

impl ToolCall for &str {
    fn action_name(&self) -> Option<&str> {
        Some(*self)
    }
}

/// A call removed from a batch, with the reason
#[derive(Debug, Clone)]
pub struct BlockedCall<T> {
    pub call: T,
    pub reason: String,
}

/// `filter_tool_calls` result; order within each side is preserved
#[derive(Debug, Clone)]
pub struct FilteredCalls<T> {
    pub allowed: Vec<T>,
    pub blocked: Vec<BlockedCall<T>>,
}

/// Enforcement checkpoint over the execution ledger
#[derive(Debug, Clone)]
pub struct ConfirmationGate {
    ledger: ExecutionLedger,
    enforce: bool,
    dangerous: HashSet<String>,
}

impl ConfirmationGate {
    /// Enforcing gate over the default dangerous set
    #[must_use]
    pub fn new(ledger: ExecutionLedger) -> Self {
        Self {
            ledger,
            enforce: true,
            dangerous: ExecutionKind::all()
                .iter()
                .map(|kind| kind.as_str().to_string())
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(ledger: ExecutionLedger, config: &GateConfig) -> Self {
        Self {
            ledger,
            enforce: config.enforce,
            dangerous: config.dangerous_actions.iter().cloned().collect(),
        }
    }

    /// Kill switch; a non-enforcing gate allows everything
    #[must_use]
    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Absent or blank names count as dangerous
    pub fn is_dangerous(&self, action: Option<&str>) -> bool {
        action
            .filter(|name| !name.trim().is_empty())
            .is_none_or(|name| self.dangerous.contains(name))
    }

    /// Allow or deny against the current time
    pub async fn must_allow(&self, request: &GateRequest) -> Result<()> {
        self.must_allow_at(request, now_ms()).await
    }

    /// Allow or deny as of `now_ms`
    pub async fn must_allow_at(&self, request: &GateRequest, now_ms: i64) -> Result<()> {
        if !self.enforce {
            return Ok(());
        }
        let action = request.action.as_deref();
        if !self.is_dangerous(action) {
            return Ok(());
        }

        let deny = |reason: DenyReason| {
            let denial = Denial {
                trace_id: request.trace_id.clone(),
                action: action.unwrap_or("<unknown>").to_string(),
                reason,
            };
            tracing::warn!(
                trace_id = denial.trace_id.as_deref(),
                action = %denial.action,
                rule_id = denial.reason.rule_id(),
                "{denial}"
            );
            Err(Error::Denied(denial))
        };

        let Some(trace_id) = request.trace_id.as_deref().filter(|id| !id.is_empty()) else {
            return deny(DenyReason::MissingTraceId);
        };

        let Some(record) = self.ledger.get_by_trace_id(trace_id).await? else {
            return deny(DenyReason::NoRecord);
        };

        if record.status != ExecutionStatus::Confirmed {
            return deny(DenyReason::NotConfirmed {
                status: record.status,
            });
        }

        if record.is_expired_at(now_ms) {
            return deny(DenyReason::Expired {
                expires_at: record.expires_at.unwrap_or(now_ms),
            });
        }

        tracing::debug!(trace_id, action, "gate allowed");
        Ok(())
    }

    /// Partition a batch into allowed and blocked calls
    ///
    /// Safe calls always pass; each dangerous call goes through `must_allow`
    /// and is blocked on any error.
    pub async fn filter_tool_calls<T: ToolCall>(
        &self,
        calls: Vec<T>,
        trace_id: Option<&str>,
    ) -> FilteredCalls<T> {
        let mut allowed = Vec::with_capacity(calls.len());
        let mut blocked = Vec::new();

        for call in calls {
            if !self.enforce || !self.is_dangerous(call.action_name()) {
                allowed.push(call);
                continue;
            }
            let request = GateRequest::new(trace_id, call.action_name());
            match self.must_allow(&request).await {
                Ok(()) => allowed.push(call),
                Err(err) => {
                    if !matches!(err, Error::Denied(_)) {
                        tracing::warn!(trace_id, error = %err, "gate check failed; blocking call");
                    }
                    blocked.push(BlockedCall {
                        call,
                        reason: err.to_string(),
                    });
                }
            }
        }

        FilteredCalls { allowed, blocked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{CancelPatch, ConfirmPatch, ExecutionParams, NewExecution};
    use crate::storage::StorageHandle;
    use tempfile::TempDir;

    async fn temp_gate() -> (TempDir, ExecutionLedger, ConfirmationGate) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.db");
        let storage = StorageHandle::new(path.to_str().unwrap()).await.unwrap();
        let ledger = ExecutionLedger::new(storage);
        let gate = ConfirmationGate::new(ledger.clone());
        (dir, ledger, gate)
    }

    async fn propose(ledger: &ExecutionLedger, trace_id: &str) {
        ledger
            .create(NewExecution::new(
                trace_id,
                "U1",
                "send-mail",
                ExecutionParams::send_mail("x@example.com", "Hi", "hello"),
            ))
            .await
            .unwrap();
    }

    fn reason_of(result: Result<()>) -> DenyReason {
        match result {
            Err(Error::Denied(denial)) => denial.reason,
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn safe_actions_pass_without_record() {
        let (_dir, ledger, gate) = temp_gate().await;
        gate.must_allow(&GateRequest::new(None, Some("list-mail")))
            .await
            .unwrap();
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_action_counts_as_dangerous() {
        let (_dir, ledger, gate) = temp_gate().await;
        let reason = reason_of(gate.must_allow(&GateRequest::new(None, None)).await);
        assert_eq!(reason, DenyReason::MissingTraceId);
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn blank_action_names_count_as_dangerous() {
        let (_dir, ledger, gate) = temp_gate().await;
        for name in ["", "   "] {
            let reason = reason_of(gate.must_allow(&GateRequest::new(None, Some(name))).await);
            assert_eq!(reason, DenyReason::MissingTraceId);
        }

        let filtered = gate.filter_tool_calls(vec!["", "list-mail"], None).await;
        assert_eq!(filtered.allowed, vec!["list-mail"]);
        assert_eq!(filtered.blocked.len(), 1);
        assert_eq!(filtered.blocked[0].call, "");
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn denies_until_confirmed() {
        let (_dir, ledger, gate) = temp_gate().await;
        let request = GateRequest::new(Some("exec_1"), Some("send-mail"));

        assert_eq!(reason_of(gate.must_allow(&request).await), DenyReason::NoRecord);

        propose(&ledger, "exec_1").await;
        assert_eq!(
            reason_of(gate.must_allow(&request).await),
            DenyReason::NotConfirmed {
                status: ExecutionStatus::Pending
            }
        );

        ledger
            .confirm_if_pending("exec_1", ConfirmPatch::default())
            .await
            .unwrap();
        gate.must_allow(&request).await.unwrap();
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn canceled_record_is_denied() {
        let (_dir, ledger, gate) = temp_gate().await;
        propose(&ledger, "exec_1").await;
        ledger
            .cancel_if_pending("exec_1", CancelPatch::default())
            .await
            .unwrap();

        let request = GateRequest::new(Some("exec_1"), Some("send-mail"));
        assert_eq!(
            reason_of(gate.must_allow(&request).await),
            DenyReason::NotConfirmed {
                status: ExecutionStatus::Canceled
            }
        );
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stale_confirmation_is_denied() {
        let (_dir, ledger, gate) = temp_gate().await;
        propose(&ledger, "exec_1").await;
        ledger
            .confirm_if_pending(
                "exec_1",
                ConfirmPatch {
                    expires_at: Some(5_000),
                    ..ConfirmPatch::default()
                },
            )
            .await
            .unwrap();

        let request = GateRequest::new(Some("exec_1"), Some("send-mail"));
        gate.must_allow_at(&request, 4_999).await.unwrap();
        assert_eq!(
            reason_of(gate.must_allow_at(&request, 5_000).await),
            DenyReason::Expired { expires_at: 5_000 }
        );
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn kill_switch_allows_everything() {
        let (_dir, ledger, gate) = temp_gate().await;
        let gate = gate.with_enforcement(false);
        gate.must_allow(&GateRequest::new(None, Some("send-mail")))
            .await
            .unwrap();
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let (_dir, ledger, gate) = temp_gate().await;
        ledger.storage().shutdown().await.unwrap();

        let err = gate
            .must_allow(&GateRequest::new(Some("exec_1"), Some("send-mail")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let filtered = gate
            .filter_tool_calls(vec!["send-mail", "list-mail"], Some("exec_1"))
            .await;
        assert_eq!(filtered.allowed, vec!["list-mail"]);
        assert_eq!(filtered.blocked.len(), 1);
    }

    #[tokio::test]
    async fn filter_partitions_batch() {
        let (_dir, ledger, gate) = temp_gate().await;
        propose(&ledger, "exec_1").await;

        let calls = vec![
            "list-mail".to_string(),
            "send-mail".to_string(),
            "create-event".to_string(),
        ];
        let filtered = gate.filter_tool_calls(calls, Some("exec_1")).await;
        assert_eq!(filtered.allowed, vec!["list-mail".to_string()]);
        assert_eq!(filtered.blocked.len(), 2);
        assert!(filtered.blocked[0].reason.contains("status=pending"));
        ledger.storage().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn custom_dangerous_set_from_config() {
        let (_dir, ledger, _) = temp_gate().await;
        let config = GateConfig {
            dangerous_actions: vec!["archive-mail".to_string()],
            ..GateConfig::default()
        };
        let gate = ConfirmationGate::from_config(ledger.clone(), &config);
        assert!(gate.is_dangerous(Some("archive-mail")));
        assert!(!gate.is_dangerous(Some("send-mail")));
        assert!(gate.is_dangerous(None));
        ledger.storage().shutdown().await.unwrap();
    }
}
