//! Execution records for dangerous actions awaiting human disposition.
//!
//! An execution is created `pending` by the proposal step, moved to
//! `confirmed` or `canceled` by a guarded transition when the human answers,
//! and finally marked `executed` (or `canceled` with a reason) by the
//! execution layer. Rows are never deleted and double as the audit trail.
//!
//! ```text
//! pending ──confirm──► confirmed ──done──► executed
//!    │                     │
//!    └──cancel──► canceled ◄──expire / fail
//! ```

use serde::{Deserialize, Serialize};

/// Kinds of dangerous actions tracked by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionKind {
    /// Send an email
    SendMail,
    /// Save a mail draft
    SaveDraft,
    /// Create a calendar event
    CreateEvent,
}

impl ExecutionKind {
    /// Stable string identifier, also used as the gate action name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SendMail => "send-mail",
            Self::SaveDraft => "save-draft",
            Self::CreateEvent => "create-event",
        }
    }

    /// All kinds, in declaration order
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::SendMail, Self::SaveDraft, Self::CreateEvent]
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send-mail" => Ok(Self::SendMail),
            "save-draft" => Ok(Self::SaveDraft),
            "create-event" => Ok(Self::CreateEvent),
            other => Err(format!("unknown execution kind: {other}")),
        }
    }
}

/// Lifecycle state of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Proposed, waiting for the human
    Pending,
    /// Human confirmed; authorizes one execution attempt sequence
    Confirmed,
    /// Canceled by the human, by expiry, or after a failed attempt
    Canceled,
    /// Side effect performed
    Executed,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Canceled => "canceled",
            Self::Executed => "executed",
        }
    }

    /// No further transitions are possible
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Executed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "canceled" => Ok(Self::Canceled),
            "executed" => Ok(Self::Executed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Action payload, one fixed field set per kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutionParams {
    SendMail {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cc: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bcc: Option<String>,
        #[serde(default)]
        subject: String,
        #[serde(default)]
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        in_reply_to: Option<String>,
    },
    SaveDraft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default)]
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        draft_id: Option<String>,
    },
    CreateEvent {
        summary: String,
        /// RFC 3339 start
        start: String,
        /// RFC 3339 end
        end: String,
        #[serde(default)]
        attendees: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// Number of body characters kept in the audit digest
const DIGEST_BODY_CHARS: usize = 50;

impl ExecutionParams {
    /// Minimal send-mail payload
    #[must_use]
    pub fn send_mail(
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::SendMail {
            to: to.into(),
            cc: None,
            bcc: None,
            subject: subject.into(),
            body: body.into(),
            thread_id: None,
            in_reply_to: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ExecutionKind {
        match self {
            Self::SendMail { .. } => ExecutionKind::SendMail,
            Self::SaveDraft { .. } => ExecutionKind::SaveDraft,
            Self::CreateEvent { .. } => ExecutionKind::CreateEvent,
        }
    }

    /// Check the per-kind required fields
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::SendMail { to, .. } => {
                if to.trim().is_empty() {
                    return Err("send-mail requires a recipient".to_string());
                }
                if !to.contains('@') {
                    return Err(format!("send-mail recipient is not an address: {to}"));
                }
            }
            Self::SaveDraft { to, .. } => {
                if let Some(to) = to {
                    if !to.trim().is_empty() && !to.contains('@') {
                        return Err(format!("save-draft recipient is not an address: {to}"));
                    }
                }
            }
            Self::CreateEvent {
                summary,
                start,
                end,
                ..
            } => {
                if summary.trim().is_empty() {
                    return Err("create-event requires a summary".to_string());
                }
                if start.trim().is_empty() || end.trim().is_empty() {
                    return Err("create-event requires start and end".to_string());
                }
            }
        }
        Ok(())
    }

    /// Short audit summary written at confirmation time
    ///
    /// Only the head of a mail body is kept.
    #[must_use]
    pub fn digest(&self) -> String {
        match self {
            Self::SendMail {
                to, subject, body, ..
            } => format!(
                "to={to}; subject={subject}; body_head={}",
                body_head(body)
            ),
            Self::SaveDraft {
                to, subject, body, ..
            } => format!(
                "to={}; subject={}; body_head={}",
                to.as_deref().unwrap_or(""),
                subject.as_deref().unwrap_or(""),
                body_head(body)
            ),
            Self::CreateEvent {
                summary,
                start,
                end,
                attendees,
                ..
            } => format!(
                "summary={summary}; start={start}; end={end}; attendees={}",
                attendees.len()
            ),
        }
    }
}

fn body_head(body: &str) -> String {
    body.chars().take(DIGEST_BODY_CHARS).collect()
}

/// A persisted execution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub trace_id: String,
    pub kind: ExecutionKind,
    pub user_id: String,
    /// Human-readable action label
    pub action: String,
    pub params: ExecutionParams,
    pub digest: Option<String>,
    /// Confirmation deadline (epoch ms), only meaningful while confirmed
    pub expires_at: Option<i64>,
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    pub channel: Option<String>,
    pub message_ts: Option<String>,
    /// Epoch ms
    pub created_at: i64,
    /// Epoch ms
    pub updated_at: i64,
}

impl ExecutionRecord {
    /// Confirmed and past its deadline
    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.status == ExecutionStatus::Confirmed
            && self.expires_at.is_some_and(|deadline| deadline <= now_ms)
    }
}

/// Input for creating a new pending execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub trace_id: String,
    pub user_id: String,
    pub action: String,
    pub params: ExecutionParams,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub message_ts: Option<String>,
}

impl NewExecution {
    #[must_use]
    pub fn new(
        trace_id: impl Into<String>,
        user_id: impl Into<String>,
        action: impl Into<String>,
        params: ExecutionParams,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            user_id: user_id.into(),
            action: action.into(),
            params,
            channel: None,
            message_ts: None,
        }
    }

    #[must_use]
    pub fn with_location(
        mut self,
        channel: impl Into<String>,
        message_ts: impl Into<String>,
    ) -> Self {
        self.channel = Some(channel.into());
        self.message_ts = Some(message_ts.into());
        self
    }

    #[must_use]
    pub const fn kind(&self) -> ExecutionKind {
        self.params.kind()
    }
}

/// Fields applied by `confirm_if_pending`; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPatch {
    pub channel: Option<String>,
    pub message_ts: Option<String>,
    pub expires_at: Option<i64>,
    pub digest: Option<String>,
}

/// Fields applied by `cancel_if_pending`; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPatch {
    pub reason: Option<String>,
    pub channel: Option<String>,
    pub message_ts: Option<String>,
}

impl CancelPatch {
    #[must_use]
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Unconditional field merge; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub reason: Option<String>,
    pub channel: Option<String>,
    pub message_ts: Option<String>,
    pub expires_at: Option<i64>,
    pub digest: Option<String>,
}
