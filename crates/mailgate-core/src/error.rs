//! Error types for mailgate-core

use std::fmt::Write;
use thiserror::Error;

use crate::execution::ExecutionStatus;
use crate::gate::Denial;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mailgate-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Execution ledger errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Dangerous action refused by the confirmation gate
    #[error("{0}")]
    Denied(Denial),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, channel failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Caller-recoverable outcomes that are not infrastructure faults
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Ledger(LedgerError::NotFound(_) | LedgerError::NotApplicable { .. })
                | Self::Denied(_)
        )
    }

    /// The gate denial, if this error is one
    #[must_use]
    pub fn as_denial(&self) -> Option<&Denial> {
        match self {
            Self::Denied(denial) => Some(denial),
            _ => None,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Ledger(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Denied(denial) => Some(
                Remediation::new(
                    "Confirm the action before executing it, or propose it again.",
                )
                .command(
                    "Inspect record",
                    format!(
                        "mailgate executions show {}",
                        denial.trace_id.as_deref().unwrap_or("<trace_id>")
                    ),
                )
                .alternative("Set MAILGATE_SAFETY_ENFORCE=0 only for local testing."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Check data dir", "ls -la ~/.local/share/mailgate")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the service or retry the command.")
                    .command("Restart", "mailgate serve")
                    .alternative("If the issue persists, check the log file."),
            ),
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Store closed or writer thread gone
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Check database", "mailgate executions list --limit 1")
            .alternative("Ensure the data directory is writable."),
            Self::MigrationFailed(_) => {
                Remediation::new("Database schema setup failed. Check logs and retry after backup.")
                    .command("Locate database", "ls -l ~/.local/share/mailgate")
                    .alternative("Backup the database file before retrying.")
            }
            Self::Unavailable(_) => Remediation::new(
                "The store is not accepting requests. Restart the process.",
            )
            .command("Restart", "mailgate serve")
            .alternative("Check for another process holding the database lock."),
            Self::Constraint(_) => Remediation::new("A uniqueness or integrity constraint failed.")
                .command("List executions", "mailgate executions list")
                .alternative("Generate a fresh trace id for new proposals."),
            Self::NotFound(_) => Remediation::new("The requested resource was not found.")
                .command("List executions", "mailgate executions list")
                .alternative("Verify the resource exists before accessing it."),
        }
    }
}

/// Execution ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    /// A guarded transition found the record in a different state
    #[error("Execution {trace_id} already processed (status={status})")]
    NotApplicable {
        trace_id: String,
        status: ExecutionStatus,
    },

    #[error("Execution already exists: {0}")]
    DuplicateTraceId(String),

    #[error("Invalid execution params: {0}")]
    InvalidParams(String),
}

impl LedgerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound(trace_id) => {
                Remediation::new(format!("No execution recorded for {trace_id}."))
                    .command("List executions", "mailgate executions list")
                    .alternative("Check the trace id attached to the confirmation message.")
            }
            Self::NotApplicable { trace_id, .. } => Remediation::new(
                "The execution was already handled; no further action is needed.",
            )
            .command("Inspect record", format!("mailgate executions show {trace_id}")),
            Self::DuplicateTraceId(trace_id) => {
                Remediation::new(format!("Trace id {trace_id} is already in use."))
                    .command("Inspect record", format!("mailgate executions show {trace_id}"))
                    .alternative("Generate a fresh trace id for each proposal.")
            }
            Self::InvalidParams(_) => {
                Remediation::new("Fix the action parameters and propose the action again.")
                    .command("List executions", "mailgate executions list")
                    .alternative("send-mail needs a recipient; create-event needs summary, start and end.")
            }
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show config", "cat mailgate.toml")
                .alternative("Validate the TOML syntax."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show config", "cat mailgate.toml")
                    .alternative("Review validation errors and adjust mailgate.toml or MAILGATE_* env vars.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
