//! Storage layer with SQLite
//!
//! Persists execution records and cached list results.
//!
//! # Schema Design
//!
//! The database uses WAL mode for concurrent reads and single-writer semantics.
//! Every write goes through one dedicated writer thread fed by a bounded
//! channel; reads open short-lived connections on the blocking pool.
//!
//! # Tables
//!
//! - `executions`: Dangerous-action ledger (epoch ms timestamps, never deleted)
//! - `email_list_cache`: Cached list results keyed by cache key (epoch seconds)

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, StorageError};
use crate::execution::{
    CancelPatch, ConfirmPatch, ExecutionPatch, ExecutionRecord, ExecutionStatus, NewExecution,
};
use crate::list_cache::ListCacheRecord;

/// Current schema version for migration tracking
pub const SCHEMA_VERSION: i32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema initialization SQL
pub const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL,  -- epoch ms
    description TEXT
);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    params TEXT NOT NULL,         -- JSON, tagged by type
    digest TEXT,
    expires_at INTEGER,           -- epoch ms, set on confirm
    status TEXT NOT NULL CHECK (status IN ('pending', 'confirmed', 'canceled', 'executed')),
    reason TEXT,
    channel TEXT,
    message_ts TEXT,
    created_at INTEGER NOT NULL,  -- epoch ms
    updated_at INTEGER NOT NULL   -- epoch ms
);

CREATE INDEX IF NOT EXISTS idx_executions_trace ON executions(trace_id);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

CREATE TABLE IF NOT EXISTS email_list_cache (
    cache_key TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,  -- epoch s
    expires_at INTEGER NOT NULL,  -- epoch s
    items_json TEXT NOT NULL,
    channel TEXT,
    thread_ts TEXT
);

CREATE INDEX IF NOT EXISTS idx_list_cache_expires ON email_list_cache(expires_at);
CREATE INDEX IF NOT EXISTS idx_list_cache_scope ON email_list_cache(channel, thread_ts, created_at);
";

/// Initialize the database schema
///
/// Safe to call on an existing database.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::MigrationFailed(format!("Schema init failed: {e}")))?;

    if get_schema_version(conn)?.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            params![SCHEMA_VERSION, now_ms(), "Initial schema"],
        )
        .map_err(|e| StorageError::MigrationFailed(format!("Version insert failed: {e}")))?;
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| StorageError::Database(e.to_string()).into())
}

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current time in epoch seconds
pub fn now_secs() -> i64 {
    now_ms() / 1000
}

// =============================================================================
// Writer Command Types
// =============================================================================

/// Result of a guarded status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Guard held; carries the updated record
    Applied(ExecutionRecord),
    /// No row for the trace id
    Missing,
    /// Row exists but the guard did not hold
    Rejected(ExecutionStatus),
}

/// Rows counted and removed by one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCounts {
    pub expired: u64,
    pub deleted: u64,
}

/// Guarded transitions executed on the writer thread
#[derive(Debug)]
enum Transition {
    Confirm(ConfirmPatch),
    Cancel(CancelPatch),
    /// `confirmed -> executed`
    Complete,
    /// `confirmed -> canceled` with a reason
    Fail(String),
    /// `confirmed -> canceled` with reason `expired`, only past the deadline
    Expire,
}

enum WriteCommand {
    InsertExecution {
        execution: NewExecution,
        now: i64,
        respond: oneshot::Sender<Result<ExecutionRecord>>,
    },
    Transition {
        trace_id: String,
        transition: Transition,
        now: i64,
        respond: oneshot::Sender<Result<CasOutcome>>,
    },
    UpdateExecution {
        trace_id: String,
        patch: ExecutionPatch,
        now: i64,
        respond: oneshot::Sender<Result<Option<ExecutionRecord>>>,
    },
    UpsertListCache {
        record: ListCacheRecord,
        respond: oneshot::Sender<Result<()>>,
    },
    SweepListCache {
        threshold: i64,
        max_delete: u32,
        respond: oneshot::Sender<Result<SweepCounts>>,
    },
    /// Stop the writer thread after acknowledging
    Shutdown { respond: oneshot::Sender<()> },
}

// =============================================================================
// Storage Handle
// =============================================================================

/// Async-safe storage handle
///
/// Cloning is cheap; all clones share the writer thread. After `shutdown`
/// every operation fails with `StorageError::Unavailable`.
#[derive(Clone)]
pub struct StorageHandle {
    write_tx: mpsc::Sender<WriteCommand>,
    db_path: Arc<String>,
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("db_path", &self.db_path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl StorageHandle {
    /// Open or create the database at `db_path` with the default queue size
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_queue_size(db_path, 1024).await
    }

    /// Open or create the database, initialize the schema, start the writer thread
    pub async fn with_queue_size(db_path: &str, write_queue_size: usize) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!("Failed to create directory: {e}"))
                })?;
            }
        }

        let db_path_owned = db_path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = open_connection(&db_path_owned)?;
            initialize_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {e}")))??;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(write_queue_size.max(1));

        let writer_handle = thread::Builder::new()
            .name("mailgate-writer".to_string())
            .spawn(move || writer_loop(&conn, &mut write_rx))
            .map_err(|e| StorageError::Database(format!("Failed to spawn writer thread: {e}")))?;

        tracing::debug!(db_path, "storage opened");

        Ok(Self {
            write_tx,
            db_path: Arc::new(db_path.to_string()),
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StorageError::Unavailable("storage has been shut down".to_string()).into());
        }
        Ok(())
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteCommand,
    ) -> Result<T> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(build(tx))
            .await
            .map_err(|_| StorageError::Unavailable("writer thread stopped".to_string()))?;
        rx.await
            .map_err(|_| StorageError::Unavailable("writer dropped response".to_string()))?
    }

    async fn read<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        let db_path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(db_path.as_str())?;
            query(&conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {e}")))?
    }

    // -- executions: writes ---------------------------------------------------

    /// Insert a new pending execution
    pub async fn insert_execution(
        &self,
        execution: NewExecution,
        now: i64,
    ) -> Result<ExecutionRecord> {
        self.send(|respond| WriteCommand::InsertExecution {
            execution,
            now,
            respond,
        })
        .await
    }

    /// `pending -> confirmed`, merging non-null patch fields
    pub async fn confirm_if_pending(
        &self,
        trace_id: &str,
        patch: ConfirmPatch,
        now: i64,
    ) -> Result<CasOutcome> {
        self.transition(trace_id, Transition::Confirm(patch), now).await
    }

    /// `pending -> canceled`, merging non-null patch fields
    pub async fn cancel_if_pending(
        &self,
        trace_id: &str,
        patch: CancelPatch,
        now: i64,
    ) -> Result<CasOutcome> {
        self.transition(trace_id, Transition::Cancel(patch), now).await
    }

    /// `confirmed -> executed`
    pub async fn complete_if_confirmed(&self, trace_id: &str, now: i64) -> Result<CasOutcome> {
        self.transition(trace_id, Transition::Complete, now).await
    }

    /// `confirmed -> canceled` with the given reason
    pub async fn fail_if_confirmed(
        &self,
        trace_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<CasOutcome> {
        self.transition(trace_id, Transition::Fail(reason.to_string()), now)
            .await
    }

    /// `confirmed -> canceled` with reason `expired` when `expires_at <= now`
    pub async fn expire_if_confirmed(&self, trace_id: &str, now: i64) -> Result<CasOutcome> {
        self.transition(trace_id, Transition::Expire, now).await
    }

    async fn transition(
        &self,
        trace_id: &str,
        transition: Transition,
        now: i64,
    ) -> Result<CasOutcome> {
        let trace_id = trace_id.to_string();
        self.send(|respond| WriteCommand::Transition {
            trace_id,
            transition,
            now,
            respond,
        })
        .await
    }

    /// Unconditional merge; `None` when the row does not exist
    pub async fn update_execution(
        &self,
        trace_id: &str,
        patch: ExecutionPatch,
        now: i64,
    ) -> Result<Option<ExecutionRecord>> {
        let trace_id = trace_id.to_string();
        self.send(|respond| WriteCommand::UpdateExecution {
            trace_id,
            patch,
            now,
            respond,
        })
        .await
    }

    // -- executions: reads ----------------------------------------------------

    pub async fn get_execution(&self, trace_id: &str) -> Result<Option<ExecutionRecord>> {
        let trace_id = trace_id.to_string();
        self.read(move |conn| query_execution(conn, &trace_id)).await
    }

    /// Confirmed rows whose deadline is at or before `now`
    pub async fn find_expired_confirmed(&self, now: i64) -> Result<Vec<ExecutionRecord>> {
        self.read(move |conn| query_expired_confirmed(conn, now))
            .await
    }

    /// Newest executions first
    pub async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.read(move |conn| query_recent_executions(conn, limit))
            .await
    }

    // -- list cache -----------------------------------------------------------

    /// Insert or refresh a cached list; a null channel/thread keeps the stored one
    pub async fn upsert_list_cache(&self, record: ListCacheRecord) -> Result<()> {
        self.send(|respond| WriteCommand::UpsertListCache { record, respond })
            .await
    }

    pub async fn get_list_cache(&self, cache_key: &str) -> Result<Option<ListCacheRecord>> {
        let cache_key = cache_key.to_string();
        self.read(move |conn| query_list_cache(conn, &cache_key))
            .await
    }

    /// Newest row for (channel, thread), else newest row for the channel
    pub async fn latest_list_cache(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> Result<Option<ListCacheRecord>> {
        let channel = channel.to_string();
        let thread_ts = thread_ts.map(str::to_string);
        self.read(move |conn| query_latest_list_cache(conn, &channel, thread_ts.as_deref()))
            .await
    }

    /// Delete up to `max_delete` rows with `expires_at < threshold`
    pub async fn sweep_list_cache(&self, threshold: i64, max_delete: u32) -> Result<SweepCounts> {
        self.send(|respond| WriteCommand::SweepListCache {
            threshold,
            max_delete,
            respond,
        })
        .await
    }

    /// Stop accepting work and wait for the writer thread to exit
    ///
    /// Queued writes ahead of the shutdown command still complete. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let _ = self
            .write_tx
            .send(WriteCommand::Shutdown { respond: tx })
            .await;
        let _ = rx.await;

        let handle = self
            .writer_handle
            .lock()
            .map_err(|_| StorageError::Database("Writer handle lock poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| StorageError::Database("Writer thread panicked".to_string()))?;
        }

        tracing::debug!(db_path = %self.db_path, "storage shut down");
        Ok(())
    }
}

fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| StorageError::Database(format!("Failed to open database: {e}")))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| StorageError::Database(format!("Failed to set busy timeout: {e}")))?;
    Ok(conn)
}

// =============================================================================
// Writer Thread Implementation
// =============================================================================

fn writer_loop(conn: &Connection, rx: &mut mpsc::Receiver<WriteCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriteCommand::InsertExecution {
                execution,
                now,
                respond,
            } => {
                let _ = respond.send(insert_execution_sync(conn, &execution, now));
            }
            WriteCommand::Transition {
                trace_id,
                transition,
                now,
                respond,
            } => {
                let _ = respond.send(transition_sync(conn, &trace_id, &transition, now));
            }
            WriteCommand::UpdateExecution {
                trace_id,
                patch,
                now,
                respond,
            } => {
                let _ = respond.send(update_execution_sync(conn, &trace_id, &patch, now));
            }
            WriteCommand::UpsertListCache { record, respond } => {
                let _ = respond.send(upsert_list_cache_sync(conn, &record));
            }
            WriteCommand::SweepListCache {
                threshold,
                max_delete,
                respond,
            } => {
                let _ = respond.send(sweep_list_cache_sync(conn, threshold, max_delete));
            }
            WriteCommand::Shutdown { respond } => {
                let _ = respond.send(());
                break;
            }
        }
    }
}

// =============================================================================
// Synchronous Database Operations
// =============================================================================

fn insert_execution_sync(
    conn: &Connection,
    execution: &NewExecution,
    now: i64,
) -> Result<ExecutionRecord> {
    let params_json = serde_json::to_string(&execution.params)?;

    conn.execute(
        "INSERT INTO executions (trace_id, type, user_id, action, params, status,
         channel, message_ts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
        params![
            execution.trace_id,
            execution.kind().as_str(),
            execution.user_id,
            execution.action,
            params_json,
            execution.channel,
            execution.message_ts,
            now,
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            StorageError::Constraint(format!("trace_id {}: {e}", execution.trace_id))
        } else {
            StorageError::Database(format!("Failed to insert execution: {e}"))
        }
    })?;

    query_execution(conn, &execution.trace_id)?.ok_or_else(|| {
        StorageError::NotFound(format!("execution {} after insert", execution.trace_id)).into()
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn transition_sync(
    conn: &Connection,
    trace_id: &str,
    transition: &Transition,
    now: i64,
) -> Result<CasOutcome> {
    let changed = match transition {
        Transition::Confirm(patch) => conn.execute(
            "UPDATE executions SET
                status = 'confirmed',
                channel = COALESCE(?2, channel),
                message_ts = COALESCE(?3, message_ts),
                expires_at = COALESCE(?4, expires_at),
                digest = COALESCE(?5, digest),
                updated_at = ?6
             WHERE trace_id = ?1 AND status = 'pending'",
            params![
                trace_id,
                patch.channel,
                patch.message_ts,
                patch.expires_at,
                patch.digest,
                now
            ],
        ),
        Transition::Cancel(patch) => conn.execute(
            "UPDATE executions SET
                status = 'canceled',
                reason = COALESCE(?2, reason),
                channel = COALESCE(?3, channel),
                message_ts = COALESCE(?4, message_ts),
                updated_at = ?5
             WHERE trace_id = ?1 AND status = 'pending'",
            params![trace_id, patch.reason, patch.channel, patch.message_ts, now],
        ),
        Transition::Complete => conn.execute(
            "UPDATE executions SET status = 'executed', updated_at = ?2
             WHERE trace_id = ?1 AND status = 'confirmed'",
            params![trace_id, now],
        ),
        Transition::Fail(reason) => conn.execute(
            "UPDATE executions SET status = 'canceled', reason = ?2, updated_at = ?3
             WHERE trace_id = ?1 AND status = 'confirmed'",
            params![trace_id, reason, now],
        ),
        Transition::Expire => conn.execute(
            "UPDATE executions SET status = 'canceled', reason = 'expired', updated_at = ?2
             WHERE trace_id = ?1 AND status = 'confirmed'
               AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![trace_id, now],
        ),
    }
    .map_err(|e| StorageError::Database(format!("Failed to update execution: {e}")))?;

    // Same connection and thread as the update, so this read sees its result
    let current = query_execution(conn, trace_id)?;
    Ok(match (changed, current) {
        (0, None) => CasOutcome::Missing,
        (0, Some(record)) => CasOutcome::Rejected(record.status),
        (_, Some(record)) => CasOutcome::Applied(record),
        (_, None) => CasOutcome::Missing,
    })
}

fn update_execution_sync(
    conn: &Connection,
    trace_id: &str,
    patch: &ExecutionPatch,
    now: i64,
) -> Result<Option<ExecutionRecord>> {
    let changed = conn
        .execute(
            "UPDATE executions SET
                status = COALESCE(?2, status),
                reason = COALESCE(?3, reason),
                channel = COALESCE(?4, channel),
                message_ts = COALESCE(?5, message_ts),
                expires_at = COALESCE(?6, expires_at),
                digest = COALESCE(?7, digest),
                updated_at = ?8
             WHERE trace_id = ?1",
            params![
                trace_id,
                patch.status.map(|s| s.as_str()),
                patch.reason,
                patch.channel,
                patch.message_ts,
                patch.expires_at,
                patch.digest,
                now
            ],
        )
        .map_err(|e| StorageError::Database(format!("Failed to update execution: {e}")))?;

    if changed == 0 {
        return Ok(None);
    }
    query_execution(conn, trace_id)
}

fn upsert_list_cache_sync(conn: &Connection, record: &ListCacheRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO email_list_cache (cache_key, created_at, expires_at, items_json, channel, thread_ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(cache_key) DO UPDATE SET
            expires_at = excluded.expires_at,
            items_json = excluded.items_json,
            channel = COALESCE(excluded.channel, email_list_cache.channel),
            thread_ts = COALESCE(excluded.thread_ts, email_list_cache.thread_ts)",
        params![
            record.cache_key,
            record.created_at,
            record.expires_at,
            record.items_json,
            record.channel,
            record.thread_ts,
        ],
    )
    .map_err(|e| StorageError::Database(format!("Failed to upsert list cache: {e}")))?;

    Ok(())
}

fn sweep_list_cache_sync(
    conn: &Connection,
    threshold: i64,
    max_delete: u32,
) -> Result<SweepCounts> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StorageError::Database(format!("Failed to begin sweep: {e}")))?;

    let expired: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM email_list_cache WHERE expires_at < ?1",
            [threshold],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Database(format!("Failed to count expired rows: {e}")))?;

    let deleted = if expired > 0 && max_delete > 0 {
        tx.execute(
            "DELETE FROM email_list_cache WHERE rowid IN (
                SELECT rowid FROM email_list_cache WHERE expires_at < ?1
                ORDER BY expires_at ASC LIMIT ?2
             )",
            params![threshold, i64::from(max_delete)],
        )
        .map_err(|e| StorageError::Database(format!("Failed to delete expired rows: {e}")))?
    } else {
        0
    };

    tx.commit()
        .map_err(|e| StorageError::Database(format!("Failed to commit sweep: {e}")))?;

    Ok(SweepCounts {
        expired: expired as u64,
        deleted: deleted as u64,
    })
}

// =============================================================================
// Read Queries
// =============================================================================

const EXECUTION_COLUMNS: &str = "trace_id, type, user_id, action, params, digest, expires_at,
    status, reason, channel, message_ts, created_at, updated_at";

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidColumn(String);

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let kind: String = row.get(1)?;
    let params_json: String = row.get(4)?;
    let status: String = row.get(7)?;

    Ok(ExecutionRecord {
        trace_id: row.get(0)?,
        kind: kind
            .parse()
            .map_err(|e: String| conversion_error(1, InvalidColumn(e)))?,
        user_id: row.get(2)?,
        action: row.get(3)?,
        params: serde_json::from_str(&params_json).map_err(|e| conversion_error(4, e))?,
        digest: row.get(5)?,
        expires_at: row.get(6)?,
        status: status
            .parse()
            .map_err(|e: String| conversion_error(7, InvalidColumn(e)))?,
        reason: row.get(8)?,
        channel: row.get(9)?,
        message_ts: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn query_execution(conn: &Connection, trace_id: &str) -> Result<Option<ExecutionRecord>> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE trace_id = ?1"),
        [trace_id],
        execution_from_row,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Query failed: {e}")).into())
}

fn collect_executions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| StorageError::Database(format!("Failed to prepare query: {e}")))?;
    let rows = stmt
        .query_map(params, execution_from_row)
        .map_err(|e| StorageError::Database(format!("Query failed: {e}")))?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(|e| StorageError::Database(format!("Row error: {e}")))?);
    }
    Ok(records)
}

fn query_expired_confirmed(conn: &Connection, now: i64) -> Result<Vec<ExecutionRecord>> {
    collect_executions(
        conn,
        &format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE status = 'confirmed' AND expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at ASC"
        ),
        [now],
    )
}

fn query_recent_executions(conn: &Connection, limit: usize) -> Result<Vec<ExecutionRecord>> {
    collect_executions(
        conn,
        &format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             ORDER BY created_at DESC, id DESC LIMIT ?1"
        ),
        [limit as i64],
    )
}

fn list_cache_from_row(row: &Row<'_>) -> rusqlite::Result<ListCacheRecord> {
    Ok(ListCacheRecord {
        cache_key: row.get(0)?,
        created_at: row.get(1)?,
        expires_at: row.get(2)?,
        items_json: row.get(3)?,
        channel: row.get(4)?,
        thread_ts: row.get(5)?,
    })
}

const LIST_CACHE_COLUMNS: &str = "cache_key, created_at, expires_at, items_json, channel, thread_ts";

fn query_list_cache(conn: &Connection, cache_key: &str) -> Result<Option<ListCacheRecord>> {
    conn.query_row(
        &format!("SELECT {LIST_CACHE_COLUMNS} FROM email_list_cache WHERE cache_key = ?1"),
        [cache_key],
        list_cache_from_row,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Query failed: {e}")).into())
}

fn query_latest_list_cache(
    conn: &Connection,
    channel: &str,
    thread_ts: Option<&str>,
) -> Result<Option<ListCacheRecord>> {
    if let Some(thread_ts) = thread_ts {
        let exact = conn
            .query_row(
                &format!(
                    "SELECT {LIST_CACHE_COLUMNS} FROM email_list_cache
                     WHERE channel = ?1 AND thread_ts = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![channel, thread_ts],
                list_cache_from_row,
            )
            .optional()
            .map_err(|e| StorageError::Database(format!("Query failed: {e}")))?;
        if exact.is_some() {
            return Ok(exact);
        }
    }

    conn.query_row(
        &format!(
            "SELECT {LIST_CACHE_COLUMNS} FROM email_list_cache
             WHERE channel = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ),
        [channel],
        list_cache_from_row,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("Query failed: {e}")).into())
}
