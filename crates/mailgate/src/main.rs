//! mailgate CLI
//!
//! Operate the execution ledger, the confirmation gate and the list cache.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mailgate_core::cache_key::ListCacheKey;
use mailgate_core::config::{Config, ConfigOverrides, LogFormat};
use mailgate_core::execution::{CancelPatch, ExecutionParams, ExecutionRecord, NewExecution};
use mailgate_core::expiry::{ExpiryWatcher, LogNotifier, spawn_expiry_watcher};
use mailgate_core::gate::{ConfirmationGate, GateRequest};
use mailgate_core::ledger::{ExecutionLedger, generate_trace_id};
use mailgate_core::list_cache::{IndexLookup, ScopedListCache};
use mailgate_core::logging::{LogConfig, LogError, init_logging};
use mailgate_core::shutdown::ShutdownSignal;
use mailgate_core::storage::{StorageHandle, now_ms, now_secs};
use mailgate_core::sweeper::{CacheSweeper, SweepSchedule, spawn_cache_sweeper};

/// Exit code for a gate denial, distinct from general failure
const EXIT_DENIED: i32 = 2;

/// mailgate - confirmation-gated mail actions
#[derive(Parser)]
#[command(name = "mailgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Database path (overrides storage.db_path)
    #[arg(long, global = true, env = "MAILGATE_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the expiry watcher and cache sweeper until interrupted
    Serve,

    /// Record a new pending execution
    Propose {
        /// Requesting user
        #[arg(long)]
        user: String,

        /// Tagged params JSON, e.g. {"type":"send-mail","to":"..","subject":"..","body":".."}
        #[arg(long)]
        params: String,

        /// Explicit trace id (generated when omitted)
        #[arg(long)]
        trace_id: Option<String>,

        /// Chat channel of the confirmation prompt
        #[arg(long)]
        channel: Option<String>,

        /// Message timestamp of the confirmation prompt
        #[arg(long, requires = "channel")]
        message_ts: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Confirm a pending execution
    Confirm {
        trace_id: String,

        #[arg(long)]
        channel: Option<String>,

        #[arg(long)]
        message_ts: Option<String>,

        /// Confirmation window in seconds (defaults to gate.execution_ttl_secs)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Cancel a pending execution
    Cancel {
        trace_id: String,

        #[arg(long, default_value = "user")]
        reason: String,
    },

    /// Mark a confirmed execution as executed
    Complete { trace_id: String },

    /// Cancel a confirmed execution after a failed attempt
    Fail {
        trace_id: String,

        #[arg(long)]
        reason: String,
    },

    /// Ask the gate whether an action may run now
    Check {
        trace_id: String,

        /// Action name, e.g. send-mail
        action: String,
    },

    /// Inspect executions
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },

    /// Auto-cancel confirmations past their window, once
    Expire {
        #[arg(long)]
        json: bool,
    },

    /// Evict expired list cache rows, once
    Sweep {
        /// Grace period in seconds (defaults to cache.sweep_grace_secs)
        #[arg(long)]
        grace_secs: Option<u64>,

        /// Row cap (defaults to cache.max_delete_per_sweep)
        #[arg(long)]
        max_delete: Option<u32>,

        #[arg(long)]
        json: bool,
    },

    /// List cache helpers
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ExecutionCommands {
    /// Most recent executions first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one execution
    Show {
        trace_id: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print the cache key for a list request
    Key {
        #[arg(long)]
        user: String,

        #[arg(long)]
        workspace: Option<String>,

        #[arg(long)]
        mailbox: Option<String>,

        #[arg(long)]
        query: Option<String>,

        #[arg(long, conflicts_with = "page")]
        page_token: Option<String>,

        #[arg(long)]
        page: Option<u32>,
    },

    /// Show the latest cached list for a channel/thread
    Scope {
        #[arg(long)]
        channel: String,

        #[arg(long)]
        thread: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Resolve a numbered follow-up ("#3") against the latest list
    Resolve {
        #[arg(long)]
        channel: String,

        #[arg(long)]
        thread: Option<String>,

        index: u32,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse::<LogFormat>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        let code = handle_fatal_error(&err);
        std::process::exit(code);
    }
}

async fn run() -> anyhow::Result<()> {
    let Cli {
        config,
        log_level,
        log_format,
        db_path,
        command,
    } = Cli::parse();

    let overrides = ConfigOverrides {
        log_level,
        log_format,
        log_file: None,
        db_path,
    };
    let config_path = config.as_deref().map(Path::new);
    let config = Config::load_with_overrides(config_path, config_path.is_some(), &overrides)?;
    init_logging_from_config(&config)?;

    let Some(command) = command else {
        println!("mailgate - confirmation-gated mail actions");
        println!();
        println!("Use --help to see available commands.");
        return Ok(());
    };

    match command {
        Commands::Cache {
            command:
                CacheCommands::Key {
                    user,
                    workspace,
                    mailbox,
                    query,
                    page_token,
                    page,
                },
        } => {
            let mut key = ListCacheKey::new(user);
            if let Some(workspace) = workspace {
                key = key.workspace(workspace);
            }
            if let Some(mailbox) = mailbox {
                key = key.mailbox(mailbox);
            }
            if let Some(query) = query {
                key = key.query(query);
            }
            if let Some(token) = page_token {
                key = key.page_token(token);
            }
            if let Some(page) = page {
                key = key.page(page);
            }
            println!("{}", key.build());
            Ok(())
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        command => {
            let storage = open_storage(&config).await?;
            let result = run_with_storage(command, &config, &storage).await;
            if let Err(err) = storage.shutdown().await {
                tracing::warn!(error = %err, "storage shutdown failed");
            }
            result
        }
    }
}

async fn run_with_storage(
    command: Commands,
    config: &Config,
    storage: &StorageHandle,
) -> anyhow::Result<()> {
    let ledger = ExecutionLedger::new(storage.clone());

    match command {
        Commands::Serve => serve(config, storage, &ledger).await,

        Commands::Propose {
            user,
            params,
            trace_id,
            channel,
            message_ts,
            json,
        } => {
            let params: ExecutionParams = serde_json::from_str(&params)
                .map_err(|e| anyhow::anyhow!("Invalid --params JSON: {e}"))?;
            let trace_id = trace_id.unwrap_or_else(|| generate_trace_id("exec"));
            let action = params.kind().as_str().to_string();
            let mut proposal = NewExecution::new(trace_id, user, action, params);
            if let Some(channel) = channel {
                proposal.channel = Some(channel);
                proposal.message_ts = message_ts;
            }
            let record = ledger.create(proposal).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{}", record.trace_id);
            }
            Ok(())
        }

        Commands::Confirm {
            trace_id,
            channel,
            message_ts,
            ttl_secs,
        } => {
            let ttl = ttl_secs.map_or_else(|| config.gate.execution_ttl(), Duration::from_secs);
            let record = ledger
                .confirm_with_ttl(&trace_id, channel, message_ts, ttl)
                .await?;
            println!(
                "Confirmed {} (expires {})",
                record.trace_id,
                record
                    .expires_at
                    .map_or_else(|| "never".to_string(), format_timestamp_ms)
            );
            Ok(())
        }

        Commands::Cancel { trace_id, reason } => {
            let record = ledger
                .cancel_if_pending(&trace_id, CancelPatch::with_reason(reason))
                .await?;
            println!("Canceled {}", record.trace_id);
            Ok(())
        }

        Commands::Complete { trace_id } => {
            let record = ledger.mark_executed(&trace_id).await?;
            println!("Executed {}", record.trace_id);
            Ok(())
        }

        Commands::Fail { trace_id, reason } => {
            let record = ledger.mark_failed(&trace_id, &reason).await?;
            println!("Canceled {} after failure", record.trace_id);
            Ok(())
        }

        Commands::Check { trace_id, action } => {
            let gate = ConfirmationGate::from_config(ledger, &config.gate);
            gate.must_allow(&GateRequest::new(Some(&trace_id), Some(&action)))
                .await?;
            println!("Allowed {action} for {trace_id}");
            Ok(())
        }

        Commands::Executions {
            command: ExecutionCommands::List { limit, json },
        } => {
            let records = ledger.list_recent(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No executions recorded.");
            } else {
                print_execution_table(&records);
            }
            Ok(())
        }

        Commands::Executions {
            command: ExecutionCommands::Show { trace_id, json },
        } => {
            let record = ledger
                .get_by_trace_id(&trace_id)
                .await?
                .ok_or_else(|| mailgate_core::error::LedgerError::NotFound(trace_id.clone()))
                .map_err(mailgate_core::Error::from)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_execution_detail(&record);
            }
            Ok(())
        }

        Commands::Expire { json } => {
            let watcher = ExpiryWatcher::new(ledger, Arc::new(LogNotifier));
            let report = watcher.tick(now_ms()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Expired {} of {} overdue confirmations",
                    report.canceled, report.scanned
                );
            }
            Ok(())
        }

        Commands::Sweep {
            grace_secs,
            max_delete,
            json,
        } => {
            let sweeper = CacheSweeper::new(storage.clone(), SweepSchedule::from(&config.cache));
            let report = sweeper
                .sweep(
                    now_secs(),
                    grace_secs.unwrap_or(config.cache.sweep_grace_secs),
                    max_delete.unwrap_or(config.cache.max_delete_per_sweep),
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Deleted {} of {} expired cache rows",
                    report.deleted, report.expired
                );
            }
            Ok(())
        }

        Commands::Cache {
            command:
                CacheCommands::Scope {
                    channel,
                    thread,
                    json,
                },
        } => {
            let cache = ScopedListCache::new(storage.clone());
            let Some(record) = cache.get_latest_by_scope(&channel, thread.as_deref()).await else {
                println!("No cached list for {channel}.");
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                let stale = if record.is_expired(now_secs()) {
                    " (stale)"
                } else {
                    ""
                };
                println!("{}{stale}", record.cache_key);
                println!("  created: {}", format_timestamp_secs(record.created_at));
                println!("  expires: {}", format_timestamp_secs(record.expires_at));
                if let Some(thread_ts) = &record.thread_ts {
                    println!("  thread:  {thread_ts}");
                }
            }
            Ok(())
        }

        Commands::Cache {
            command:
                CacheCommands::Resolve {
                    channel,
                    thread,
                    index,
                },
        } => {
            let cache = ScopedListCache::new(storage.clone());
            match cache
                .resolve_index(&channel, thread.as_deref(), index, now_secs())
                .await
            {
                IndexLookup::Found { item, .. } => {
                    println!("#{} {} <{}>", item.index, item.subject, item.from);
                    println!("  message: {}", item.message_id);
                    Ok(())
                }
                IndexLookup::NoList => anyhow::bail!("No cached list for {channel}"),
                IndexLookup::Expired { cache_key } => {
                    anyhow::bail!("Cached list {cache_key} has expired; list again")
                }
                IndexLookup::NotInList { cache_key } => {
                    anyhow::bail!("#{index} is not in cached list {cache_key}")
                }
                IndexLookup::Unreadable { cache_key } => {
                    anyhow::bail!("Cached list {cache_key} could not be decoded")
                }
            }
        }

        Commands::Cache {
            command: CacheCommands::Key { .. },
        }
        | Commands::Config { .. } => Ok(()),
    }
}

async fn serve(
    config: &Config,
    storage: &StorageHandle,
    ledger: &ExecutionLedger,
) -> anyhow::Result<()> {
    let shutdown = ShutdownSignal::new();

    let watcher = ExpiryWatcher::new(ledger.clone(), Arc::new(LogNotifier));
    let expiry = spawn_expiry_watcher(
        watcher,
        config.gate.expiry_check_interval(),
        shutdown.clone(),
    );
    let sweeper = CacheSweeper::new(storage.clone(), SweepSchedule::from(&config.cache));
    let sweeper = spawn_cache_sweeper(sweeper, shutdown.clone());

    tracing::info!(
        db_path = %storage.db_path(),
        enforce = config.gate.enforce,
        "mailgate background tasks running"
    );

    wait_for_shutdown_signal().await?;

    shutdown.trigger();
    expiry.join().await;
    let stats = sweeper.join().await;
    tracing::info!(
        sweeps = stats.runs,
        deleted = stats.deleted,
        failures = stats.failures,
        "mailgate shutdown complete"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    Ok(())
}

async fn open_storage(config: &Config) -> anyhow::Result<StorageHandle> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db_path = db_path.to_string_lossy();
    Ok(StorageHandle::with_queue_size(&db_path, config.storage.writer_queue_size).await?)
}

fn init_logging_from_config(config: &Config) -> anyhow::Result<()> {
    let log_config = LogConfig::from(&config.general);
    match init_logging(&log_config) {
        Ok(()) | Err(LogError::AlreadyInitialized) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn print_execution_table(records: &[ExecutionRecord]) {
    println!(
        "{:<32} {:<13} {:<10} {:<12} {}",
        "TRACE ID", "ACTION", "STATUS", "USER", "UPDATED"
    );
    for record in records {
        println!(
            "{:<32} {:<13} {:<10} {:<12} {}",
            record.trace_id,
            record.kind.as_str(),
            record.status.as_str(),
            record.user_id,
            format_timestamp_ms(record.updated_at)
        );
    }
}

fn print_execution_detail(record: &ExecutionRecord) {
    println!("{}", record.trace_id);
    println!("  action:  {} ({})", record.action, record.kind);
    println!("  status:  {}", record.status);
    println!("  user:    {}", record.user_id);
    if let Some(reason) = &record.reason {
        println!("  reason:  {reason}");
    }
    if let Some(digest) = &record.digest {
        println!("  digest:  {digest}");
    }
    if let Some(expires_at) = record.expires_at {
        println!("  expires: {}", format_timestamp_ms(expires_at));
    }
    if let Some(channel) = &record.channel {
        println!(
            "  channel: {channel} {}",
            record.message_ts.as_deref().unwrap_or("")
        );
    }
    println!("  created: {}", format_timestamp_ms(record.created_at));
    println!("  updated: {}", format_timestamp_ms(record.updated_at));
}

fn format_timestamp_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

fn format_timestamp_secs(secs: i64) -> String {
    format_timestamp_ms(secs.saturating_mul(1000))
}

/// Print the error and return the process exit code
fn handle_fatal_error(err: &anyhow::Error) -> i32 {
    if let Some(core_err) = err.downcast_ref::<mailgate_core::Error>() {
        eprintln!(
            "{}",
            mailgate_core::error::format_error_with_remediation(core_err)
        );
        if core_err.as_denial().is_some() {
            return EXIT_DENIED;
        }
    } else {
        eprintln!("Error: {err}");
    }
    1
}
