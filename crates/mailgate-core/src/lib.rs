//! mailgate-core: Core library for mailgate
//!
//! Confirmation-gated execution of side-effecting mail and calendar actions,
//! plus a scoped cache of listed emails so chat users can say "reply to #3".
//!
//! # Architecture
//!
//! ```text
//! agent tool calls ─► ConfirmationGate ─► ExecutionLedger ─► Storage (SQLite/WAL)
//!                                               ▲                  ▲
//!                          ExpiryWatcher ───────┘                  │
//! list results ─► ListCacheKey ─► ScopedListCache ─────────────────┤
//!                                               CacheSweeper ──────┘
//! ```
//!
//! # Modules
//!
//! - `execution`: execution records, params and status
//! - `ledger`: durable state machine with compare-and-set transitions
//! - `gate`: "must be confirmed" check and tool-call filtering
//! - `expiry`: background auto-cancel of stale confirmations
//! - `cache_key`: deterministic list-cache keys
//! - `list_cache`: scoped, fail-soft list cache
//! - `sweeper`: background eviction of expired cache rows
//! - `token`: single-flight access token cache
//! - `storage`: SQLite storage with a single writer thread
//! - `config`: Configuration management
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod cache_key;
pub mod config;
pub mod error;
pub mod execution;
pub mod expiry;
pub mod gate;
pub mod ledger;
pub mod list_cache;
pub mod logging;
pub mod shutdown;
pub mod storage;
pub mod sweeper;
pub mod token;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
