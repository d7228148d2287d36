//! # sqlx-sqlite-conn-mgr
//!
//! A minimal wrapper around SQLx that enforces pragmatic SQLite connection policies
//! for embedded application databases.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: Main database type with separate read and write connection pools
//! - **[`SqliteDatabaseConfig`]**: Configuration for connection pool settings
//! - **[`LiveConfig`]**: Runtime-tunable settings shared by everything built on a database
//! - **[`WriteGuard`]**: RAII guard ensuring exclusive write access
//! - **[`RetryPolicy`]**: Exponential backoff for busy/locked failures
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Dual pools**: Separate read-only pool (max 6 connections) and write pool (max 1 connection)
//! - **WAL mode**: Write-Ahead Logging, `synchronous=NORMAL` and foreign keys applied on connect
//! - **Exclusive writes**: Single-connection write pool enforces serialized write access
//! - **Concurrent reads**: Multiple readers can query simultaneously via the read pool
//! - **Fail fast, retry outside**: SQLite's busy handler is disabled; contention is retried
//!   by [`RetryPolicy`] with bounded exponential backoff

mod config;
mod database;
mod error;
pub mod maintenance;
mod retry;
mod write_guard;

// Re-export public types
pub use config::{CheckpointThresholds, FlowConfig, LiveConfig, SqliteDatabaseConfig};
pub use database::{SqliteDatabase, remove_database_files};
pub use error::{Error, Result};
pub use maintenance::{CheckpointMode, WalCheckpoint};
pub use retry::{Backoff, RetryPolicy, Transient, sqlite_primary_code};
pub use write_guard::WriteGuard;
