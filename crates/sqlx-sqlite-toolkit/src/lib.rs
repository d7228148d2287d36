//! # sqlx-sqlite-toolkit
//!
//! Write serialization, WAL checkpoint scheduling and reactive queries for SQLite
//! databases opened with `sqlx-sqlite-conn-mgr` and observed with `sqlx-sqlite-observer`.
//!
//! ## Core Types
//!
//! - **[`WriteSerializer`]**: single-consumer write queue; every task runs in its own
//!   `BEGIN IMMEDIATE` transaction, retried on busy errors, with grouping
//!   ([`submit_all`](WriteSerializer::submit_all)) and coalescing
//!   ([`coalesce`](WriteSerializer::coalesce)) of related writes
//! - **[`CheckpointScheduler`]**: background loop folding the WAL back into the database
//!   once it is idle, old and large enough
//! - **[`reactive_query`]**: re-runs a read whenever the tables it depends on change
//! - **[`PageSource`]**: offset-paged reads that report when their tables change
//! - **[`FlowMetrics`]**: counters shared by the write path and the checkpoint loop
//!
//! Schema migrations ([`migration`]), partial updates ([`UpdateBuilder`]) and maintenance
//! operations are all executed through the write queue.

mod checkpoint;
mod error;
mod maintenance;
mod metrics;
pub mod migration;
pub mod paging;
mod reactive;
mod serializer;
mod statement;
mod update;

pub use checkpoint::{CheckpointScheduler, CheckpointState, WalCheckpointer};
pub use error::{Error, Result};
pub use metrics::{FlowMetrics, MetricsSnapshot, RECENT_SQL_CAPACITY};
pub use paging::{Page, PageSource};
pub use reactive::{ReactiveQuery, reactive_query};
pub use serializer::{
   CoalescedTask, CommitListener, DEFAULT_GROUP_KEY, WriteHandle, WriteSerializer,
};
pub use statement::{Statement, WriteQueryResult, bind_value, validate_identifier};
pub use update::UpdateBuilder;
