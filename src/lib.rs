//! # sqlite-flow
//!
//! Embedded SQLite stores with a single serialized write path, background WAL
//! checkpointing and reactive change notifications.
//!
//! A [`FlowStore`] bundles one database with its write queue
//! ([`WriteSerializer`]), invalidation bus and [`CheckpointScheduler`]. An
//! [`IdentityRouter`] hands out stores per caller identity.
//!
//! # Example
//!
//! ```no_run
//! use sqlite_flow::{FlowStore, IdentityRouter, RouteContext, StoreRouter};
//!
//! # async fn example() -> sqlite_flow::Result<()> {
//! let store = FlowStore::open("app.db").await?;
//! let router = IdentityRouter::with_default(store);
//!
//! let store = router.route(&RouteContext::write("alice"))?;
//! store
//!    .writer()
//!    .execute("CREATE TABLE IF NOT EXISTS todos (id INTEGER PRIMARY KEY, title TEXT)", vec![])
//!    .await?;
//!
//! let mut todos = store.subscribe(["todos"]);
//! # let _ = &mut todos;
//! router.close_all().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod router;
mod store;

pub use error::{Error, Result};
pub use router::{IdentityRouter, Role, RouteContext, StoreRouter, aggregate_invalidations};
pub use store::{Builder, FlowStore};

pub use sqlx_sqlite_conn_mgr::{
   CheckpointMode, CheckpointThresholds, FlowConfig, LiveConfig, SqliteDatabaseConfig,
   WalCheckpoint,
};
pub use sqlx_sqlite_observer::{Invalidation, InvalidationBus, InvalidationStream};
pub use sqlx_sqlite_toolkit::migration::{ExpectedColumn, ExpectedSchema, ExpectedTable, SchemaDiff};
pub use sqlx_sqlite_toolkit::{
   CheckpointScheduler, CheckpointState, FlowMetrics, MetricsSnapshot, Page, PageSource,
   ReactiveQuery, Statement, UpdateBuilder, WriteHandle, WriteQueryResult, WriteSerializer,
};
