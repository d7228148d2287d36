//! # sqlx-sqlite-observer
//!
//! Table-level invalidation notifications for SQLite databases managed by
//! `sqlx-sqlite-conn-mgr`.
//!
//! ## How it works
//!
//! - SQLite's update, commit and rollback hooks are installed on the write connection
//!   every time it is acquired ([`ChangeTracker::install`])
//! - Modified tables are buffered per transaction and only published after commit;
//!   rolled back changes are never seen
//! - Subscribers receive an [`InvalidationStream`]: the first item is a synthetic initial
//!   event, later items are conflated so a slow consumer always sees the latest commit
//! - [`InvalidationTransport`] carries invalidations across process boundaries
//!
//! ## Limitations
//!
//! The update hook does not fire for `WITHOUT ROWID` tables, nor for `DELETE FROM t`
//! without a `WHERE` clause when SQLite applies the truncate optimization. Use
//! [`ObservableSqliteDatabase::unobservable_tables`] to find the former.

mod bus;
mod change;
mod conn_mgr;
mod error;
pub mod schema;
mod stream;
mod tracker;
mod transport;

pub use bus::InvalidationBus;
pub use change::{ChangeOperation, Invalidation, normalize_tables};
pub use conn_mgr::{ObservableSqliteDatabase, ObservableWriteGuard};
pub use error::Error;
pub use stream::{InvalidationStream, Registration};
pub use tracker::{ChangeTracker, ObserverCallback, ObserverId};
pub use transport::{BroadcastTransport, InvalidationTransport};

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
