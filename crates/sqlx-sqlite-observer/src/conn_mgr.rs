//! Integration with sqlx-sqlite-conn-mgr crate.
//!
//! Wraps a [`SqliteDatabase`] so that every write connection handed out carries the
//! change-tracking hooks. Changes are buffered during transactions and only published
//! after commit.
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use sqlx_sqlite_conn_mgr::SqliteDatabase;
//! use sqlx_sqlite_observer::ObservableSqliteDatabase;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!    let db = SqliteDatabase::connect("mydb.db", None).await?;
//!    let observable = ObservableSqliteDatabase::new(db);
//!
//!    let mut invalidations = observable.subscribe(["users"]);
//!    // Initial event
//!    invalidations.next().await;
//!
//!    let mut writer = observable.acquire_writer().await?;
//!    sqlx::query("INSERT INTO users (name) VALUES (?)")
//!       .bind("Alice")
//!       .execute(&mut *writer)
//!       .await?;
//!    drop(writer);
//!
//!    let change = invalidations.next().await;
//!    Ok(())
//! }
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;
use sqlx::{Pool, Sqlite};
use sqlx_sqlite_conn_mgr::{SqliteDatabase, WriteGuard};
use tracing::{trace, warn};

use crate::Result;
use crate::bus::InvalidationBus;
use crate::schema::{is_without_rowid, list_tables};
use crate::stream::InvalidationStream;
use crate::tracker::ChangeTracker;

/// Wrapper around `SqliteDatabase` that provides change observation.
///
/// Changes made through [`acquire_writer`](Self::acquire_writer) are tracked; read
/// operations are unaffected.
///
/// Invalidation streams end once the database is closed or its last clone is dropped.
#[derive(Debug, Clone)]
pub struct ObservableSqliteDatabase {
   db: Arc<SqliteDatabase>,
   tracker: Arc<ChangeTracker>,
   _lifetime: Arc<TrackerLifetime>,
}

/// Closes the tracker when the last database clone goes away.
#[derive(Debug)]
struct TrackerLifetime(Arc<ChangeTracker>);

impl Drop for TrackerLifetime {
   fn drop(&mut self) {
      self.0.close();
   }
}

impl ObservableSqliteDatabase {
   pub fn new(db: Arc<SqliteDatabase>) -> Self {
      let tracker = ChangeTracker::new();
      Self {
         db,
         _lifetime: Arc::new(TrackerLifetime(Arc::clone(&tracker))),
         tracker,
      }
   }

   /// Conflating invalidation stream for `tables` (every table if empty).
   pub fn subscribe<I, S>(&self, tables: I) -> InvalidationStream
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      self.bus().subscribe(tables)
   }

   pub fn bus(&self) -> InvalidationBus {
      InvalidationBus::new(Arc::clone(&self.tracker))
   }

   /// Get a reference to the read-only connection pool.
   pub fn read_pool(&self) -> sqlx_sqlite_conn_mgr::Result<&Pool<Sqlite>> {
      self.db.read_pool()
   }

   /// Acquire an observable write guard.
   ///
   /// Committed changes are published when [`ObservableWriteGuard::publish_changes`] is
   /// called or the guard is dropped.
   pub async fn acquire_writer(&self) -> Result<ObservableWriteGuard> {
      let mut writer = self.db.acquire_writer().await?;
      self.tracker.install(&mut writer).await?;

      Ok(ObservableWriteGuard {
         writer,
         tracker: Arc::clone(&self.tracker),
      })
   }

   /// Tables whose row changes SQLite's update hook never reports (`WITHOUT ROWID`).
   ///
   /// Writes to these tables produce no invalidations; subscribers must be notified by
   /// other means.
   pub async fn unobservable_tables(&self) -> Result<Vec<String>> {
      let pool = self.db.read_pool()?;
      let mut conn = pool.acquire().await?;

      let mut unobservable = Vec::new();
      for table in list_tables(&mut conn).await? {
         if is_without_rowid(&mut conn, &table).await? {
            warn!(table = %table, "Changes to WITHOUT ROWID table cannot be observed");
            unobservable.push(table);
         }
      }
      Ok(unobservable)
   }

   /// Get the underlying `SqliteDatabase`.
   pub fn inner(&self) -> &Arc<SqliteDatabase> {
      &self.db
   }

   pub fn tracker(&self) -> &Arc<ChangeTracker> {
      &self.tracker
   }

   /// End every invalidation stream, then close the underlying database.
   pub async fn close(&self) -> Result<()> {
      self.tracker.close();
      self.db.close().await?;
      Ok(())
   }

   /// Like [`close`](Self::close), but also deletes the database files.
   pub async fn remove(&self) -> Result<()> {
      self.tracker.close();
      self.db.remove().await?;
      Ok(())
   }
}

/// RAII guard for observable write access to the database.
///
/// Wraps a `WriteGuard` from `sqlx-sqlite-conn-mgr` whose connection has the tracking
/// hooks installed.
#[must_use = "if unused, the write lock is immediately released"]
pub struct ObservableWriteGuard {
   writer: WriteGuard,
   tracker: Arc<ChangeTracker>,
}

impl ObservableWriteGuard {
   /// Publish the changes committed so far without releasing the writer.
   pub fn publish_changes(&self) {
      self.tracker.publish_committed();
   }

   /// Forget every change recorded on this connection that has not been published.
   ///
   /// Call when `COMMIT` fails: the commit hook has already staged its changes by then.
   pub fn discard_changes(&self) {
      self.tracker.discard_pending();
      self.tracker.discard_committed();
   }
}

impl Drop for ObservableWriteGuard {
   fn drop(&mut self) {
      let published = self.tracker.publish_committed();
      trace!(tables = ?published, "ObservableWriteGuard dropped");
   }
}

impl Deref for ObservableWriteGuard {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.writer
   }
}

impl DerefMut for ObservableWriteGuard {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.writer
   }
}
