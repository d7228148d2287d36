//! Commit-aware table change tracking on top of SQLite's native hooks.
//!
//! The update hook buffers the names of modified tables, the commit hook moves the
//! buffer to the committed set and the rollback hook discards it. Nothing is delivered
//! from inside a hook: SQLite forbids touching the connection there and the hooks run
//! on SQLx's worker thread. Committed tables are handed to observers by
//! [`ChangeTracker::publish_committed`] once the write path is back in control.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, trace};

use crate::Result;
use crate::change::ChangeOperation;

/// Identifier of an observer registered with a [`ChangeTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callback receiving the watched tables touched by a commit.
pub type ObserverCallback = Arc<dyn Fn(&BTreeSet<String>) + Send + Sync>;

struct Observer {
   tables: BTreeSet<String>,
   callback: ObserverCallback,
}

/// Per-database registry of changed tables and of the observers interested in them.
#[derive(Default)]
pub struct ChangeTracker {
   pending: Mutex<BTreeSet<String>>,
   committed: Mutex<BTreeSet<String>>,
   observers: RwLock<HashMap<ObserverId, Observer>>,
   next_id: AtomicU64,
   closed: AtomicBool,
}

impl ChangeTracker {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Install update, commit and rollback hooks on `conn`, replacing any previous ones.
   ///
   /// Must be called every time the write connection is acquired, since the pool may
   /// have replaced the underlying connection.
   pub async fn install(self: &Arc<Self>, conn: &mut SqliteConnection) -> Result<()> {
      let mut handle = conn
         .lock_handle()
         .await
         .map_err(|e| crate::Error::HookInstallation(e.to_string()))?;

      let tracker = Arc::clone(self);
      handle.set_update_hook(move |result| {
         let operation = ChangeOperation::from_sqlite(&result.operation);
         trace!(table = %result.table, ?operation, rowid = result.rowid, "Row changed");
         tracker.record(result.table);
      });

      let tracker = Arc::clone(self);
      handle.set_commit_hook(move || {
         tracker.stage_commit();
         true
      });

      let tracker = Arc::clone(self);
      handle.set_rollback_hook(move || {
         tracker.discard_pending();
      });

      Ok(())
   }

   pub(crate) fn record(&self, table: &str) {
      self.pending.lock().insert(table.to_lowercase());
   }

   pub(crate) fn stage_commit(&self) {
      let mut pending = self.pending.lock();
      if pending.is_empty() {
         return;
      }
      self.committed.lock().append(&mut pending);
   }

   pub(crate) fn discard_pending(&self) {
      let mut pending = self.pending.lock();
      if !pending.is_empty() {
         trace!(tables = ?*pending, "Discarding rolled back changes");
         pending.clear();
      }
   }

   /// Forget changes the commit hook staged for a `COMMIT` that then failed.
   pub(crate) fn discard_committed(&self) {
      let mut committed = self.committed.lock();
      if !committed.is_empty() {
         trace!(tables = ?*committed, "Discarding changes of a failed commit");
         committed.clear();
      }
   }

   /// Register `callback` for commits touching any of `tables` (all tables if empty).
   ///
   /// On a closed tracker the callback is dropped right away and never invoked.
   pub fn add_observer(&self, tables: BTreeSet<String>, callback: ObserverCallback) -> ObserverId {
      let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
      let mut observers = self.observers.write();
      if !self.closed.load(Ordering::Acquire) {
         observers.insert(id, Observer { tables, callback });
      }
      id
   }

   /// Returns false if the observer was already removed.
   pub fn remove_observer(&self, id: ObserverId) -> bool {
      self.observers.write().remove(&id).is_some()
   }

   pub fn observer_count(&self) -> usize {
      self.observers.read().len()
   }

   /// Drop every observer and refuse new ones.
   ///
   /// Dropping the callbacks releases the channels they feed, so invalidation streams
   /// end once none of their trackers is open.
   pub fn close(&self) {
      let observers = {
         let mut observers = self.observers.write();
         if self.closed.swap(true, Ordering::AcqRel) {
            return;
         }
         std::mem::take(&mut *observers)
      };
      debug!(observers = observers.len(), "Change tracker closed");
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   /// Deliver the committed change set to matching observers and clear it.
   ///
   /// Returns the tables that were published.
   pub fn publish_committed(&self) -> BTreeSet<String> {
      let committed = std::mem::take(&mut *self.committed.lock());
      if committed.is_empty() {
         return committed;
      }

      // Callbacks run outside the registry lock so they may (un)register observers.
      let targets: Vec<(ObserverCallback, BTreeSet<String>)> = self
         .observers
         .read()
         .values()
         .filter_map(|observer| {
            let matched: BTreeSet<String> = if observer.tables.is_empty() {
               committed.clone()
            } else {
               observer
                  .tables
                  .intersection(&committed)
                  .cloned()
                  .collect()
            };
            (!matched.is_empty()).then(|| (Arc::clone(&observer.callback), matched))
         })
         .collect();

      debug!(tables = ?committed, observers = targets.len(), "Publishing committed changes");

      for (callback, matched) in targets {
         callback(&matched);
      }
      committed
   }
}

impl std::fmt::Debug for ChangeTracker {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ChangeTracker")
         .field("pending", &*self.pending.lock())
         .field("committed", &*self.committed.lock())
         .field("observers", &self.observer_count())
         .finish()
   }
}
