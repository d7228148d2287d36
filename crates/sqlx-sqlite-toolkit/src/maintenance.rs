//! Maintenance through the write queue.
//!
//! These run as exclusive jobs on the write connection, so they never interleave with a
//! queued transaction.

use std::path::Path;

use sqlx_sqlite_conn_mgr::{CheckpointMode, WalCheckpoint, maintenance};
use tracing::debug;

use crate::serializer::{WriteHandle, WriteSerializer};

impl WriteSerializer {
   /// `PRAGMA wal_checkpoint(<mode>)`.
   ///
   /// Verbose logging is decided by the settings in force when the job runs.
   pub fn checkpoint(&self, mode: CheckpointMode) -> WriteHandle<WalCheckpoint> {
      let settings = self.database().inner().settings().clone();
      self.submit_exclusive(move |conn| {
         let settings = settings.clone();
         Box::pin(async move {
            let result = maintenance::wal_checkpoint(conn, mode).await?;
            if settings.load().verbose_maintenance_log {
               debug!(mode = mode.as_sql(), ?result, "WAL checkpoint");
            }
            Ok(result)
         })
      })
   }

   pub fn analyze(&self) -> WriteHandle<()> {
      self.submit_exclusive(|conn| Box::pin(async move { Ok(maintenance::analyze(conn).await?) }))
   }

   /// Rebuild the database file, reclaiming free pages.
   pub fn vacuum(&self) -> WriteHandle<()> {
      self.submit_exclusive(|conn| Box::pin(async move { Ok(maintenance::vacuum(conn).await?) }))
   }

   /// `PRAGMA integrity_check` on the write connection.
   pub fn integrity_check(&self) -> WriteHandle<bool> {
      self.submit_exclusive(|conn| {
         Box::pin(async move { Ok(maintenance::integrity_check(conn).await?) })
      })
   }

   /// Write a compacted copy of the database to `target` (`VACUUM INTO`).
   ///
   /// Fails if `target` already exists.
   pub fn backup_into(&self, target: impl AsRef<Path>) -> WriteHandle<()> {
      let target = target.as_ref().to_string_lossy().into_owned();
      self.submit_exclusive(move |conn| {
         let target = target.clone();
         Box::pin(async move {
            sqlx::query("VACUUM INTO ?")
               .bind(&target)
               .execute(&mut *conn)
               .await?;
            debug!(target = %target, "Database backed up");
            Ok(())
         })
      })
   }
}
