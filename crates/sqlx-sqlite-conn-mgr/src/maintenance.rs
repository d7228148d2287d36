//! Maintenance PRAGMAs: WAL checkpoints, integrity checks, statistics and space reclamation.
//!
//! These operate on a single connection. Anything that writes (checkpoints, `ANALYZE`,
//! `VACUUM`) must be given the write connection; read-only introspection works on any
//! connection.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;

use crate::Result;

/// `PRAGMA wal_checkpoint` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
   /// Checkpoint as many frames as possible without waiting on readers or writers.
   Passive,
   /// Wait for writers, then checkpoint every frame.
   Full,
   /// Like `Full`, then wait for readers so the next writer restarts the log.
   Restart,
   /// Like `Restart`, then truncate the WAL file to zero bytes.
   Truncate,
}

impl CheckpointMode {
   pub fn as_sql(&self) -> &'static str {
      match self {
         CheckpointMode::Passive => "PASSIVE",
         CheckpointMode::Full => "FULL",
         CheckpointMode::Restart => "RESTART",
         CheckpointMode::Truncate => "TRUNCATE",
      }
   }
}

/// Row returned by `PRAGMA wal_checkpoint`.
///
/// Both page counts are `-1` when the database is not in WAL mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalCheckpoint {
   /// 1 if the checkpoint could not complete because of a concurrent lock.
   pub busy: i64,
   /// Frames currently in the WAL file.
   pub log_pages: i64,
   /// Frames moved back into the database file.
   pub checkpointed_pages: i64,
}

/// Run `PRAGMA wal_checkpoint(<mode>)`.
pub async fn wal_checkpoint(
   conn: &mut SqliteConnection,
   mode: CheckpointMode,
) -> Result<WalCheckpoint> {
   let sql = format!("PRAGMA wal_checkpoint({})", mode.as_sql());
   let row: Option<(i64, i64, i64)> = sqlx::query_as(&sql).fetch_optional(&mut *conn).await?;

   Ok(row
      .map(|(busy, log_pages, checkpointed_pages)| WalCheckpoint {
         busy,
         log_pages,
         checkpointed_pages,
      })
      .unwrap_or_default())
}

/// `PRAGMA integrity_check`; true when every reported line is `ok`.
pub async fn integrity_check(conn: &mut SqliteConnection) -> Result<bool> {
   let lines: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
      .fetch_all(&mut *conn)
      .await?;

   Ok(lines.iter().all(|line| line.eq_ignore_ascii_case("ok")))
}

/// Refresh the query planner statistics.
pub async fn analyze(conn: &mut SqliteConnection) -> Result<()> {
   sqlx::query("ANALYZE").execute(&mut *conn).await?;
   Ok(())
}

/// Rebuild the database file, reclaiming free pages. Cannot run inside a transaction.
pub async fn vacuum(conn: &mut SqliteConnection) -> Result<()> {
   sqlx::query("VACUUM").execute(&mut *conn).await?;
   Ok(())
}

pub async fn page_count(conn: &mut SqliteConnection) -> Result<i64> {
   Ok(sqlx::query_scalar("PRAGMA page_count")
      .fetch_one(&mut *conn)
      .await?)
}

pub async fn page_size(conn: &mut SqliteConnection) -> Result<i64> {
   Ok(sqlx::query_scalar("PRAGMA page_size")
      .fetch_one(&mut *conn)
      .await?)
}

/// Database size estimated as `page_count * page_size`, WAL excluded.
pub async fn estimated_size_bytes(conn: &mut SqliteConnection) -> Result<i64> {
   let count = page_count(conn).await?;
   let size = page_size(conn).await?;
   Ok(count * size)
}

/// Current journal mode, lower-cased (`wal`, `delete`, ...).
pub async fn journal_mode(conn: &mut SqliteConnection) -> Result<String> {
   let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
      .fetch_one(&mut *conn)
      .await?;
   Ok(mode.to_ascii_lowercase())
}
