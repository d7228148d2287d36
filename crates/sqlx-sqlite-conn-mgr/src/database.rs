//! SQLite database with connection pooling and exclusive write access

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::{
   SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use tracing::{debug, error};

use crate::config::{LiveConfig, SqliteDatabaseConfig};
use crate::maintenance;
use crate::write_guard::WriteGuard;
use crate::{Error, Result};

/// SQLite database with connection pooling for concurrent reads and exclusive writes.
///
/// ## Architecture
///
/// The database maintains two connection pools:
/// - **`read_pool`**: Pool of read-only connections for concurrent reads
/// - **`write_conn`**: Single-connection pool for exclusive write access (enforced by max_connections=1)
///
/// ## State Management
///
/// - **`closed`**: Prevents use after the database has been closed
/// - **`path`**: Database file path for cleanup operations
/// - **`settings`**: Live settings shared with the write path and background loops
///
/// ## Usage Pattern
///
/// ```text
/// 1. Connect to database (WAL and PRAGMA tuning applied per connection when allowed)
/// 2. Read operations: Access read_pool for concurrent reads
/// 3. Write operations: Acquire writer (waits while another writer holds it)
/// 4. Close database when done
/// ```
#[derive(Debug)]
pub struct SqliteDatabase {
   /// Pool of read-only connections (defaults to max_connections=6) for concurrent reads
   read_pool: Pool<Sqlite>,

   /// Single read-write connection pool (max_connections=1) for serialized writes
   write_conn: Pool<Sqlite>,

   /// Marks database as closed to prevent further operations
   closed: AtomicBool,

   /// Path to database file (used for cleanup and registry lookups)
   path: PathBuf,

   settings: LiveConfig,
}

impl SqliteDatabase {
   /// Open (creating if missing) the database at `path`.
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      let config = custom_config.unwrap_or_default();
      let path = path.as_ref().to_path_buf();

      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         tokio::fs::create_dir_all(parent).await?;
      }

      let settings = config.settings.load();

      let mut write_options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true)
         .busy_timeout(config.busy_timeout);

      if settings.allow_pragma_tuning {
         write_options = write_options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

         if settings.verbose_maintenance_log {
            debug!(path = %path.display(), "Applying PRAGMAs: journal_mode=WAL, synchronous=NORMAL, foreign_keys=ON");
         }
      }

      // Connecting eagerly creates the file (and switches it to WAL) before any
      // read-only connection tries to open it.
      let write_conn = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(0)
         .idle_timeout(Some(config.idle_timeout))
         .connect_with(write_options)
         .await?;

      let read_options = SqliteConnectOptions::new()
         .filename(&path)
         .read_only(true)
         .busy_timeout(config.busy_timeout);

      let read_pool = SqlitePoolOptions::new()
         .max_connections(config.max_read_connections.max(1))
         .min_connections(0)
         .idle_timeout(Some(config.idle_timeout))
         .connect_lazy_with(read_options);

      debug!(path = %path.display(), "Connected to database");

      Ok(Arc::new(Self {
         read_pool,
         write_conn,
         closed: AtomicBool::new(false),
         path,
         settings: config.settings,
      }))
   }

   /// Open the database, verifying its integrity; a corrupt database is deleted and
   /// recreated empty.
   ///
   /// The rebuild destroys every row in the file and is always logged at error level.
   pub async fn connect_self_healing(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      let path = path.as_ref().to_path_buf();

      match Self::connect_verified(&path, custom_config.clone()).await {
         Ok(db) => Ok(db),
         Err(err) if err.is_corruption() => {
            error!(
               path = %path.display(),
               error = %err,
               "Database is corrupt; deleting database files and recreating"
            );
            remove_database_files(&path).await?;
            Self::connect(&path, custom_config).await
         }
         Err(err) => Err(err),
      }
   }

   async fn connect_verified(
      path: &Path,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      let db = Self::connect(path, custom_config).await?;

      let verified = {
         let mut writer = db.acquire_writer().await?;
         maintenance::integrity_check(&mut writer).await
      };

      match verified {
         Ok(true) => Ok(db),
         Ok(false) => {
            db.close().await?;
            Err(Error::Corrupted {
               path: path.to_path_buf(),
            })
         }
         Err(err) => {
            db.close().await?;
            Err(err)
         }
      }
   }

   /// Get a reference to the read-only connection pool.
   pub fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }
      Ok(&self.read_pool)
   }

   /// Acquire exclusive write access, waiting while another writer holds it.
   pub async fn acquire_writer(&self) -> Result<WriteGuard> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }
      let conn = self.write_conn.acquire().await?;
      Ok(WriteGuard::new(conn))
   }

   /// Live settings this database was opened with.
   pub fn settings(&self) -> &LiveConfig {
      &self.settings
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   /// Size of the main database file estimated from its page count.
   pub async fn estimated_size_bytes(&self) -> Result<i64> {
      let mut conn = self.read_pool()?.acquire().await?;
      maintenance::estimated_size_bytes(&mut conn).await
   }

   /// Close both pools, waiting for checked-out connections to be returned.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::AcqRel) {
         return Ok(());
      }
      self.read_pool.close().await;
      self.write_conn.close().await;
      debug!(path = %self.path.display(), "Closed database");
      Ok(())
   }

   /// Close the database and delete its files (main, `-wal`, `-shm`).
   pub async fn remove(&self) -> Result<()> {
      self.close().await?;
      remove_database_files(&self.path).await
   }
}

/// Delete a database file together with its WAL and shared-memory files.
///
/// Missing files are not an error.
pub async fn remove_database_files(path: &Path) -> Result<()> {
   let base = path.as_os_str().to_owned();
   let mut candidates = vec![path.to_path_buf()];
   for suffix in ["-wal", "-shm"] {
      let mut name = base.clone();
      name.push(suffix);
      candidates.push(PathBuf::from(name));
   }

   for candidate in candidates {
      match tokio::fs::remove_file(&candidate).await {
         Ok(()) => debug!(path = %candidate.display(), "Removed database file"),
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
         Err(e) => return Err(Error::Io(e)),
      }
   }
   Ok(())
}
