use std::path::Path;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Pool, Sqlite};
use sqlx_sqlite_conn_mgr::{LiveConfig, SqliteDatabase, SqliteDatabaseConfig};
use sqlx_sqlite_observer::{InvalidationBus, InvalidationStream, ObservableSqliteDatabase};
use sqlx_sqlite_toolkit::migration::{self, ExpectedSchema, SchemaDiff};
use sqlx_sqlite_toolkit::{
   CheckpointScheduler, FlowMetrics, MetricsSnapshot, PageSource, ReactiveQuery,
   WriteSerializer,
};
use tracing::{debug, warn};

use crate::Result;

/// Options for opening a [`FlowStore`].
#[derive(Debug, Clone)]
pub struct Builder {
   config: Option<SqliteDatabaseConfig>,
   self_heal: bool,
   auto_checkpoint: bool,
}

impl Default for Builder {
   fn default() -> Self {
      Self {
         config: None,
         self_heal: false,
         auto_checkpoint: true,
      }
   }
}

impl Builder {
   pub fn new() -> Self {
      Self::default()
   }

   /// Pool sizes, timeouts and the live flow settings.
   pub fn config(mut self, config: SqliteDatabaseConfig) -> Self {
      self.config = Some(config);
      self
   }

   /// Delete and recreate the file when it fails to open as a database.
   pub fn self_healing(mut self, enabled: bool) -> Self {
      self.self_heal = enabled;
      self
   }

   /// Start the background checkpoint scheduler on open. Enabled by default.
   pub fn auto_checkpoint(mut self, enabled: bool) -> Self {
      self.auto_checkpoint = enabled;
      self
   }

   /// Open the database and wire up the write queue, change observation and
   /// checkpoint scheduling around it.
   pub async fn open(self, path: impl AsRef<Path>) -> Result<FlowStore> {
      let path = path.as_ref();
      let db = if self.self_heal {
         SqliteDatabase::connect_self_healing(path, self.config).await?
      } else {
         SqliteDatabase::connect(path, self.config).await?
      };

      let observable = ObservableSqliteDatabase::new(db);
      let serializer = WriteSerializer::spawn(observable.clone(), FlowMetrics::new());
      let scheduler = CheckpointScheduler::for_serializer(&serializer);
      serializer.set_commit_listener(Some(scheduler.commit_listener()));

      if self.auto_checkpoint {
         scheduler.start();
      }

      // Surfaces tables whose writes will never be observed
      if let Err(e) = observable.unobservable_tables().await {
         warn!(path = %path.display(), error = %e, "Failed to inspect tables");
      }

      debug!(path = %path.display(), auto_checkpoint = self.auto_checkpoint, "Opened store");

      Ok(FlowStore {
         observable,
         serializer,
         scheduler,
      })
   }
}

/// One database with its write queue, invalidation bus and checkpoint
/// scheduler. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct FlowStore {
   observable: ObservableSqliteDatabase,
   serializer: WriteSerializer,
   scheduler: CheckpointScheduler,
}

impl FlowStore {
   /// Open with default options.
   pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
      Builder::new().open(path).await
   }

   pub fn builder() -> Builder {
      Builder::new()
   }

   /// The write queue. Every write to this store goes through it.
   pub fn writer(&self) -> &WriteSerializer {
      &self.serializer
   }

   pub fn scheduler(&self) -> &CheckpointScheduler {
      &self.scheduler
   }

   pub fn database(&self) -> &ObservableSqliteDatabase {
      &self.observable
   }

   pub fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      Ok(self.observable.read_pool()?)
   }

   pub fn bus(&self) -> InvalidationBus {
      self.observable.bus()
   }

   /// Invalidations for committed writes touching any of `tables`.
   pub fn subscribe<I, S>(&self, tables: I) -> InvalidationStream
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      self.observable.subscribe(tables)
   }

   /// Run `read` now and again after every commit touching `tables`.
   pub fn reactive_query<T, F, Fut, I, S>(&self, tables: I, read: F) -> Result<ReactiveQuery<T>>
   where
      T: Clone + Send + Sync + 'static,
      F: Fn(Pool<Sqlite>) -> Fut + Send + Sync + 'static,
      Fut: Future<Output = std::result::Result<T, sqlx::Error>> + Send + 'static,
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      Ok(sqlx_sqlite_toolkit::reactive_query(&self.observable, tables, read)?)
   }

   /// Offset-paged reads of `sql`, invalidated by the next commit touching `tables`.
   pub fn pager<T, I, S>(
      &self,
      tables: I,
      sql: impl Into<String>,
      values: Vec<JsonValue>,
      page_size: usize,
   ) -> Result<PageSource<T>>
   where
      T: for<'r> FromRow<'r, SqliteRow>,
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      Ok(PageSource::new(&self.observable, tables, sql, values, page_size)?)
   }

   /// Bring the schema up to `expected` in a single queued transaction.
   pub async fn migrate(&self, expected: &ExpectedSchema) -> Result<SchemaDiff> {
      Ok(migration::migrate(&self.serializer, expected).await?)
   }

   pub fn metrics(&self) -> MetricsSnapshot {
      self.serializer.metrics().snapshot()
   }

   pub fn flow_metrics(&self) -> &Arc<FlowMetrics> {
      self.serializer.metrics()
   }

   /// Live settings. Changes apply to the next transaction or checkpoint tick.
   pub fn settings(&self) -> &LiveConfig {
      self.observable.inner().settings()
   }

   pub fn path(&self) -> &Path {
      self.observable.inner().path()
   }

   pub fn is_closed(&self) -> bool {
      self.serializer.is_closed() || self.observable.inner().is_closed()
   }

   /// Stop checkpointing, shut the write queue and close all connections.
   ///
   /// The write in flight finishes; queued writes fail with `TaskAbandoned`.
   /// Invalidation streams and reactive queries of this store end.
   pub async fn close(&self) -> Result<()> {
      self.scheduler.stop();
      self.serializer.close().await;
      self.observable.close().await?;
      debug!(path = %self.path().display(), "Closed store");
      Ok(())
   }

   /// Close the store and delete the database, WAL and SHM files.
   pub async fn remove(&self) -> Result<()> {
      self.scheduler.stop();
      self.serializer.close().await;
      self.observable.remove().await?;
      Ok(())
   }
}

impl std::fmt::Debug for FlowStore {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("FlowStore")
         .field("path", &self.path())
         .field("closed", &self.is_closed())
         .finish()
   }
}
