//! Configuration for SQLite database connection pools and live runtime settings

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Configuration for SqliteDatabase connection pools
///
/// Pool settings are applied once at connect time. Everything that may change while the
/// database is open lives in [`LiveConfig`], carried here as `settings`.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_mgr::SqliteDatabaseConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = SqliteDatabaseConfig::default();
///
/// // Override just one field
/// let config = SqliteDatabaseConfig {
///     max_read_connections: 3,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of concurrent read connections
   ///
   /// This controls the size of the read-only connection pool.
   /// Higher values allow more concurrent read queries but consume more resources.
   ///
   /// Default: 6
   pub max_read_connections: u32,

   /// Idle timeout for both read and write connections
   ///
   /// Connections that remain idle for this duration will be closed automatically.
   /// This helps prevent resource exhaustion from idle threads.
   ///
   /// Default: 30 seconds
   pub idle_timeout: Duration,

   /// SQLite's own busy handler timeout
   ///
   /// Zero makes lock contention surface immediately as `SQLITE_BUSY`, leaving the
   /// waiting to [`RetryPolicy`](crate::RetryPolicy).
   ///
   /// Default: 0
   pub busy_timeout: Duration,

   /// Live settings shared with everything built on top of this database.
   pub settings: LiveConfig,
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout: Duration::from_secs(30),
         busy_timeout: Duration::ZERO,
         settings: LiveConfig::default(),
      }
   }
}

/// Thresholds gating the background WAL checkpoint loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointThresholds {
   /// Delay between two scheduler ticks.
   pub poll_interval: Duration,
   /// Minimum time since the last committed write.
   pub min_idle: Duration,
   /// Minimum time since the last checkpoint.
   pub min_interval: Duration,
   /// Minimum number of WAL pages before a checkpoint is worth running.
   pub wal_pages_threshold: i64,
}

impl Default for CheckpointThresholds {
   fn default() -> Self {
      Self {
         poll_interval: Duration::from_secs(2),
         min_idle: Duration::from_secs(3),
         min_interval: Duration::from_secs(5),
         wal_pages_threshold: 128,
      }
   }
}

/// Runtime-tunable settings.
///
/// Read through [`LiveConfig::load`] at the moment a value is needed, so updates apply to
/// the next retry, tick or connection without restarting anything.
#[derive(Debug, Clone)]
pub struct FlowConfig {
   /// Runtime used for background work (write worker, checkpoint loop, reactive reads).
   /// `None` spawns onto the ambient tokio runtime.
   pub io_runtime: Option<Handle>,

   /// Total attempts (first try included) for operations failing with a busy/locked error.
   pub busy_max_attempts: u32,

   /// First backoff delay; doubled after every retry.
   pub busy_initial_delay: Duration,

   /// Upper bound for a single backoff delay.
   pub busy_max_delay: Duration,

   pub checkpoint: CheckpointThresholds,

   /// Emit debug logs for maintenance operations (checkpoints, PRAGMAs).
   pub verbose_maintenance_log: bool,

   /// Apply `journal_mode=WAL`, `synchronous=NORMAL` and `foreign_keys=ON` on connect.
   pub allow_pragma_tuning: bool,
}

impl Default for FlowConfig {
   fn default() -> Self {
      Self {
         io_runtime: None,
         busy_max_attempts: 7,
         busy_initial_delay: Duration::from_millis(10),
         busy_max_delay: Duration::from_millis(200),
         checkpoint: CheckpointThresholds::default(),
         verbose_maintenance_log: false,
         allow_pragma_tuning: true,
      }
   }
}

/// Shared, atomically swappable holder for [`FlowConfig`].
///
/// Cloning is cheap and every clone observes the same value.
#[derive(Debug, Clone)]
pub struct LiveConfig(Arc<ArcSwap<FlowConfig>>);

impl LiveConfig {
   pub fn new(config: FlowConfig) -> Self {
      Self(Arc::new(ArcSwap::from_pointee(config)))
   }

   /// Current settings.
   pub fn load(&self) -> Arc<FlowConfig> {
      self.0.load_full()
   }

   /// Replace the settings wholesale.
   pub fn store(&self, config: FlowConfig) {
      self.0.store(Arc::new(config));
   }

   /// Modify the current settings in place.
   pub fn update<F>(&self, mut f: F)
   where
      F: FnMut(&mut FlowConfig),
   {
      self.0.rcu(|current| {
         let mut next = FlowConfig::clone(current);
         f(&mut next);
         next
      });
   }

   /// Spawn onto the configured I/O runtime, or the ambient one.
   pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
   where
      F: Future + Send + 'static,
      F::Output: Send + 'static,
   {
      match &self.load().io_runtime {
         Some(handle) => handle.spawn(future),
         None => tokio::spawn(future),
      }
   }
}

impl Default for LiveConfig {
   fn default() -> Self {
      Self::new(FlowConfig::default())
   }
}
