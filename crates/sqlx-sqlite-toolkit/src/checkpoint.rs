//! Background WAL checkpointing.
//!
//! [`CheckpointScheduler`] wakes up every `poll_interval`, samples the WAL with a
//! `PASSIVE` checkpoint and, when the database has been idle long enough, the last
//! checkpoint is old enough and the log is large enough, folds the log back with a
//! `TRUNCATE` checkpoint. Thresholds are read from the live settings on every tick.
//!
//! Both checkpoints are issued through a [`WalCheckpointer`]; the write queue implements
//! it, so a checkpoint never overlaps a write transaction.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx_sqlite_conn_mgr::{CheckpointMode, CheckpointThresholds, LiveConfig, WalCheckpoint};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Result;
use crate::metrics::FlowMetrics;
use crate::serializer::{CommitListener, WriteSerializer};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Issues WAL checkpoints on behalf of the scheduler.
pub trait WalCheckpointer: Send + Sync {
   fn checkpoint(&self, mode: CheckpointMode) -> BoxFuture<'static, Result<WalCheckpoint>>;
}

impl WalCheckpointer for WriteSerializer {
   fn checkpoint(&self, mode: CheckpointMode) -> BoxFuture<'static, Result<WalCheckpoint>> {
      Box::pin(WriteSerializer::checkpoint(self, mode))
   }
}

/// What the scheduler knows about the WAL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointState {
   /// Frames in the WAL at the last sample; `-1` outside WAL mode.
   pub observed_log_pages: i64,
   pub last_checkpoint_at: Option<Instant>,
   pub checkpoint_count: u64,
   pub last_write_at: Option<Instant>,
}

impl CheckpointState {
   /// Idle, interval and size conditions all hold at `now`.
   ///
   /// A missing timestamp satisfies its condition.
   pub fn should_checkpoint(&self, now: Instant, thresholds: &CheckpointThresholds) -> bool {
      let idle = self
         .last_write_at
         .is_none_or(|at| now.saturating_duration_since(at) >= thresholds.min_idle);
      let interval = self
         .last_checkpoint_at
         .is_none_or(|at| now.saturating_duration_since(at) >= thresholds.min_interval);
      let large = self.observed_log_pages >= thresholds.wal_pages_threshold;

      idle && interval && large
   }
}

/// Background loop deciding when to checkpoint the WAL.
///
/// Cloning shares the loop. The loop stops on [`stop`](Self::stop) or when the last
/// clone is dropped.
#[derive(Clone)]
pub struct CheckpointScheduler {
   inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
   checkpointer: Arc<dyn WalCheckpointer>,
   settings: LiveConfig,
   state: watch::Sender<CheckpointState>,
   task: Mutex<Option<JoinHandle<()>>>,
   metrics: Option<Arc<FlowMetrics>>,
}

impl CheckpointScheduler {
   pub fn new(checkpointer: Arc<dyn WalCheckpointer>, settings: LiveConfig) -> Self {
      Self::build(checkpointer, settings, None)
   }

   /// Scheduler checkpointing through `serializer`, recording into its metrics.
   pub fn for_serializer(serializer: &WriteSerializer) -> Self {
      let settings = serializer.database().inner().settings().clone();
      Self::build(
         Arc::new(serializer.clone()),
         settings,
         Some(Arc::clone(serializer.metrics())),
      )
   }

   fn build(
      checkpointer: Arc<dyn WalCheckpointer>,
      settings: LiveConfig,
      metrics: Option<Arc<FlowMetrics>>,
   ) -> Self {
      let (state, _) = watch::channel(CheckpointState::default());
      Self {
         inner: Arc::new(SchedulerInner {
            checkpointer,
            settings,
            state,
            task: Mutex::new(None),
            metrics,
         }),
      }
   }

   /// Start the loop. Does nothing while already running.
   pub fn start(&self) {
      let mut task = self.inner.task.lock();
      if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
         return;
      }

      let weak = Arc::downgrade(&self.inner);
      *task = Some(self.inner.settings.spawn(run_loop(weak)));
      debug!("Checkpoint scheduler started");
   }

   /// Cancel the loop. Does nothing when stopped.
   pub fn stop(&self) {
      if let Some(handle) = self.inner.task.lock().take() {
         handle.abort();
         debug!("Checkpoint scheduler stopped");
      }
   }

   pub fn is_running(&self) -> bool {
      self
         .inner
         .task
         .lock()
         .as_ref()
         .is_some_and(|handle| !handle.is_finished())
   }

   /// Record a committed write now.
   pub fn on_write_committed(&self) {
      self.record_write_at(Instant::now());
   }

   pub(crate) fn record_write_at(&self, at: Instant) {
      self.inner.record_write_at(at);
   }

   /// Listener for [`WriteSerializer::set_commit_listener`].
   ///
   /// Holds the scheduler weakly.
   pub fn commit_listener(&self) -> CommitListener {
      let weak = Arc::downgrade(&self.inner);
      Arc::new(move || {
         if let Some(inner) = weak.upgrade() {
            inner.record_write_at(Instant::now());
         }
      })
   }

   pub fn state(&self) -> CheckpointState {
      *self.inner.state.borrow()
   }

   pub fn watch_state(&self) -> watch::Receiver<CheckpointState> {
      self.inner.state.subscribe()
   }

   /// Sample the WAL once and, if warranted, one checkpoint as of `now`.
   ///
   /// Returns whether a checkpoint ran.
   #[cfg(test)]
   pub(crate) async fn tick(&self, now: Instant, thresholds: &CheckpointThresholds) -> Result<bool> {
      self.inner.tick(now, thresholds).await
   }
}

impl std::fmt::Debug for CheckpointScheduler {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("CheckpointScheduler")
         .field("running", &self.is_running())
         .field("state", &self.state())
         .finish()
   }
}

impl SchedulerInner {
   fn record_write_at(&self, at: Instant) {
      self.state.send_modify(|state| state.last_write_at = Some(at));
   }

   async fn tick(&self, now: Instant, thresholds: &CheckpointThresholds) -> Result<bool> {
      let sample = self.checkpointer.checkpoint(CheckpointMode::Passive).await?;
      self
         .state
         .send_modify(|state| state.observed_log_pages = sample.log_pages);

      if !self.state.borrow().should_checkpoint(now, thresholds) {
         return Ok(false);
      }

      let result = self.checkpointer.checkpoint(CheckpointMode::Truncate).await?;
      self.state.send_modify(|state| {
         state.observed_log_pages = result.log_pages;
         state.last_checkpoint_at = Some(now);
         state.checkpoint_count += 1;
      });

      if let Some(metrics) = &self.metrics {
         metrics.record_checkpoint();
      }

      if result.busy != 0 {
         debug!(
            log_pages = result.log_pages,
            checkpointed_pages = result.checkpointed_pages,
            "WAL checkpoint blocked by readers"
         );
      } else if self.settings.load().verbose_maintenance_log {
         debug!(
            sampled_pages = sample.log_pages,
            checkpointed_pages = result.checkpointed_pages,
            "WAL checkpoint (TRUNCATE) completed"
         );
      }

      Ok(true)
   }
}

impl Drop for SchedulerInner {
   fn drop(&mut self) {
      if let Some(handle) = self.task.get_mut().take() {
         handle.abort();
      }
   }
}

async fn run_loop(weak: Weak<SchedulerInner>) {
   loop {
      let poll_interval = match weak.upgrade() {
         Some(inner) => inner.settings.load().checkpoint.poll_interval,
         None => break,
      };
      tokio::time::sleep(poll_interval.max(MIN_POLL_INTERVAL)).await;

      let Some(inner) = weak.upgrade() else { break };
      let thresholds = inner.settings.load().checkpoint;
      if let Err(e) = inner.tick(Instant::now(), &thresholds).await {
         warn!(error = %e, "Checkpoint tick failed");
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx_sqlite_conn_mgr::FlowConfig;
   use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

   use crate::Error;

   struct FakeCheckpointer {
      log_pages: AtomicI64,
      calls: Mutex<Vec<CheckpointMode>>,
   }

   impl FakeCheckpointer {
      fn new(log_pages: i64) -> Arc<Self> {
         Arc::new(Self {
            log_pages: AtomicI64::new(log_pages),
            calls: Mutex::new(Vec::new()),
         })
      }

      fn truncates(&self) -> usize {
         self
            .calls
            .lock()
            .iter()
            .filter(|mode| **mode == CheckpointMode::Truncate)
            .count()
      }
   }

   impl WalCheckpointer for FakeCheckpointer {
      fn checkpoint(&self, mode: CheckpointMode) -> BoxFuture<'static, Result<WalCheckpoint>> {
         self.calls.lock().push(mode);
         let log_pages = self.log_pages.load(Ordering::SeqCst);
         Box::pin(futures::future::ready(Ok(WalCheckpoint {
            busy: 0,
            log_pages,
            checkpointed_pages: log_pages,
         })))
      }
   }

   struct FailingCheckpointer {
      calls: AtomicUsize,
   }

   impl WalCheckpointer for FailingCheckpointer {
      fn checkpoint(&self, _mode: CheckpointMode) -> BoxFuture<'static, Result<WalCheckpoint>> {
         self.calls.fetch_add(1, Ordering::SeqCst);
         Box::pin(futures::future::ready(Err(Error::Other("passive checkpoint failed".into()))))
      }
   }

   fn thresholds() -> CheckpointThresholds {
      CheckpointThresholds {
         poll_interval: Duration::from_secs(2),
         min_idle: Duration::from_millis(3000),
         min_interval: Duration::from_millis(5000),
         wal_pages_threshold: 128,
      }
   }

   fn scheduler(checkpointer: Arc<FakeCheckpointer>) -> CheckpointScheduler {
      CheckpointScheduler::new(checkpointer, LiveConfig::default())
   }

   #[test]
   fn test_should_checkpoint_requires_all_conditions() {
      let base = Instant::now();
      let state = CheckpointState {
         observed_log_pages: 128,
         last_checkpoint_at: Some(base),
         checkpoint_count: 1,
         last_write_at: Some(base),
      };
      let t = thresholds();

      assert!(state.should_checkpoint(base + Duration::from_secs(5), &t));
      // Not idle long enough
      let recent_write = CheckpointState {
         last_write_at: Some(base + Duration::from_millis(2500)),
         ..state
      };
      assert!(!recent_write.should_checkpoint(base + Duration::from_secs(5), &t));
      // Last checkpoint too recent
      assert!(!state.should_checkpoint(base + Duration::from_millis(4999), &CheckpointThresholds {
         min_idle: Duration::ZERO,
         ..t
      }));
      // Log too small
      let small = CheckpointState {
         observed_log_pages: 127,
         ..state
      };
      assert!(!small.should_checkpoint(base + Duration::from_secs(60), &t));
   }

   #[test]
   fn test_missing_timestamps_are_satisfied() {
      let state = CheckpointState {
         observed_log_pages: 500,
         ..CheckpointState::default()
      };
      assert!(state.should_checkpoint(Instant::now(), &thresholds()));
   }

   #[test]
   fn test_non_wal_database_never_checkpoints() {
      let state = CheckpointState {
         observed_log_pages: -1,
         ..CheckpointState::default()
      };
      assert!(!state.should_checkpoint(Instant::now(), &thresholds()));
   }

   #[tokio::test]
   async fn test_tick_suppressed_while_not_idle() {
      let fake = FakeCheckpointer::new(200);
      let scheduler = scheduler(fake.clone());
      let base = Instant::now();
      scheduler.record_write_at(base);

      let fired = scheduler
         .tick(base + Duration::from_millis(2999), &thresholds())
         .await
         .unwrap();

      assert!(!fired);
      assert_eq!(fake.truncates(), 0);
      assert_eq!(scheduler.state().observed_log_pages, 200);
   }

   #[tokio::test]
   async fn test_tick_suppressed_below_page_threshold() {
      let fake = FakeCheckpointer::new(127);
      let scheduler = scheduler(fake.clone());
      let base = Instant::now();
      scheduler.record_write_at(base);

      let fired = scheduler
         .tick(base + Duration::from_secs(60), &thresholds())
         .await
         .unwrap();

      assert!(!fired);
      assert_eq!(fake.truncates(), 0);
   }

   #[tokio::test]
   async fn test_tick_suppressed_within_min_interval() {
      let fake = FakeCheckpointer::new(200);
      let scheduler = scheduler(fake.clone());
      let base = Instant::now();
      scheduler.record_write_at(base);

      assert!(
         scheduler
            .tick(base + Duration::from_secs(3), &thresholds())
            .await
            .unwrap()
      );
      assert!(
         !scheduler
            .tick(base + Duration::from_millis(7999), &thresholds())
            .await
            .unwrap()
      );
      assert!(
         scheduler
            .tick(base + Duration::from_secs(8), &thresholds())
            .await
            .unwrap()
      );
      assert_eq!(fake.truncates(), 2);
   }

   #[tokio::test]
   async fn test_checkpoint_fires_exactly_once_when_conditions_align() {
      let fake = FakeCheckpointer::new(200);
      let scheduler = scheduler(fake.clone());
      let base = Instant::now();
      scheduler.record_write_at(base);

      let mut fired = 0;
      for second in 1..=7 {
         if scheduler
            .tick(base + Duration::from_secs(second), &thresholds())
            .await
            .unwrap()
         {
            fired += 1;
         }
      }

      assert_eq!(fired, 1);
      assert_eq!(fake.truncates(), 1);

      let state = scheduler.state();
      assert_eq!(state.checkpoint_count, 1);
      assert_eq!(state.last_checkpoint_at, Some(base + Duration::from_secs(3)));
   }

   #[tokio::test]
   async fn test_commit_listener_updates_last_write() {
      let scheduler = scheduler(FakeCheckpointer::new(0));
      assert!(scheduler.state().last_write_at.is_none());

      let listener = scheduler.commit_listener();
      listener();
      assert!(scheduler.state().last_write_at.is_some());

      // The listener does not keep the scheduler alive
      drop(scheduler);
      listener();
   }

   #[tokio::test]
   async fn test_start_and_stop_are_idempotent() {
      let scheduler = scheduler(FakeCheckpointer::new(0));
      assert!(!scheduler.is_running());

      scheduler.start();
      scheduler.start();
      assert!(scheduler.is_running());

      scheduler.stop();
      scheduler.stop();
      assert!(!scheduler.is_running());
   }

   #[tokio::test]
   async fn test_failed_ticks_do_not_stop_the_loop() {
      let failing = Arc::new(FailingCheckpointer {
         calls: AtomicUsize::new(0),
      });
      let mut config = FlowConfig::default();
      config.checkpoint.poll_interval = Duration::from_millis(10);

      let scheduler = CheckpointScheduler::new(failing.clone(), LiveConfig::new(config));
      scheduler.start();
      tokio::time::sleep(Duration::from_millis(150)).await;

      assert!(failing.calls.load(Ordering::SeqCst) >= 2);
      assert!(scheduler.is_running());
      scheduler.stop();
   }
}
