//! Single-consumer write queue.
//!
//! Every write against a database goes through one [`WriteSerializer`]: submissions are
//! queued in FIFO order and executed one at a time by a single worker task, each inside
//! its own `BEGIN IMMEDIATE` / `COMMIT` transaction. With a single consumer there is
//! never more than one open write transaction, without any lock around the writer.
//!
//! A failing task rolls back its own transaction and rejects only its own handle; the
//! worker moves on to the next task. Transient lock failures (`SQLITE_BUSY`,
//! `SQLITE_LOCKED`) re-run the whole transaction with the live backoff settings, which
//! is why operations are `FnMut`.
//!
//! The worker suspends in three places only: waiting for the next task, sleeping
//! between retries, and awaiting SQLite.
//!
//! ## Shutdown
//!
//! [`WriteSerializer::close`] stops accepting work, lets the running task finish and
//! stops the worker. Handles of tasks still queued resolve to [`Error::TaskAbandoned`].
//! Dropping every serializer handle without closing drains the queue first.

use std::any::Any;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use sqlx::sqlite::SqliteConnection;
use sqlx_sqlite_conn_mgr::RetryPolicy;
use sqlx_sqlite_observer::ObservableSqliteDatabase;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::metrics::FlowMetrics;
use crate::{Error, Result};

/// Grouping key of [`WriteSerializer::submit_batch`].
pub const DEFAULT_GROUP_KEY: &str = "__default__";

/// Task registered with [`WriteSerializer::coalesce`].
pub type CoalescedTask =
   Box<dyn for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send>;

/// Called after every successful commit.
pub type CommitListener = Arc<dyn Fn() + Send + Sync>;

type Job = Box<dyn FnOnce(Arc<Worker>) -> BoxFuture<'static, ()> + Send>;

/// Handle to a database's write queue. Cloning shares the queue.
#[derive(Clone)]
pub struct WriteSerializer {
   shared: Arc<Shared>,
}

struct Shared {
   sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
   shutdown: Arc<Notify>,
   pending: Mutex<IndexMap<String, Vec<CoalescedTask>>>,
   worker: Arc<Worker>,
   handle: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Worker {
   db: ObservableSqliteDatabase,
   metrics: Arc<FlowMetrics>,
   on_commit: RwLock<Option<CommitListener>>,
}

impl WriteSerializer {
   /// Start the worker on the database's configured I/O runtime.
   pub fn spawn(db: ObservableSqliteDatabase, metrics: Arc<FlowMetrics>) -> Self {
      let (sender, receiver) = mpsc::unbounded_channel();
      let shutdown = Arc::new(Notify::new());
      let settings = db.inner().settings().clone();

      let worker = Arc::new(Worker {
         db,
         metrics,
         on_commit: RwLock::new(None),
      });

      let handle = settings.spawn(run_worker(
         Arc::clone(&worker),
         receiver,
         Arc::clone(&shutdown),
      ));

      Self {
         shared: Arc::new(Shared {
            sender: Mutex::new(Some(sender)),
            shutdown,
            pending: Mutex::new(IndexMap::new()),
            worker,
            handle: Mutex::new(Some(handle)),
         }),
      }
   }

   /// Run `op` in its own transaction.
   pub fn submit<T, F>(&self, op: F) -> WriteHandle<T>
   where
      T: Send + 'static,
      F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
   {
      self.enqueue(move |worker| async move {
         let mut body = Single::new(op);
         worker.transaction(&mut body).await
      })
   }

   /// Partition `items` by key and run `op` once per group, one transaction per group.
   ///
   /// Groups run in the order their key first appears and keep the relative order of
   /// their items. Results are concatenated in group order. The first failing group
   /// rejects the handle; groups before it stay committed and later ones do not run.
   pub fn submit_all<I, K, R, KS, F>(
      &self,
      items: impl IntoIterator<Item = I>,
      key_selector: KS,
      op: F,
   ) -> WriteHandle<Vec<R>>
   where
      I: Send + Sync + 'static,
      K: Hash + Eq,
      KS: FnMut(&I) -> K,
      R: Send + 'static,
      F: for<'c> FnMut(&'c mut SqliteConnection, &'c [I]) -> BoxFuture<'c, Result<Vec<R>>>
         + Send
         + 'static,
   {
      let groups = group_by_key(items, key_selector);

      self.enqueue(move |worker| async move {
         let mut op = op;
         let mut results = Vec::new();
         for items in &groups {
            let mut body = Group {
               op: &mut op,
               items: items.as_slice(),
               _output: PhantomData,
            };
            results.append(&mut worker.transaction(&mut body).await?);
         }
         Ok(results)
      })
   }

   /// [`submit_all`](Self::submit_all) with every item in one group.
   pub fn submit_batch<I, R, F>(&self, items: impl IntoIterator<Item = I>, op: F) -> WriteHandle<Vec<R>>
   where
      I: Send + Sync + 'static,
      R: Send + 'static,
      F: for<'c> FnMut(&'c mut SqliteConnection, &'c [I]) -> BoxFuture<'c, Result<Vec<R>>>
         + Send
         + 'static,
   {
      self.submit_all(items, |_| DEFAULT_GROUP_KEY, op)
   }

   /// Register `task` under `key` for the next [`flush_coalesced`](Self::flush_coalesced).
   ///
   /// Does not touch the database.
   pub fn coalesce<F>(&self, key: impl Into<String>, task: F)
   where
      F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send + 'static,
   {
      self
         .shared
         .pending
         .lock()
         .entry(key.into())
         .or_default()
         .push(Box::new(task));
   }

   /// Number of keys with coalesced tasks waiting for a flush.
   pub fn pending_coalesced(&self) -> usize {
      self.shared.pending.lock().len()
   }

   /// Take every coalesced task and run them, one transaction per key.
   ///
   /// Tasks coalesced after this call belong to the next flush.
   pub fn flush_coalesced(&self) -> WriteHandle<()> {
      let mut snapshot = std::mem::take(&mut *self.shared.pending.lock());
      trace!(keys = snapshot.len(), "Flushing coalesced tasks");

      self.enqueue(move |worker| async move {
         for (key, tasks) in snapshot.iter_mut() {
            trace!(key = %key, tasks = tasks.len(), "Running coalesced group");
            let mut body = Coalesced { tasks };
            worker.transaction(&mut body).await?;
         }
         Ok(())
      })
   }

   /// Run `op` on the write connection outside of any transaction.
   ///
   /// For statements SQLite refuses inside a transaction (`VACUUM`) and for WAL
   /// checkpoints. Transient failures are retried; the commit listener is not invoked.
   pub fn submit_exclusive<T, F>(&self, op: F) -> WriteHandle<T>
   where
      T: Send + 'static,
      F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
   {
      self.enqueue(move |worker| async move {
         let mut body = Single::new(op);
         worker.exclusive(&mut body).await
      })
   }

   /// Install (or clear) the listener invoked after every commit.
   pub fn set_commit_listener(&self, listener: Option<CommitListener>) {
      *self.shared.worker.on_commit.write() = listener;
   }

   pub fn database(&self) -> &ObservableSqliteDatabase {
      &self.shared.worker.db
   }

   pub fn metrics(&self) -> &Arc<FlowMetrics> {
      &self.shared.worker.metrics
   }

   pub fn is_closed(&self) -> bool {
      self.shared.sender.lock().is_none()
   }

   /// Stop accepting work, finish the running task and stop the worker.
   ///
   /// Queued tasks are abandoned. Coalesced tasks that were never flushed are dropped.
   pub async fn close(&self) {
      if self.shared.sender.lock().take().is_none() {
         return;
      }
      self.shared.shutdown.notify_one();

      let dropped = std::mem::take(&mut *self.shared.pending.lock()).len();
      if dropped > 0 {
         warn!(keys = dropped, "Dropping unflushed coalesced tasks");
      }

      let handle = self.shared.handle.lock().take();
      if let Some(handle) = handle
         && let Err(e) = handle.await
      {
         warn!(error = %e, "Write worker terminated abnormally");
      }
   }

   fn enqueue<T, F, Fut>(&self, task: F) -> WriteHandle<T>
   where
      T: Send + 'static,
      F: FnOnce(Arc<Worker>) -> Fut + Send + 'static,
      Fut: Future<Output = Result<T>> + Send + 'static,
   {
      let (tx, rx) = oneshot::channel();
      let job: Job = Box::new(move |worker| {
         async move {
            let result = task(worker).await;
            // The caller may have dropped the handle
            let _ = tx.send(result);
         }
         .boxed()
      });

      let sent = match self.shared.sender.lock().as_ref() {
         Some(sender) => sender.send(job).is_ok(),
         None => false,
      };

      if sent {
         WriteHandle::pending(rx)
      } else {
         WriteHandle::failed(Error::QueueClosed)
      }
   }
}

impl std::fmt::Debug for WriteSerializer {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("WriteSerializer")
         .field("path", &self.database().inner().path())
         .field("closed", &self.is_closed())
         .field("pending_coalesced", &self.pending_coalesced())
         .finish()
   }
}

async fn run_worker(
   worker: Arc<Worker>,
   mut receiver: mpsc::UnboundedReceiver<Job>,
   shutdown: Arc<Notify>,
) {
   debug!(path = %worker.db.inner().path().display(), "Write worker started");

   loop {
      let job = tokio::select! {
         biased;
         _ = shutdown.notified() => break,
         job = receiver.recv() => match job {
            Some(job) => job,
            // Every serializer handle is gone and the queue is drained
            None => break,
         },
      };

      if AssertUnwindSafe(job(Arc::clone(&worker)))
         .catch_unwind()
         .await
         .is_err()
      {
         warn!("Write job panicked outside of its transaction");
      }
   }

   receiver.close();
   let mut abandoned = 0usize;
   while receiver.try_recv().is_ok() {
      abandoned += 1;
   }
   debug!(abandoned, "Write worker stopped");
}

impl Worker {
   fn retry_policy(&self) -> RetryPolicy {
      RetryPolicy::from_config(&self.db.inner().settings().load())
         .with_counter(self.metrics.busy_counter())
   }

   async fn transaction<B: TransactionBody>(&self, body: &mut B) -> Result<B::Output> {
      let mut backoff = self.retry_policy().backoff();
      loop {
         match self.transaction_attempt(body).await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next_delay(&err) {
               Some(delay) => tokio::time::sleep(delay).await,
               None => {
                  self.metrics.record_failed_transaction();
                  return Err(err);
               }
            },
         }
      }
   }

   async fn transaction_attempt<B: TransactionBody>(&self, body: &mut B) -> Result<B::Output> {
      let mut writer = self.db.acquire_writer().await?;
      let started = Instant::now();

      sqlx::query("BEGIN IMMEDIATE").execute(&mut *writer).await?;

      match run_guarded(body.run(&mut *writer)).await {
         Ok(value) => match sqlx::query("COMMIT").execute(&mut *writer).await {
            Ok(_) => {
               // Releasing the writer publishes the committed changes
               drop(writer);
               self.metrics.record_transaction(started.elapsed());
               trace!(elapsed_us = started.elapsed().as_micros() as u64, "Committed");
               self.notify_commit();
               Ok(value)
            }
            Err(commit_err) => {
               // The commit hook has already staged this transaction's changes
               writer.discard_changes();
               Err(rollback(&mut writer, commit_err.into()).await)
            }
         },
         Err(err) => Err(rollback(&mut writer, err).await),
      }
   }

   async fn exclusive<B: TransactionBody>(&self, body: &mut B) -> Result<B::Output> {
      let mut backoff = self.retry_policy().backoff();
      loop {
         match self.exclusive_attempt(body).await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next_delay(&err) {
               Some(delay) => tokio::time::sleep(delay).await,
               None => return Err(err),
            },
         }
      }
   }

   async fn exclusive_attempt<B: TransactionBody>(&self, body: &mut B) -> Result<B::Output> {
      let mut writer = self.db.acquire_writer().await?;
      run_guarded(body.run(&mut *writer)).await
   }

   fn notify_commit(&self) {
      let listener = self.on_commit.read().clone();
      if let Some(listener) = listener {
         listener();
      }
   }
}

async fn rollback(conn: &mut SqliteConnection, err: Error) -> Error {
   match sqlx::query("ROLLBACK").execute(&mut *conn).await {
      // Rollback succeeded, return original error
      Ok(_) => err,

      // Rollback also failed, return the rollback error and the original error
      Err(rollback_err) => Error::TransactionRollbackFailed {
         transaction_error: err.to_string(),
         rollback_error: rollback_err.to_string(),
      },
   }
}

async fn run_guarded<T>(future: BoxFuture<'_, Result<T>>) -> Result<T> {
   match AssertUnwindSafe(future).catch_unwind().await {
      Ok(result) => result,
      Err(panic) => Err(Error::TaskPanicked(panic_message(&*panic))),
   }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
   if let Some(message) = panic.downcast_ref::<&str>() {
      message.to_string()
   } else if let Some(message) = panic.downcast_ref::<String>() {
      message.clone()
   } else {
      "unknown panic".to_string()
   }
}

/// Partition preserving first-seen key order and intra-group item order.
pub(crate) fn group_by_key<I, K, KS>(items: impl IntoIterator<Item = I>, mut key_selector: KS) -> Vec<Vec<I>>
where
   K: Hash + Eq,
   KS: FnMut(&I) -> K,
{
   let mut groups: IndexMap<K, Vec<I>> = IndexMap::new();
   for item in items {
      groups.entry(key_selector(&item)).or_default().push(item);
   }
   groups.into_values().collect()
}

/// Work executed on the write connection, possibly several times when retried.
trait TransactionBody: Send {
   type Output: Send;

   fn run<'c>(&'c mut self, conn: &'c mut SqliteConnection) -> BoxFuture<'c, Result<Self::Output>>;
}

struct Single<F, T> {
   op: F,
   _output: PhantomData<fn() -> T>,
}

impl<F, T> Single<F, T> {
   fn new(op: F) -> Self {
      Self {
         op,
         _output: PhantomData,
      }
   }
}

impl<F, T> TransactionBody for Single<F, T>
where
   F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
   T: Send,
{
   type Output = T;

   fn run<'c>(&'c mut self, conn: &'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> {
      (self.op)(conn)
   }
}

struct Group<'g, F, I, R> {
   op: &'g mut F,
   items: &'g [I],
   _output: PhantomData<fn() -> R>,
}

impl<F, I, R> TransactionBody for Group<'_, F, I, R>
where
   F: for<'c> FnMut(&'c mut SqliteConnection, &'c [I]) -> BoxFuture<'c, Result<Vec<R>>> + Send,
   I: Sync,
   R: Send,
{
   type Output = Vec<R>;

   fn run<'c>(&'c mut self, conn: &'c mut SqliteConnection) -> BoxFuture<'c, Result<Vec<R>>> {
      (self.op)(conn, self.items)
   }
}

struct Coalesced<'g> {
   tasks: &'g mut Vec<CoalescedTask>,
}

impl TransactionBody for Coalesced<'_> {
   type Output = ();

   fn run<'c>(&'c mut self, conn: &'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> {
      Box::pin(async move {
         for task in self.tasks.iter_mut() {
            task(&mut *conn).await?;
         }
         Ok(())
      })
   }
}

/// Result of a queued write; resolves once the task committed, failed or was dropped.
#[must_use = "the write is queued regardless; await the handle to observe its result"]
pub struct WriteHandle<T> {
   state: HandleState<T>,
}

enum HandleState<T> {
   Pending(oneshot::Receiver<Result<T>>),
   Failed(Option<Error>),
}

impl<T> WriteHandle<T> {
   fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
      Self {
         state: HandleState::Pending(rx),
      }
   }

   /// A handle that resolves immediately to `err`.
   pub fn failed(err: Error) -> Self {
      Self {
         state: HandleState::Failed(Some(err)),
      }
   }
}

impl<T> Future for WriteHandle<T> {
   type Output = Result<T>;

   fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
      match &mut self.get_mut().state {
         HandleState::Pending(rx) => Pin::new(rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            // The worker dropped the task without running it
            Err(_) => Err(Error::TaskAbandoned),
         }),
         HandleState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(Error::TaskAbandoned))),
      }
   }
}

impl<T> std::fmt::Debug for WriteHandle<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let state = match &self.state {
         HandleState::Pending(_) => "pending",
         HandleState::Failed(_) => "failed",
      };
      f.debug_struct("WriteHandle").field("state", &state).finish()
   }
}
