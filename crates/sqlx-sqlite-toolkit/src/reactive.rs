//! Queries that re-run whenever the tables they read change.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use sqlx::{Pool, Sqlite};
use sqlx_sqlite_conn_mgr::{LiveConfig, RetryPolicy};
use sqlx_sqlite_observer::{InvalidationStream, ObservableSqliteDatabase};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::WatchStream;
use tracing::{trace, warn};

use crate::Result;

/// Latest result of a query re-executed on every change to its tables.
///
/// As a [`Stream`], yields each newly completed result; intermediate results are skipped
/// when the consumer is slower than the database. Dropping it stops re-execution.
pub struct ReactiveQuery<T> {
   values: Pin<Box<dyn Stream<Item = T> + Send>>,
   latest: watch::Receiver<Option<T>>,
   driver: JoinHandle<()>,
}

/// Run `read` now and again after every commit touching `tables`.
///
/// Each execution runs on the configured I/O runtime, retried on busy errors. Runs may
/// overlap; whichever completes last is the current value. A run that still fails after
/// retrying is logged and leaves the previous value in place.
pub fn reactive_query<T, F, Fut, I, S>(
   db: &ObservableSqliteDatabase,
   tables: I,
   read: F,
) -> Result<ReactiveQuery<T>>
where
   T: Clone + Send + Sync + 'static,
   F: Fn(Pool<Sqlite>) -> Fut + Send + Sync + 'static,
   Fut: Future<Output = std::result::Result<T, sqlx::Error>> + Send + 'static,
   I: IntoIterator<Item = S>,
   S: AsRef<str>,
{
   let pool = db.read_pool()?.clone();
   let invalidations = db.subscribe(tables);
   let settings = db.inner().settings().clone();
   let (tx, rx) = watch::channel(None);

   let driver = db
      .inner()
      .settings()
      .spawn(drive(invalidations, pool, settings, Arc::new(read), tx));

   let values = WatchStream::new(rx.clone()).filter_map(futures::future::ready);

   Ok(ReactiveQuery {
      values: Box::pin(values),
      latest: rx,
      driver,
   })
}

impl<T: Clone> ReactiveQuery<T> {
   /// Most recently completed result, if any run has completed yet.
   pub fn latest(&self) -> Option<T> {
      self.latest.borrow().clone()
   }
}

impl<T> Stream for ReactiveQuery<T> {
   type Item = T;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
      self.get_mut().values.as_mut().poll_next(cx)
   }
}

impl<T> Drop for ReactiveQuery<T> {
   fn drop(&mut self) {
      self.driver.abort();
   }
}

impl<T> std::fmt::Debug for ReactiveQuery<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ReactiveQuery")
         .field("finished", &self.driver.is_finished())
         .finish()
   }
}

async fn drive<T, F, Fut>(
   mut invalidations: InvalidationStream,
   pool: Pool<Sqlite>,
   settings: LiveConfig,
   read: Arc<F>,
   tx: watch::Sender<Option<T>>,
) where
   T: Send + Sync + 'static,
   F: Fn(Pool<Sqlite>) -> Fut + Send + Sync + 'static,
   Fut: Future<Output = std::result::Result<T, sqlx::Error>> + Send + 'static,
{
   let mut reads = JoinSet::new();

   loop {
      tokio::select! {
         event = invalidations.next() => {
            let Some(event) = event else { break };
            trace!(generation = event.generation, initial = event.initial, "Re-running reactive query");

            let config = settings.load();
            let policy = RetryPolicy::from_config(&config);
            let pool = pool.clone();
            let read = Arc::clone(&read);
            let run = async move { policy.run(|| read(pool.clone())).await };

            match &config.io_runtime {
               Some(handle) => reads.spawn_on(run, handle),
               None => reads.spawn(run),
            };
         }
         Some(done) = reads.join_next(), if !reads.is_empty() => match done {
            Ok(Ok(value)) => {
               tx.send_replace(Some(value));
            }
            Ok(Err(e)) => warn!(error = %e, "Reactive query failed"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "Reactive query task panicked"),
         },
         _ = tx.closed() => break,
      }
   }

   reads.abort_all();
}
