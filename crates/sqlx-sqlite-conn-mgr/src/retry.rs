//! Busy/locked retry with exponential backoff.
//!
//! SQLite allows a single writer. Anything contending for the write lock (another
//! process, a checkpoint, a direct connection) fails with `SQLITE_BUSY` or `SQLITE_LOCKED`
//! instead of waiting, because the pools are opened with a zero busy timeout. Those
//! failures are absorbed here: the operation is re-run after a delay that starts at
//! `initial_delay` and doubles up to `max_delay`, for at most `max_attempts` attempts.
//! Any other error, or the last transient one, is returned immediately.
//!
//! There is no wall-clock deadline; the worst-case added latency is the sum of the
//! bounded delay series.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::config::FlowConfig;

/// `SQLITE_BUSY`
const SQLITE_BUSY: i32 = 5;
/// `SQLITE_LOCKED`
const SQLITE_LOCKED: i32 = 6;

/// Classifies errors that are worth retrying because another connection holds a lock.
pub trait Transient {
   fn is_transient(&self) -> bool;
}

impl Transient for sqlx::Error {
   fn is_transient(&self) -> bool {
      matches!(
         sqlite_primary_code(self),
         Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)
      )
   }
}

/// Primary SQLite result code of a database error.
///
/// SQLx reports the extended code (e.g. `517` for `SQLITE_BUSY_SNAPSHOT`); the primary
/// code is its low byte.
pub fn sqlite_primary_code(err: &sqlx::Error) -> Option<i32> {
   err.as_database_error()
      .and_then(|db_err| db_err.code())
      .and_then(|code| code.parse::<i32>().ok())
      .map(|code| code & 0xff)
}

/// Retry policy for transient lock failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
   /// Total attempts, the first one included. Zero is treated as one.
   pub max_attempts: u32,
   pub initial_delay: Duration,
   pub max_delay: Duration,
   pub multiplier: u32,
   counter: Option<Arc<AtomicU64>>,
}

impl RetryPolicy {
   pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
      Self {
         max_attempts,
         initial_delay,
         max_delay,
         multiplier: 2,
         counter: None,
      }
   }

   /// Policy reflecting the current busy-retry settings.
   pub fn from_config(config: &FlowConfig) -> Self {
      Self::new(
         config.busy_max_attempts,
         config.busy_initial_delay,
         config.busy_max_delay,
      )
   }

   /// Count every scheduled retry into `counter`.
   pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
      self.counter = Some(counter);
      self
   }

   /// Fresh backoff state for one logical operation.
   pub fn backoff(&self) -> Backoff {
      Backoff {
         attempt: 1,
         max_attempts: self.max_attempts.max(1),
         delay: self.initial_delay.max(Duration::from_millis(1)),
         max_delay: self.max_delay,
         multiplier: self.multiplier.max(1),
         counter: self.counter.clone(),
      }
   }

   /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
   pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
   where
      E: Transient + Display,
      F: FnMut() -> Fut,
      Fut: Future<Output = Result<T, E>>,
   {
      self.run_classified(<E as Transient>::is_transient, op).await
   }

   /// Like [`run`](Self::run) with an explicit transient-error classifier.
   pub async fn run_classified<T, E, C, F, Fut>(&self, classify: C, mut op: F) -> Result<T, E>
   where
      E: Display,
      C: Fn(&E) -> bool,
      F: FnMut() -> Fut,
      Fut: Future<Output = Result<T, E>>,
   {
      let mut backoff = self.backoff();
      loop {
         match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next_delay_classified(&err, &classify) {
               Some(delay) => tokio::time::sleep(delay).await,
               None => return Err(err),
            },
         }
      }
   }
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self::from_config(&FlowConfig::default())
   }
}

/// Backoff state of a single retried operation.
///
/// Useful where each attempt needs mutable access to state that a closure-based
/// [`RetryPolicy::run`] cannot lend out, such as a held connection.
#[derive(Debug)]
pub struct Backoff {
   attempt: u32,
   max_attempts: u32,
   delay: Duration,
   max_delay: Duration,
   multiplier: u32,
   counter: Option<Arc<AtomicU64>>,
}

impl Backoff {
   /// The attempt currently being made, starting at 1.
   pub fn attempt(&self) -> u32 {
      self.attempt
   }

   /// Delay before the next attempt, or `None` if `err` must be returned to the caller.
   pub fn next_delay<E>(&mut self, err: &E) -> Option<Duration>
   where
      E: Transient + Display,
   {
      self.next_delay_classified(err, <E as Transient>::is_transient)
   }

   pub fn next_delay_classified<E, C>(&mut self, err: &E, classify: C) -> Option<Duration>
   where
      E: Display,
      C: Fn(&E) -> bool,
   {
      if !classify(err) || self.attempt >= self.max_attempts {
         return None;
      }

      let delay = self.delay;
      warn!(
         attempt = self.attempt,
         delay_ms = delay.as_millis() as u64,
         error = %err,
         "Database busy, retrying"
      );

      self.delay = self
         .delay
         .saturating_mul(self.multiplier)
         .min(self.max_delay.max(Duration::from_millis(1)));
      self.attempt += 1;
      if let Some(counter) = &self.counter {
         counter.fetch_add(1, Ordering::Relaxed);
      }
      Some(delay)
   }
}
