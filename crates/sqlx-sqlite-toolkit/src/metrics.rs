//! Counters for the write path and the checkpoint loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// How many executed statements are kept for inspection.
pub const RECENT_SQL_CAPACITY: usize = 50;

#[derive(Debug, Default)]
pub struct FlowMetrics {
   busy_retries: Arc<AtomicU64>,
   transactions: AtomicU64,
   failed_transactions: AtomicU64,
   transaction_micros: AtomicU64,
   checkpoints: AtomicU64,
   recent_sql: Mutex<VecDeque<String>>,
}

/// Point-in-time copy of [`FlowMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
   pub busy_retries: u64,
   pub transactions: u64,
   pub failed_transactions: u64,
   pub average_transaction_ms: f64,
   pub checkpoints: u64,
   /// Oldest first.
   pub recent_sql: Vec<String>,
}

impl FlowMetrics {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Counter incremented by [`RetryPolicy`](sqlx_sqlite_conn_mgr::RetryPolicy) on every retry.
   pub fn busy_counter(&self) -> Arc<AtomicU64> {
      Arc::clone(&self.busy_retries)
   }

   pub fn record_transaction(&self, elapsed: Duration) {
      self.transactions.fetch_add(1, Ordering::Relaxed);
      self
         .transaction_micros
         .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
   }

   pub fn record_failed_transaction(&self) {
      self.failed_transactions.fetch_add(1, Ordering::Relaxed);
   }

   pub fn record_checkpoint(&self) {
      self.checkpoints.fetch_add(1, Ordering::Relaxed);
   }

   pub fn record_sql(&self, sql: impl Into<String>) {
      let mut recent = self.recent_sql.lock();
      if recent.len() == RECENT_SQL_CAPACITY {
         recent.pop_front();
      }
      recent.push_back(sql.into());
   }

   pub fn snapshot(&self) -> MetricsSnapshot {
      let transactions = self.transactions.load(Ordering::Relaxed);
      let micros = self.transaction_micros.load(Ordering::Relaxed);
      let average_transaction_ms = if transactions == 0 {
         0.0
      } else {
         micros as f64 / transactions as f64 / 1000.0
      };

      MetricsSnapshot {
         busy_retries: self.busy_retries.load(Ordering::Relaxed),
         transactions,
         failed_transactions: self.failed_transactions.load(Ordering::Relaxed),
         average_transaction_ms,
         checkpoints: self.checkpoints.load(Ordering::Relaxed),
         recent_sql: self.recent_sql.lock().iter().cloned().collect(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_recent_sql_is_bounded() {
      let metrics = FlowMetrics::new();
      for i in 0..(RECENT_SQL_CAPACITY + 5) {
         metrics.record_sql(format!("SELECT {i}"));
      }

      let snapshot = metrics.snapshot();
      assert_eq!(snapshot.recent_sql.len(), RECENT_SQL_CAPACITY);
      assert_eq!(snapshot.recent_sql[0], "SELECT 5");
   }

   #[test]
   fn test_average_transaction_time() {
      let metrics = FlowMetrics::new();
      assert_eq!(metrics.snapshot().average_transaction_ms, 0.0);

      metrics.record_transaction(Duration::from_millis(10));
      metrics.record_transaction(Duration::from_millis(30));

      let snapshot = metrics.snapshot();
      assert_eq!(snapshot.transactions, 2);
      assert!((snapshot.average_transaction_ms - 20.0).abs() < f64::EPSILON);
   }

   #[test]
   fn test_busy_counter_is_shared() {
      let metrics = FlowMetrics::new();
      metrics.busy_counter().fetch_add(3, Ordering::Relaxed);
      assert_eq!(metrics.snapshot().busy_retries, 3);
   }

   #[test]
   fn test_snapshot_serializes_camel_case() {
      let json = serde_json::to_value(FlowMetrics::new().snapshot()).unwrap();
      assert!(json.get("busyRetries").is_some());
      assert!(json.get("averageTransactionMs").is_some());
   }
}
