use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};
use sqlx_sqlite_conn_mgr::SqliteDatabase;
use sqlx_sqlite_observer::ObservableSqliteDatabase;
use sqlx_sqlite_toolkit::{Error, FlowMetrics, WriteSerializer};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;

struct TestStore {
   serializer: WriteSerializer,
   observable: ObservableSqliteDatabase,
   temp_dir: TempDir,
}

impl TestStore {
   fn db_path(&self) -> std::path::PathBuf {
      self.temp_dir.path().join("test.db")
   }

   async fn count(&self) -> i64 {
      sqlx::query_scalar("SELECT COUNT(*) FROM items")
         .fetch_one(self.observable.read_pool().unwrap())
         .await
         .unwrap()
   }
}

async fn create_test_store() -> TestStore {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let db = SqliteDatabase::connect(temp_dir.path().join("test.db"), None)
      .await
      .expect("Failed to connect to test database");
   let observable = ObservableSqliteDatabase::new(db);
   let serializer = WriteSerializer::spawn(observable.clone(), FlowMetrics::new());

   serializer
      .execute(
         "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, tag TEXT)",
         vec![],
      )
      .await
      .unwrap();

   TestStore {
      serializer,
      observable,
      temp_dir,
   }
}

fn insert(serializer: &WriteSerializer, name: &str) -> sqlx_sqlite_toolkit::WriteHandle<i64> {
   let name = name.to_string();
   serializer.submit(move |conn| {
      let name = name.clone();
      Box::pin(async move {
         let result = sqlx::query("INSERT INTO items (name) VALUES (?)")
            .bind(name)
            .execute(&mut *conn)
            .await?;
         Ok(result.last_insert_rowid())
      })
   })
}

// ============================================================================
// Ordering and isolation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_open_transaction() {
   let store = create_test_store().await;
   let open = Arc::new(AtomicUsize::new(0));
   let max_open = Arc::new(AtomicUsize::new(0));

   let mut tasks = Vec::new();
   for i in 0..20 {
      let serializer = store.serializer.clone();
      let open = open.clone();
      let max_open = max_open.clone();
      tasks.push(tokio::spawn(async move {
         serializer
            .submit(move |conn| {
               let open = open.clone();
               let max_open = max_open.clone();
               Box::pin(async move {
                  let now_open = open.fetch_add(1, Ordering::SeqCst) + 1;
                  max_open.fetch_max(now_open, Ordering::SeqCst);
                  tokio::time::sleep(Duration::from_millis(2)).await;
                  sqlx::query("INSERT INTO items (name) VALUES (?)")
                     .bind(format!("item-{i}"))
                     .execute(&mut *conn)
                     .await?;
                  open.fetch_sub(1, Ordering::SeqCst);
                  Ok(())
               })
            })
            .await
      }));
   }

   for task in tasks {
      task.await.unwrap().unwrap();
   }

   assert_eq!(max_open.load(Ordering::SeqCst), 1);
   assert_eq!(store.count().await, 20);
}

#[tokio::test]
async fn test_tasks_run_in_submission_order() {
   let store = create_test_store().await;
   let events = Arc::new(Mutex::new(Vec::new()));

   let submit = |label: &'static str, delay: u64| {
      let events = events.clone();
      store.serializer.submit(move |_conn| {
         let events = events.clone();
         Box::pin(async move {
            events.lock().unwrap().push(format!("begin {label}"));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            events.lock().unwrap().push(format!("end {label}"));
            Ok(())
         })
      })
   };

   let a = submit("A", 30);
   let b = submit("B", 0);
   b.await.unwrap();
   a.await.unwrap();

   assert_eq!(
      *events.lock().unwrap(),
      vec!["begin A", "end A", "begin B", "end B"]
   );
}

#[tokio::test]
async fn test_failed_task_does_not_affect_others() {
   let store = create_test_store().await;

   let failing = store.serializer.submit(|conn| {
      Box::pin(async move {
         sqlx::query("INSERT INTO items (name) VALUES ('doomed')")
            .execute(&mut *conn)
            .await?;
         Err::<(), _>(Error::Other("rejected".into()))
      })
   });
   let succeeding = insert(&store.serializer, "kept");

   assert!(matches!(failing.await, Err(Error::Other(msg)) if msg == "rejected"));
   succeeding.await.unwrap();

   let names: Vec<String> = sqlx::query_scalar("SELECT name FROM items")
      .fetch_all(store.observable.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(names, vec!["kept"]);

   let metrics = store.serializer.metrics().snapshot();
   assert_eq!(metrics.failed_transactions, 1);
   assert_eq!(metrics.busy_retries, 0);
}

#[tokio::test]
async fn test_constraint_violation_is_not_retried() {
   let store = create_test_store().await;
   insert(&store.serializer, "dup").await.unwrap();

   let err = insert(&store.serializer, "dup").await.unwrap_err();
   assert_eq!(err.error_code(), "SQLITE_2067");
   assert_eq!(store.serializer.metrics().snapshot().busy_retries, 0);
}

#[tokio::test]
async fn test_panicking_task_is_rolled_back() {
   let store = create_test_store().await;

   let panicking = store.serializer.submit::<(), _>(|conn| {
      Box::pin(async move {
         sqlx::query("INSERT INTO items (name) VALUES ('half-done')")
            .execute(&mut *conn)
            .await?;
         panic!("boom")
      })
   });

   assert!(matches!(panicking.await, Err(Error::TaskPanicked(msg)) if msg == "boom"));

   // The worker keeps going
   insert(&store.serializer, "after").await.unwrap();
   assert_eq!(store.count().await, 1);
}

// ============================================================================
// Grouping
// ============================================================================

#[tokio::test]
async fn test_submit_all_groups_by_first_seen_key() {
   let store = create_test_store().await;
   let calls = Arc::new(Mutex::new(Vec::<Vec<&'static str>>::new()));

   let recorded = calls.clone();
   let results = store
      .serializer
      .submit_all(
         vec!["x", "y", "z"],
         |item| if *item == "y" { 'b' } else { 'a' },
         move |_conn, items| {
            let recorded = recorded.clone();
            Box::pin(async move {
               recorded.lock().unwrap().push(items.to_vec());
               Ok(items.iter().map(|item| item.to_uppercase()).collect())
            })
         },
      )
      .await
      .unwrap();

   assert_eq!(*calls.lock().unwrap(), vec![vec!["x", "z"], vec!["y"]]);
   assert_eq!(results, vec!["X", "Z", "Y"]);
}

#[tokio::test]
async fn test_thirty_names_batched_by_first_letter() {
   let store = create_test_store().await;
   let names: Vec<String> = [
      "alice", "adam", "bob", "bella", "carol", "chris", "dave", "diana", "erin", "ed", "frank",
      "fiona", "grace", "gus", "heidi", "hank", "ivan", "iris", "judy", "jack", "mallory", "mike",
      "oscar", "olga", "peggy", "pat", "trent", "tina", "victor", "walter",
   ]
   .iter()
   .map(|name| name.to_string())
   .collect();
   assert_eq!(names.len(), 30);

   let distinct_letters = names
      .iter()
      .filter_map(|name| name.chars().next())
      .collect::<std::collections::HashSet<_>>()
      .len();

   let batch_calls = Arc::new(AtomicUsize::new(0));
   let counter = batch_calls.clone();
   let inserted = store
      .serializer
      .submit_all(
         names,
         |name| name.chars().next(),
         move |conn, group| {
            let counter = counter.clone();
            Box::pin(async move {
               counter.fetch_add(1, Ordering::SeqCst);
               let mut builder: QueryBuilder<Sqlite> =
                  QueryBuilder::new("INSERT INTO items (name, tag) ");
               builder.push_values(group.iter(), |mut row, name| {
                  row.push_bind(name.clone())
                     .push_bind(name[..1].to_string());
               });
               let result = builder.build().execute(&mut *conn).await?;
               Ok(vec![result.rows_affected()])
            })
         },
      )
      .await
      .unwrap();

   let calls = batch_calls.load(Ordering::SeqCst);
   assert_eq!(calls, distinct_letters);
   assert!(calls <= 26);
   assert_eq!(inserted.iter().sum::<u64>(), 30);
   assert_eq!(store.count().await, 30);

   // One transaction per group
   let metrics = store.serializer.metrics().snapshot();
   assert_eq!(metrics.transactions as usize, 1 + distinct_letters);
}

#[tokio::test]
async fn test_submit_all_stops_at_first_failing_group() {
   let store = create_test_store().await;
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = calls.clone();

   let result = store
      .serializer
      .submit_all(
         vec!["ok-1", "bad", "ok-2"],
         |name| name.to_string(),
         move |conn, group| {
            let counter = counter.clone();
            Box::pin(async move {
               counter.fetch_add(1, Ordering::SeqCst);
               if group[0] == "bad" {
                  return Err(Error::Other("bad group".into()));
               }
               sqlx::query("INSERT INTO items (name) VALUES (?)")
                  .bind(group[0])
                  .execute(&mut *conn)
                  .await?;
               Ok(vec![()])
            })
         },
      )
      .await;

   assert!(result.is_err());
   assert_eq!(calls.load(Ordering::SeqCst), 2);
   assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn test_empty_batch_never_invokes_op() {
   let store = create_test_store().await;
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = calls.clone();

   let results = store
      .serializer
      .submit_batch(Vec::<String>::new(), move |_conn, _items| {
         counter.fetch_add(1, Ordering::SeqCst);
         Box::pin(async move { Ok(vec![0u8]) })
      })
      .await
      .unwrap();

   assert!(results.is_empty());
   assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Coalescing
// ============================================================================

fn coalesce_insert(serializer: &WriteSerializer, key: &str, name: &'static str, ran: Arc<AtomicUsize>) {
   serializer.coalesce(key, move |conn| {
      let ran = ran.clone();
      Box::pin(async move {
         ran.fetch_add(1, Ordering::SeqCst);
         sqlx::query("INSERT INTO items (name) VALUES (?)")
            .bind(name)
            .execute(&mut *conn)
            .await?;
         Ok(())
      })
   });
}

#[tokio::test]
async fn test_coalesced_tasks_share_one_transaction() {
   let store = create_test_store().await;
   let ran = Arc::new(AtomicUsize::new(0));
   let before = store.serializer.metrics().snapshot().transactions;

   coalesce_insert(&store.serializer, "user:1", "first", ran.clone());
   coalesce_insert(&store.serializer, "user:1", "second", ran.clone());
   assert_eq!(store.serializer.pending_coalesced(), 1);
   // Nothing touches the database before the flush
   assert_eq!(store.count().await, 0);

   store.serializer.flush_coalesced().await.unwrap();

   assert_eq!(ran.load(Ordering::SeqCst), 2);
   assert_eq!(store.count().await, 2);
   assert_eq!(store.serializer.metrics().snapshot().transactions, before + 1);
}

#[tokio::test]
async fn test_failing_coalesced_task_rolls_back_its_key() {
   let store = create_test_store().await;
   let ran = Arc::new(AtomicUsize::new(0));

   coalesce_insert(&store.serializer, "user:1", "first", ran.clone());
   store.serializer.coalesce("user:1", |_conn| {
      Box::pin(async move { Err(Error::Other("second failed".into())) })
   });

   assert!(store.serializer.flush_coalesced().await.is_err());
   assert_eq!(ran.load(Ordering::SeqCst), 1);
   assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn test_tasks_coalesced_after_snapshot_wait_for_next_flush() {
   let store = create_test_store().await;
   let early = Arc::new(AtomicUsize::new(0));
   let late = Arc::new(AtomicUsize::new(0));

   coalesce_insert(&store.serializer, "user:1", "early", early.clone());
   let flush = store.serializer.flush_coalesced();
   coalesce_insert(&store.serializer, "user:1", "late", late.clone());

   flush.await.unwrap();
   assert_eq!(early.load(Ordering::SeqCst), 1);
   assert_eq!(late.load(Ordering::SeqCst), 0);
   assert_eq!(store.serializer.pending_coalesced(), 1);

   store.serializer.flush_coalesced().await.unwrap();
   assert_eq!(late.load(Ordering::SeqCst), 1);
   assert_eq!(store.count().await, 2);
}

// ============================================================================
// Busy retry
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_database_is_retried() {
   let store = create_test_store().await;

   let options = SqliteConnectOptions::new()
      .filename(store.db_path())
      .busy_timeout(Duration::ZERO);
   let mut blocker = SqliteConnection::connect_with(&options).await.unwrap();
   sqlx::query("BEGIN IMMEDIATE")
      .execute(&mut blocker)
      .await
      .unwrap();

   let release = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      sqlx::query("COMMIT").execute(&mut blocker).await.unwrap();
      blocker
   });

   insert(&store.serializer, "patient").await.unwrap();
   release.await.unwrap().close().await.unwrap();

   assert_eq!(store.count().await, 1);
   assert!(store.serializer.metrics().snapshot().busy_retries >= 1);
}

// ============================================================================
// Commit side effects
// ============================================================================

#[tokio::test]
async fn test_commit_publishes_invalidation() {
   let store = create_test_store().await;
   let mut stream = store.observable.subscribe(["items"]);
   assert!(stream.next().await.unwrap().initial);

   insert(&store.serializer, "visible").await.unwrap();

   let invalidation = timeout(Duration::from_millis(500), stream.next())
      .await
      .unwrap()
      .unwrap();
   assert!(invalidation.touches("items"));

   // Subscribers see the committed row
   assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn test_rolled_back_task_publishes_nothing() {
   let store = create_test_store().await;
   let mut stream = store.observable.subscribe(["items"]);
   assert!(stream.next().await.unwrap().initial);

   let result = store
      .serializer
      .submit(|conn| {
         Box::pin(async move {
            sqlx::query("INSERT INTO items (name) VALUES ('ghost')")
               .execute(&mut *conn)
               .await?;
            Err::<(), _>(Error::Other("abort".into()))
         })
      })
      .await;
   assert!(result.is_err());

   assert!(
      timeout(Duration::from_millis(50), stream.next())
         .await
         .is_err()
   );
}

#[tokio::test]
async fn test_failed_commit_publishes_nothing() {
   let store = create_test_store().await;
   store
      .serializer
      .execute("CREATE TABLE owners (id INTEGER PRIMARY KEY)", vec![])
      .await
      .unwrap();
   store
      .serializer
      .execute(
         "CREATE TABLE pets (id INTEGER PRIMARY KEY, owner_id INTEGER NOT NULL \
          REFERENCES owners(id) DEFERRABLE INITIALLY DEFERRED)",
         vec![],
      )
      .await
      .unwrap();

   let mut stream = store.observable.subscribe(["pets"]);
   assert!(stream.next().await.unwrap().initial);

   // The deferred foreign key check only fails at COMMIT
   let commits = Arc::new(AtomicUsize::new(0));
   let counter = commits.clone();
   store
      .serializer
      .set_commit_listener(Some(Arc::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
      })));
   let result = store
      .serializer
      .execute("INSERT INTO pets (owner_id) VALUES (42)", vec![])
      .await;
   assert!(matches!(result, Err(Error::Sqlx(_))));
   assert_eq!(commits.load(Ordering::SeqCst), 0);
   assert_eq!(store.serializer.metrics().snapshot().failed_transactions, 1);

   assert!(
      timeout(Duration::from_millis(50), stream.next())
         .await
         .is_err()
   );

   let pets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pets")
      .fetch_one(store.observable.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(pets, 0);

   // The writer is usable again afterwards
   insert(&store.serializer, "after").await.unwrap();
   assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn test_commit_listener_runs_after_commits_only() {
   let store = create_test_store().await;
   let commits = Arc::new(AtomicUsize::new(0));
   let counter = commits.clone();
   store
      .serializer
      .set_commit_listener(Some(Arc::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
      })));

   insert(&store.serializer, "one").await.unwrap();
   assert_eq!(commits.load(Ordering::SeqCst), 1);

   // Failed and exclusive jobs do not count as commits
   let _ = insert(&store.serializer, "one").await;
   store.serializer.analyze().await.unwrap();
   assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_executed_sql_is_recorded() {
   let store = create_test_store().await;
   store
      .serializer
      .execute("INSERT INTO items (name) VALUES (?)", vec![serde_json::json!("n")])
      .await
      .unwrap();

   let recent = store.serializer.metrics().snapshot().recent_sql;
   assert_eq!(
      recent.last().map(String::as_str),
      Some("INSERT INTO items (name) VALUES (?)")
   );
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_close_finishes_running_task_and_abandons_queue() {
   let store = create_test_store().await;
   let started = Arc::new(Notify::new());

   let signal = started.clone();
   let running = store.serializer.submit(move |conn| {
      let signal = signal.clone();
      Box::pin(async move {
         signal.notify_one();
         tokio::time::sleep(Duration::from_millis(50)).await;
         sqlx::query("INSERT INTO items (name) VALUES ('in-flight')")
            .execute(&mut *conn)
            .await?;
         Ok(())
      })
   });
   started.notified().await;

   let queued = insert(&store.serializer, "queued");
   store.serializer.close().await;

   running.await.unwrap();
   assert!(matches!(queued.await, Err(Error::TaskAbandoned)));
   assert_eq!(store.count().await, 1);

   assert!(store.serializer.is_closed());
   assert!(matches!(
      insert(&store.serializer, "late").await,
      Err(Error::QueueClosed)
   ));

   // Closing twice is fine
   store.serializer.close().await;
}

#[tokio::test]
async fn test_dropping_serializer_drains_queue() {
   let store = create_test_store().await;
   let handles: Vec<_> = ["a", "b", "c"]
      .iter()
      .map(|name| insert(&store.serializer, name))
      .collect();

   let TestStore {
      serializer,
      observable,
      temp_dir,
   } = store;
   drop(serializer);

   for handle in handles {
      handle.await.unwrap();
   }

   let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
      .fetch_one(observable.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(count, 3);
   drop(temp_dir);
}
