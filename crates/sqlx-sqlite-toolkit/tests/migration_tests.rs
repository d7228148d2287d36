use sqlx_sqlite_conn_mgr::SqliteDatabase;
use sqlx_sqlite_observer::ObservableSqliteDatabase;
use sqlx_sqlite_toolkit::migration::{
   ExpectedColumn, ExpectedSchema, ExpectedTable, compare_schema, migrate,
};
use sqlx_sqlite_toolkit::{FlowMetrics, WriteSerializer};
use tempfile::TempDir;

async fn create_test_store() -> (ObservableSqliteDatabase, WriteSerializer, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let db = SqliteDatabase::connect(temp_dir.path().join("test.db"), None)
      .await
      .expect("Failed to connect to test database");
   let observable = ObservableSqliteDatabase::new(db);
   let serializer = WriteSerializer::spawn(observable.clone(), FlowMetrics::new());
   (observable, serializer, temp_dir)
}

fn schema_v2() -> ExpectedSchema {
   ExpectedSchema {
      tables: vec![
         ExpectedTable {
            name: "users".into(),
            columns: vec![
               ExpectedColumn::new("id", "INTEGER").primary_key(),
               ExpectedColumn::new("name", "TEXT").not_null(),
               ExpectedColumn::new("age", "INTEGER").not_null(),
            ],
         },
         ExpectedTable {
            name: "sessions".into(),
            columns: vec![
               ExpectedColumn::new("token", "TEXT").primary_key(),
               ExpectedColumn::new("user_id", "INTEGER").not_null(),
            ],
         },
      ],
   }
}

#[tokio::test]
async fn test_migrate_creates_missing_tables() {
   let (observable, serializer, _temp_dir) = create_test_store().await;

   let diff = migrate(&serializer, &schema_v2()).await.unwrap();
   assert_eq!(diff.missing_tables.len(), 2);
   assert!(diff.missing_columns.is_empty());

   let mut conn = observable.read_pool().unwrap().acquire().await.unwrap();
   let remaining = compare_schema(&mut conn, &schema_v2()).await.unwrap();
   assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_migrate_adds_columns_to_populated_table() {
   let (observable, serializer, _temp_dir) = create_test_store().await;
   serializer
      .execute("CREATE TABLE Users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", vec![])
      .await
      .unwrap();
   serializer
      .execute("INSERT INTO users (name) VALUES ('Alice')", vec![])
      .await
      .unwrap();

   let diff = migrate(&serializer, &schema_v2()).await.unwrap();

   // "Users" matches "users"; only the new column and the new table are missing
   assert_eq!(diff.missing_tables.len(), 1);
   assert_eq!(diff.missing_tables[0].name, "sessions");
   let added: Vec<&str> = diff.missing_columns["users"]
      .iter()
      .map(|column| column.name.as_str())
      .collect();
   assert_eq!(added, vec!["age"]);

   let age: i64 = sqlx::query_scalar("SELECT age FROM users WHERE name = 'Alice'")
      .fetch_one(observable.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(age, 0);
}

#[tokio::test]
async fn test_migrate_is_idempotent() {
   let (_observable, serializer, _temp_dir) = create_test_store().await;

   migrate(&serializer, &schema_v2()).await.unwrap();
   let second = migrate(&serializer, &schema_v2()).await.unwrap();

   assert!(second.is_empty());
   let recent = serializer.metrics().snapshot().recent_sql;
   assert_eq!(recent.len(), 2);
   assert!(recent.iter().all(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS")));
}

#[tokio::test]
async fn test_invalid_schema_changes_nothing() {
   let (observable, serializer, _temp_dir) = create_test_store().await;
   let mut schema = schema_v2();
   schema.tables.push(ExpectedTable {
      name: "bad name".into(),
      columns: vec![ExpectedColumn::new("id", "INTEGER")],
   });

   let err = migrate(&serializer, &schema).await.unwrap_err();
   assert_eq!(err.error_code(), "INVALID_IDENTIFIER");

   let mut conn = observable.read_pool().unwrap().acquire().await.unwrap();
   let diff = compare_schema(&mut conn, &schema_v2()).await.unwrap();
   assert_eq!(diff.missing_tables.len(), 2);
}
