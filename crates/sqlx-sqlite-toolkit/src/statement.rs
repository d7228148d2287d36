//! Parameterized statements with JSON-valued binds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::query::Query;
use sqlx::Sqlite;

use crate::serializer::{WriteHandle, WriteSerializer};
use crate::{Error, Result};

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

/// One SQL statement and its positional bind values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
   pub sql: String,
   #[serde(default)]
   pub values: Vec<JsonValue>,
}

impl Statement {
   pub fn new(sql: impl Into<String>) -> Self {
      Self {
         sql: sql.into(),
         values: Vec::new(),
      }
   }

   pub fn with_values(sql: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         sql: sql.into(),
         values,
      }
   }

   pub async fn execute(&self, conn: &mut SqliteConnection) -> Result<WriteQueryResult> {
      let mut query = sqlx::query(&self.sql);
      for value in &self.values {
         query = bind_value(query, value.clone());
      }

      let result = query.execute(&mut *conn).await?;
      Ok(WriteQueryResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }
}

impl WriteSerializer {
   /// Execute `statements` in order inside one queued transaction.
   pub fn execute_statements(&self, statements: Vec<Statement>) -> WriteHandle<Vec<WriteQueryResult>> {
      let metrics = Arc::clone(self.metrics());
      self.submit(move |conn| {
         let statements = statements.clone();
         let metrics = Arc::clone(&metrics);
         Box::pin(async move {
            let mut results = Vec::with_capacity(statements.len());
            for statement in &statements {
               results.push(statement.execute(&mut *conn).await?);
               metrics.record_sql(statement.sql.clone());
            }
            Ok(results)
         })
      })
   }

   /// Execute one statement in its own queued transaction.
   pub fn execute(&self, sql: impl Into<String>, values: Vec<JsonValue>) -> WriteHandle<WriteQueryResult> {
      let statement = Statement::with_values(sql, values);
      let metrics = Arc::clone(self.metrics());
      self.submit(move |conn| {
         let statement = statement.clone();
         let metrics = Arc::clone(&metrics);
         Box::pin(async move {
            let result = statement.execute(&mut *conn).await?;
            metrics.record_sql(statement.sql);
            Ok(result)
         })
      })
   }
}

/// Bind a JSON value with the SQLite storage class closest to it.
///
/// Integers keep their precision; arrays and objects are bound as JSON text.
pub fn bind_value<'a>(
   query: Query<'a, Sqlite, SqliteArguments<'a>>,
   value: JsonValue,
) -> Query<'a, Sqlite, SqliteArguments<'a>> {
   match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(number) => {
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Too large for SQLite's INTEGER, loses precision
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Check that `name` is usable as a bare SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn validate_identifier(name: &str) -> Result<()> {
   let mut chars = name.chars();
   let valid = match chars.next() {
      Some(first) if first.is_ascii_alphabetic() || first == '_' => {
         chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
      }
      _ => false,
   };

   if valid {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier {
         name: name.to_string(),
      })
   }
}
