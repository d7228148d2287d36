//! Additive schema migrations.
//!
//! [`compare_schema`] reports the tables and columns an [`ExpectedSchema`] declares but the
//! live database lacks; [`plan_migration`] turns that into `CREATE TABLE IF NOT EXISTS`
//! and `ALTER TABLE ... ADD COLUMN` statements. Nothing is ever dropped or altered in
//! place. [`migrate`] runs both inside one queued write transaction.
//!
//! ```
//! use sqlx_sqlite_toolkit::migration::ExpectedSchema;
//!
//! let schema: ExpectedSchema = serde_json::from_str(r#"{
//!    "tables": [{
//!       "name": "users",
//!       "columns": [
//!          { "name": "id", "type": "INTEGER", "primaryKey": true },
//!          { "name": "name", "type": "TEXT", "notNull": true }
//!       ]
//!    }]
//! }"#).unwrap();
//!
//! assert_eq!(schema.tables[0].columns.len(), 2);
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx_sqlite_observer::schema::{list_tables, table_columns};
use tracing::debug;

use crate::serializer::{WriteHandle, WriteSerializer};
use crate::statement::validate_identifier;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSchema {
   pub tables: Vec<ExpectedTable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedTable {
   pub name: String,
   pub columns: Vec<ExpectedColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedColumn {
   pub name: String,
   /// Declared type, e.g. `INTEGER`, `TEXT`, `VARCHAR(64)`.
   #[serde(rename = "type")]
   pub sql_type: String,
   #[serde(default)]
   pub not_null: bool,
   #[serde(default)]
   pub primary_key: bool,
   /// SQL literal used as the column default.
   #[serde(default)]
   pub default: Option<String>,
}

impl ExpectedColumn {
   pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         sql_type: sql_type.into(),
         not_null: false,
         primary_key: false,
         default: None,
      }
   }

   pub fn not_null(mut self) -> Self {
      self.not_null = true;
      self
   }

   pub fn primary_key(mut self) -> Self {
      self.primary_key = true;
      self
   }

   pub fn default_value(mut self, literal: impl Into<String>) -> Self {
      self.default = Some(literal.into());
      self
   }
}

/// What the live database lacks compared to an [`ExpectedSchema`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiff {
   pub missing_tables: Vec<ExpectedTable>,
   /// Keyed by table name, in schema order.
   pub missing_columns: IndexMap<String, Vec<ExpectedColumn>>,
}

impl SchemaDiff {
   pub fn is_empty(&self) -> bool {
      self.missing_tables.is_empty() && self.missing_columns.is_empty()
   }
}

/// Compare the live schema visible on `conn` against `expected`.
///
/// Table and column names are compared case-insensitively.
pub async fn compare_schema(
   conn: &mut SqliteConnection,
   expected: &ExpectedSchema,
) -> Result<SchemaDiff> {
   let existing: HashSet<String> = list_tables(&mut *conn)
      .await?
      .into_iter()
      .map(|name| name.to_lowercase())
      .collect();

   let mut diff = SchemaDiff::default();
   for table in &expected.tables {
      if !existing.contains(&table.name.to_lowercase()) {
         diff.missing_tables.push(table.clone());
         continue;
      }

      let live: HashSet<String> = table_columns(&mut *conn, &table.name)
         .await?
         .into_iter()
         .map(|column| column.name.to_lowercase())
         .collect();

      let missing: Vec<ExpectedColumn> = table
         .columns
         .iter()
         .filter(|column| !live.contains(&column.name.to_lowercase()))
         .cloned()
         .collect();

      if !missing.is_empty() {
         diff.missing_columns.insert(table.name.clone(), missing);
      }
   }

   Ok(diff)
}

/// DDL statements that add everything in `diff`.
pub fn plan_migration(diff: &SchemaDiff) -> Result<Vec<String>> {
   let mut statements = Vec::new();

   for table in &diff.missing_tables {
      validate_identifier(&table.name)?;

      let mut definitions = table
         .columns
         .iter()
         .map(column_definition)
         .collect::<Result<Vec<_>>>()?;

      let primary_key: Vec<&str> = table
         .columns
         .iter()
         .filter(|column| column.primary_key)
         .map(|column| column.name.as_str())
         .collect();
      if !primary_key.is_empty() {
         definitions.push(format!("PRIMARY KEY ({})", primary_key.join(", ")));
      }

      statements.push(format!(
         "CREATE TABLE IF NOT EXISTS {} ({})",
         table.name,
         definitions.join(", ")
      ));
   }

   for (table, columns) in &diff.missing_columns {
      validate_identifier(table)?;
      for column in columns {
         if column.primary_key {
            return Err(Error::Other(format!(
               "cannot add primary key column '{}' to existing table '{table}'",
               column.name
            )));
         }

         let mut definition = column_definition(column)?;
         // SQLite refuses NOT NULL columns without a default on existing tables
         if column.not_null && column.default.is_none() {
            definition.push_str(default_for_type(&column.sql_type));
         }
         statements.push(format!("ALTER TABLE {table} ADD COLUMN {definition}"));
      }
   }

   Ok(statements)
}

/// Bring the database up to `expected` in one queued transaction.
///
/// Resolves to the differences found before migrating.
pub fn migrate(serializer: &WriteSerializer, expected: &ExpectedSchema) -> WriteHandle<SchemaDiff> {
   let expected = expected.clone();
   let metrics = Arc::clone(serializer.metrics());

   serializer.submit(move |conn| {
      let expected = expected.clone();
      let metrics = Arc::clone(&metrics);
      Box::pin(async move {
         let diff = compare_schema(&mut *conn, &expected).await?;
         let statements = plan_migration(&diff)?;
         debug!(statements = statements.len(), "Applying schema migration");

         for sql in statements {
            sqlx::query(&sql).execute(&mut *conn).await?;
            metrics.record_sql(sql);
         }
         Ok(diff)
      })
   })
}

fn column_definition(column: &ExpectedColumn) -> Result<String> {
   validate_identifier(&column.name)?;
   validate_type(&column.sql_type)?;

   let mut definition = column.name.clone();
   if !column.sql_type.is_empty() {
      definition.push(' ');
      definition.push_str(&column.sql_type);
   }
   if column.not_null {
      definition.push_str(" NOT NULL");
   }
   if let Some(literal) = &column.default {
      definition.push_str(" DEFAULT ");
      definition.push_str(literal);
   }
   Ok(definition)
}

fn validate_type(sql_type: &str) -> Result<()> {
   let valid = sql_type
      .chars()
      .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | ' ' | '(' | ')' | ','));

   if valid {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier {
         name: sql_type.to_string(),
      })
   }
}

/// Default clause keeping existing rows valid, chosen from the type's affinity.
fn default_for_type(sql_type: &str) -> &'static str {
   let upper = sql_type.to_ascii_uppercase();
   if upper.contains("INT") {
      " DEFAULT 0"
   } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
      " DEFAULT ''"
   } else if upper.contains("BLOB") || upper.is_empty() {
      " DEFAULT X''"
   } else {
      " DEFAULT 0.0"
   }
}
