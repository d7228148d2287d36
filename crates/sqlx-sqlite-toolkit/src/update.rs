//! Partial `UPDATE` statements.
//!
//! ```
//! use serde_json::json;
//! use sqlx_sqlite_toolkit::UpdateBuilder;
//!
//! let statement = UpdateBuilder::table("users")
//!    .set("name", json!("Alice"))
//!    .set("age", json!(31))
//!    .where_clause("id = ?", vec![json!(7)])
//!    .build()
//!    .unwrap();
//!
//! assert_eq!(statement.sql, "UPDATE users SET name = ?, age = ? WHERE id = ?");
//! ```

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::statement::{Statement, validate_identifier};
use crate::{Error, Result};

/// Builds `UPDATE <table> SET <col> = ?, ... [WHERE ...]` from the columns that changed.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
   table: String,
   columns: IndexMap<String, JsonValue>,
   filter: Option<(String, Vec<JsonValue>)>,
}

impl UpdateBuilder {
   pub fn table(table: impl Into<String>) -> Self {
      Self {
         table: table.into(),
         columns: IndexMap::new(),
         filter: None,
      }
   }

   /// Set `column` to `value`. Setting a column twice keeps its first position and the
   /// last value.
   pub fn set(mut self, column: impl Into<String>, value: JsonValue) -> Self {
      self.columns.insert(column.into(), value);
      self
   }

   /// Only set `column` when `value` is present.
   pub fn set_if_some(self, column: impl Into<String>, value: Option<JsonValue>) -> Self {
      match value {
         Some(value) => self.set(column, value),
         None => self,
      }
   }

   /// Raw `WHERE` condition with its own positional parameters.
   pub fn where_clause(mut self, condition: impl Into<String>, values: Vec<JsonValue>) -> Self {
      self.filter = Some((condition.into(), values));
      self
   }

   pub fn is_empty(&self) -> bool {
      self.columns.is_empty()
   }

   pub fn build(self) -> Result<Statement> {
      validate_identifier(&self.table)?;
      if self.columns.is_empty() {
         return Err(Error::EmptyUpdate(self.table));
      }

      let mut assignments = Vec::with_capacity(self.columns.len());
      let mut values = Vec::with_capacity(self.columns.len());
      for (column, value) in self.columns {
         validate_identifier(&column)?;
         assignments.push(format!("{column} = ?"));
         values.push(value);
      }

      let mut sql = format!("UPDATE {} SET {}", self.table, assignments.join(", "));
      if let Some((condition, filter_values)) = self.filter {
         sql.push_str(" WHERE ");
         sql.push_str(&condition);
         values.extend(filter_values);
      }

      Ok(Statement::with_values(sql, values))
   }
}
