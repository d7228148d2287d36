//! Schema introspection utilities for SQLite tables.
//!
//! Used to detect tables whose changes SQLite's update hook cannot report, and by the
//! migration planner to compare the live schema against an expected one.

use regex::Regex;
use sqlx::{Row, SqliteConnection};
use std::sync::OnceLock;

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
   pub cid: i64,
   pub name: String,
   /// Declared type as written in the schema, possibly empty.
   pub declared_type: String,
   pub not_null: bool,
   pub default_value: Option<String>,
   /// 0 for non-PK columns, otherwise the 1-based position within the primary key.
   pub pk: i64,
}

/// User tables in the main schema, internal `sqlite_%` tables excluded, sorted by name.
pub async fn list_tables(conn: &mut SqliteConnection) -> crate::Result<Vec<String>> {
   let tables: Vec<String> = sqlx::query_scalar(
      r#"
      SELECT name FROM sqlite_master
      WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
      ORDER BY name
      "#,
   )
   .fetch_all(&mut *conn)
   .await?;

   Ok(tables)
}

/// Columns of `table_name` in declaration order; empty if the table does not exist.
pub async fn table_columns(
   conn: &mut SqliteConnection,
   table_name: &str,
) -> crate::Result<Vec<ColumnInfo>> {
   // PRAGMA table_info returns: cid, name, type, notnull, dflt_value, pk
   let pragma = format!("PRAGMA table_info({})", quote_identifier(table_name));

   let rows = sqlx::query(&pragma).fetch_all(&mut *conn).await?;

   rows
      .iter()
      .map(|row| -> std::result::Result<ColumnInfo, sqlx::Error> {
         Ok(ColumnInfo {
            cid: row.try_get("cid")?,
            name: row.try_get("name")?,
            declared_type: row.try_get("type")?,
            not_null: row.try_get::<i64, _>("notnull")? != 0,
            default_value: row.try_get("dflt_value")?,
            pk: row.try_get("pk")?,
         })
      })
      .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
      .map_err(crate::Error::Sqlx)
}

/// Checks if a table was created with WITHOUT ROWID.
///
/// Uses a regex anchored to the end of the CREATE TABLE statement to avoid
/// false positives from string literals or comments containing "WITHOUT ROWID".
pub async fn is_without_rowid(
   conn: &mut SqliteConnection,
   table_name: &str,
) -> crate::Result<bool> {
   let sql = r#"
        SELECT sql FROM sqlite_master
        WHERE type = 'table' AND name = ?1
    "#;

   let row: Option<(Option<String>,)> = sqlx::query_as(sql)
      .bind(table_name)
      .fetch_optional(&mut *conn)
      .await
      .map_err(crate::Error::Sqlx)?;

   match row {
      Some((Some(create_sql),)) => Ok(has_without_rowid_clause(&create_sql)),
      _ => Ok(false),
   }
}

/// Checks if a CREATE TABLE statement ends with WITHOUT ROWID.
///
/// The regex matches "WITHOUT ROWID" only when it appears at the end of the
/// statement (after the closing parenthesis), avoiding false matches in
/// string literals or comments.
fn has_without_rowid_clause(create_sql: &str) -> bool {
   static RE: OnceLock<Regex> = OnceLock::new();
   let re = RE.get_or_init(|| {
      // Match WITHOUT ROWID after ) with optional whitespace, case-insensitive
      Regex::new(r"(?i)\)\s*WITHOUT\s+ROWID\s*$").expect("invalid regex")
   });
   re.is_match(create_sql)
}

/// Quotes a SQLite identifier to prevent SQL injection.
pub fn quote_identifier(name: &str) -> String {
   // Double any existing double quotes and wrap in double quotes
   format!("\"{}\"", name.replace('"', "\"\""))
}
