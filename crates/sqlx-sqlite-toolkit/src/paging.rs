//! Offset-paged reads that go stale when their tables change.
//!
//! A [`PageSource`] runs a caller-supplied `SELECT` against the read pool one page at a
//! time, appending `LIMIT ? OFFSET ?` itself. It subscribes to the tables the query
//! reads when created; the first commit touching any of them invalidates the source,
//! and every later [`load`](PageSource::load) fails with
//! [`Error::PageSourceInvalidated`]. Callers then build a fresh source and reload,
//! usually from page 0.
//!
//! # Example
//!
//! ```no_run
//! use sqlx_sqlite_observer::ObservableSqliteDatabase;
//! use sqlx_sqlite_toolkit::paging::PageSource;
//!
//! # async fn example(db: &ObservableSqliteDatabase) -> sqlx_sqlite_toolkit::Result<()> {
//! let mut source = PageSource::<(i64, String)>::new(
//!    db,
//!    ["posts"],
//!    "SELECT id, title FROM posts ORDER BY id",
//!    vec![],
//!    20,
//! )?;
//!
//! let first = source.load(0).await?;
//! if let Some(next) = first.next_page {
//!    let _second = source.load(next).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::marker::PhantomData;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use sqlx_sqlite_conn_mgr::{LiveConfig, RetryPolicy};
use sqlx_sqlite_observer::{InvalidationStream, ObservableSqliteDatabase};
use tracing::{debug, trace};

use crate::statement::bind_value;
use crate::{Error, Result};

/// One page of rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
   pub items: Vec<T>,
   /// Index of this page, starting at 0.
   pub page: usize,
   /// `None` on the first page.
   pub prev_page: Option<usize>,
   /// `None` once a page comes back short.
   pub next_page: Option<usize>,
}

/// Offset-paged reads of one query, valid until its tables change.
pub struct PageSource<T> {
   pool: Pool<Sqlite>,
   settings: LiveConfig,
   sql: String,
   values: Vec<JsonValue>,
   page_size: usize,
   invalidations: Option<InvalidationStream>,
   _rows: PhantomData<fn() -> T>,
}

impl<T> PageSource<T>
where
   T: for<'r> FromRow<'r, SqliteRow>,
{
   /// Page through `sql` in steps of `page_size` rows.
   ///
   /// `sql` must not carry its own top-level `LIMIT` or `OFFSET`. It should have an
   /// `ORDER BY`, otherwise consecutive pages may overlap. `tables` are the tables
   /// whose commits invalidate the source (every table if empty).
   pub fn new<I, S>(
      db: &ObservableSqliteDatabase,
      tables: I,
      sql: impl Into<String>,
      values: Vec<JsonValue>,
      page_size: usize,
   ) -> Result<Self>
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      if page_size == 0 || i64::try_from(page_size).is_err() {
         return Err(Error::InvalidPageSize(page_size));
      }

      let sql = normalize_query(&sql.into());
      validate_paging_query(&sql)?;

      let pool = db.read_pool()?.clone();
      let mut invalidations = db.subscribe(tables);
      // The initial event is ready immediately; anything after it is a commit
      if let Some(Some(event)) = invalidations.next().now_or_never() {
         trace!(tables = ?event.tables, "Page source subscribed");
      }

      Ok(Self {
         pool,
         settings: db.inner().settings().clone(),
         sql,
         values,
         page_size,
         invalidations: Some(invalidations),
         _rows: PhantomData,
      })
   }

   pub fn page_size(&self) -> usize {
      self.page_size
   }

   /// Whether a watched table has changed, or the database closed, since creation.
   pub fn is_invalidated(&mut self) -> bool {
      loop {
         let Some(stream) = self.invalidations.as_mut() else {
            return true;
         };
         match stream.next().now_or_never() {
            None => return false,
            Some(Some(event)) if event.initial => continue,
            Some(_) => self.invalidate(),
         }
      }
   }

   /// Wait until the source becomes invalid.
   pub async fn invalidated(&mut self) {
      while let Some(stream) = self.invalidations.as_mut() {
         match stream.next().await {
            Some(event) if event.initial => continue,
            _ => self.invalidate(),
         }
      }
   }

   /// Mark the source invalid and stop observing its tables.
   pub fn invalidate(&mut self) {
      if self.invalidations.take().is_some() {
         debug!("Page source invalidated");
      }
   }

   /// Load page `page` (offset `page * page_size`).
   ///
   /// Runs on the configured I/O runtime and is retried on busy errors.
   pub async fn load(&mut self, page: usize) -> Result<Page<T>> {
      if self.is_invalidated() {
         return Err(Error::PageSourceInvalidated);
      }

      let offset = page
         .checked_mul(self.page_size)
         .and_then(|offset| i64::try_from(offset).ok())
         .ok_or_else(|| Error::Other(format!("page {page} is out of range")))?;
      let limit = self.page_size as i64;

      let sql = format!("{} LIMIT ? OFFSET ?", self.sql);
      let mut values = self.values.clone();
      values.push(JsonValue::from(limit));
      values.push(JsonValue::from(offset));

      let rows = read(&self.settings, &self.pool, move |pool| {
         let sql = sql.clone();
         let values = values.clone();
         async move { bind_all(&sql, values).fetch_all(&pool).await }
      })
      .await?;
      let items = rows
         .iter()
         .map(|row| T::from_row(row))
         .collect::<std::result::Result<Vec<_>, _>>()?;

      trace!(page, items = items.len(), "Loaded page");

      Ok(Page {
         next_page: (items.len() >= self.page_size).then_some(page + 1),
         prev_page: page.checked_sub(1),
         page,
         items,
      })
   }

   /// Total number of rows the query yields, ignoring paging.
   pub async fn count(&mut self) -> Result<i64> {
      if self.is_invalidated() {
         return Err(Error::PageSourceInvalidated);
      }

      let sql = format!("SELECT COUNT(*) FROM ({})", self.sql);
      let values = self.values.clone();
      let row = read(&self.settings, &self.pool, move |pool| {
         let sql = sql.clone();
         let values = values.clone();
         async move { bind_all(&sql, values).fetch_one(&pool).await }
      })
      .await?;
      Ok(row.try_get::<i64, _>(0)?)
   }
}

impl<T> std::fmt::Debug for PageSource<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PageSource")
         .field("sql", &self.sql)
         .field("page_size", &self.page_size)
         .field("valid", &self.invalidations.is_some())
         .finish()
   }
}

/// Run `op` on the I/O runtime, retrying busy errors.
async fn read<R, F, Fut>(settings: &LiveConfig, pool: &Pool<Sqlite>, op: F) -> Result<R>
where
   R: Send + 'static,
   F: Fn(Pool<Sqlite>) -> Fut + Send + Sync + 'static,
   Fut: Future<Output = std::result::Result<R, sqlx::Error>> + Send + 'static,
{
   let policy = RetryPolicy::from_config(&settings.load());
   let pool = pool.clone();
   let handle = settings.spawn(async move { policy.run(|| op(pool.clone())).await });

   match handle.await {
      Ok(result) => Ok(result?),
      Err(e) => Err(Error::Other(format!("page read failed: {e}"))),
   }
}

fn bind_all(sql: &str, values: Vec<JsonValue>) -> Query<'_, Sqlite, SqliteArguments<'_>> {
   values.into_iter().fold(sqlx::query(sql), bind_value)
}

fn normalize_query(sql: &str) -> String {
   sql.trim().trim_end_matches(';').trim_end().to_string()
}

/// Reject queries with a top-level `LIMIT` or `OFFSET`.
///
/// Subqueries, string literals, quoted identifiers and comments may contain either.
pub(crate) fn validate_paging_query(sql: &str) -> Result<()> {
   if sql.is_empty() {
      return Err(Error::InvalidPagingQuery("query is empty".into()));
   }

   match find_top_level_keyword(sql, &["LIMIT", "OFFSET"]) {
      Some(keyword) => Err(Error::InvalidPagingQuery(format!(
         "query must not contain a top-level {keyword}"
      ))),
      None => Ok(()),
   }
}

/// First of `keywords` that appears as a whole word at parenthesis depth 0, outside
/// literals, quoted identifiers and comments.
fn find_top_level_keyword(sql: &str, keywords: &[&'static str]) -> Option<&'static str> {
   let upper = sql.to_ascii_uppercase();
   let bytes = upper.as_bytes();
   let len = bytes.len();
   let mut depth: i32 = 0;
   let mut i = 0;

   while i < len {
      match bytes[i] {
         b'(' => depth += 1,
         b')' => depth -= 1,
         quote @ (b'\'' | b'"' | b'`') => i = skip_until(bytes, i + 1, quote),
         b'[' => i = skip_until(bytes, i + 1, b']'),
         b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_until(bytes, i + 2, b'\n'),
         b'/' if bytes.get(i + 1) == Some(&b'*') => {
            i = upper[i + 2..].find("*/").map_or(len, |end| i + 2 + end + 1);
         }
         _ if depth == 0 && starts_word(bytes, i) => {
            if let Some(keyword) = keywords
               .iter()
               .find(|keyword| is_word_at(bytes, i, keyword.as_bytes()))
            {
               return Some(*keyword);
            }
         }
         _ => {}
      }
      i += 1;
   }

   None
}

/// Index of the closing `end` byte at or after `from` (or the end of input).
///
/// Doubled quotes inside literals land here as two adjacent sections, which scans the same.
fn skip_until(bytes: &[u8], from: usize, end: u8) -> usize {
   bytes[from.min(bytes.len())..]
      .iter()
      .position(|&b| b == end)
      .map_or(bytes.len(), |offset| from + offset)
}

fn is_ident_byte(b: u8) -> bool {
   b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn starts_word(bytes: &[u8], i: usize) -> bool {
   i == 0 || !is_ident_byte(bytes[i - 1])
}

fn is_word_at(bytes: &[u8], i: usize, word: &[u8]) -> bool {
   bytes[i..].starts_with(word) && bytes.get(i + word.len()).is_none_or(|&b| !is_ident_byte(b))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_plain_query_is_accepted() {
      assert!(validate_paging_query("SELECT id FROM posts ORDER BY id").is_ok());
      assert!(validate_paging_query("SELECT id FROM posts WHERE category = ?").is_ok());
   }

   #[test]
   fn test_top_level_limit_and_offset_are_rejected() {
      let err = validate_paging_query("SELECT id FROM posts LIMIT 10").unwrap_err();
      assert_eq!(err.error_code(), "INVALID_PAGING_QUERY");
      assert!(err.to_string().contains("LIMIT"));

      let err = validate_paging_query("select id from posts order by id offset 2").unwrap_err();
      assert!(err.to_string().contains("OFFSET"));
   }

   #[test]
   fn test_limit_inside_subquery_is_allowed() {
      let sql = "SELECT id FROM posts WHERE id IN (SELECT post_id FROM likes LIMIT 5) ORDER BY id";
      assert!(validate_paging_query(sql).is_ok());
   }

   #[test]
   fn test_limit_in_literals_identifiers_and_comments_is_ignored() {
      for sql in [
         "SELECT id FROM posts WHERE title = 'no LIMIT here'",
         "SELECT \"limit\" FROM posts",
         "SELECT `offset` FROM posts",
         "SELECT [limit] FROM posts",
         "SELECT id FROM posts -- LIMIT 3\nORDER BY id",
         "SELECT id FROM posts /* OFFSET 3 */ ORDER BY id",
         "SELECT id FROM posts WHERE title = 'it''s LIMIT'",
      ] {
         assert!(validate_paging_query(sql).is_ok(), "{sql}");
      }
   }

   #[test]
   fn test_keyword_must_be_a_whole_word() {
      assert!(validate_paging_query("SELECT limited, offsets FROM posts").is_ok());
      assert!(validate_paging_query("SELECT speed_limit FROM posts").is_ok());
   }

   #[test]
   fn test_unterminated_sections_do_not_panic() {
      assert!(validate_paging_query("SELECT 'open").is_ok());
      assert!(validate_paging_query("SELECT id /* open").is_ok());
      assert!(validate_paging_query("SELECT [open").is_ok());
   }

   #[test]
   fn test_empty_query_is_rejected() {
      assert!(validate_paging_query("").is_err());
   }

   #[test]
   fn test_trailing_semicolon_is_trimmed() {
      assert_eq!(normalize_query("  SELECT 1 ;; \n"), "SELECT 1");
   }
}
