use std::collections::BTreeSet;

use sqlx::sqlite::SqliteOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
   Insert,
   Update,
   Delete,
}

impl ChangeOperation {
   pub(crate) fn from_sqlite(operation: &SqliteOperation) -> Option<Self> {
      match operation {
         SqliteOperation::Insert => Some(ChangeOperation::Insert),
         SqliteOperation::Update => Some(ChangeOperation::Update),
         SqliteOperation::Delete => Some(ChangeOperation::Delete),
         _ => None,
      }
   }
}

/// Notification that watched tables may have changed.
///
/// Delivered through conflating streams: a slow consumer only ever sees the latest
/// notification, so `tables` lists the tables touched by the most recent commit and
/// `generation` (incremented per commit, per subscription) tells how many were skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
   /// 0 for the synthetic event emitted on subscribe.
   pub generation: u64,
   /// Watched tables modified by the latest commit; the whole watched set for the
   /// initial event.
   pub tables: BTreeSet<String>,
   /// True for the synthetic event emitted on subscribe.
   pub initial: bool,
}

impl Invalidation {
   pub(crate) fn initial(tables: BTreeSet<String>) -> Self {
      Self {
         generation: 0,
         tables,
         initial: true,
      }
   }

   /// Whether `table` (compared case-insensitively) is part of this notification.
   pub fn touches(&self, table: &str) -> bool {
      self.tables.contains(&table.to_lowercase())
   }
}

/// Lower-cased, de-duplicated table set. An empty set watches every table.
pub fn normalize_tables<I, S>(tables: I) -> BTreeSet<String>
where
   I: IntoIterator<Item = S>,
   S: AsRef<str>,
{
   tables
      .into_iter()
      .map(|t| t.as_ref().trim().to_lowercase())
      .filter(|t| !t.is_empty())
      .collect()
}
