//! Error types for sqlx-sqlite-conn-mgr

use std::path::PathBuf;

use thiserror::Error;

use crate::retry::{Transient, sqlite_primary_code};

/// `SQLITE_CORRUPT`
const SQLITE_CORRUPT: i32 = 11;
/// `SQLITE_NOTADB`
const SQLITE_NOTADB: i32 = 26;

/// Errors that may occur when working with sqlx-sqlite-conn-mgr
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// `PRAGMA integrity_check` reported problems for the database file
   #[error("Database failed integrity check: {}", path.display())]
   Corrupted { path: PathBuf },
}

impl Error {
   /// True when the database file itself is damaged or is not a database at all.
   pub fn is_corruption(&self) -> bool {
      match self {
         Error::Corrupted { .. } => true,
         Error::Sqlx(e) => matches!(
            sqlite_primary_code(e),
            Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB)
         ),
         _ => false,
      }
   }
}

impl Transient for Error {
   fn is_transient(&self) -> bool {
      match self {
         Error::Sqlx(e) => e.is_transient(),
         _ => false,
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
