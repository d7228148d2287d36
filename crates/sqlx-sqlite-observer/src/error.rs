//! Error types for the sqlx-sqlite-observer crate.

use sqlx_sqlite_conn_mgr::Transient;

/// Errors that can occur during observation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Failed to install SQLite hooks on the write connection.
   #[error("Hook installation failed: {0}")]
   HookInstallation(String),

   /// SQLx database error.
   #[error("Database error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error("Connection manager error: {0}")]
   ConnMgr(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Generic database error with context.
   #[error("Database error: {0}")]
   Database(String),

   /// A cross-process transport rejected a notification.
   #[error("Transport error: {0}")]
   Transport(String),
}

impl Transient for Error {
   fn is_transient(&self) -> bool {
      match self {
         Error::Sqlx(e) => e.is_transient(),
         Error::ConnMgr(e) => e.is_transient(),
         _ => false,
      }
   }
}
