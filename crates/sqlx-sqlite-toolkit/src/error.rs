use sqlx_sqlite_conn_mgr::Transient;

/// Result type alias for toolkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for SQLite toolkit operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Error from the observer (change notifications).
   #[error(transparent)]
   Observer(#[from] sqlx_sqlite_observer::Error),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// The write queue no longer accepts work.
   #[error("write queue is closed")]
   QueueClosed,

   /// The write queue shut down before the task ran.
   #[error("write task was abandoned before it ran")]
   TaskAbandoned,

   /// A queued write task panicked; its transaction was rolled back.
   #[error("write task panicked: {0}")]
   TaskPanicked(String),

   /// Table or column name contains invalid characters.
   ///
   /// Identifiers must match `[a-zA-Z_][a-zA-Z0-9_]*`.
   #[error("invalid identifier '{name}': must match [a-zA-Z_][a-zA-Z0-9_]*")]
   InvalidIdentifier { name: String },

   /// Paged query carries its own top-level LIMIT or OFFSET, or is empty.
   #[error("invalid paging query: {0}")]
   InvalidPagingQuery(String),

   /// Page size must be positive and fit in an `i64`.
   #[error("invalid page size {0}")]
   InvalidPageSize(usize),

   /// A watched table changed since the page source was created.
   #[error("page source was invalidated by a change to its tables")]
   PageSourceInvalidated,

   /// UPDATE without any column to set.
   #[error("update of table '{0}' sets no columns")]
   EmptyUpdate(String),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::ConnectionManager(sqlx_sqlite_conn_mgr::Error::Corrupted { .. }) => {
            "DATABASE_CORRUPT".to_string()
         }
         Error::ConnectionManager(sqlx_sqlite_conn_mgr::Error::DatabaseClosed) => {
            "DATABASE_CLOSED".to_string()
         }
         Error::ConnectionManager(_) => "CONNECTION_ERROR".to_string(),
         Error::Observer(_) => "OBSERVER_ERROR".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::QueueClosed => "QUEUE_CLOSED".to_string(),
         Error::TaskAbandoned => "TASK_ABANDONED".to_string(),
         Error::TaskPanicked(_) => "TASK_PANICKED".to_string(),
         Error::InvalidIdentifier { .. } => "INVALID_IDENTIFIER".to_string(),
         Error::InvalidPagingQuery(_) => "INVALID_PAGING_QUERY".to_string(),
         Error::InvalidPageSize(_) => "INVALID_PAGE_SIZE".to_string(),
         Error::PageSourceInvalidated => "PAGE_SOURCE_INVALIDATED".to_string(),
         Error::EmptyUpdate(_) => "EMPTY_UPDATE".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }
}

impl Transient for Error {
   fn is_transient(&self) -> bool {
      match self {
         Error::Sqlx(e) => e.is_transient(),
         Error::ConnectionManager(e) => e.is_transient(),
         Error::Observer(e) => e.is_transient(),
         _ => false,
      }
   }
}
