use serde::{Serialize, Serializer};

/// Result type alias for store and routing operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the write queue, checkpointing or migrations.
   #[error(transparent)]
   Toolkit(#[from] sqlx_sqlite_toolkit::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Error from the observer (change notifications).
   #[error(transparent)]
   Observer(#[from] sqlx_sqlite_observer::Error),

   /// No store is registered for the identity and there is no default store.
   #[error("no store registered for '{0}'")]
   StoreNotFound(String),
}

impl Error {
   /// Machine-readable error code.
   pub fn error_code(&self) -> String {
      match self {
         Error::Toolkit(e) => e.error_code(),
         Error::ConnectionManager(sqlx_sqlite_conn_mgr::Error::Corrupted { .. }) => {
            "DATABASE_CORRUPT".to_string()
         }
         Error::ConnectionManager(sqlx_sqlite_conn_mgr::Error::DatabaseClosed) => {
            "DATABASE_CLOSED".to_string()
         }
         Error::ConnectionManager(_) => "CONNECTION_ERROR".to_string(),
         Error::Observer(_) => "OBSERVER_ERROR".to_string(),
         Error::StoreNotFound(_) => "STORE_NOT_FOUND".to_string(),
      }
   }
}

#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      }
      .serialize(serializer)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_store_not_found_serializes_with_code() {
      let err = Error::StoreNotFound("tenant-a".into());
      let json = serde_json::to_value(&err).unwrap();
      assert_eq!(json["code"], "STORE_NOT_FOUND");
      assert_eq!(json["message"], "no store registered for 'tenant-a'");
   }

   #[test]
   fn test_toolkit_codes_pass_through() {
      let err = Error::from(sqlx_sqlite_toolkit::Error::QueueClosed);
      assert_eq!(err.error_code(), "QUEUE_CLOSED");
   }
}
