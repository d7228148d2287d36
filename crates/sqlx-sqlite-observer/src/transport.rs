//! Cross-process invalidation transport.
//!
//! The bus only ever needs to announce that a table changed and to listen for such
//! announcements; how they cross process boundaries is up to the implementation.

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::Result;

pub trait InvalidationTransport: Send + Sync {
   /// Announce that `table` changed. Must not block.
   fn notify(&self, table: &str) -> Result<()>;

   /// Announcements for `table`, each item being the table name.
   fn subscribe(&self, table: &str) -> BoxStream<'static, String>;
}

/// In-process transport backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
   tx: broadcast::Sender<String>,
}

impl BroadcastTransport {
   pub fn new(capacity: usize) -> Self {
      let (tx, _) = broadcast::channel(capacity.max(1));
      Self { tx }
   }
}

impl Default for BroadcastTransport {
   fn default() -> Self {
      Self::new(256)
   }
}

impl InvalidationTransport for BroadcastTransport {
   fn notify(&self, table: &str) -> Result<()> {
      // No receivers is not an error
      let _ = self.tx.send(table.to_lowercase());
      Ok(())
   }

   fn subscribe(&self, table: &str) -> BoxStream<'static, String> {
      let table = table.to_lowercase();
      BroadcastStream::new(self.tx.subscribe())
         .filter_map(move |item| {
            let wanted = match item {
               Ok(changed) if changed == table => Some(changed),
               Ok(_) => None,
               Err(BroadcastStreamRecvError::Lagged(missed)) => {
                  warn!(missed, table = %table, "Transport lagged");
                  // A lagged receiver may have missed this table; report it
                  Some(table.clone())
               }
            };
            futures::future::ready(wanted)
         })
         .boxed()
   }
}
