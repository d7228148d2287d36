use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_stream::Stream;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use crate::change::Invalidation;
use crate::tracker::{ChangeTracker, ObserverId};

/// An observer registration that is removed from its tracker when dropped.
#[must_use = "dropping a registration immediately removes the observer"]
#[derive(Debug)]
pub struct Registration {
   tracker: Arc<ChangeTracker>,
   id: ObserverId,
}

impl Registration {
   pub(crate) fn new(tracker: Arc<ChangeTracker>, id: ObserverId) -> Self {
      Self { tracker, id }
   }

   pub fn id(&self) -> ObserverId {
      self.id
   }
}

impl Drop for Registration {
   fn drop(&mut self) {
      if self.tracker.remove_observer(self.id) {
         trace!(id = ?self.id, "Observer removed");
      }
   }
}

/// A conflating stream of [`Invalidation`]s.
///
/// The first item is the synthetic initial event. Afterwards, if several commits land
/// before the consumer polls, only the latest is delivered. The stream ends once every
/// database feeding it has been closed or dropped.
pub struct InvalidationStream {
   inner: Pin<Box<WatchStream<Invalidation>>>,
   registrations: Vec<Registration>,
}

impl InvalidationStream {
   pub(crate) fn new(inner: WatchStream<Invalidation>, registrations: Vec<Registration>) -> Self {
      Self {
         inner: Box::pin(inner),
         registrations,
      }
   }

   /// Number of native observers backing this stream (one per store).
   pub fn observer_count(&self) -> usize {
      self.registrations.len()
   }

   /// Remove every native observer. No event is produced after this returns.
   pub fn unsubscribe(self) {
      drop(self);
   }
}

impl Stream for InvalidationStream {
   type Item = Invalidation;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.inner.as_mut().poll_next(cx)
   }
}

impl std::fmt::Debug for InvalidationStream {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("InvalidationStream")
         .field("registrations", &self.registrations)
         .finish()
   }
}
