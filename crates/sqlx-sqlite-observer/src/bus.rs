//! Fan-out of committed table changes to conflating subscriber streams.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::change::{Invalidation, normalize_tables};
use crate::stream::{InvalidationStream, Registration};
use crate::tracker::ChangeTracker;
use crate::transport::InvalidationTransport;

/// Subscription point for the committed changes of one database.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
   tracker: Arc<ChangeTracker>,
}

impl InvalidationBus {
   pub fn new(tracker: Arc<ChangeTracker>) -> Self {
      Self { tracker }
   }

   pub fn tracker(&self) -> &Arc<ChangeTracker> {
      &self.tracker
   }

   /// Subscribe to commits touching any of `tables` (every table if empty).
   ///
   /// The stream yields the initial event immediately.
   pub fn subscribe<I, S>(&self, tables: I) -> InvalidationStream
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      Self::aggregate(std::slice::from_ref(self), tables)
   }

   /// One conflated stream over several databases, with one observer per database.
   ///
   /// `generation` counts commits across all of them.
   pub fn aggregate<I, S>(buses: &[InvalidationBus], tables: I) -> InvalidationStream
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      let tables = normalize_tables(tables);
      let (tx, rx) = watch::channel(Invalidation::initial(tables.clone()));
      let tx = Arc::new(tx);

      let registrations = buses
         .iter()
         .map(|bus| {
            let tx = Arc::clone(&tx);
            let id = bus.tracker.add_observer(
               tables.clone(),
               Arc::new(move |changed: &BTreeSet<String>| {
                  tx.send_modify(|current| {
                     current.generation += 1;
                     current.tables = changed.clone();
                     current.initial = false;
                  });
               }),
            );
            Registration::new(Arc::clone(&bus.tracker), id)
         })
         .collect();

      debug!(tables = ?tables, stores = buses.len(), "Subscribed to invalidations");

      InvalidationStream::new(WatchStream::new(rx), registrations)
   }

   /// Forward every committed change to `transport`, one `notify` per table.
   ///
   /// Forwarding stops when the returned registration is dropped.
   pub fn relay<I, S>(&self, transport: Arc<dyn InvalidationTransport>, tables: I) -> Registration
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      let id = self.tracker.add_observer(
         normalize_tables(tables),
         Arc::new(move |changed: &BTreeSet<String>| {
            for table in changed {
               if let Err(e) = transport.notify(table) {
                  warn!(table = %table, error = %e, "Failed to relay invalidation");
               }
            }
         }),
      );
      Registration::new(Arc::clone(&self.tracker), id)
   }
}
