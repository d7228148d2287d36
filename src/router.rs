//! Picking a store per caller.
//!
//! A [`StoreRouter`] maps a [`RouteContext`] to the [`FlowStore`] that should
//! serve it. [`IdentityRouter`] keys stores by identity with an optional
//! fallback; other strategies can read the free-form `hints`.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx_sqlite_observer::{InvalidationBus, InvalidationStream};
use tracing::{debug, warn};

use crate::{Error, FlowStore, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
   #[default]
   Read,
   Write,
}

/// Who is asking and for what.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteContext {
   pub identity: Option<String>,
   #[serde(default)]
   pub role: Role,
   #[serde(default)]
   pub hints: HashMap<String, JsonValue>,
}

impl RouteContext {
   pub fn read(identity: impl Into<String>) -> Self {
      Self {
         identity: Some(identity.into()),
         role: Role::Read,
         hints: HashMap::new(),
      }
   }

   pub fn write(identity: impl Into<String>) -> Self {
      Self {
         identity: Some(identity.into()),
         role: Role::Write,
         hints: HashMap::new(),
      }
   }

   pub fn with_hint(mut self, key: impl Into<String>, value: JsonValue) -> Self {
      self.hints.insert(key.into(), value);
      self
   }

   pub fn hint(&self, key: &str) -> Option<&JsonValue> {
      self.hints.get(key)
   }
}

pub trait StoreRouter: Send + Sync {
   /// Store to read from for `ctx`.
   fn readable(&self, ctx: &RouteContext) -> Result<FlowStore>;

   /// Store to write to for `ctx`.
   fn writable(&self, ctx: &RouteContext) -> Result<FlowStore>;

   /// Dispatch on `ctx.role`.
   fn route(&self, ctx: &RouteContext) -> Result<FlowStore> {
      match ctx.role {
         Role::Read => self.readable(ctx),
         Role::Write => self.writable(ctx),
      }
   }
}

/// Routes each identity to its registered store, falling back to a default.
///
/// Reads and writes for an identity resolve to the same store; the store's
/// read pool and write queue keep them apart.
#[derive(Default)]
pub struct IdentityRouter {
   stores: RwLock<HashMap<String, FlowStore>>,
   default: RwLock<Option<FlowStore>>,
}

impl IdentityRouter {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_default(store: FlowStore) -> Self {
      let router = Self::new();
      router.set_default(Some(store));
      router
   }

   /// Replace the fallback store, returning the previous one.
   pub fn set_default(&self, store: Option<FlowStore>) -> Option<FlowStore> {
      std::mem::replace(&mut *self.default.write(), store)
   }

   /// Register `store` for `identity`, returning any store it replaces.
   pub fn register(&self, identity: impl Into<String>, store: FlowStore) -> Option<FlowStore> {
      let identity = identity.into();
      debug!(identity = %identity, path = %store.path().display(), "Registered store");
      self.stores.write().insert(identity, store)
   }

   /// Remove the store for `identity`. The store itself stays open.
   pub fn unregister(&self, identity: &str) -> Option<FlowStore> {
      self.stores.write().remove(identity)
   }

   pub fn identities(&self) -> Vec<String> {
      self.stores.read().keys().cloned().collect()
   }

   /// Every distinct store this router can hand out, default first.
   pub fn stores(&self) -> Vec<FlowStore> {
      let mut stores: Vec<FlowStore> = Vec::new();
      let candidates = self
         .default
         .read()
         .iter()
         .cloned()
         .chain(self.stores.read().values().cloned())
         .collect::<Vec<_>>();

      for store in candidates {
         if !stores.iter().any(|known| known.path() == store.path()) {
            stores.push(store);
         }
      }
      stores
   }

   /// Invalidations for `tables` from every store this router knows about.
   pub fn subscribe_all<I, S>(&self, tables: I) -> InvalidationStream
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      aggregate_invalidations(&self.stores(), tables)
   }

   /// Close every store and clear the routing table.
   ///
   /// Keeps going after a failure and returns the first error.
   pub async fn close_all(&self) -> Result<()> {
      let stores = self.stores();
      self.stores.write().clear();
      self.default.write().take();

      let mut first_error = None;
      for store in stores {
         if let Err(e) = store.close().await {
            warn!(path = %store.path().display(), error = %e, "Failed to close store");
            first_error.get_or_insert(e);
         }
      }

      match first_error {
         Some(e) => Err(e),
         None => Ok(()),
      }
   }

   fn lookup(&self, ctx: &RouteContext) -> Result<FlowStore> {
      if let Some(identity) = ctx.identity.as_deref()
         && let Some(store) = self.stores.read().get(identity)
      {
         return Ok(store.clone());
      }

      self.default.read().clone().ok_or_else(|| {
         Error::StoreNotFound(ctx.identity.clone().unwrap_or_else(|| "<default>".to_string()))
      })
   }
}

impl StoreRouter for IdentityRouter {
   fn readable(&self, ctx: &RouteContext) -> Result<FlowStore> {
      self.lookup(ctx)
   }

   fn writable(&self, ctx: &RouteContext) -> Result<FlowStore> {
      self.lookup(ctx)
   }
}

/// One conflated stream of invalidations from several stores.
///
/// `generation` counts commits across all of them.
pub fn aggregate_invalidations<I, S>(stores: &[FlowStore], tables: I) -> InvalidationStream
where
   I: IntoIterator<Item = S>,
   S: AsRef<str>,
{
   let buses: Vec<InvalidationBus> = stores.iter().map(FlowStore::bus).collect();
   InvalidationBus::aggregate(&buses, tables)
}
