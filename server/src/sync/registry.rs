//! Subscription registry.
//!
//! Registrations are infrequent; fan-out reads are hot. The index is kept
//! behind copy-on-write snapshots: writers clone, modify, and swap the
//! `Arc`, fan-out grabs the current `Arc` and iterates without holding any
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use lattice_engine::Query;

/// A standing query registered by a connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub sub_id: String,
    pub connection_id: String,
    pub resource: String,
    pub query: Query,
}

/// Immutable snapshot of all subscriptions plus the by-resource index.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionIndex {
    subscriptions: HashMap<String, Subscription>,
    by_resource: HashMap<String, HashSet<String>>,
}

impl SubscriptionIndex {
    /// All subscriptions standing on a resource.
    pub fn for_resource(&self, resource: &str) -> impl Iterator<Item = &Subscription> {
        self.by_resource
            .get(resource)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.subscriptions.get(id))
    }

    pub fn get(&self, sub_id: &str) -> Option<&Subscription> {
        self.subscriptions.get(sub_id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// The mutable registry handing out snapshots.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Arc<SubscriptionIndex>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot; safe to iterate while writers swap in new ones.
    pub fn snapshot(&self) -> Arc<SubscriptionIndex> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Register a subscription.
    pub fn insert(&self, subscription: Subscription) {
        self.update(|index| {
            index
                .by_resource
                .entry(subscription.resource.clone())
                .or_default()
                .insert(subscription.sub_id.clone());
            index
                .subscriptions
                .insert(subscription.sub_id.clone(), subscription);
        });
    }

    /// Remove one subscription. Returns it if it existed.
    pub fn remove(&self, sub_id: &str) -> Option<Subscription> {
        let mut removed = None;
        self.update(|index| {
            if let Some(subscription) = index.subscriptions.remove(sub_id) {
                if let Some(ids) = index.by_resource.get_mut(&subscription.resource) {
                    ids.remove(sub_id);
                    if ids.is_empty() {
                        index.by_resource.remove(&subscription.resource);
                    }
                }
                removed = Some(subscription);
            }
        });
        removed
    }

    /// Purge everything a connection registered. Returns how many went.
    pub fn remove_connection(&self, connection_id: &str) -> usize {
        let mut removed = 0;
        self.update(|index| {
            let doomed: Vec<String> = index
                .subscriptions
                .values()
                .filter(|s| s.connection_id == connection_id)
                .map(|s| s.sub_id.clone())
                .collect();
            removed = doomed.len();
            for sub_id in doomed {
                if let Some(subscription) = index.subscriptions.remove(&sub_id) {
                    if let Some(ids) = index.by_resource.get_mut(&subscription.resource) {
                        ids.remove(&sub_id);
                        if ids.is_empty() {
                            index.by_resource.remove(&subscription.resource);
                        }
                    }
                }
            }
        });
        removed
    }

    fn update(&self, f: impl FnOnce(&mut SubscriptionIndex)) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}
