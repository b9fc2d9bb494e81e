use crate::{
    kinds::{KindMetadata, Kinds},
    metrics::IndexMetrics,
    watcher::{PushRules, ResourceWatcher},
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use strategy_controller_core::{ResourceKind, SubscribeTarget};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error("subscribe target kind {actual} does not match watcher kind {expected}")]
    KindMismatch {
        expected: ResourceKind,
        actual: ResourceKind,
    },

    #[error("unsupported resource kind: {0}")]
    UnsupportedKind(ResourceKind),
}

/// Starts delivering cluster change events for a kind to its watcher.
pub trait WatchResources: Send + Sync + 'static {
    fn watch(&self, metadata: &KindMetadata, watcher: Arc<ResourceWatcher>);
}

/// Owns the watcher for each active resource kind, creating watchers as
/// clients first subscribe to a kind.
pub struct WatcherRegistry {
    watchers: RwLock<HashMap<ResourceKind, Arc<ResourceWatcher>>>,
    kinds: Kinds,
    watches: Arc<dyn WatchResources>,
    push: Arc<dyn PushRules>,
    metrics: IndexMetrics,
}

// === impl WatcherRegistry ===

impl WatcherRegistry {
    pub fn new(
        kinds: Kinds,
        watches: Arc<dyn WatchResources>,
        push: Arc<dyn PushRules>,
        metrics: IndexMetrics,
    ) -> Self {
        Self {
            watchers: Default::default(),
            kinds,
            watches,
            push,
            metrics,
        }
    }

    /// Subscribes `target` on the watcher for its kind, creating and starting
    /// the watcher if it does not yet exist.
    pub fn register_watcher(
        &self,
        target: &SubscribeTarget,
    ) -> Result<Arc<ResourceWatcher>, WatchError> {
        if let Some(watcher) = self.get_watcher(&target.kind) {
            watcher.add_subscribe_target(target)?;
            return Ok(watcher);
        }

        let mut watchers = self.watchers.write();
        match watchers.entry(target.kind.clone()) {
            Entry::Occupied(entry) => {
                let watcher = entry.get().clone();
                watcher.add_subscribe_target(target)?;
                Ok(watcher)
            }
            Entry::Vacant(entry) => {
                let metadata = self
                    .kinds
                    .get(&target.kind)
                    .ok_or_else(|| WatchError::UnsupportedKind(target.kind.clone()))?;
                let watcher = Arc::new(ResourceWatcher::new(
                    target.kind.clone(),
                    metadata.translate().clone(),
                    self.push.clone(),
                    self.metrics.clone(),
                ));

                // The target is subscribed before events can arrive so that
                // the initial listing is cached.
                watcher.add_subscribe_target(target)?;
                self.watches.watch(metadata, watcher.clone());
                entry.insert(watcher.clone());
                self.metrics.watcher_created();
                info!(kind = %target.kind, "Started watcher");
                Ok(watcher)
            }
        }
    }

    pub fn get_watcher(&self, kind: &ResourceKind) -> Option<Arc<ResourceWatcher>> {
        self.watchers.read().get(kind).cloned()
    }

    pub fn kinds(&self) -> &Kinds {
        &self.kinds
    }
}

impl std::fmt::Debug for WatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherRegistry")
            .field("kinds", &self.kinds)
            .field("watchers", &self.watchers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
