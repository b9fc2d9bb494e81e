use crate::{delta::DeltaConnection, transport::TransportConnection};
use parking_lot::Mutex;
use std::sync::Arc;
use strategy_controller_core::{Connection, ConnectionRegistry, RegistryError, SubscribeTarget};
use strategy_controller_k8s_index::{ResourceWatcher, WatchError, WatcherRegistry};
use tracing::debug;

/// Holds the connection registries of both protocols alongside the watcher
/// registry they subscribe through.
///
/// Each server only mutates its own connection registry; both are consulted
/// before a watcher stops tracking a target. Subscribing and releasing are
/// serialized so that a watcher never drops a target that a registry holds.
#[derive(Clone, Debug)]
pub struct Subscribers {
    watchers: Arc<WatcherRegistry>,
    transport: Arc<ConnectionRegistry<TransportConnection>>,
    discovery: Arc<ConnectionRegistry<DeltaConnection>>,
    targets: Arc<Mutex<()>>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SubscribeError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// === impl Subscribers ===

impl Subscribers {
    pub fn new(watchers: Arc<WatcherRegistry>) -> Self {
        Self {
            watchers,
            transport: Default::default(),
            discovery: Default::default(),
            targets: Default::default(),
        }
    }

    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    pub fn transport(&self) -> &Arc<ConnectionRegistry<TransportConnection>> {
        &self.transport
    }

    pub fn discovery(&self) -> &Arc<ConnectionRegistry<DeltaConnection>> {
        &self.discovery
    }

    /// Subscribes `target` on its kind's watcher and registers `conn` for it.
    ///
    /// If the connection cannot be registered, the target is released again.
    pub(crate) fn subscribe<C: Connection>(
        &self,
        registry: &ConnectionRegistry<C>,
        target: &SubscribeTarget,
        conn: C,
    ) -> Result<Arc<ResourceWatcher>, SubscribeError> {
        let _targets = self.targets.lock();
        let watcher = self.watchers.register_watcher(target)?;
        if let Err(error) = registry.add(target, conn) {
            self.release_unlocked(target);
            return Err(error.into());
        }
        Ok(watcher)
    }

    /// Stops the watcher for `target`'s kind from tracking the target once no
    /// client of either protocol subscribes to it.
    pub(crate) fn release(&self, target: &SubscribeTarget) {
        let _targets = self.targets.lock();
        self.release_unlocked(target);
    }

    fn release_unlocked(&self, target: &SubscribeTarget) {
        if self.is_subscribed(target) {
            return;
        }
        let Some(watcher) = self.watchers.get_watcher(&target.kind) else {
            return;
        };
        if watcher.remove_subscribe_target(target) {
            debug!(%target, "Released subscribe target");
        }
    }

    fn is_subscribed(&self, target: &SubscribeTarget) -> bool {
        self.transport.get(target).is_some() || self.discovery.get(target).is_some()
    }
}
