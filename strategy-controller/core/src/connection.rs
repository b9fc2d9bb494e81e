use crate::{ClientIdentifier, NamespacedApp, ResourceKind, SubscribeTarget};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;

/// The capabilities a registry needs from a client connection.
///
/// Connections are cheap handles onto a shared stream, so they are cloned
/// freely into and out of the registry.
pub trait Connection: Clone + Send + Sync + 'static {
    fn identifier(&self) -> &ClientIdentifier;

    /// Returns false once the underlying stream has failed or closed.
    fn is_valid(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} has no live stream")]
    NilConnection(ClientIdentifier),
}

/// Indexes live connections by the targets they subscribe to.
///
/// The forward index maps `(namespace, app) -> kind -> client -> connection`
/// and is used to fan pushes out. The reverse index maps each client to the
/// `(namespace, app, kind)` slots it occupies so that a disconnect tears down
/// every subscription without scanning the forward index. Both are updated
/// under a single lock, so every forward entry has exactly one reverse entry.
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    index: RwLock<Index<C>>,
}

type ByClient<C> = HashMap<ClientIdentifier, C>;

#[derive(Debug)]
struct Index<C> {
    by_app: HashMap<NamespacedApp, HashMap<ResourceKind, ByClient<C>>>,
    by_client: HashMap<ClientIdentifier, Vec<(NamespacedApp, ResourceKind)>>,
}

// === impl ConnectionRegistry ===

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            index: RwLock::new(Index {
                by_app: HashMap::default(),
                by_client: HashMap::default(),
            }),
        }
    }
}

impl<C: Connection> ConnectionRegistry<C> {
    /// Registers `connection` as a subscriber of `target`.
    ///
    /// Adding a client that already occupies the slot is a no-op unless the
    /// registered connection has since become invalid, in which case it is
    /// replaced.
    pub fn add(&self, target: &SubscribeTarget, connection: C) -> Result<(), RegistryError> {
        let id = connection.identifier().clone();
        if !connection.is_valid() {
            return Err(RegistryError::NilConnection(id));
        }

        let app = target.namespaced_app();
        let mut index = self.index.write();
        match index
            .by_app
            .entry(app.clone())
            .or_default()
            .entry(target.kind.clone())
            .or_default()
            .entry(id.clone())
        {
            Entry::Vacant(entry) => {
                entry.insert(connection);
            }
            Entry::Occupied(mut entry) => {
                if !entry.get().is_valid() {
                    entry.insert(connection);
                }
            }
        }

        let slots = index.by_client.entry(id).or_default();
        let slot = (app, target.kind.clone());
        if !slots.contains(&slot) {
            slots.push(slot);
        }

        Ok(())
    }

    /// Returns a snapshot of the connections subscribed to `target`.
    ///
    /// The snapshot may include connections that have become invalid but have
    /// not yet been torn down.
    pub fn get(&self, target: &SubscribeTarget) -> Option<Vec<C>> {
        let index = self.index.read();
        let clients = index
            .by_app
            .get(&target.namespaced_app())?
            .get(&target.kind)?;
        if clients.is_empty() {
            return None;
        }
        Some(clients.values().cloned().collect())
    }

    /// Removes a single client from a single target.
    ///
    /// Returns true if the client was subscribed to the target.
    pub fn remove(&self, target: &SubscribeTarget, id: &ClientIdentifier) -> bool {
        let app = target.namespaced_app();
        let mut index = self.index.write();
        let removed = index.remove_slot(&app, &target.kind, id);

        if let Entry::Occupied(mut entry) = index.by_client.entry(id.clone()) {
            entry
                .get_mut()
                .retain(|(a, k)| !(*a == app && *k == target.kind));
            if entry.get().is_empty() {
                entry.remove();
            }
        }

        removed
    }

    /// Removes every subscription held by a client, returning the targets it
    /// was subscribed to.
    pub fn remove_by_identifier(&self, id: &ClientIdentifier) -> Vec<SubscribeTarget> {
        let mut index = self.index.write();
        let slots = match index.by_client.remove(id) {
            Some(slots) => slots,
            None => return vec![],
        };

        slots
            .into_iter()
            .filter_map(|(app, kind)| {
                if index.remove_slot(&app, &kind, id) {
                    Some(app.target(kind))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Lists the targets a client is subscribed to.
    pub fn subscriptions(&self, id: &ClientIdentifier) -> Vec<SubscribeTarget> {
        self.index
            .read()
            .by_client
            .get(id)
            .map(|slots| {
                slots
                    .iter()
                    .map(|(app, kind)| app.target(kind.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of distinct clients with at least one subscription.
    pub fn clients(&self) -> usize {
        self.index.read().by_client.len()
    }
}

// === impl Index ===

impl<C> Index<C> {
    /// Removes a client from a forward slot, pruning maps that become empty.
    fn remove_slot(
        &mut self,
        app: &NamespacedApp,
        kind: &ResourceKind,
        id: &ClientIdentifier,
    ) -> bool {
        let Some(kinds) = self.by_app.get_mut(app) else {
            return false;
        };
        let Some(clients) = kinds.get_mut(kind) else {
            return false;
        };

        let removed = clients.remove(id).is_some();
        if clients.is_empty() {
            kinds.remove(kind);
            if kinds.is_empty() {
                self.by_app.remove(app);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[derive(Clone, Debug)]
    struct TestConnection {
        id: ClientIdentifier,
        valid: Arc<AtomicBool>,
    }

    impl TestConnection {
        fn new(id: &str) -> Self {
            Self {
                id: id.into(),
                valid: Arc::new(AtomicBool::new(true)),
            }
        }

        fn close(&self) {
            self.valid.store(false, Ordering::Release);
        }
    }

    impl Connection for TestConnection {
        fn identifier(&self) -> &ClientIdentifier {
            &self.id
        }

        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::Acquire)
        }
    }

    impl<C: Connection> ConnectionRegistry<C> {
        /// Asserts that the forward and reverse indexes describe the same set
        /// of (client, app, kind) entries.
        fn assert_consistent(&self) {
            let index = self.index.read();
            let mut forward = index
                .by_app
                .iter()
                .flat_map(|(app, kinds)| {
                    kinds.iter().flat_map(move |(kind, clients)| {
                        clients
                            .keys()
                            .map(move |id| (id.clone(), app.clone(), kind.clone()))
                    })
                })
                .collect::<Vec<_>>();
            let mut reverse = index
                .by_client
                .iter()
                .flat_map(|(id, slots)| {
                    slots
                        .iter()
                        .map(move |(app, kind)| (id.clone(), app.clone(), kind.clone()))
                })
                .collect::<Vec<_>>();
            forward.sort();
            reverse.sort();
            assert_eq!(forward, reverse);
        }
    }

    fn ids(conns: Option<Vec<TestConnection>>) -> Vec<String> {
        let mut ids = conns
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    #[test]
    fn add_and_get() {
        let registry = ConnectionRegistry::default();
        let rls = SubscribeTarget::new("default", "foo", "RateLimitStrategy");
        let cbs = SubscribeTarget::new("default", "foo", "CircuitBreakerStrategy");

        assert!(registry.get(&rls).is_none());

        registry.add(&rls, TestConnection::new("a")).unwrap();
        registry.add(&rls, TestConnection::new("b")).unwrap();
        registry.add(&cbs, TestConnection::new("a")).unwrap();

        assert_eq!(ids(registry.get(&rls)), vec!["a", "b"]);
        assert_eq!(ids(registry.get(&cbs)), vec!["a"]);
        assert!(registry
            .get(&SubscribeTarget::new("other", "foo", "RateLimitStrategy"))
            .is_none());
        assert_eq!(registry.clients(), 2);
        registry.assert_consistent();
    }

    #[test]
    fn rejects_closed_connections() {
        let registry = ConnectionRegistry::default();
        let conn = TestConnection::new("a");
        conn.close();
        let target = SubscribeTarget::new("default", "foo", "RateLimitStrategy");
        assert_eq!(
            registry.add(&target, conn),
            Err(RegistryError::NilConnection("a".into()))
        );
        assert!(registry.get(&target).is_none());
        registry.assert_consistent();
    }

    #[test]
    fn repeated_add_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let target = SubscribeTarget::new("default", "foo", "RateLimitStrategy");
        let conn = TestConnection::new("a");
        registry.add(&target, conn.clone()).unwrap();
        registry.add(&target, conn).unwrap();

        assert_eq!(ids(registry.get(&target)), vec!["a"]);
        assert_eq!(registry.subscriptions(&"a".into()), vec![target]);
        registry.assert_consistent();
    }

    #[test]
    fn replaces_invalid_connection() {
        let registry = ConnectionRegistry::default();
        let target = SubscribeTarget::new("default", "foo", "RateLimitStrategy");
        let stale = TestConnection::new("a");
        registry.add(&target, stale.clone()).unwrap();
        stale.close();

        let fresh = TestConnection::new("a");
        registry.add(&target, fresh).unwrap();
        let conns = registry.get(&target).unwrap();
        assert_eq!(conns.len(), 1);
        assert!(conns[0].is_valid());
        registry.assert_consistent();
    }

    #[test]
    fn remove_by_identifier_tears_down_every_slot() {
        let registry = ConnectionRegistry::default();
        let rls = SubscribeTarget::new("default", "foo", "RateLimitStrategy");
        let cbs = SubscribeTarget::new("default", "bar", "CircuitBreakerStrategy");
        registry.add(&rls, TestConnection::new("a")).unwrap();
        registry.add(&cbs, TestConnection::new("a")).unwrap();
        registry.add(&rls, TestConnection::new("b")).unwrap();

        let mut removed = registry.remove_by_identifier(&"a".into());
        removed.sort();
        let mut expected = vec![rls.clone(), cbs.clone()];
        expected.sort();
        assert_eq!(removed, expected);

        assert_eq!(ids(registry.get(&rls)), vec!["b"]);
        assert!(registry.get(&cbs).is_none());
        assert!(registry.subscriptions(&"a".into()).is_empty());
        registry.assert_consistent();

        // Removing an unknown client is a no-op.
        assert!(registry.remove_by_identifier(&"a".into()).is_empty());
        registry.assert_consistent();
    }

    #[test]
    fn remove_single_slot() {
        let registry = ConnectionRegistry::default();
        let rls = SubscribeTarget::new("default", "foo", "RateLimitStrategy");
        let cbs = SubscribeTarget::new("default", "foo", "CircuitBreakerStrategy");
        registry.add(&rls, TestConnection::new("a")).unwrap();
        registry.add(&cbs, TestConnection::new("a")).unwrap();

        assert!(registry.remove(&rls, &"a".into()));
        assert!(!registry.remove(&rls, &"a".into()));
        assert!(registry.get(&rls).is_none());
        assert_eq!(registry.subscriptions(&"a".into()), vec![cbs]);
        registry.assert_consistent();
    }

    #[test]
    fn interleaved_operations_stay_consistent() {
        let registry = ConnectionRegistry::default();
        let targets = ["foo", "bar", "baz"]
            .iter()
            .flat_map(|app| {
                ["RateLimitStrategy", "ThrottlingStrategy"]
                    .iter()
                    .map(move |kind| SubscribeTarget::new("default", app, *kind))
            })
            .collect::<Vec<_>>();

        for (i, target) in targets.iter().enumerate() {
            for client in ["a", "b", "c"].iter().take(i % 3 + 1) {
                registry.add(target, TestConnection::new(client)).unwrap();
                registry.assert_consistent();
            }
        }

        registry.remove(&targets[1], &"a".into());
        registry.assert_consistent();
        registry.remove_by_identifier(&"b".into());
        registry.assert_consistent();
        registry.add(&targets[0], TestConnection::new("b")).unwrap();
        registry.assert_consistent();
        registry.remove_by_identifier(&"a".into());
        registry.remove_by_identifier(&"c".into());
        registry.assert_consistent();

        assert_eq!(ids(registry.get(&targets[0])), vec!["b"]);
        assert_eq!(registry.clients(), 1);
    }
}
