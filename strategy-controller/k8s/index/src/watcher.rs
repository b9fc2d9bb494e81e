use crate::{
    cache::{ResourceCache, SetOp},
    kinds::Translate,
    metrics::IndexMetrics,
    WatchError,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use strategy_controller_core::{
    NamespacedApp, NamespacedName, ResourceKind, Rule, SubscribeTarget,
};
use strategy_controller_k8s_api::{DynamicObject, Labels};
use tracing::{debug, trace, warn};

/// Delivers an application's current rules to its subscribers.
#[async_trait::async_trait]
pub trait PushRules: Send + Sync + 'static {
    async fn push(
        &self,
        target: SubscribeTarget,
        rules: Vec<Rule>,
        version: i64,
    ) -> anyhow::Result<()>;
}

/// Maintains the cache for a single resource kind and pushes rule updates to
/// subscribers as resources change.
///
/// Only resources bound to a subscribed target are cached. Every resource of
/// the kind is still remembered as it was last observed, so that a target
/// subscribed after its resources were created is backfilled immediately.
pub struct ResourceWatcher {
    kind: ResourceKind,
    cache: ResourceCache,
    subscriptions: RwLock<Subscriptions>,
    observed: Mutex<HashMap<NamespacedName, Observed>>,
    translate: Translate,
    push: Arc<dyn PushRules>,
    metrics: IndexMetrics,
}

#[derive(Debug, Default)]
struct Subscriptions {
    targets: HashSet<SubscribeTarget>,
    namespaces: HashSet<String>,
    apps: HashSet<NamespacedApp>,
}

#[derive(Clone, Debug)]
struct Observed {
    app: Option<NamespacedApp>,
    resource: Arc<DynamicObject>,
}

/// What a change event did to the cache.
#[derive(Debug, Default)]
struct Changed {
    pushes: Vec<NamespacedApp>,
}

// === impl ResourceWatcher ===

impl ResourceWatcher {
    pub fn new(
        kind: ResourceKind,
        translate: Translate,
        push: Arc<dyn PushRules>,
        metrics: IndexMetrics,
    ) -> Self {
        Self {
            cache: ResourceCache::new(kind.clone(), metrics.clone()),
            kind,
            subscriptions: Default::default(),
            observed: Default::default(),
            translate,
            push,
            metrics,
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Records interest in a target. Returns true if the target was not
    /// already subscribed.
    ///
    /// Resources of this kind that were observed before the target was
    /// subscribed are added to the cache.
    pub fn add_subscribe_target(&self, target: &SubscribeTarget) -> Result<bool, WatchError> {
        if target.kind != self.kind {
            return Err(WatchError::KindMismatch {
                expected: self.kind.clone(),
                actual: target.kind.clone(),
            });
        }

        let observed = self.observed.lock();
        let added = {
            let mut subs = self.subscriptions.write();
            let added = subs.targets.insert(target.clone());
            subs.namespaces.insert(target.namespace.clone());
            subs.apps.insert(target.namespaced_app());
            added
        };

        if added {
            let app = target.namespaced_app();
            for (name, obs) in observed.iter() {
                if obs.app.as_ref() == Some(&app) && self.cache.app_of(name).is_none() {
                    debug!(%name, %app, kind = %self.kind, "Backfilling resource");
                    self.cache
                        .set_by_name(name.clone(), app.clone(), obs.resource.clone());
                    self.cache.set_by_app(&app, obs.resource.clone());
                }
            }
        }

        Ok(added)
    }

    /// Drops interest in a target. Returns true if the target was subscribed.
    pub fn remove_subscribe_target(&self, target: &SubscribeTarget) -> bool {
        let mut subs = self.subscriptions.write();
        if !subs.targets.remove(target) {
            return false;
        }

        subs.namespaces = subs.targets.iter().map(|t| t.namespace.clone()).collect();
        subs.apps = subs.targets.iter().map(|t| t.namespaced_app()).collect();
        true
    }

    pub fn has_subscribed(&self, target: &SubscribeTarget) -> bool {
        self.subscriptions.read().targets.contains(target)
    }

    pub fn has_any_subscribed_of_app(&self, app: &NamespacedApp) -> bool {
        self.subscriptions.read().apps.contains(app)
    }

    pub fn has_any_subscribed_of_namespace(&self, namespace: &str) -> bool {
        self.subscriptions.read().namespaces.contains(namespace)
    }

    /// Handles an add, update (`Some`) or deletion (`None`) of a resource.
    ///
    /// Events for resources that are neither subscribed nor cached are
    /// ignored. Otherwise the cache is updated and every affected
    /// application's rules are pushed. Push failures are logged; the cache is
    /// not rolled back.
    pub async fn on_resource_changed(
        &self,
        kind: &ResourceKind,
        name: NamespacedName,
        resource: Option<DynamicObject>,
        labels: &Labels,
    ) {
        if *kind != self.kind {
            debug!(%kind, watcher = %self.kind, %name, "Ignoring event for another kind");
            return;
        }

        let Changed { pushes } = self.apply(name, resource.map(Arc::new), labels);
        for app in pushes {
            self.push_app(app).await;
        }
    }

    /// Reads and translates the cached rules for an application.
    ///
    /// Translation stops at the first resource that fails to translate; the
    /// rules translated before it are returned.
    pub fn get_rules(&self, app: &NamespacedApp) -> (Vec<Rule>, i64) {
        let (resources, version) = self.cache.get_by_app(app);
        let mut rules = Vec::with_capacity(resources.len());
        for resource in resources {
            match (self.translate)(resource.as_ref()) {
                Ok(rule) => rules.push(rule),
                Err(error) => {
                    warn!(%error, kind = %self.kind, %app, "Failed to translate resource");
                    break;
                }
            }
        }
        (rules, version)
    }

    /// Applies a change event to the cache, returning the applications whose
    /// rules changed.
    fn apply(
        &self,
        name: NamespacedName,
        resource: Option<Arc<DynamicObject>>,
        labels: &Labels,
    ) -> Changed {
        let mut observed = self.observed.lock();
        let app = labels
            .app()
            .map(|app| NamespacedApp::new(&name.namespace, app));
        match resource.as_ref() {
            Some(resource) => {
                observed.insert(
                    name.clone(),
                    Observed {
                        app: app.clone(),
                        resource: resource.clone(),
                    },
                );
            }
            None => {
                observed.remove(&name);
            }
        }

        let previous = self.cache.app_of(&name);
        let subscribed = app
            .as_ref()
            .filter(|app| self.has_subscribed(&app.target(self.kind.clone())));

        let mut changed = Changed::default();
        match (resource, subscribed) {
            (Some(resource), Some(app)) => {
                if let Some(previous) = previous.filter(|p| p != app) {
                    debug!(%name, from = %previous, to = %app, "Resource moved to another application");
                    self.cache.delete_by_app(&previous, &name.name);
                    changed.pushes.push(previous);
                }
                self.cache
                    .set_by_name(name.clone(), app.clone(), resource.clone());
                match self.cache.set_by_app(app, resource) {
                    SetOp::Added => debug!(%name, %app, kind = %self.kind, "Added"),
                    SetOp::Updated => debug!(%name, %app, kind = %self.kind, "Updated"),
                }
                changed.pushes.push(app.clone());
            }

            // The resource was deleted, or is no longer bound to a subscribed
            // target: drop it from the cache if it was there.
            _ => match previous {
                Some(previous) => {
                    debug!(%name, app = %previous, kind = %self.kind, "Removed");
                    self.cache.delete_by_name(&name);
                    self.cache.delete_by_app(&previous, &name.name);
                    changed.pushes.push(previous);
                }
                None => {
                    trace!(%name, kind = %self.kind, "Ignoring unsubscribed resource");
                    self.metrics.event_ignored(&self.kind);
                }
            },
        }

        changed
    }

    async fn push_app(&self, app: NamespacedApp) {
        let (rules, version) = self.get_rules(&app);
        let target = app.target(self.kind.clone());
        if let Err(error) = self.push.push(target, rules, version).await {
            warn!(%error, %app, kind = %self.kind, version, "Failed to push rules");
        }
    }
}

impl std::fmt::Debug for ResourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWatcher")
            .field("kind", &self.kind)
            .field("subscriptions", &*self.subscriptions.read())
            .finish_non_exhaustive()
    }
}
