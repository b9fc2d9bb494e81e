use crate::metrics::IndexMetrics;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use strategy_controller_core::{NamespacedApp, NamespacedName, ResourceKind};
use strategy_controller_k8s_api::{DynamicObject, ResourceExt};

/// Caches the resources of a single kind, both by name and grouped by the
/// application they govern.
///
/// Each application group carries a version that is incremented by every
/// mutation of the group. Groups are never discarded once created, so a
/// group's version never moves backwards even after it is emptied.
#[derive(Debug)]
pub struct ResourceCache {
    kind: ResourceKind,
    index: RwLock<Index>,
    metrics: IndexMetrics,
}

/// Indicates whether `set_by_app` inserted a new resource or replaced one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOp {
    Added,
    Updated,
}

#[derive(Debug, Default)]
struct Index {
    by_name: HashMap<NamespacedName, Cached>,
    by_app: HashMap<NamespacedApp, Group>,
}

#[derive(Clone, Debug)]
struct Cached {
    app: NamespacedApp,
    resource: Arc<DynamicObject>,
}

#[derive(Debug, Default)]
struct Group {
    resources: Vec<Arc<DynamicObject>>,
    version: i64,
}

// === impl ResourceCache ===

impl ResourceCache {
    pub fn new(kind: ResourceKind, metrics: IndexMetrics) -> Self {
        Self {
            kind,
            index: Default::default(),
            metrics,
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn get_by_name(&self, name: &NamespacedName) -> Option<Arc<DynamicObject>> {
        self.index
            .read()
            .by_name
            .get(name)
            .map(|c| c.resource.clone())
    }

    /// Returns the application a cached resource was filed under.
    pub fn app_of(&self, name: &NamespacedName) -> Option<NamespacedApp> {
        self.index.read().by_name.get(name).map(|c| c.app.clone())
    }

    pub fn set_by_name(
        &self,
        name: NamespacedName,
        app: NamespacedApp,
        resource: Arc<DynamicObject>,
    ) {
        self.index
            .write()
            .by_name
            .insert(name, Cached { app, resource });
    }

    pub fn delete_by_name(&self, name: &NamespacedName) -> Option<Arc<DynamicObject>> {
        self.index
            .write()
            .by_name
            .remove(name)
            .map(|c| c.resource)
    }

    /// Returns a snapshot of the resources governing `app` and the group's
    /// version. Unknown applications have no resources and version 0.
    pub fn get_by_app(&self, app: &NamespacedApp) -> (Vec<Arc<DynamicObject>>, i64) {
        self.index
            .read()
            .by_app
            .get(app)
            .map(|g| (g.resources.clone(), g.version))
            .unwrap_or_default()
    }

    /// Inserts or replaces (by name) a resource in an application's group.
    pub fn set_by_app(&self, app: &NamespacedApp, resource: Arc<DynamicObject>) -> SetOp {
        let op = {
            let mut index = self.index.write();
            let group = index.by_app.entry(app.clone()).or_default();
            let name = resource.name_any();
            let op = match group.resources.iter_mut().find(|r| r.name_any() == name) {
                Some(existing) => {
                    *existing = resource;
                    SetOp::Updated
                }
                None => {
                    group.resources.push(resource);
                    SetOp::Added
                }
            };
            group.version += 1;
            op
        };

        self.metrics.cache_set(&self.kind);
        op
    }

    /// Removes a resource from an application's group by name.
    ///
    /// Returns false, without touching the group's version, if no such
    /// resource is present.
    pub fn delete_by_app(&self, app: &NamespacedApp, name: &str) -> bool {
        {
            let mut index = self.index.write();
            let Some(group) = index.by_app.get_mut(app) else {
                return false;
            };
            let Some(pos) = group.resources.iter().position(|r| r.name_any() == name) else {
                return false;
            };
            group.resources.remove(pos);
            group.version += 1;
        }

        self.metrics.cache_delete(&self.kind);
        true
    }
}
