use ahash::AHashMap as HashMap;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use strategy_controller_core::{ResourceKind, Rule};
use strategy_controller_k8s_api::{self as k8s, ApiResource, DynamicObject, Resource};

/// Translates a cached resource into its wire-level rule.
pub type Translate = Arc<dyn Fn(&DynamicObject) -> anyhow::Result<Rule> + Send + Sync>;

/// Describes a resource kind that clients may subscribe to.
#[derive(Clone)]
pub struct KindMetadata {
    kind: ResourceKind,
    api_resource: ApiResource,
    translate: Translate,
}

/// The static table of supported kinds.
#[derive(Clone, Debug, Default)]
pub struct Kinds(HashMap<ResourceKind, KindMetadata>);

// === impl KindMetadata ===

impl KindMetadata {
    pub fn new(kind: ResourceKind, api_resource: ApiResource, translate: Translate) -> Self {
        Self {
            kind,
            api_resource,
            translate,
        }
    }

    /// Describes a statically-typed resource. Cached objects are parsed as `K`
    /// before being translated.
    pub fn of<K>(translate: fn(&K) -> anyhow::Result<Rule>) -> Self
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + 'static,
    {
        let erased = Arc::new(move |obj: &DynamicObject| -> anyhow::Result<Rule> {
            let resource = obj.clone().try_parse::<K>()?;
            translate(&resource)
        });
        Self {
            kind: k8s::resource_kind::<K>().into(),
            api_resource: ApiResource::erase::<K>(&()),
            translate: erased,
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.api_resource
    }

    pub fn translate(&self) -> &Translate {
        &self.translate
    }
}

impl fmt::Debug for KindMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindMetadata")
            .field("kind", &self.kind)
            .field("api_resource", &self.api_resource)
            .finish_non_exhaustive()
    }
}

// === impl Kinds ===

impl Kinds {
    pub fn get(&self, kind: &ResourceKind) -> Option<&KindMetadata> {
        self.0.get(kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KindMetadata> {
        self.0.values()
    }
}

impl FromIterator<KindMetadata> for Kinds {
    fn from_iter<T: IntoIterator<Item = KindMetadata>>(iter: T) -> Self {
        Self(iter.into_iter().map(|m| (m.kind.clone(), m)).collect())
    }
}
