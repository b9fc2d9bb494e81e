use std::{fmt, sync::Arc};

/// Identifies a type of policy resource.
///
/// Kinds are formatted as `<group>/<version>/<Kind>`, e.g.
/// `fault-tolerance.opensergo.io/v1alpha1/RateLimitStrategy`, but the value is
/// otherwise opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind(Arc<str>);

/// Uniquely identifies a single resource instance of a kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

/// The grouping key that clients subscribe to. Several resources of the same
/// kind may govern a single application.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedApp {
    pub namespace: String,
    pub app: String,
}

/// What a client declares interest in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscribeTarget {
    pub namespace: String,
    pub app: String,
    pub kind: ResourceKind,
}

/// Names one logical client connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentifier(Arc<str>);

// === impl ResourceKind ===

impl ResourceKind {
    pub fn new(kind: impl Into<Arc<str>>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for ResourceKind {
    fn from(kind: String) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl NamespacedName ===

impl NamespacedName {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl NamespacedApp ===

impl NamespacedApp {
    pub fn new(namespace: impl ToString, app: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            app: app.to_string(),
        }
    }

    pub fn target(&self, kind: ResourceKind) -> SubscribeTarget {
        SubscribeTarget {
            namespace: self.namespace.clone(),
            app: self.app.clone(),
            kind,
        }
    }
}

impl fmt::Display for NamespacedApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.app)
    }
}

// === impl SubscribeTarget ===

impl SubscribeTarget {
    pub fn new(
        namespace: impl ToString,
        app: impl ToString,
        kind: impl Into<ResourceKind>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            app: app.to_string(),
            kind: kind.into(),
        }
    }

    pub fn namespaced_app(&self) -> NamespacedApp {
        NamespacedApp::new(&self.namespace, &self.app)
    }
}

impl fmt::Display for SubscribeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.app, self.kind)
    }
}

// === impl ClientIdentifier ===

impl ClientIdentifier {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ClientIdentifier {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientIdentifier {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
