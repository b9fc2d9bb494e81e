use std::{collections::BTreeMap, sync::Arc};

/// The label that binds a policy resource to the application it governs.
pub const APP_LABEL: &str = "app";

pub type Map = BTreeMap<String, String>;

/// A cheaply-cloneable snapshot of a resource's labels.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Labels(Arc<Map>);

// === impl Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the application this resource is bound to, if any.
    pub fn app(&self) -> Option<&str> {
        self.get(APP_LABEL).filter(|app| !app.is_empty())
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_label() {
        let labels = Labels::from(maplit::btreemap! {
            "app".to_string() => "foo".to_string(),
            "tier".to_string() => "web".to_string(),
        });
        assert_eq!(labels.app(), Some("foo"));
        assert_eq!(labels.get("tier"), Some("web"));

        assert_eq!(Labels::from(None).app(), None);
        assert_eq!(
            Some(("app", "")).into_iter().collect::<Labels>().app(),
            None,
            "empty app labels are ignored"
        );
    }
}
