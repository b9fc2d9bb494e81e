use crate::{ResourceKind, SubscribeTarget};
use std::{fmt, str::FromStr};

const DELIMITER: char = '/';

/// A resource name requested over the discovery protocol.
///
/// On the wire this is `<kind>/<app>/<namespace>`. The kind itself is
/// `/`-delimited, so names are parsed from the right: the last two segments
/// are the namespace and app and everything before them is the kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    pub kind: ResourceKind,
    pub app: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource name {0:?}: expected <kind>/<app>/<namespace>")]
pub struct InvalidResourceName(String);

// === impl ResourceName ===

impl ResourceName {
    pub fn target(&self) -> SubscribeTarget {
        SubscribeTarget {
            namespace: self.namespace.clone(),
            app: self.app.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl From<SubscribeTarget> for ResourceName {
    fn from(SubscribeTarget { namespace, app, kind }: SubscribeTarget) -> Self {
        Self {
            kind,
            app,
            namespace,
        }
    }
}

impl FromStr for ResourceName {
    type Err = InvalidResourceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidResourceName(s.to_string());

        let mut parts = s.rsplitn(3, DELIMITER);
        let namespace = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let app = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let kind = parts.next().ok_or_else(invalid)?;
        if kind.split(DELIMITER).any(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self {
            kind: ResourceKind::from(kind),
            app: app.to_string(),
            namespace: namespace.to_string(),
        })
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}",
            self.kind, self.app, self.namespace
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE_LIMIT: &str = "fault-tolerance.opensergo.io/v1alpha1/RateLimitStrategy";

    #[test]
    fn parses_compound_kind() {
        let name = format!("{RATE_LIMIT}/foo-app/default")
            .parse::<ResourceName>()
            .expect("must parse");
        assert_eq!(name.kind.as_str(), RATE_LIMIT);
        assert_eq!(name.app, "foo-app");
        assert_eq!(name.namespace, "default");
        assert_eq!(
            name.target(),
            SubscribeTarget::new("default", "foo-app", RATE_LIMIT)
        );
    }

    #[test]
    fn display_matches_wire_format() {
        let name = ResourceName::from(SubscribeTarget::new("ns-0", "app-0", RATE_LIMIT));
        assert_eq!(name.to_string(), format!("{RATE_LIMIT}/app-0/ns-0"));
        assert_eq!(name.to_string().parse::<ResourceName>(), Ok(name));
    }

    #[test]
    fn rejects_missing_segments() {
        assert!("".parse::<ResourceName>().is_err());
        assert!("app/ns".parse::<ResourceName>().is_err());
        assert!("Kind//ns".parse::<ResourceName>().is_err());
        assert!("Kind/app/".parse::<ResourceName>().is_err());
        assert!("group//Kind/app/ns".parse::<ResourceName>().is_err());
    }
}
