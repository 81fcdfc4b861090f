/// Core routing data model shared by the registry, router and connector
pub mod backend;
pub mod policy;
pub mod registry;
pub mod router;
pub mod session;

use std::collections::BTreeMap;
use std::fmt;

/// Id given to origins that register without an explicit identity.
/// Such origins are renamed to their `host:port` form when admitted
/// into an [`OriginSet`].
pub const ANONYMOUS_ORIGIN_ID: &str = "anonymous-origin";

/// One network-addressable backend instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Unique within the owning origin set
    pub id: String,
    /// The application this origin serves; stamped at admission
    pub app_id: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(
        id: impl Into<String>,
        app_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            app_id: app_id.into(),
            host: host.into(),
            port,
        }
    }

    /// An origin with no identity of its own; it receives one at admission
    pub fn anonymous(host: impl Into<String>, port: u16) -> Self {
        Self::new(ANONYMOUS_ORIGIN_ID, "", host, port)
    }

    /// The `host:port` form used as the admission id for anonymous origins
    pub fn host_as_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Id normalization applied when an origin is admitted into a backend:
    /// anonymous ids are rewritten to `host:port`, and the owning
    /// application id is stamped on regardless.
    pub fn admitted(self, app_id: &str) -> Origin {
        if self.id.contains(ANONYMOUS_ORIGIN_ID) {
            Origin {
                id: self.host_as_string(),
                app_id: app_id.to_string(),
                ..self
            }
        } else {
            Origin {
                app_id: app_id.to_string(),
                ..self
            }
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.id, self.host, self.port)
    }
}

/// The origins belonging to one logical backend application.
///
/// Deduplicated by origin id with stable (sorted) iteration order.
/// Immutable once attached to a descriptor; reconfiguration replaces
/// the whole set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginSet {
    origins: BTreeMap<String, Origin>,
}

impl OriginSet {
    /// An origin set with no members. Routing to it yields a
    /// no-origins-available failure rather than an error at build time.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Admit origins into a backend owned by `app_id`, applying the id
    /// normalization rule. A later origin with the same admitted id
    /// replaces an earlier one.
    pub fn admit(app_id: &str, origins: impl IntoIterator<Item = Origin>) -> Self {
        let mut set = BTreeMap::new();
        for origin in origins {
            let origin = origin.admitted(app_id);
            set.insert(origin.id.clone(), origin);
        }
        Self { origins: set }
    }

    pub fn get(&self, id: &str) -> Option<&Origin> {
        self.origins.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.origins.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Origin> {
        self.origins.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.origins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_origin_is_renamed_at_admission() {
        let origin = Origin::anonymous("localhost", 9090);
        let admitted = origin.admitted("landing");

        assert_eq!(admitted.id, "localhost:9090");
        assert_eq!(admitted.app_id, "landing");
        assert_eq!(admitted.host, "localhost");
        assert_eq!(admitted.port, 9090);
    }

    #[test]
    fn test_named_origin_keeps_id_but_gets_app_id() {
        let origin = Origin::new("app-01", "someone-else", "10.0.1.5", 8080);
        let admitted = origin.admitted("app");

        assert_eq!(admitted.id, "app-01");
        assert_eq!(admitted.app_id, "app");
    }

    #[test]
    fn test_admission_matches_on_id_substring() {
        // Generated ids embed the anonymous marker, e.g. "anonymous-origin-3"
        let origin = Origin::new("anonymous-origin-3", "", "localhost", 7001);
        let admitted = origin.admitted("app");
        assert_eq!(admitted.id, "localhost:7001");
    }

    #[test]
    fn test_origin_set_dedupes_by_admitted_id() {
        let set = OriginSet::admit(
            "app",
            vec![
                Origin::anonymous("localhost", 9090),
                Origin::new("localhost:9090", "", "localhost", 9090),
            ],
        );
        assert_eq!(set.len(), 1);
        assert!(set.contains("localhost:9090"));
    }

    #[test]
    fn test_origin_set_iteration_is_sorted_by_id() {
        let set = OriginSet::admit(
            "app",
            vec![
                Origin::new("b-02", "", "localhost", 2),
                Origin::new("a-01", "", "localhost", 1),
            ],
        );
        let ids: Vec<&str> = set.ids().collect();
        assert_eq!(ids, vec!["a-01", "b-02"]);
    }

    #[test]
    fn test_empty_set() {
        let set = OriginSet::empty();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
        assert!(!set.contains("anything"));
    }
}
