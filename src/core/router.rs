/// Request-path dispatch over the registry
use std::sync::Arc;

use crate::core::backend::BackendDescriptor;
use crate::core::registry::BackendRegistry;
use crate::error::{PorticoError, PorticoResult};

/// Resolves an inbound request path to exactly one backend descriptor
/// via longest-matching-prefix.
///
/// Resolution is a pure read over a point-in-time snapshot and is safe
/// to call from any number of request-handling tasks; identical-length
/// prefix ties are impossible because the registry holds at most one
/// descriptor per prefix.
pub struct Router {
    registry: Arc<BackendRegistry>,
}

impl Router {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve `path` against the current registry snapshot
    pub fn resolve(&self, path: &str) -> PorticoResult<Arc<BackendDescriptor>> {
        self.registry
            .snapshot()
            .resolve(path)
            .cloned()
            .ok_or_else(|| PorticoError::no_route(path))
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::BackendDescriptor;
    use crate::core::Origin;

    fn descriptor(app_id: &str, prefix: &str) -> BackendDescriptor {
        BackendDescriptor::http(app_id, prefix, vec![Origin::anonymous("localhost", 9090)])
            .unwrap()
    }

    fn router_with(routes: Vec<(&str, &str)>) -> Router {
        let registry = Arc::new(BackendRegistry::new());
        registry
            .put_all(
                routes
                    .into_iter()
                    .map(|(prefix, app)| (prefix.to_string(), descriptor(app, prefix))),
            )
            .unwrap();
        Router::new(registry)
    }

    #[test]
    fn test_resolve_prefers_longest_prefix() {
        let router = router_with(vec![
            ("/", "root"),
            ("/shop/", "shop"),
            ("/shop/checkout/", "checkout"),
        ]);

        assert_eq!(router.resolve("/shop/checkout/pay").unwrap().app_id, "checkout");
        assert_eq!(router.resolve("/shop/browse").unwrap().app_id, "shop");
        assert_eq!(router.resolve("/about").unwrap().app_id, "root");
    }

    #[test]
    fn test_resolve_without_match_fails() {
        let router = router_with(vec![("/api/", "api")]);
        let result = router.resolve("/other");
        assert!(matches!(result, Err(PorticoError::NoRoute { path }) if path == "/other"));
    }

    #[test]
    fn test_resolve_exact_prefix_boundary() {
        let router = router_with(vec![("/tls12", "tls12"), ("/tls11-to-tls12", "cross")]);

        // "/tls11-to-tls12/c" starts with "/tls11-to-tls12", not "/tls12"
        assert_eq!(router.resolve("/tls11-to-tls12/c").unwrap().app_id, "cross");
        assert_eq!(router.resolve("/tls12/b2").unwrap().app_id, "tls12");
    }

    #[test]
    fn test_resolution_tracks_registry_updates() {
        let registry = Arc::new(BackendRegistry::new());
        registry.put("/app/", descriptor("v1", "/app/"));
        let router = Router::new(Arc::clone(&registry));

        assert_eq!(router.resolve("/app/x").unwrap().app_id, "v1");

        registry.put("/app/", descriptor("v2", "/app/"));
        assert_eq!(router.resolve("/app/x").unwrap().app_id, "v2");

        registry.remove("/app/");
        assert!(router.resolve("/app/x").is_err());
    }
}
