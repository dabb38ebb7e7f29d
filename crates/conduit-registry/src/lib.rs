//! The endpoint router (C4): the named-endpoint table a transport adapter
//! resolves an incoming path against before handing off to
//! `conduit_core::dispatch::got_request`.
//!
//! Endpoints are registered with fully explicit metadata -- path,
//! cardinality, request/reply schema, handler, meta-parameter names,
//! dependency bindings -- rather than recovered by inspecting a handler's
//! Rust signature at runtime, since Rust has no such introspection. The
//! `#[conduit::endpoint]` attribute macro sugars the common case at the call
//! site; this crate only ever sees the explicit form.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{Cardinality, Endpoint, Handler, Path, Provider, Schema};
use parking_lot::RwLock;

/// An endpoint table, optionally delegating to mounted child routers.
///
/// Cheap to hand out as `Arc<Router>` and mount into a parent: lookups are
/// computed lazily at `route` time rather than eagerly merged, so a child
/// router registered into after mounting is still visible through the
/// parent.
#[derive(Default)]
pub struct Router {
    entries: RwLock<HashMap<Path, Endpoint>>,
    children: RwLock<Vec<Arc<Router>>>,
    dependency_overrides: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint from its explicit parts. A path collision with
    /// an entry already in *this* router (not a mounted child) logs a
    /// warning and overwrites -- re-registration is expected during
    /// development, not treated as an error.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        path: Path,
        cardinality: Cardinality,
        request_schema: Schema,
        reply_schema: Schema,
        handler: Arc<dyn Handler>,
        meta_keys: Vec<String>,
        deps: Vec<Arc<dyn Provider>>,
    ) {
        let endpoint = Endpoint::new(path.clone(), cardinality, request_schema, reply_schema, handler)
            .with_meta_keys(meta_keys)
            .with_deps(deps);
        self.register_endpoint(endpoint);
    }

    /// Register an already-built endpoint, e.g. the output of a
    /// `#[conduit::endpoint]`-generated `_endpoint()` function.
    pub fn register_endpoint(&self, mut endpoint: Endpoint) {
        endpoint.deps = self.apply_overrides(endpoint.deps);
        let mut entries = self.entries.write();
        if entries.contains_key(&endpoint.path) {
            tracing::warn!(path = %endpoint.path, "endpoint re-registered, overwriting previous binding");
        }
        entries.insert(endpoint.path.clone(), endpoint);
    }

    /// Resolve a path: this router's own entries shadow any mounted child's,
    /// per §4.4's mount semantics.
    pub fn route(&self, path: &Path) -> Option<Endpoint> {
        if let Some(endpoint) = self.entries.read().get(path) {
            return Some(endpoint.clone());
        }
        for child in self.children.read().iter() {
            if let Some(endpoint) = child.route(path) {
                return Some(endpoint);
            }
        }
        None
    }

    /// Include a child registry. Lookups against it happen lazily, through
    /// `route`, not by eagerly copying its entries in.
    pub fn mount(&self, child: Arc<Router>) {
        self.children.write().push(child);
    }

    /// Bind a dependency override: any provider named `original_name`
    /// passed to a later `register`/`register_endpoint` call on this router
    /// is substituted with `replacement` instead. Applied at registration
    /// time -- endpoints already registered before this call keep their
    /// original bindings.
    pub fn override_dependency(&self, original_name: impl Into<String>, replacement: Arc<dyn Provider>) {
        self.dependency_overrides.write().insert(original_name.into(), replacement);
    }

    /// Every endpoint visible through this router, parent entries first and
    /// shadowing any mounted child registered under the same path. Used by
    /// transports that need to enumerate every registered path up front --
    /// the HTTP adapter's lowercased-URL lookup table (§6's path
    /// canonicalization rule) builds from this once at `start()`.
    pub fn entries(&self) -> Vec<Endpoint> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        self.collect_entries(&mut seen, &mut out);
        out
    }

    fn collect_entries(&self, seen: &mut std::collections::HashSet<Path>, out: &mut Vec<Endpoint>) {
        for (path, endpoint) in self.entries.read().iter() {
            if seen.insert(path.clone()) {
                out.push(endpoint.clone());
            }
        }
        for child in self.children.read().iter() {
            child.collect_entries(seen, out);
        }
    }

    fn apply_overrides(&self, deps: Vec<Arc<dyn Provider>>) -> Vec<Arc<dyn Provider>> {
        let overrides = self.dependency_overrides.read();
        if overrides.is_empty() {
            return deps;
        }
        deps.into_iter()
            .map(|dep| overrides.get(dep.name()).cloned().unwrap_or(dep))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{provider_fn, BoxFuture, HandlerArgs, LogicalType, ReplyOutput, RpcError, Value};

    fn noop_handler() -> Arc<dyn Handler> {
        let f = |_args: HandlerArgs| -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
            Box::pin(async { Ok(ReplyOutput::Unary(Value::Message(Default::default()))) })
        };
        Arc::new(f)
    }

    fn empty_schema(name: &str) -> Schema {
        Schema::new(name, vec![])
    }

    #[test]
    fn register_then_route_returns_endpoint() {
        let router = Router::new();
        let path = Path::from("/pkg.Svc/Method");
        router.register(
            path.clone(),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("pkg.Reply"),
            noop_handler(),
            vec![],
            vec![],
        );
        assert!(router.route(&path).is_some());
        assert!(router.route(&Path::from("/pkg.Svc/Missing")).is_none());
    }

    #[test]
    fn reregistration_overwrites_rather_than_errors() {
        let router = Router::new();
        let path = Path::from("/pkg.Svc/Method");
        for _ in 0..2 {
            router.register(
                path.clone(),
                Cardinality::UnaryUnary,
                empty_schema("pkg.Req"),
                empty_schema("pkg.Reply"),
                noop_handler(),
                vec![],
                vec![],
            );
        }
        assert!(router.route(&path).is_some());
    }

    #[test]
    fn parent_entry_shadows_mounted_child() {
        let parent = Router::new();
        let child = Arc::new(Router::new());
        let path = Path::from("/pkg.Svc/Method");

        child.register(
            path.clone(),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("child.Reply"),
            noop_handler(),
            vec![],
            vec![],
        );
        parent.mount(child.clone());
        assert_eq!(parent.route(&path).unwrap().reply_schema.name, "child.Reply");

        parent.register(
            path.clone(),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("parent.Reply"),
            noop_handler(),
            vec![],
            vec![],
        );
        assert_eq!(parent.route(&path).unwrap().reply_schema.name, "parent.Reply");
    }

    #[test]
    fn child_registered_after_mount_is_still_visible() {
        let parent = Router::new();
        let child = Arc::new(Router::new());
        parent.mount(child.clone());

        let path = Path::from("/pkg.Svc/Late");
        child.register(
            path.clone(),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("pkg.Reply"),
            noop_handler(),
            vec![],
            vec![],
        );
        assert!(parent.route(&path).is_some());
    }

    #[tokio_test_lite::test]
    async fn override_dependency_substitutes_by_provider_name() {
        let router = Router::new();
        let real = provider_fn("db", || async { Ok::<u32, RpcError>(1) });
        let fake = provider_fn("db", || async { Ok::<u32, RpcError>(42) });
        router.override_dependency("db", fake);

        router.register(
            Path::from("/pkg.Svc/Method"),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("pkg.Reply"),
            noop_handler(),
            vec![],
            vec![real],
        );

        let endpoint = router.route(&Path::from("/pkg.Svc/Method")).unwrap();
        assert_eq!(endpoint.deps.len(), 1);
        let scope = conduit_core::DependencyScope::resolve(&endpoint.deps).await.unwrap();
        assert_eq!(*scope.get::<u32>("db").unwrap(), 42);
    }

    #[test]
    fn entries_collects_parent_and_child_without_duplicates() {
        let parent = Router::new();
        let child = Arc::new(Router::new());
        child.register(
            Path::from("/pkg.Svc/Child"),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("pkg.Reply"),
            noop_handler(),
            vec![],
            vec![],
        );
        parent.mount(child);
        parent.register(
            Path::from("/pkg.Svc/Parent"),
            Cardinality::UnaryUnary,
            empty_schema("pkg.Req"),
            empty_schema("pkg.Reply"),
            noop_handler(),
            vec![],
            vec![],
        );

        let paths: Vec<String> = parent.entries().iter().map(|e| e.path.to_string()).collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&"/pkg.Svc/Parent".to_string()));
        assert!(paths.contains(&"/pkg.Svc/Child".to_string()));
    }

    #[test]
    fn unused_import_guard() {
        let _ = LogicalType::Bool;
    }
}
