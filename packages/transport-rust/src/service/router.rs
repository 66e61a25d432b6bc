//! Route matching: picks the [`Controller`] for a request path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use strest_core::{Request, Response};
use tracing::debug;

use super::controller::Controller;
use crate::network::sink::{ResponseSink, SinkError};

// ---------------------------------------------------------------------------
// Route patterns
// ---------------------------------------------------------------------------

/// Param name under which a trailing `*` stores the rest of the path.
pub const WILDCARD_PARAM: &str = "*";

/// Errors raised while registering a controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route '{0}' is already registered")]
    Duplicate(String),
    #[error("invalid route '{route}': {reason}")]
    Invalid { route: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Canonical form of a path: leading slash, no trailing or doubled slashes.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in segments(path) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn parse_pattern(route: &str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason: &str| RouteError::Invalid {
        route: route.to_string(),
        reason: reason.to_string(),
    };
    let raw: Vec<&str> = segments(route).collect();
    let mut parsed = Vec::with_capacity(raw.len());
    for (i, segment) in raw.iter().enumerate() {
        if *segment == WILDCARD_PARAM {
            if i + 1 != raw.len() {
                return Err(invalid("'*' must be the last segment"));
            }
            parsed.push(Segment::Wildcard);
        } else if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("empty parameter name"));
            }
            if parsed.iter().any(|s| matches!(s, Segment::Param(n) if n == name)) {
                return Err(invalid("parameter name used twice"));
            }
            parsed.push(Segment::Param(name.to_string()));
        } else {
            parsed.push(Segment::Literal((*segment).to_string()));
        }
    }
    Ok(parsed)
}

fn match_pattern(pattern: &[Segment], path: &str) -> Option<BTreeMap<String, String>> {
    let parts: Vec<&str> = segments(path).collect();
    let mut params = BTreeMap::new();
    for (i, segment) in pattern.iter().enumerate() {
        match segment {
            Segment::Wildcard => {
                params.insert(WILDCARD_PARAM.to_string(), parts[i.min(parts.len())..].join("/"));
                return Some(params);
            }
            Segment::Literal(literal) => {
                if parts.get(i) != Some(&literal.as_str()) {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), (*parts.get(i)?).to_string());
            }
        }
    }
    (parts.len() == pattern.len()).then_some(params)
}

struct PatternRoute {
    route: String,
    segments: Vec<Segment>,
    controller: Arc<dyn Controller>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Result of a successful route lookup.
pub struct RouteMatch {
    pub controller: Arc<dyn Controller>,
    /// Values captured by `:name` segments and a trailing `*`.
    pub params: BTreeMap<String, String>,
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("route", &self.controller.route())
            .field("params", &self.params)
            .finish()
    }
}

/// Maps request paths to controllers.
///
/// Routes without `:name` or `*` segments are looked up exactly and win
/// over patterns. Patterns are tried in registration order.
#[derive(Default)]
pub struct Router {
    exact: HashMap<String, Arc<dyn Controller>>,
    patterns: Vec<PatternRoute>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller under its own [`Controller::route`].
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Duplicate`] if the route is already taken and
    /// [`RouteError::Invalid`] if the pattern is malformed.
    pub fn register(&mut self, controller: impl Controller + 'static) -> Result<(), RouteError> {
        self.register_arc(Arc::new(controller))
    }

    /// Registers an already shared controller.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn register_arc(&mut self, controller: Arc<dyn Controller>) -> Result<(), RouteError> {
        let route = normalize(controller.route());
        let parsed = parse_pattern(&route)?;
        let is_exact = parsed.iter().all(|s| matches!(s, Segment::Literal(_)));

        if self.exact.contains_key(&route) || self.patterns.iter().any(|p| p.route == route) {
            return Err(RouteError::Duplicate(route));
        }
        debug!(route = %route, "registered controller");
        if is_exact {
            self.exact.insert(route, controller);
        } else {
            self.patterns.push(PatternRoute {
                route,
                segments: parsed,
                controller,
            });
        }
        Ok(())
    }

    /// Finds the controller for `path`. Any query string is ignored.
    #[must_use]
    pub fn match_route(&self, path: &str) -> Option<RouteMatch> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        let path = normalize(path);
        if let Some(controller) = self.exact.get(&path) {
            return Some(RouteMatch {
                controller: Arc::clone(controller),
                params: BTreeMap::new(),
            });
        }
        self.patterns.iter().find_map(|p| {
            match_pattern(&p.segments, &path).map(|params| RouteMatch {
                controller: Arc::clone(&p.controller),
                params,
            })
        })
    }

    /// Routes `request` to its controller, copying captured path values
    /// into the request params. Unknown paths get a 404 through `sink`.
    ///
    /// # Errors
    ///
    /// Returns the sink error if a response could not be delivered.
    pub async fn dispatch(
        &self,
        mut request: Request,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<(), SinkError> {
        let Some(found) = self.match_route(request.path()) else {
            debug!(uri = request.uri(), transport = sink.transport(), "no route");
            let message = format!("no route for {}", request.path());
            return sink.deliver(Response::error(&request, 404, &message)).await;
        };
        for (name, value) in found.params {
            request.set_param(&name, value);
        }
        found.controller.handle(request, sink).await
    }

    /// All registered routes, exact ones first.
    #[must_use]
    pub fn routes(&self) -> Vec<&str> {
        let mut exact: Vec<&str> = self.exact.keys().map(String::as_str).collect();
        exact.sort_unstable();
        exact.extend(self.patterns.iter().map(|p| p.route.as_str()));
        exact
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("routes", &self.routes()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sink::RecordingSink;
    use crate::service::controller::{handler_fn, MethodController};

    fn echo_route(route: &str) -> MethodController {
        let route_name = route.to_string();
        MethodController::all(
            route,
            handler_fn(move |request: Request, sink: Arc<dyn ResponseSink>| {
                let route_name = route_name.clone();
                async move {
                    let mut response = Response::new(&request);
                    response.put("data.route", route_name.as_str());
                    sink.deliver(response).await
                }
            }),
        )
    }

    #[test]
    fn exact_route_beats_pattern() {
        let mut router = Router::new();
        router.register(echo_route("/users/:id")).unwrap();
        router.register(echo_route("/users/me")).unwrap();

        let found = router.match_route("/users/me").unwrap();
        assert_eq!(found.controller.route(), "/users/me");
        assert!(found.params.is_empty());

        let found = router.match_route("/users/42").unwrap();
        assert_eq!(found.controller.route(), "/users/:id");
        assert_eq!(found.params["id"], "42");
    }

    #[test]
    fn patterns_match_in_registration_order() {
        let mut router = Router::new();
        router.register(echo_route("/files/:name")).unwrap();
        router.register(echo_route("/files/*")).unwrap();

        assert_eq!(
            router.match_route("/files/a.txt").unwrap().controller.route(),
            "/files/:name"
        );
        let deep = router.match_route("/files/a/b/c.txt").unwrap();
        assert_eq!(deep.controller.route(), "/files/*");
        assert_eq!(deep.params[WILDCARD_PARAM], "a/b/c.txt");
    }

    #[test]
    fn wildcard_matches_empty_remainder() {
        let mut router = Router::new();
        router.register(echo_route("/static/*")).unwrap();
        let found = router.match_route("/static").unwrap();
        assert_eq!(found.params[WILDCARD_PARAM], "");
    }

    #[test]
    fn paths_are_normalized_and_query_ignored() {
        let mut router = Router::new();
        router.register(echo_route("ping/")).unwrap();
        assert!(router.match_route("/ping").is_some());
        assert!(router.match_route("//ping/").is_some());
        assert!(router.match_route("/ping?verbose=1").is_some());
        assert!(router.match_route("/pong").is_none());
        assert_eq!(router.routes(), vec!["/ping"]);
    }

    #[test]
    fn param_does_not_span_segments() {
        let mut router = Router::new();
        router.register(echo_route("/users/:id")).unwrap();
        assert!(router.match_route("/users").is_none());
        assert!(router.match_route("/users/1/posts").is_none());
    }

    #[test]
    fn duplicate_and_invalid_routes_are_rejected() {
        let mut router = Router::new();
        router.register(echo_route("/a")).unwrap();
        assert_eq!(
            router.register(echo_route("/a/")),
            Err(RouteError::Duplicate("/a".to_string()))
        );
        assert!(matches!(
            router.register(echo_route("/a/*/b")),
            Err(RouteError::Invalid { .. })
        ));
        assert!(matches!(
            router.register(echo_route("/a/:")),
            Err(RouteError::Invalid { .. })
        ));
        assert!(matches!(
            router.register(echo_route("/a/:x/:x")),
            Err(RouteError::Invalid { .. })
        ));
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_copies_captures_into_params() {
        let mut router = Router::new();
        router
            .register(MethodController::new("/users/:id").on(
                &["GET"],
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    let mut response = Response::new(&request);
                    response.put("data.id", request.param_str("id"));
                    sink.deliver(response).await
                }),
            ))
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        router
            .dispatch(Request::new("GET", "/users/7?x=1").with_txn_id("t"), sink.clone())
            .await
            .unwrap();
        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].get_str("data.id"), "7");
        assert_eq!(responses[0].txn_id(), "t");
    }

    #[tokio::test]
    async fn dispatch_unknown_path_is_404() {
        let router = Router::new();
        let sink = Arc::new(RecordingSink::default());
        router
            .dispatch(Request::new("GET", "/nowhere").with_txn_id("n"), sink.clone())
            .await
            .unwrap();
        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code(), 404);
        assert_eq!(responses[0].txn_id(), "n");
        assert!(responses[0].is_terminal());
    }
}
