//! Route table construction and matching.
//!
//! Every HTTP event of every function becomes a [`Route`] at a normalized path. Paths are
//! compiled into a `matchit` router; methods are looked up per path, with `ANY` routes as the
//! fallback. Requests nothing matches get the catch-all diagnostic unless a user route already
//! captures every path.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use http::Method;
use matchit::Router;
use tower_http::cors::CorsLayer;

use crate::{
    cors::CorsPolicy,
    handler::HandlerRegistry,
    invoke::{InvocationController, InvocationSettings, InvocationShared, RouteIntegration},
    requests::RequestTable,
    service::{FunctionDefinition, Integration},
    templates::{TemplateKind, TemplateLoader},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteMethod {
    /// `ANY` or `*`.
    Any,
    Exact(Method),
}

impl RouteMethod {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "ANY" | "*" => Ok(Self::Any),
            _ => Method::from_bytes(upper.as_bytes())
                .map(Self::Exact)
                .with_context(|| format!("invalid http method {s:?}")),
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMethod::Any => f.write_str("ANY"),
            RouteMethod::Exact(m) => f.write_str(m.as_str()),
        }
    }
}

/// Options the route table is built with.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Prepended to every event path.
    pub prefix: String,
    /// The policy `cors: true` selects and overrides are merged over.
    pub cors: CorsPolicy,
    /// Directory template files are resolved against.
    pub template_root: PathBuf,
    pub settings: InvocationSettings,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            cors: CorsPolicy::default(),
            template_root: PathBuf::from("."),
            settings: InvocationSettings::default(),
        }
    }
}

/// A declared (method, path) bound to its function.
pub struct Route {
    pub method: RouteMethod,
    /// Normalized path, `{name}` parameters and an optional trailing `{name*}`.
    pub path: String,
    pub cors: Option<CorsPolicy>,
    controller: InvocationController,
    cors_layer: Option<CorsLayer>,
}

impl Route {
    pub fn controller(&self) -> &InvocationController {
        &self.controller
    }

    pub fn cors_layer(&self) -> Option<&CorsLayer> {
        self.cors_layer.as_ref()
    }

    pub fn describe(&self) -> String {
        format!("{} - {}", self.method, self.path)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("function", &self.controller.function().name)
            .field("cors", &self.cors.is_some())
            .finish()
    }
}

/// All routes declared at one path.
#[derive(Debug)]
struct PathEntry {
    routes: HashMap<RouteMethod, Route>,
    /// Answers `OPTIONS` preflights when some route here declares CORS.
    preflight: Option<CorsLayer>,
}

/// A `matchit` slot: the entry plus, for the parent of a greedy path, the greedy parameter to
/// bind to the empty string.
#[derive(Debug)]
struct Slot {
    entry: usize,
    empty_param: Option<String>,
}

/// Outcome of matching a request against the table.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Matched {
        route: &'a Route,
        path_params: BTreeMap<String, String>,
    },
    /// An `OPTIONS` request at a CORS-enabled path with no `OPTIONS` route.
    Preflight(&'a CorsLayer),
    NotFound,
}

type Declared = (RouteMethod, Option<CorsPolicy>, InvocationController);

#[derive(Debug)]
pub struct RouteTable {
    router: Router<Slot>,
    entries: Vec<PathEntry>,
    existing_routes: Vec<String>,
    has_catch_all: bool,
}

impl RouteTable {
    pub fn build(
        functions: &[FunctionDefinition],
        options: &RouteOptions,
        registry: Arc<dyn HandlerRegistry>,
        requests: Arc<RequestTable>,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(InvocationShared {
            settings: options.settings.clone(),
            registry,
            requests,
        });
        let templates = TemplateLoader::new(options.template_root.clone());
        let prefix = normalize_prefix(&options.prefix);

        // Group by path first: a path's CORS layer needs every method declared there.
        let mut by_path: BTreeMap<String, Vec<Declared>> = BTreeMap::new();
        for function in functions {
            let function_arc = Arc::new(function.clone());
            for event in function.events.iter().filter_map(|e| e.http()) {
                let method = RouteMethod::parse(&event.method)
                    .with_context(|| format!("function {}", function.name))?;
                let path = normalize_path(&prefix, &event.path);
                let cors = options
                    .cors
                    .for_event(event.cors.as_ref())
                    .with_context(|| format!("function {}: {method} {path}", function.name))?;

                let integration = match event.integration {
                    Integration::LambdaProxy => RouteIntegration::Proxy,
                    Integration::Lambda => RouteIntegration::Lambda {
                        request: templates
                            .resolve_templates(function, event, TemplateKind::Request)
                            .with_context(|| {
                                format!("function {}: request template", function.name)
                            })?,
                        response: templates
                            .resolve_templates(function, event, TemplateKind::Response)
                            .with_context(|| {
                                format!("function {}: response template", function.name)
                            })?,
                    },
                };

                let routes = by_path.entry(path.clone()).or_default();
                if routes.iter().any(|(m, _, _)| *m == method) {
                    anyhow::bail!("duplicate route {method} {path} (function {})", function.name);
                }
                tracing::info!(
                    event = "route_registered",
                    method = %method,
                    route = %path,
                    function = %function.name,
                    integration = event.integration.as_str(),
                    cors = cors.is_some(),
                );
                let controller = InvocationController::new(
                    Arc::clone(&shared),
                    Arc::clone(&function_arc),
                    integration,
                );
                routes.push((method, cors, controller));
            }
        }

        let mut router = Router::new();
        let mut entries = Vec::with_capacity(by_path.len());
        let mut existing_routes = Vec::new();
        let mut has_catch_all = false;
        let mut greedy_parents = Vec::new();

        for (path, declared) in by_path {
            let methods: Option<Vec<Method>> = declared
                .iter()
                .map(|(m, _, _)| match m {
                    RouteMethod::Any => None,
                    RouteMethod::Exact(m) => Some(m.clone()),
                })
                .collect();

            let mut routes = HashMap::with_capacity(declared.len());
            let mut preflight = None;
            for (method, cors, controller) in declared {
                let cors_layer = cors
                    .as_ref()
                    .map(|policy| policy.layer(methods.as_deref()))
                    .transpose()
                    .with_context(|| format!("invalid cors policy for {method} {path}"))?;
                if preflight.is_none() {
                    preflight = cors_layer.clone();
                }
                if method == RouteMethod::Any && is_root_catch_all(&path) {
                    has_catch_all = true;
                }
                let route = Route {
                    method: method.clone(),
                    path: path.clone(),
                    cors,
                    controller,
                    cors_layer,
                };
                existing_routes.push((path.clone(), method.to_string()));
                routes.insert(method, route);
            }
            if routes.contains_key(&RouteMethod::Exact(Method::OPTIONS)) {
                preflight = None;
            }

            let index = entries.len();
            router
                .insert(to_matchit_path(&path)?, Slot {
                    entry: index,
                    empty_param: None,
                })
                .with_context(|| format!("route {path} conflicts with another declared path"))?;
            if let Some((parent, param)) = greedy_parent(&path) {
                greedy_parents.push((parent, param, index));
            }
            entries.push(PathEntry { routes, preflight });
        }

        // `/a/{x*}` also answers `/a`, unless `/a` is declared itself.
        for (parent, param, index) in greedy_parents {
            let Ok(matchit_parent) = to_matchit_path(&parent) else {
                continue;
            };
            let slot = Slot {
                entry: index,
                empty_param: Some(param),
            };
            if router.insert(matchit_parent, slot).is_err() {
                tracing::debug!(event = "greedy_parent_skipped", route = %parent);
            }
        }

        existing_routes.sort();
        Ok(Self {
            router,
            entries,
            existing_routes: existing_routes
                .into_iter()
                .map(|(path, method)| format!("{method} - {path}"))
                .collect(),
            has_catch_all,
        })
    }

    /// Match a request path (trailing slashes already stripped).
    pub fn match_request(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        let Ok(matched) = self.router.at(path) else {
            return RouteMatch::NotFound;
        };
        let slot = matched.value;
        let Some(entry) = self.entries.get(slot.entry) else {
            return RouteMatch::NotFound;
        };

        let route = entry
            .routes
            .get(&RouteMethod::Exact(method.clone()))
            .or_else(|| {
                (method == Method::HEAD)
                    .then(|| entry.routes.get(&RouteMethod::Exact(Method::GET)))
                    .flatten()
            })
            .or_else(|| {
                // Preflights go to the CORS layer before `ANY` routes see them.
                if method == Method::OPTIONS && entry.preflight.is_some() {
                    None
                } else {
                    entry.routes.get(&RouteMethod::Any)
                }
            });

        match route {
            Some(route) => {
                let mut path_params: BTreeMap<String, String> = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                if let Some(param) = &slot.empty_param {
                    path_params.insert(param.clone(), String::new());
                }
                RouteMatch::Matched {
                    route,
                    path_params,
                }
            }
            None => match (&entry.preflight, method == Method::OPTIONS) {
                (Some(layer), true) => RouteMatch::Preflight(layer),
                _ => RouteMatch::NotFound,
            },
        }
    }

    /// `METHOD - path` for every declared route, sorted by path then method.
    pub fn existing_routes(&self) -> &[String] {
        &self.existing_routes
    }

    /// Whether a user route `ANY /{name*}` answers every request.
    pub fn has_catch_all(&self) -> bool {
        self.has_catch_all
    }

    pub fn len(&self) -> usize {
        self.existing_routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.existing_routes.is_empty()
    }
}

/// Prefix with exactly one leading and one trailing `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Join `prefix` and an event path into the route path.
///
/// One leading `/` of the event path is dropped, repeated slashes collapse, a trailing `/` is
/// removed (except for `/` itself) and a trailing greedy `{name+}` becomes `{name*}`.
pub fn normalize_path(prefix: &str, path: &str) -> String {
    let prefix = normalize_prefix(prefix);
    let path = path.trim();
    let joined = format!("{prefix}{}", path.strip_prefix('/').unwrap_or(path));

    let mut out = String::with_capacity(joined.len());
    for c in joined.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.ends_with("+}") {
        if let Some(open) = out.rfind('{') {
            let name = out[open + 1..out.len() - 2].to_string();
            out.truncate(open);
            out.push_str(&format!("{{{name}*}}"));
        }
    }
    out
}

fn is_root_catch_all(path: &str) -> bool {
    path.starts_with("/{")
        && path.ends_with("*}")
        && !path[1..].contains('/')
}

/// For `/a/{x*}`: `("/a", "x")`.
fn greedy_parent(path: &str) -> Option<(String, String)> {
    let name = path.strip_suffix("*}")?;
    let open = name.rfind("/{")?;
    let param = name[open + 2..].to_string();
    let parent = if open == 0 {
        "/".to_string()
    } else {
        path[..open].to_string()
    };
    Some((parent, param))
}

/// Check a normalized path's parameters and rewrite the greedy `{name*}` into `matchit`'s
/// `{*name}`.
fn to_matchit_path(path: &str) -> anyhow::Result<String> {
    if !path.starts_with('/') {
        anyhow::bail!("route paths must start with '/': {path}");
    }

    let mut out = String::with_capacity(path.len());
    let mut param: Option<String> = None;
    for ch in path.chars() {
        match (ch, param.as_mut()) {
            ('{', Some(_)) => anyhow::bail!("nested '{{' in route path: {path}"),
            ('{', None) => param = Some(String::new()),
            ('}', None) => anyhow::bail!("unmatched '}}' in route path: {path}"),
            ('}', Some(name)) => {
                let greedy = name.ends_with('*');
                let name = name.trim_end_matches('*');
                if name.is_empty() {
                    anyhow::bail!("empty '{{}}' param in route path: {path}");
                }
                if greedy {
                    out.push_str(&format!("{{*{name}}}"));
                } else {
                    out.push_str(&format!("{{{name}}}"));
                }
                param = None;
            }
            (c, Some(name)) => name.push(c),
            (c, None) => out.push(c),
        }
    }
    if param.is_some() {
        anyhow::bail!("unclosed '{{' in route path: {path}");
    }
    if let Some(star) = out.find("{*") {
        if !out[star..].ends_with('}') || out[star..].contains('/') {
            anyhow::bail!("a greedy parameter must be the last path segment: {path}");
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        handler::{handler_fn, ModuleCache, StaticModule, StaticModules},
        service::ServiceDefinition,
    };

    fn table(yaml: &str, prefix: &str) -> anyhow::Result<RouteTable> {
        let service = ServiceDefinition::from_yaml_bytes(yaml.as_bytes(), ".")?;
        let registry = ModuleCache::new(StaticModules::new().with_module("h", || {
            StaticModule::new().handler("main", handler_fn(|_e, _c| async { Ok(json!({})) }))
        }));
        RouteTable::build(
            &service.functions,
            &RouteOptions {
                prefix: prefix.to_string(),
                ..RouteOptions::default()
            },
            Arc::new(registry),
            Arc::new(RequestTable::new()),
        )
    }

    fn matched<'a>(m: RouteMatch<'a>) -> (&'a Route, BTreeMap<String, String>) {
        match m {
            RouteMatch::Matched { route, path_params } => (route, path_params),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn normalizes_prefixes() {
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("api"), "/api/");
        assert_eq!(normalize_prefix("/api/v1/"), "/api/v1/");
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("/", "hello"), "/hello");
        assert_eq!(normalize_path("/", "/hello/"), "/hello");
        assert_eq!(normalize_path("/", "/"), "/");
        assert_eq!(normalize_path("/", ""), "/");
        assert_eq!(normalize_path("api", "users/{id}"), "/api/users/{id}");
        assert_eq!(normalize_path("/api/", "/users/"), "/api/users");
        assert_eq!(normalize_path("/", "files/{proxy+}"), "/files/{proxy*}");
        assert_eq!(normalize_path("/", "//a//b/"), "/a/b");
    }

    #[test]
    fn normalization_is_idempotent() {
        for p in ["hello", "/a/{b}/", "files/{proxy+}", "//x//", "/", "{any+}"] {
            let once = normalize_path("/", p);
            assert_eq!(normalize_path("/", &once), once, "{p}");
        }
    }

    #[test]
    fn converts_greedy_params_for_matchit() {
        assert_eq!(to_matchit_path("/v1/items/{id}").unwrap(), "/v1/items/{id}");
        assert_eq!(to_matchit_path("/files/{proxy*}").unwrap(), "/files/{*proxy}");
        assert!(to_matchit_path("v1/items").is_err());
        assert!(to_matchit_path("/v1/{").is_err());
        assert!(to_matchit_path("/v1/}").is_err());
        assert!(to_matchit_path("/v1/{}").is_err());
        assert!(to_matchit_path("/v1/{{id}}").is_err());
        assert!(to_matchit_path("/{a*}/b").is_err());
    }

    #[test]
    fn greedy_parents() {
        assert_eq!(greedy_parent("/files/{p*}"), Some(("/files".to_string(), "p".to_string())));
        assert_eq!(greedy_parent("/{p*}"), Some(("/".to_string(), "p".to_string())));
        assert_eq!(greedy_parent("/files/{p}"), None);
    }

    const SERVICE: &str = r#"
functions:
  a:
    handler: h.main
    events:
      - http: GET users/{id}
      - http: any files/{path+}
      - http:
          method: post
          path: users
          cors: true
"#;

    #[test]
    fn matches_methods_params_and_greedy_paths() {
        let t = table(SERVICE, "/").unwrap();

        let (route, params) = matched(t.match_request(&Method::GET, "/users/7"));
        assert_eq!(route.path, "/users/{id}");
        assert_eq!(params["id"], "7");

        let (route, _) = matched(t.match_request(&Method::HEAD, "/users/7"));
        assert_eq!(route.method, RouteMethod::Exact(Method::GET));

        let (route, params) = matched(t.match_request(&Method::DELETE, "/files/a/b.txt"));
        assert_eq!(route.method, RouteMethod::Any);
        assert_eq!(params["path"], "a/b.txt");

        let (_, params) = matched(t.match_request(&Method::GET, "/files"));
        assert_eq!(params["path"], "");

        assert!(matches!(t.match_request(&Method::PUT, "/users/7"), RouteMatch::NotFound));
        assert!(matches!(t.match_request(&Method::GET, "/nope"), RouteMatch::NotFound));
    }

    #[test]
    fn preflight_only_where_cors_is_declared() {
        let t = table(SERVICE, "/").unwrap();
        assert!(matches!(t.match_request(&Method::OPTIONS, "/users"), RouteMatch::Preflight(_)));
        assert!(matches!(t.match_request(&Method::OPTIONS, "/users/1"), RouteMatch::NotFound));

        let (route, _) = matched(t.match_request(&Method::POST, "/users"));
        assert!(route.cors_layer().is_some());
    }

    #[test]
    fn existing_routes_are_sorted_by_path() {
        let t = table(SERVICE, "/").unwrap();
        assert_eq!(
            t.existing_routes(),
            ["ANY - /files/{path*}", "POST - /users", "GET - /users/{id}"]
        );
        assert!(!t.has_catch_all());
    }

    #[test]
    fn prefix_applies_to_every_route() {
        let t = table(SERVICE, "dev").unwrap();
        matched(t.match_request(&Method::GET, "/dev/users/1"));
        assert!(matches!(t.match_request(&Method::GET, "/users/1"), RouteMatch::NotFound));
    }

    #[test]
    fn root_any_greedy_route_is_a_catch_all() {
        let yaml = r#"
functions:
  a:
    handler: h.main
    events:
      - http: ANY {proxy+}
"#;
        let t = table(yaml, "/").unwrap();
        assert!(t.has_catch_all());
        let (_, params) = matched(t.match_request(&Method::GET, "/"));
        assert_eq!(params["proxy"], "");
        let (_, params) = matched(t.match_request(&Method::PATCH, "/x/y"));
        assert_eq!(params["proxy"], "x/y");
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let yaml = r#"
functions:
  a:
    handler: h.main
    events:
      - http: GET x
      - http: get /x/
"#;
        let err = table(yaml, "/").unwrap_err();
        assert!(err.to_string().contains("duplicate route"));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let yaml = r#"
functions:
  a:
    handler: h.main
    events:
      - http: GET items/{id
"#;
        assert!(table(yaml, "/").is_err());
    }
}
