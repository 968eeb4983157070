//! axum server wiring.
//!
//! Every request goes through one fallback handler that matches it against the [`RouteTable`],
//! applies the route's CORS layer and hands it to the route's [`InvocationController`]. Unmatched
//! requests get the catch-all diagnostic.
//!
//! [`InvocationController`]: crate::invoke::InvocationController

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, request::Parts, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use tower::{service_fn, Layer as _, ServiceExt as _};

use crate::{
    config::GatewayConfig,
    context::{RequestSnapshot, StageConfig},
    handler::{DylibLoader, HandlerRegistry, ModuleCache},
    invoke::InvocationSettings,
    requests::RequestTable,
    response::GatewayResponse,
    routes::{Route, RouteMatch, RouteOptions, RouteTable},
    service::ServiceDefinition,
};

#[derive(Clone)]
struct AppState {
    routes: Arc<RouteTable>,
    max_body_bytes: usize,
}

/// A service definition compiled into a servable app.
pub struct Gateway {
    routes: Arc<RouteTable>,
    requests: Arc<RequestTable>,
    max_body_bytes: usize,
}

impl Gateway {
    pub fn new(
        cfg: &GatewayConfig,
        service: &ServiceDefinition,
        registry: Arc<dyn HandlerRegistry>,
    ) -> anyhow::Result<Self> {
        let stage = StageConfig {
            name: cfg.stage.clone().unwrap_or_else(|| service.stage.clone()),
            variables: service.stage_variables.clone(),
            principal_fallback: cfg.principal_fallback(),
        };
        let options = RouteOptions {
            prefix: cfg.prefix.clone(),
            cors: cfg.cors.clone(),
            template_root: service.root.clone(),
            settings: InvocationSettings {
                stage,
                skip_cache_invalidation: cfg.skip_cache_invalidation,
                no_timeout: cfg.no_timeout,
            },
        };

        let requests = Arc::new(RequestTable::new());
        let routes = RouteTable::build(&service.functions, &options, registry, Arc::clone(&requests))?;
        Ok(Self {
            routes: Arc::new(routes),
            requests,
            max_body_bytes: cfg.max_body_bytes,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    pub fn router(&self) -> Router {
        Router::new().fallback(handle_any).with_state(AppState {
            routes: Arc::clone(&self.routes),
            max_body_bytes: self.max_body_bytes,
        })
    }

    /// Cancel pending timers and drop every in-flight record.
    pub fn shutdown(&self) {
        let pending = self.requests.len();
        self.requests.clear();
        tracing::info!(event = "gateway_stopped", pending_requests = pending);
    }
}

pub async fn run(cfg: GatewayConfig) -> anyhow::Result<()> {
    let service = ServiceDefinition::load(&cfg.service_path).await?;
    let registry = Arc::new(ModuleCache::new(DylibLoader::new(service.root.clone())));
    let gateway = Gateway::new(&cfg, &service, registry)?;

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!(
        event = "gateway_listening",
        addr = %listener.local_addr()?,
        service = %service.name,
        routes = gateway.routes().len(),
        catch_all = gateway.routes().has_catch_all(),
    );

    let app = gateway.router();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    gateway.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(event = "signal_handler_failed", error = %err);
    }
}

/// `/a/b/` and `/a/b` route the same; `/` stays `/`.
fn trim_trailing_slashes(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

async fn handle_any(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let path = trim_trailing_slashes(parts.uri.path()).to_string();

    match state.routes.match_request(&parts.method, &path) {
        RouteMatch::NotFound => {
            tracing::debug!(
                event = "route_not_found",
                method = %parts.method,
                path = %path,
            );
            GatewayResponse::not_found(parts.method.as_str(), &path, state.routes.existing_routes())
                .into_response()
        }
        RouteMatch::Preflight(layer) => {
            // The layer answers OPTIONS itself; the inner service is never reached.
            let preflight = layer.clone().layer(service_fn(|_req: Request<Body>| async {
                Ok::<_, Infallible>(StatusCode::NO_CONTENT.into_response())
            }));
            preflight
                .oneshot(Request::from_parts(parts, Body::empty()))
                .await
                .unwrap_or_else(|never| match never {})
        }
        RouteMatch::Matched { route, path_params } => {
            let body = match to_bytes(body, state.max_body_bytes).await {
                Ok(b) => b,
                Err(_) => {
                    tracing::debug!(
                        event = "request_rejected",
                        reason = "body_too_large",
                        route = %route.path,
                    );
                    return GatewayResponse::text(StatusCode::PAYLOAD_TOO_LARGE, "body too large")
                        .into_response();
                }
            };
            invoke_route(route, path_params, parts, body).await
        }
    }
}

async fn invoke_route(
    route: &Route,
    path_params: std::collections::BTreeMap<String, String>,
    parts: Parts,
    body: Bytes,
) -> Response {
    // An explicit OPTIONS route answers for itself; the CORS layer would treat it as a preflight.
    let cors = route
        .cors_layer()
        .filter(|_| parts.method != Method::OPTIONS)
        .cloned();

    let controller = route.controller().clone();
    let resource = route.path.clone();
    let invoke = service_fn(move |req: Request<Bytes>| {
        let controller = controller.clone();
        let (parts, body) = req.into_parts();
        let request = RequestSnapshot::from_parts(&parts, &resource, path_params.clone());
        async move { Ok::<_, Infallible>(controller.handle(request, body).await.into_response()) }
    });

    let req = Request::from_parts(parts, body);
    let result = match cors {
        Some(layer) => layer.layer(invoke).oneshot(req).await.map(|mut res| {
            // Mirroring has nothing to mirror without an Origin header.
            res.headers_mut()
                .entry(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .or_insert(HeaderValue::from_static("*"));
            res
        }),
        None => invoke.oneshot(req).await,
    };
    result.unwrap_or_else(|never| match never {})
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handler::{handler_fn, StaticModule, StaticModules};

    fn gateway(max_body_bytes: usize) -> Gateway {
        let service = ServiceDefinition::from_yaml_bytes(
            br#"
functions:
  echo:
    handler: h.echo
    events:
      - http: POST echo
      - http: GET /
"#,
            ".",
        )
        .unwrap();
        let cfg = GatewayConfig {
            max_body_bytes,
            ..GatewayConfig::from_yaml_bytes(b"service_path: serverless.yml").unwrap()
        };
        let registry = ModuleCache::new(StaticModules::new().with_module("h", || {
            StaticModule::new().handler(
                "echo",
                handler_fn(|event, _ctx| async move {
                    Ok(json!({ "statusCode": 200, "body": event["body"].clone() }))
                }),
            )
        }));
        Gateway::new(&cfg, &service, Arc::new(registry)).unwrap()
    }

    async fn body_text(res: Response) -> String {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn trailing_slashes_are_ignored() {
        assert_eq!(trim_trailing_slashes("/a/b/"), "/a/b");
        assert_eq!(trim_trailing_slashes("/a//"), "/a");
        assert_eq!(trim_trailing_slashes("/"), "/");
        assert_eq!(trim_trailing_slashes("//"), "/");
    }

    #[tokio::test]
    async fn routes_with_a_trailing_slash() {
        let res = gateway(1024)
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo/")
                    .body(Body::from("hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "hi");
    }

    #[tokio::test]
    async fn payload_too_large_is_rejected() {
        let res = gateway(1)
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .body(Body::from("too-big"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn root_route_is_served() {
        let res = gateway(1024)
            .router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn shutdown_clears_pending_records() {
        let gw = gateway(1024);
        let _rx = gw.requests().begin("r1");
        assert_eq!(gw.requests().len(), 1);
        gw.shutdown();
        assert!(gw.requests().is_empty());
    }
}
