use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use offline_gateway::{
    config::GatewayConfig,
    handler::{from_callback, handler_fn, ModuleCache, StaticModule, StaticModules},
    server::Gateway,
    service::ServiceDefinition,
    HandlerError, ProxyResponse,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const SERVICE: &[u8] = br#"
service: offline-test
provider:
  stage: dev
custom:
  stageVariables:
    color: blue
functions:
  hello:
    handler: handlers/hello.main
    events:
      - http: GET hello
  users:
    handler: handlers/users.get
    events:
      - http:
          method: get
          path: users/{id}
          cors: true
  broken:
    handler: handlers/broken.main
    events:
      - http:
          method: get
          path: broken
          integration: lambda
  missing:
    handler: handlers/nowhere.main
    events:
      - http: GET missing
  slow:
    handler: handlers/slow.main
    timeout: 1
    events:
      - http: GET slow
  twice:
    handler: handlers/twice.main
    events:
      - http: GET twice
  both:
    handler: handlers/both.main
    events:
      - http: GET both
  mapped:
    handler: handlers/mapped.main
    events:
      - http:
          method: post
          path: items/{id}
          integration: lambda
          request:
            template:
              application/json: '{"id": "$input.params(''id'')", "name": $input.json(''$.name''), "stage": "$context.stage"}'
  passthrough:
    handler: handlers/mapped.main
    events:
      - http:
          method: post
          path: raw
          integration: lambda
"#;

fn modules(loads: Arc<AtomicUsize>) -> StaticModules {
    StaticModules::new()
        .with_module("handlers/hello", move || {
            loads.fetch_add(1, Ordering::SeqCst);
            StaticModule::new().handler(
                "main",
                handler_fn(|_event, _ctx| async {
                    Ok(ProxyResponse::json(200, &json!({ "ok": true })).into_value())
                }),
            )
        })
        .with_module("handlers/users", || {
            StaticModule::new().handler(
                "get",
                handler_fn(|event: Value, _ctx| async move {
                    Ok(json!({
                        "statusCode": 200,
                        "body": {
                            "id": event["pathParameters"]["id"],
                            "resource": event["resource"],
                            "stage": event["requestContext"]["stage"],
                            "offline": event["isOffline"],
                            "color": event["stageVariables"]["color"],
                        },
                    }))
                }),
            )
        })
        .with_module("handlers/broken", || {
            StaticModule::new().handler(
                "main",
                handler_fn(|_event, _ctx| async {
                    Err(HandlerError::new("boom").with_type("TypeError"))
                }),
            )
        })
        .with_module("handlers/slow", || {
            StaticModule::new().handler("main", from_callback(|_event, _ctx| {}))
        })
        .with_module("handlers/twice", || {
            StaticModule::new().handler(
                "main",
                from_callback(|_event, ctx| {
                    ctx.succeed(ProxyResponse::text(200, "first").into_value());
                    ctx.succeed(ProxyResponse::text(200, "second").into_value());
                }),
            )
        })
        .with_module("handlers/both", || {
            StaticModule::new().handler(
                "main",
                handler_fn(|_event, ctx| async move {
                    ctx.succeed(ProxyResponse::text(200, "via-context").into_value());
                    Ok(ProxyResponse::text(200, "via-return").into_value())
                }),
            )
        })
        .with_module("handlers/mapped", || {
            StaticModule::new().handler("main", handler_fn(|event, _ctx| async move { Ok(event) }))
        })
}

fn config(extra: &str) -> GatewayConfig {
    let yaml = format!("service_path: serverless.yml\n{extra}");
    GatewayConfig::from_yaml_bytes(yaml.as_bytes()).unwrap()
}

fn app_with(cfg: GatewayConfig, loads: Arc<AtomicUsize>) -> (Router, Gateway) {
    let service = ServiceDefinition::from_yaml_bytes(SERVICE, "service-root-that-does-not-exist")
        .unwrap();
    let registry = ModuleCache::new(modules(loads));
    let gateway = Gateway::new(&cfg, &service, Arc::new(registry)).unwrap();
    (gateway.router(), gateway)
}

fn app() -> Router {
    app_with(config(""), Arc::default()).0
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(res: axum::response::Response) -> String {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn proxy_route_returns_the_handler_response() {
    let res = app().oneshot(get("/hello")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/json");
    assert_eq!(json_body(res).await, json!({ "ok": true }));
}

#[tokio::test]
async fn proxy_events_carry_path_parameters_and_stage() {
    let res = app().oneshot(get("/users/42")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["id"], "42");
    assert_eq!(body["resource"], "/users/{id}");
    assert_eq!(body["stage"], "dev");
    assert_eq!(body["offline"], true);
    assert_eq!(body["color"], "blue");
}

#[tokio::test]
async fn handler_failures_are_masked_as_200() {
    let res = app().oneshot(get("/broken")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["errorMessage"], "boom");
    assert_eq!(body["errorType"], "TypeError");
    assert!(body["stackTrace"].is_array());
    assert!(body["offlineInfo"].is_string());
}

#[tokio::test]
async fn missing_modules_are_masked_as_200() {
    let res = app().oneshot(get("/missing")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["errorType"], "ModuleNotFoundError");
    assert!(body["errorMessage"].as_str().unwrap().contains("handlers/nowhere"));
}

#[tokio::test]
async fn unmatched_requests_list_existing_routes() {
    let res = app().oneshot(get("/nope")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = json_body(res).await;
    assert_eq!(body["statusCode"], 404);
    assert_eq!(body["currentRoute"], "GET - /nope");
    assert_eq!(
        body["existingRoutes"],
        json!([
            "GET - /both",
            "GET - /broken",
            "GET - /hello",
            "POST - /items/{id}",
            "GET - /missing",
            "POST - /raw",
            "GET - /slow",
            "GET - /twice",
            "GET - /users/{id}",
        ])
    );
}

#[tokio::test]
async fn wrong_method_is_not_found() {
    let req = Request::builder()
        .method("DELETE")
        .uri("/hello")
        .body(Body::empty())
        .unwrap();
    let res = app().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(res).await["currentRoute"], "DELETE - /hello");
}

#[tokio::test]
async fn cors_headers_only_on_cors_routes() {
    let with_origin = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("origin", "http://localhost:8080")
            .body(Body::empty())
            .unwrap()
    };

    let res = app().oneshot(with_origin("/users/1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()["access-control-allow-origin"],
        "http://localhost:8080"
    );
    assert_eq!(res.headers()["access-control-allow-credentials"], "true");

    let res = app().oneshot(with_origin("/hello")).await.unwrap();
    assert!(res.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn cors_origin_defaults_to_wildcard_without_origin_header() {
    let res = app().oneshot(get("/users/1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");

    let res = app().oneshot(get("/hello")).await.unwrap();
    assert!(res.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn preflight_is_answered_for_cors_routes() {
    let preflight = |uri: &str| {
        Request::builder()
            .method("OPTIONS")
            .uri(uri)
            .header("origin", "http://localhost:8080")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap()
    };

    let res = app().oneshot(preflight("/users/1")).await.unwrap();
    assert!(res.status().is_success());
    assert!(res.headers().contains_key("access-control-allow-methods"));

    let res = app().oneshot(preflight("/hello")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn modules_reload_on_every_request() {
    let loads = Arc::new(AtomicUsize::new(0));
    let (app, _gw) = app_with(config(""), Arc::clone(&loads));
    for _ in 0..3 {
        let res = app.clone().oneshot(get("/hello")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert_eq!(loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cache_invalidation_can_be_skipped() {
    let loads = Arc::new(AtomicUsize::new(0));
    let (app, _gw) = app_with(config("skip_cache_invalidation: true"), Arc::clone(&loads));
    for _ in 0..3 {
        app.clone().oneshot(get("/hello")).await.unwrap();
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn handlers_that_never_answer_time_out() {
    let (app, gw) = app_with(config(""), Arc::default());
    let res = app.oneshot(get("/slow")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let text = text_body(res).await;
    assert!(text.contains("'slow'"));
    assert!(text.contains("1000ms"));
    assert!(gw.requests().is_empty());
}

#[tokio::test]
async fn only_the_first_answer_counts() {
    let res = app().oneshot(get("/twice")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_body(res).await, "first");
}

#[tokio::test]
async fn context_answer_beats_a_later_return_value() {
    let res = app().oneshot(get("/both")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_body(res).await, "via-context");
}

#[tokio::test]
async fn lambda_integration_renders_the_request_template() {
    let req = Request::builder()
        .method("POST")
        .uri("/items/7")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"name":"widget"}"#))
        .unwrap();
    let res = app().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/json");
    let body = json_body(res).await;
    assert_eq!(body["id"], "7");
    assert_eq!(body["name"], "widget");
    assert_eq!(body["stage"], "dev");
    assert_eq!(body["isOffline"], true);
    assert_eq!(body["stageVariables"]["color"], "blue");
}

#[tokio::test]
async fn lambda_integration_falls_back_to_the_default_template() {
    let req = Request::builder()
        .method("POST")
        .uri("/raw?sort=asc")
        .header("content-type", "application/json")
        .header("x-trace", "abc")
        .body(Body::from(r#"{"a":1}"#))
        .unwrap();
    let res = app().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["body"], json!({ "a": 1 }));
    assert_eq!(body["method"], "POST");
    assert_eq!(body["stage"], "dev");
    assert_eq!(body["query"]["sort"], "asc");
    assert_eq!(body["headers"]["X-Trace"], "abc");
    assert_eq!(body["identity"]["sourceIp"], "127.0.0.1");
    assert_eq!(body["stageVariables"]["color"], "blue");
}

#[tokio::test]
async fn stage_override_and_prefix_apply() {
    let (app, _gw) = app_with(config("stage: local\nprefix: api"), Arc::default());
    let res = app.clone().oneshot(get("/api/users/9")).await.unwrap();
    assert_eq!(json_body(res).await["stage"], "local");

    let res = app.oneshot(get("/users/9")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
