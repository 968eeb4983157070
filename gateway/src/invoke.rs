//! The per-request invocation lifecycle.
//!
//! `received → handler-resolved → event-built → invoked → responded`, with every failure along
//! the way folded into the masked error body (HTTP 200). The handler runs on its own task and
//! races the function timeout on the request's record in the [`RequestTable`].

use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use futures::FutureExt as _;
use offline_handler::InvocationInfo;
use serde_json::{json, Map, Value};

use crate::{
    context::{request_context, Context, Payload, RequestSnapshot, StageConfig},
    error::InvocationError,
    handler::{panic_message, HandlerRegistry, HandlerResult, LambdaContext},
    requests::RequestTable,
    response::GatewayResponse,
    service::FunctionDefinition,
    templates::TemplateMap,
    vtl,
};

/// Gateway-wide settings every invocation reads.
#[derive(Debug, Clone, Default)]
pub struct InvocationSettings {
    pub stage: StageConfig,
    /// Keep loaded modules between requests instead of reloading them.
    pub skip_cache_invalidation: bool,
    /// Let handlers run past their configured timeout.
    pub no_timeout: bool,
}

/// State shared by every route's controller.
pub struct InvocationShared {
    pub settings: InvocationSettings,
    pub registry: Arc<dyn HandlerRegistry>,
    pub requests: Arc<RequestTable>,
}

/// How a route builds events and shapes results.
#[derive(Debug, Clone)]
pub enum RouteIntegration {
    /// Mapping templates in both directions.
    Lambda {
        request: TemplateMap,
        response: TemplateMap,
    },
    /// The fixed proxy envelope in, `{statusCode, headers, body}` out.
    Proxy,
}

/// Invokes one function for one route.
#[derive(Clone)]
pub struct InvocationController {
    shared: Arc<InvocationShared>,
    function: Arc<FunctionDefinition>,
    integration: RouteIntegration,
}

/// Drops the request's record however the request ends (including a client disconnect).
struct RecordGuard<'a> {
    requests: &'a RequestTable,
    id: &'a str,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.requests.finish(self.id);
    }
}

impl InvocationController {
    pub fn new(
        shared: Arc<InvocationShared>,
        function: Arc<FunctionDefinition>,
        integration: RouteIntegration,
    ) -> Self {
        Self {
            shared,
            function,
            integration,
        }
    }

    pub fn function(&self) -> &FunctionDefinition {
        &self.function
    }

    pub async fn handle(&self, request: RequestSnapshot, body: Bytes) -> GatewayResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        let requests = Arc::clone(&self.shared.requests);
        let reply = requests.begin(&request_id);
        let _record = RecordGuard {
            requests: &requests,
            id: &request_id,
        };

        tracing::debug!(
            event = "invocation_started",
            function = %self.function.name,
            route = %request.resource_path,
            request_id = %request_id,
        );

        if !self.shared.settings.no_timeout {
            let timer = tokio::spawn({
                let requests = Arc::clone(&requests);
                let id = request_id.clone();
                let function = self.function.name.clone();
                let timeout_ms = self.function.timeout_ms;
                async move {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    if requests.resolve(&id, GatewayResponse::timeout(&function, timeout_ms)) {
                        tracing::warn!(
                            event = "invocation_timeout",
                            function = %function,
                            request_id = %id,
                            timeout_ms = timeout_ms,
                            "handler timed out"
                        );
                    }
                }
            });
            requests.attach_timeout(&request_id, timer.abort_handle());
        }

        tokio::spawn({
            let this = self.clone();
            let id = request_id.clone();
            async move {
                let response = match AssertUnwindSafe(this.invoke(&id, request, body))
                    .catch_unwind()
                    .await
                {
                    Ok(response) => response,
                    Err(payload) => {
                        let err = InvocationError::Panic(panic_message(&*payload));
                        this.log_failure(&id, &err);
                        GatewayResponse::failure(&err)
                    }
                };
                if !this.shared.requests.resolve(&id, response) {
                    tracing::debug!(
                        event = "late_reply_dropped",
                        function = %this.function.name,
                        request_id = %id,
                    );
                }
            }
        });

        match reply.await {
            Ok(response) => response,
            Err(_) => GatewayResponse::failure(&InvocationError::Panic(
                "invocation ended without a response".to_string(),
            )),
        }
    }

    async fn invoke(&self, request_id: &str, request: RequestSnapshot, body: Bytes) -> GatewayResponse {
        let content_type = request.content_type();
        let payload = Payload::parse(String::from_utf8_lossy(&body).into_owned(), &content_type);
        match self.run(request_id, &request, payload, &content_type).await {
            Ok(response) => response,
            Err(err) => {
                self.log_failure(request_id, &err);
                GatewayResponse::failure(&err)
            }
        }
    }

    async fn run(
        &self,
        request_id: &str,
        request: &RequestSnapshot,
        payload: Payload,
        content_type: &str,
    ) -> Result<GatewayResponse, InvocationError> {
        let registry = &self.shared.registry;
        if !self.shared.settings.skip_cache_invalidation {
            registry.invalidate_all();
        }
        let handler = registry.resolve_handler(&self.function.handler)?;

        let event = self.build_event(request, payload, content_type)?;

        let (context, completion) = LambdaContext::new(
            self.invocation_info(request_id),
            Duration::from_millis(self.function.timeout_ms),
        );
        // The return value is one more answer through the context; the first answer wins.
        let answer = context.clone();
        let call = async move {
            answer.done(handler.call(event, context).await);
            std::future::pending::<HandlerResult>().await
        };
        let result = tokio::select! {
            result = completion.wait() => result,
            result = call => result,
        };

        Ok(self.shape(request_id, request, result?, content_type))
    }

    fn build_event(
        &self,
        request: &RequestSnapshot,
        payload: Payload,
        content_type: &str,
    ) -> Result<Value, InvocationError> {
        let stage = &self.shared.settings.stage;
        let mut event = match &self.integration {
            RouteIntegration::Lambda { request: templates, .. } => {
                let template = templates.select(content_type)?;
                let context = Context::build(request, stage, payload);
                vtl::render(template, &context)?
            }
            RouteIntegration::Proxy => proxy_event(request, &payload, stage),
        };
        if let Value::Object(fields) = &mut event {
            fields.insert("isOffline".to_string(), Value::Bool(true));
            fields.insert("stageVariables".to_string(), stage.variables_value());
        }
        Ok(event)
    }

    fn shape(
        &self,
        request_id: &str,
        request: &RequestSnapshot,
        result: Value,
        content_type: &str,
    ) -> GatewayResponse {
        match &self.integration {
            RouteIntegration::Lambda { response, .. } => {
                match self.render_response(request, &result, response, content_type) {
                    Ok(rendered) => GatewayResponse::from_lambda_result(&result, rendered),
                    Err(err) => {
                        self.log_failure(request_id, &err);
                        GatewayResponse::failure(&err)
                    }
                }
            }
            RouteIntegration::Proxy => match GatewayResponse::from_proxy_result(&result) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        event = "malformed_proxy_result",
                        function = %self.function.name,
                        request_id = %request_id,
                        error = %err,
                        "answering 502"
                    );
                    GatewayResponse::bad_gateway()
                }
            },
        }
    }

    fn render_response(
        &self,
        request: &RequestSnapshot,
        result: &Value,
        templates: &TemplateMap,
        content_type: &str,
    ) -> Result<Option<String>, InvocationError> {
        let template = templates.select(content_type)?;
        if template.trim().is_empty() {
            return Ok(None);
        }
        let context = Context::build(
            request,
            &self.shared.settings.stage,
            Payload::from_value(result.clone()),
        );
        Ok(Some(vtl::render_to_string(template, &context)?))
    }

    fn invocation_info(&self, request_id: &str) -> InvocationInfo {
        let name = &self.function.name;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        InvocationInfo {
            function_name: name.clone(),
            function_version: "$LATEST".to_string(),
            invoked_function_arn: format!("offline_invokedFunctionArn_for_{name}"),
            memory_limit_in_mb: self.function.memory_size_mb,
            aws_request_id: format!("offline_awsRequestId_{request_id}"),
            log_group_name: format!("offline_logGroupName_for_{name}"),
            log_stream_name: format!("offline_logStreamName_for_{name}"),
            deadline_ms: now_ms + self.function.timeout_ms,
            environment: self.function.environment.clone(),
        }
    }

    fn log_failure(&self, request_id: &str, err: &InvocationError) {
        tracing::warn!(
            event = "invocation_failed",
            function = %self.function.name,
            request_id = %request_id,
            error_type = %err.error_type(),
            error = %err,
            "answering with the masked error body"
        );
    }
}

/// The fixed `lambda-proxy` event.
pub fn proxy_event(request: &RequestSnapshot, payload: &Payload, stage: &StageConfig) -> Value {
    let string_map = |m: &std::collections::BTreeMap<String, String>| -> Value {
        if m.is_empty() {
            return Value::Null;
        }
        Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect::<Map<_, _>>(),
        )
    };
    json!({
        "resource": request.resource_path,
        "path": request.path,
        "httpMethod": request.method.as_str().to_ascii_uppercase(),
        "headers": request.capitalized_headers(),
        "queryStringParameters": string_map(&request.query),
        "pathParameters": string_map(&request.path_params),
        "stageVariables": stage.variables_value(),
        "requestContext": request_context(request, stage),
        "body": if payload.raw.is_empty() { Value::Null } else { Value::String(payload.raw.clone()) },
        "isBase64Encoded": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::snapshot;

    #[test]
    fn proxy_events_carry_the_request() {
        let stage = StageConfig {
            name: "dev".to_string(),
            ..Default::default()
        };
        let payload = Payload::parse(r#"{"a":1}"#.to_string(), "application/json");
        let event = proxy_event(&snapshot(), &payload, &stage);

        assert_eq!(event["resource"], "/users/{id}");
        assert_eq!(event["path"], "/users/42");
        assert_eq!(event["httpMethod"], "POST");
        assert_eq!(event["headers"]["User-Agent"], "curl/8");
        assert_eq!(event["queryStringParameters"]["sort"], "asc");
        assert_eq!(event["pathParameters"]["id"], "42");
        assert_eq!(event["requestContext"]["stage"], "dev");
        assert_eq!(event["body"], r#"{"a":1}"#);
        assert_eq!(event["isBase64Encoded"], false);
    }

    #[test]
    fn empty_parameters_and_bodies_are_null() {
        let mut request = snapshot();
        request.query.clear();
        request.path_params.clear();
        let event = proxy_event(&request, &Payload::default(), &StageConfig::default());
        assert!(event["queryStringParameters"].is_null());
        assert!(event["pathParameters"].is_null());
        assert!(event["body"].is_null());
    }
}
