//! HTTP responses produced by the gateway, and the shaping of handler results into them.

use axum::response::IntoResponse;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Value};

use crate::error::InvocationError;

/// Static pointer included in every failure body.
pub const OFFLINE_INFO: &str =
    "offline-gateway: if you believe this is an issue with the gateway itself, please report it.";

fn application_json() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    /// A plain text response (no default content-type is set).
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(body.into()),
        }
    }

    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self::text(status, body.to_string()).with_header(header::CONTENT_TYPE, application_json())
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// The masked failure: HTTP 200 carrying the error's details.
    pub fn failure(err: &InvocationError) -> Self {
        Self::json(
            StatusCode::OK,
            &json!({
                "errorMessage": err.message(),
                "errorType": err.error_type(),
                "stackTrace": err.stack_trace(),
                "offlineInfo": OFFLINE_INFO,
            }),
        )
    }

    pub fn timeout(function: &str, timeout_ms: u64) -> Self {
        Self::text(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Your λ handler '{function}' timed out after {timeout_ms}ms."),
        )
        .with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
    }

    pub fn bad_gateway() -> Self {
        Self::json(
            StatusCode::BAD_GATEWAY,
            &json!({ "message": "Internal server error" }),
        )
    }

    /// The catch-all diagnostic. `existing_routes` must already be sorted.
    pub fn not_found(method: &str, path: &str, existing_routes: &[String]) -> Self {
        Self::json(
            StatusCode::NOT_FOUND,
            &json!({
                "statusCode": 404,
                "error": "Route not found. Check the method and path against existingRoutes.",
                "currentRoute": format!("{method} - {path}"),
                "existingRoutes": existing_routes,
            }),
        )
    }

    /// `lambda` integration: always 200; the rendered response template wins over the raw result.
    pub fn from_lambda_result(result: &Value, rendered: Option<String>) -> Self {
        let body = match rendered {
            Some(text) if !text.trim().is_empty() => text,
            _ => match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        Self::text(StatusCode::OK, body).with_header(header::CONTENT_TYPE, application_json())
    }

    /// `lambda-proxy` integration: `{statusCode, headers, multiValueHeaders, body, isBase64Encoded}`.
    pub fn from_proxy_result(result: &Value) -> Result<Self, MalformedProxyResult> {
        let Value::Object(fields) = result else {
            return Err(MalformedProxyResult::NotAnObject);
        };

        let status = match fields.get("statusCode") {
            None | Some(Value::Null) => StatusCode::OK,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .and_then(|n| StatusCode::from_u16(n).ok())
                .ok_or_else(|| MalformedProxyResult::Status(n.to_string()))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<u16>()
                .ok()
                .and_then(|n| StatusCode::from_u16(n).ok())
                .ok_or_else(|| MalformedProxyResult::Status(s.clone()))?,
            Some(other) => return Err(MalformedProxyResult::Status(other.to_string())),
        };

        let mut headers = HeaderMap::new();
        if let Some(Value::Object(single)) = fields.get("headers") {
            for (name, value) in single {
                if let Some((name, value)) = header_pair(name, value) {
                    headers.insert(name, value);
                }
            }
        }
        if let Some(Value::Object(multi)) = fields.get("multiValueHeaders") {
            for (name, values) in multi {
                let Value::Array(values) = values else {
                    continue;
                };
                for value in values {
                    if let Some((name, value)) = header_pair(name, value) {
                        headers.append(name, value);
                    }
                }
            }
        }
        headers
            .entry(header::CONTENT_TYPE)
            .or_insert(application_json());

        let text = match fields.get("body") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let body = if fields.get("isBase64Encoded") == Some(&Value::Bool(true)) {
            Bytes::from(STANDARD.decode(text.trim()).map_err(MalformedProxyResult::Base64)?)
        } else {
            Bytes::from(text)
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

fn header_pair(name: &str, value: &Value) -> Option<(HeaderName, HeaderValue)> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&text),
    ) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            tracing::warn!(event = "proxy_header_dropped", header = %name, "invalid header in proxy result");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedProxyResult {
    #[error("proxy result must be an object")]
    NotAnObject,
    #[error("invalid statusCode {0}")]
    Status(String),
    #[error("body is not valid base64: {0}")]
    Base64(#[source] base64::DecodeError),
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> axum::response::Response {
        let mut res = axum::response::Response::new(axum::body::Body::from(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}
