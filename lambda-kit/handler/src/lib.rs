//! Handler-side contract for `offline-gateway`.
//!
//! Handlers invoked by the gateway receive a JSON event plus invocation metadata and answer with a
//! JSON value or a [`HandlerError`]. This crate holds the types both sides agree on:
//! - [`HandlerError`]: the structured failure reported back to the gateway
//! - [`InvocationInfo`]: serializable invocation metadata (function name, request id, deadline, ...)
//! - [`ProxyResponse`]: a builder for `lambda-proxy` integration results
//! - [`abi`]: the C ABI used by handlers compiled as shared libraries

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod abi;

fn default_error_type() -> String {
    "Error".to_string()
}

/// Failure reported by a handler.
///
/// Serialized with the gateway's field names (`errorMessage`, `errorType`, `stackTrace`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerError {
    pub error_message: String,
    #[serde(default = "default_error_type")]
    pub error_type: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl HandlerError {
    /// An `Error`-typed failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            error_type: default_error_type(),
            stack_trace: Vec::new(),
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_stack_trace(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = frames;
        self
    }

    /// Build from any error, recording its `source()` chain as the stack trace.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut frames = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            frames.push(cause.to_string());
            source = cause.source();
        }
        Self::new(err.to_string()).with_stack_trace(frames)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(value.to_string()).with_type("SyntaxError")
    }
}

/// Invocation metadata handed to every handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationInfo {
    pub function_name: String,
    pub function_version: String,
    pub invoked_function_arn: String,
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: u64,
    pub aws_request_id: String,
    pub log_group_name: String,
    pub log_stream_name: String,
    /// Wall-clock deadline, milliseconds since the Unix epoch.
    pub deadline_ms: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Body of a proxy-integration response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    #[default]
    Empty,
    Text(String),
    Binary(Vec<u8>),
}

impl From<()> for ResponseBody {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<&str> for ResponseBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// A `lambda-proxy` result: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

impl Default for ProxyResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            body: ResponseBody::Empty,
        }
    }
}

impl ProxyResponse {
    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: ResponseBody::Text(body.into()),
        }
    }

    /// JSON body with a `Content-Type: application/json` header.
    pub fn json(status_code: u16, body: &Value) -> Self {
        Self::text(status_code, body.to_string()).with_header("Content-Type", "application/json")
    }

    pub fn binary(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: ResponseBody::Binary(body.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.headers.insert(name, value.into());
        }
        self
    }

    /// The `{statusCode, headers, body, isBase64Encoded}` value the gateway expects.
    pub fn into_value(self) -> Value {
        let (body, is_base64_encoded) = match self.body {
            ResponseBody::Empty => (String::new(), false),
            ResponseBody::Text(s) => (s, false),
            ResponseBody::Binary(bytes) => (STANDARD.encode(bytes), true),
        };
        serde_json::json!({
            "statusCode": self.status_code,
            "headers": self.headers,
            "body": body,
            "isBase64Encoded": is_base64_encoded,
        })
    }
}

impl From<ProxyResponse> for Value {
    fn from(value: ProxyResponse) -> Self {
        value.into_value()
    }
}

impl From<aws_lambda_events::event::apigw::ApiGatewayProxyResponse> for ProxyResponse {
    fn from(value: aws_lambda_events::event::apigw::ApiGatewayProxyResponse) -> Self {
        let mut headers = HashMap::new();
        for (name, v) in value.headers.iter() {
            if let Ok(s) = v.to_str() {
                headers.insert(name.to_string(), s.to_string());
            }
        }

        let status_code = if value.status_code <= 0 {
            200
        } else if value.status_code > u16::MAX as i64 {
            u16::MAX
        } else {
            value.status_code as u16
        };

        Self {
            status_code,
            headers,
            body: value
                .body
                .map(|b| match b {
                    aws_lambda_events::encodings::Body::Empty => ResponseBody::Empty,
                    aws_lambda_events::encodings::Body::Text(s) => ResponseBody::Text(s),
                    aws_lambda_events::encodings::Body::Binary(b) => ResponseBody::Binary(b),
                })
                .unwrap_or(ResponseBody::Empty),
        }
    }
}
