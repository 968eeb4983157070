//! Request context exposed to mapping templates (`$context`, `$input`, `$stageVariables`,
//! `$util`) and reused for proxy events' `requestContext`.

use std::collections::BTreeMap;

use http::{header, request::Parts, Method};
use serde_json::{json, Map, Value};

use crate::{jsonpath, util::Util};

const DEFAULT_SOURCE_IP: &str = "127.0.0.1";
const PRINCIPAL_PLACEHOLDER: &str = "offlineContext_authorizer_principalId";

/// Principal established by an authentication layer in front of the gateway.
///
/// Insert it into the request extensions; it takes precedence over the configured fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrincipal(pub String);

/// The parts of a request the context and events are built from.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    /// The route's normalized path (`/users/{id}`).
    pub resource_path: String,
    /// The request path as received.
    pub path: String,
    /// Header names lower-cased; repeated headers joined with `,`.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub path_params: BTreeMap<String, String>,
    pub source_ip: Option<String>,
    pub principal: Option<String>,
}

impl RequestSnapshot {
    pub fn from_parts(
        parts: &Parts,
        resource_path: &str,
        path_params: BTreeMap<String, String>,
    ) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &parts.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let query = parts
            .uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        let source_ip = parts
            .extensions
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|info| info.0.ip().to_string());

        Self {
            method: parts.method.clone(),
            resource_path: resource_path.to_string(),
            path: parts.uri.path().to_string(),
            headers,
            query,
            path_params,
            source_ip,
            principal: parts.extensions.get::<AuthPrincipal>().map(|p| p.0.clone()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Media type of the body without parameters, `application/json` when absent.
    pub fn content_type(&self) -> String {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| "application/json".to_string())
    }

    /// Header map with names capitalized the way the gateway presents them (`Content-Type`).
    pub fn capitalized_headers(&self) -> Map<String, Value> {
        self.headers
            .iter()
            .map(|(k, v)| (capitalize_header(k), Value::String(v.clone())))
            .collect()
    }
}

/// Upper-case the first letter of each `-`-separated word, leaving the rest untouched.
pub fn capitalize_header(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut start = true;
    for c in name.chars() {
        if start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        start = c == '-';
    }
    out
}

/// Stage-level settings shared by every request.
#[derive(Debug, Clone, Default)]
pub struct StageConfig {
    pub name: String,
    pub variables: Option<Map<String, Value>>,
    /// Principal used when the request carries none.
    pub principal_fallback: Option<String>,
}

impl StageConfig {
    /// `stageVariables` as handed to handlers: the configured map, or `{}`.
    pub fn variables_value(&self) -> Value {
        Value::Object(self.variables.clone().unwrap_or_default())
    }
}

/// The request body: raw text plus its parse when the content type is JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub raw: String,
    pub parsed: Option<Value>,
}

impl Payload {
    /// Parse `raw` when `content_type` is JSON (`application/json` or `*+json`). A body that
    /// fails to parse is kept raw.
    pub fn parse(raw: String, content_type: &str) -> Self {
        if raw.is_empty() || !is_json_content_type(content_type) {
            return Self { raw, parsed: None };
        }
        match serde_json::from_str(&raw) {
            Ok(v) => Self {
                raw,
                parsed: Some(v),
            },
            Err(err) => {
                tracing::debug!(
                    event = "payload_parse_failed",
                    content_type = %content_type,
                    error = %err,
                    "keeping raw body"
                );
                Self { raw, parsed: None }
            }
        }
    }

    /// A payload that is already a value (a handler's result).
    pub fn from_value(value: Value) -> Self {
        let raw = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            raw,
            parsed: Some(value),
        }
    }

    /// The document path queries run against.
    pub fn document(&self) -> Value {
        match &self.parsed {
            Some(v) => v.clone(),
            None if self.raw.is_empty() => Value::Object(Map::new()),
            None => Value::String(self.raw.clone()),
        }
    }
}

pub fn is_json_content_type(content_type: &str) -> bool {
    content_type == "application/json" || content_type.ends_with("+json")
}

/// `$input`.
pub trait InputAccessor {
    /// First match of a JSONPath expression against the payload.
    fn path(&self, expression: &str) -> Option<Value>;
    /// JSON text of [`InputAccessor::path`], `null` when nothing matches.
    fn json(&self, expression: &str) -> String {
        self.path(expression)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string())
    }
    fn body(&self) -> &str;
    /// A single parameter: path, then query string, then header (case-insensitive).
    fn param(&self, key: &str) -> Option<String>;
    /// `{path, querystring, header}`.
    fn params(&self) -> Value;
}

#[derive(Debug, Clone)]
pub struct RequestInput {
    payload: Payload,
    document: Value,
    path: Map<String, Value>,
    querystring: Map<String, Value>,
    header: Map<String, Value>,
}

impl RequestInput {
    fn new(request: &RequestSnapshot, payload: Payload) -> Self {
        let to_map = |m: &BTreeMap<String, String>| -> Map<String, Value> {
            m.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect()
        };
        Self {
            document: payload.document(),
            payload,
            path: to_map(&request.path_params),
            querystring: to_map(&request.query),
            header: request.capitalized_headers(),
        }
    }
}

impl InputAccessor for RequestInput {
    fn path(&self, expression: &str) -> Option<Value> {
        jsonpath::extract(&self.document, expression)
    }

    fn body(&self) -> &str {
        &self.payload.raw
    }

    fn param(&self, key: &str) -> Option<String> {
        let found = self
            .path
            .get(key)
            .or_else(|| self.querystring.get(key))
            .or_else(|| {
                self.header
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })?;
        found.as_str().map(str::to_string)
    }

    fn params(&self) -> Value {
        json!({
            "path": self.path,
            "querystring": self.querystring,
            "header": self.header,
        })
    }
}

/// Everything a mapping template can see.
#[derive(Debug, Clone)]
pub struct Context {
    /// `$context`.
    pub context: Value,
    /// `$input`.
    pub input: RequestInput,
    /// `$stageVariables`.
    pub stage_variables: Value,
    /// `$util`.
    pub util: Util,
}

impl Context {
    pub fn build(request: &RequestSnapshot, stage: &StageConfig, payload: Payload) -> Self {
        Self {
            context: request_context(request, stage),
            input: RequestInput::new(request, payload),
            stage_variables: stage.variables_value(),
            util: Util,
        }
    }
}

/// The `$context` block, also used as a proxy event's `requestContext`.
pub fn request_context(request: &RequestSnapshot, stage: &StageConfig) -> Value {
    let principal_id = request
        .principal
        .clone()
        .or_else(|| stage.principal_fallback.clone())
        .unwrap_or_else(|| PRINCIPAL_PLACEHOLDER.to_string());

    json!({
        "apiId": "offlineContext_apiId",
        "resourceId": "offlineContext_resourceId",
        "requestId": format!("offlineContext_requestId_{}", uuid::Uuid::new_v4().simple()),
        "httpMethod": request.method.as_str().to_ascii_uppercase(),
        "resourcePath": request.resource_path,
        "stage": stage.name,
        "authorizer": {
            "principalId": principal_id,
        },
        "identity": {
            "accountId": "offlineContext_accountId",
            "apiKey": "offlineContext_apiKey",
            "caller": "offlineContext_caller",
            "cognitoAuthenticationProvider": "offlineContext_cognitoAuthenticationProvider",
            "cognitoAuthenticationType": "offlineContext_cognitoAuthenticationType",
            "cognitoIdentityId": "offlineContext_cognitoIdentityId",
            "cognitoIdentityPoolId": "offlineContext_cognitoIdentityPoolId",
            "sourceIp": request.source_ip.as_deref().unwrap_or(DEFAULT_SOURCE_IP),
            "user": "offlineContext_user",
            "userAgent": request.header("user-agent").unwrap_or(""),
            "userArn": "offlineContext_userArn",
        },
    })
}
