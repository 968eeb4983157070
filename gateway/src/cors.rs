//! CORS policies: the gateway-wide default, per-event overrides, and the tower-http layer they
//! compile to.

use std::time::Duration;

use anyhow::Context as _;
use http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};

use crate::{serde_ext, service::CorsSetting};

fn default_origin() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_headers() -> Vec<String> {
    ["accept", "content-type", "x-api-key"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_credentials() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsPolicy {
    #[serde(default = "default_origin", deserialize_with = "serde_ext::de_string_or_seq")]
    pub origin: Vec<String>,
    #[serde(default = "default_headers", deserialize_with = "serde_ext::de_string_or_seq")]
    pub headers: Vec<String>,
    #[serde(default = "default_credentials")]
    pub credentials: bool,
    #[serde(default, deserialize_with = "serde_ext::de_string_or_seq")]
    pub exposed_headers: Vec<String>,
    #[serde(default, deserialize_with = "serde_ext::de_option_u64_or_string")]
    /// Preflight cache lifetime in seconds.
    pub max_age: Option<u64>,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            headers: default_headers(),
            credentials: default_credentials(),
            exposed_headers: Vec::new(),
            max_age: None,
        }
    }
}

/// Spellings accepted in event-level overrides, mapped onto policy field names.
const OVERRIDE_ALIASES: &[(&str, &str)] = &[
    ("origins", "origin"),
    ("allowCredentials", "credentials"),
    ("exposedHeaders", "exposed_headers"),
    ("maxAge", "max_age"),
];

impl CorsPolicy {
    /// The policy for an event's `cors` setting, or `None` when the route gets no CORS handling.
    pub fn for_event(&self, setting: Option<&CorsSetting>) -> anyhow::Result<Option<CorsPolicy>> {
        match setting {
            None | Some(CorsSetting::Enabled(false)) => Ok(None),
            Some(CorsSetting::Enabled(true)) => Ok(Some(self.clone())),
            Some(CorsSetting::Override(overrides)) => self.merged(overrides).map(Some),
        }
    }

    /// Shallow-merge `overrides` over this policy.
    pub fn merged(&self, overrides: &Map<String, Value>) -> anyhow::Result<CorsPolicy> {
        let Value::Object(mut base) = serde_json::to_value(self)? else {
            anyhow::bail!("cors policy did not serialize to an object");
        };
        for (key, value) in overrides {
            let key = OVERRIDE_ALIASES
                .iter()
                .find(|(alias, _)| alias == key)
                .map(|(_, field)| *field)
                .unwrap_or(key.as_str());
            base.insert(key.to_string(), value.clone());
        }
        serde_json::from_value(Value::Object(base)).context("invalid cors override")
    }

    /// Build the layer answering preflights and decorating responses for one path.
    ///
    /// `methods` are the methods routed at the path; `None` means the path accepts any method.
    /// A wildcard origin is mirrored when credentials are allowed, since browsers reject
    /// `Access-Control-Allow-Origin: *` on credentialed requests.
    pub fn layer(&self, methods: Option<&[Method]>) -> anyhow::Result<CorsLayer> {
        let wildcard = self.origin.iter().any(|o| o == "*");
        let origin = if wildcard && self.credentials {
            AllowOrigin::mirror_request()
        } else if wildcard {
            AllowOrigin::any()
        } else {
            let origins = self
                .origin
                .iter()
                .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid cors origin {o:?}")))
                .collect::<anyhow::Result<Vec<_>>>()?;
            AllowOrigin::list(origins)
        };

        let methods = match methods {
            Some(methods) => {
                let mut methods = methods.to_vec();
                if !methods.contains(&Method::OPTIONS) {
                    methods.push(Method::OPTIONS);
                }
                AllowMethods::list(methods)
            }
            None => AllowMethods::mirror_request(),
        };

        let mut layer = CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(AllowHeaders::list(header_names(&self.headers)?))
            .allow_credentials(self.credentials);
        if !self.exposed_headers.is_empty() {
            layer = layer.expose_headers(ExposeHeaders::list(header_names(&self.exposed_headers)?));
        }
        if let Some(secs) = self.max_age {
            layer = layer.max_age(Duration::from_secs(secs));
        }
        Ok(layer)
    }
}

fn header_names(names: &[String]) -> anyhow::Result<Vec<HeaderName>> {
    names
        .iter()
        .map(|n| {
            HeaderName::from_bytes(n.trim().as_bytes())
                .with_context(|| format!("invalid cors header name {n:?}"))
        })
        .collect()
}
