//! Service definition parsing.
//!
//! The gateway reads a serverless-style YAML file (`provider`, `custom.stageVariables`,
//! `functions.<name>.events[].http`) and resolves it once into [`ServiceDefinition`]: handler
//! references parsed, environments merged, timeouts in milliseconds, HTTP events in one shape.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{handler::HandlerRef, serde_ext};

/// Runtimes whose handlers this gateway can load.
pub const SUPPORTED_RUNTIMES: &[&str] = &["provided", "provided.al2", "provided.al2023", "rust"];

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MEMORY_SIZE_MB: u64 = 1024;

fn default_runtime() -> String {
    "provided.al2023".to_string()
}

fn default_stage() -> String {
    "dev".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceFile {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    provider: ProviderSection,
    #[serde(default)]
    custom: CustomSection,
    #[serde(default)]
    functions: BTreeMap<String, FunctionSection>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProviderSection {
    #[serde(default = "default_runtime")]
    runtime: String,
    #[serde(default = "default_stage")]
    stage: String,
    #[serde(default, deserialize_with = "serde_ext::de_scalar_map")]
    environment: HashMap<String, String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            stage: default_stage(),
            environment: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomSection {
    #[serde(default)]
    stage_variables: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionSection {
    handler: String,
    #[serde(default, deserialize_with = "serde_ext::de_option_u64_or_string")]
    timeout: Option<u64>,
    #[serde(default, deserialize_with = "serde_ext::de_option_u64_or_string")]
    memory_size: Option<u64>,
    #[serde(default, deserialize_with = "serde_ext::de_scalar_map")]
    environment: HashMap<String, String>,
    #[serde(default)]
    events: Vec<EventSection>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventSection {
    #[serde(default)]
    http: Option<HttpSection>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HttpSection {
    /// `http: GET users/{id}`
    Compact(String),
    Full(HttpDetails),
}

#[derive(Debug, Clone, Deserialize)]
struct HttpDetails {
    method: String,
    path: String,
    #[serde(default)]
    integration: Option<Integration>,
    #[serde(default)]
    cors: Option<CorsSetting>,
    #[serde(default)]
    request: Option<TemplateSection>,
    #[serde(default)]
    response: Option<TemplateSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TemplateSection {
    #[serde(default)]
    template: Option<BTreeMap<String, String>>,
}

/// How the gateway shapes events and results for a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Integration {
    /// Mapping templates build the event and the response body.
    #[serde(rename = "lambda", alias = "aws")]
    Lambda,
    /// Fixed proxy envelope in, `{statusCode, headers, body}` out.
    #[default]
    #[serde(rename = "lambda-proxy", alias = "aws_proxy", alias = "aws-proxy")]
    LambdaProxy,
}

impl Integration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Integration::Lambda => "lambda",
            Integration::LambdaProxy => "lambda-proxy",
        }
    }
}

/// An event's `cors` setting: a flag, or an object merged over the gateway policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CorsSetting {
    Enabled(bool),
    Override(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
/// One HTTP trigger of a function, exactly as declared.
pub struct HttpEvent {
    /// Declared method (`GET`, `post`, `ANY`, `*`, ...).
    pub method: String,
    /// Declared path, before prefixing and normalization.
    pub path: String,
    pub integration: Integration,
    pub cors: Option<CorsSetting>,
    /// Inline request templates keyed by content type.
    pub request_templates: Option<BTreeMap<String, String>>,
    /// Inline response templates keyed by content type.
    pub response_templates: Option<BTreeMap<String, String>>,
}

impl HttpEvent {
    /// Parse the compact `"METHOD path"` form.
    pub fn parse_compact(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(method), Some(path), None) = (parts.next(), parts.next(), parts.next()) else {
            anyhow::bail!("http event must look like \"METHOD path\", got {s:?}");
        };
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            integration: Integration::default(),
            cors: None,
            request_templates: None,
            response_templates: None,
        })
    }

    fn from_section(section: HttpSection) -> anyhow::Result<Self> {
        match section {
            HttpSection::Compact(s) => Self::parse_compact(&s),
            HttpSection::Full(d) => Ok(Self {
                method: d.method,
                path: d.path,
                integration: d.integration.unwrap_or_default(),
                cors: d.cors,
                request_templates: d.request.and_then(|r| r.template),
                response_templates: d.response.and_then(|r| r.template),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventDefinition {
    Http(HttpEvent),
    /// A non-HTTP trigger (`schedule`, `sqs`, ...). Kept for completeness, never routed.
    Other { kind: String },
}

impl EventDefinition {
    pub fn http(&self) -> Option<&HttpEvent> {
        match self {
            EventDefinition::Http(e) => Some(e),
            EventDefinition::Other { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A function with everything the gateway needs to route to and invoke it.
pub struct FunctionDefinition {
    pub name: String,
    pub handler: HandlerRef,
    pub timeout_ms: u64,
    pub memory_size_mb: u64,
    /// Provider environment overridden by the function's own entries.
    pub environment: HashMap<String, String>,
    pub events: Vec<EventDefinition>,
}

#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub runtime: String,
    pub stage: String,
    /// `custom.stageVariables`, when declared.
    pub stage_variables: Option<Map<String, Value>>,
    pub functions: Vec<FunctionDefinition>,
    /// Directory handler modules and template files are resolved against.
    pub root: PathBuf,
}

impl ServiceDefinition {
    /// Parse and resolve a service YAML. `root` is the directory the file lives in.
    pub fn from_yaml_bytes(bytes: &[u8], root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let file: ServiceFile = serde_yaml::from_slice(bytes).context("invalid service file")?;
        Self::resolve(file, root.into())
    }

    /// Read and resolve the service file at `path`.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read service file {}", path.display()))?;
        let root = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::from_yaml_bytes(&bytes, root)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name)
    }

    fn resolve(file: ServiceFile, root: PathBuf) -> anyhow::Result<Self> {
        let runtime = file.provider.runtime;
        if !SUPPORTED_RUNTIMES.contains(&runtime.as_str()) {
            anyhow::bail!(
                "unsupported runtime {runtime:?}; supported runtimes are {}",
                SUPPORTED_RUNTIMES.join(", ")
            );
        }

        let mut functions = Vec::with_capacity(file.functions.len());
        for (name, f) in file.functions {
            let handler = HandlerRef::parse(&f.handler)
                .with_context(|| format!("function {name}: invalid handler {:?}", f.handler))?;

            let mut environment = file.provider.environment.clone();
            environment.extend(f.environment);

            let mut events = Vec::with_capacity(f.events.len());
            for (idx, e) in f.events.into_iter().enumerate() {
                let event = match e.http {
                    Some(http) => EventDefinition::Http(
                        HttpEvent::from_section(http)
                            .with_context(|| format!("function {name}: event #{idx}"))?,
                    ),
                    None => EventDefinition::Other {
                        kind: e.other.keys().next().cloned().unwrap_or_default(),
                    },
                };
                events.push(event);
            }

            functions.push(FunctionDefinition {
                timeout_ms: f.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS).saturating_mul(1000),
                memory_size_mb: f.memory_size.unwrap_or(DEFAULT_MEMORY_SIZE_MB),
                name,
                handler,
                environment,
                events,
            });
        }

        Ok(Self {
            name: file.service.unwrap_or_else(|| "service".to_string()),
            runtime,
            stage: file.provider.stage,
            stage_variables: file.custom.stage_variables,
            functions,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &[u8] = br#"
service: demo
provider:
  runtime: provided.al2023
  stage: local
  environment:
    TABLE: items
    DEBUG: false
custom:
  stageVariables:
    color: blue
functions:
  hello:
    handler: handlers/hello.handle
    timeout: "6"
    environment:
      DEBUG: true
    events:
      - http: GET hello
      - http:
          method: post
          path: /items/{id}
          integration: lambda
          cors: true
          request:
            template:
              application/json: '{"id": "$input.params(''id'')"}'
      - schedule: rate(5 minutes)
"#;

    #[test]
    fn resolves_functions_and_events() {
        let svc = ServiceDefinition::from_yaml_bytes(SERVICE, "/srv").unwrap();
        assert_eq!(svc.name, "demo");
        assert_eq!(svc.stage, "local");
        assert_eq!(svc.stage_variables.as_ref().unwrap()["color"], "blue");

        let f = svc.function("hello").unwrap();
        assert_eq!(f.handler.module, "handlers/hello");
        assert_eq!(f.handler.export, "handle");
        assert_eq!(f.timeout_ms, 6000);
        assert_eq!(f.memory_size_mb, 1024);
        assert_eq!(f.environment["TABLE"], "items");
        assert_eq!(f.environment["DEBUG"], "true");

        assert_eq!(f.events.len(), 3);
        let compact = f.events[0].http().unwrap();
        assert_eq!(compact.method, "GET");
        assert_eq!(compact.path, "hello");
        assert_eq!(compact.integration, Integration::LambdaProxy);

        let full = f.events[1].http().unwrap();
        assert_eq!(full.integration, Integration::Lambda);
        assert_eq!(full.cors, Some(CorsSetting::Enabled(true)));
        assert!(full.request_templates.as_ref().unwrap().contains_key("application/json"));

        assert_eq!(
            f.events[2],
            EventDefinition::Other {
                kind: "schedule".to_string()
            }
        );
    }

    #[test]
    fn timeout_defaults_to_thirty_seconds() {
        let yaml = br#"
functions:
  a:
    handler: a.main
"#;
        let svc = ServiceDefinition::from_yaml_bytes(yaml, ".").unwrap();
        assert_eq!(svc.functions[0].timeout_ms, 30_000);
        assert_eq!(svc.stage, "dev");
        assert!(svc.stage_variables.is_none());
    }

    #[test]
    fn unsupported_runtime_is_rejected() {
        let yaml = br#"
provider:
  runtime: nodejs18.x
functions: {}
"#;
        let err = ServiceDefinition::from_yaml_bytes(yaml, ".").unwrap_err();
        assert!(err.to_string().contains("unsupported runtime"));
    }

    #[test]
    fn malformed_compact_event_is_rejected() {
        let yaml = br#"
functions:
  a:
    handler: a.main
    events:
      - http: GET
"#;
        assert!(ServiceDefinition::from_yaml_bytes(yaml, ".").is_err());
    }

    #[test]
    fn handler_without_export_is_rejected() {
        let yaml = br#"
functions:
  a:
    handler: main
"#;
        assert!(ServiceDefinition::from_yaml_bytes(yaml, ".").is_err());
    }

    #[test]
    fn cors_override_object_is_kept() {
        let yaml = br#"
functions:
  a:
    handler: a.main
    events:
      - http:
          method: get
          path: x
          cors:
            origins: ["http://a.test"]
"#;
        let svc = ServiceDefinition::from_yaml_bytes(yaml, ".").unwrap();
        let Some(CorsSetting::Override(m)) = &svc.functions[0].events[0].http().unwrap().cors
        else {
            panic!("expected override");
        };
        assert_eq!(m["origins"][0], "http://a.test");
    }
}
