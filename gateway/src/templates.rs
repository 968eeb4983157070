//! Mapping-template resolution for `lambda` integrations.
//!
//! Templates are looked up once per route when the route table is built: an inline mapping on the
//! event wins, then a `<handler module>.req.vm` / `.res.vm` file next to the handler, then the
//! built-in default.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;

use crate::service::{FunctionDefinition, HttpEvent};

/// The request template used when a route configures none.
pub const DEFAULT_REQUEST_TEMPLATE: &str = include_str!("../templates/offline-default.req.vm");

/// An empty response template passes the handler result through.
pub const DEFAULT_RESPONSE_TEMPLATE: &str = "";

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Request,
    Response,
}

impl TemplateKind {
    pub fn file_extension(&self) -> &'static str {
        match self {
            TemplateKind::Request => "req.vm",
            TemplateKind::Response => "res.vm",
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            TemplateKind::Request => DEFAULT_REQUEST_TEMPLATE,
            TemplateKind::Response => DEFAULT_RESPONSE_TEMPLATE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no {kind} template for content type {content_type}")]
    Missing {
        kind: &'static str,
        content_type: String,
    },
}

/// Templates of one kind for one route, keyed by content type.
#[derive(Debug, Clone)]
pub struct TemplateMap {
    kind: TemplateKind,
    templates: Arc<BTreeMap<String, String>>,
}

impl TemplateMap {
    pub fn new(kind: TemplateKind, templates: BTreeMap<String, String>) -> Self {
        Self {
            kind,
            templates: Arc::new(templates),
        }
    }

    /// The template for `content_type`, falling back to `application/json`.
    pub fn select(&self, content_type: &str) -> Result<&str, TemplateError> {
        self.templates
            .get(content_type)
            .or_else(|| self.templates.get(DEFAULT_CONTENT_TYPE))
            .map(String::as_str)
            .ok_or_else(|| TemplateError::Missing {
                kind: match self.kind {
                    TemplateKind::Request => "request",
                    TemplateKind::Response => "response",
                },
                content_type: content_type.to_string(),
            })
    }
}

/// Reads template files under the service root; each file is read at most once.
#[derive(Debug)]
pub struct TemplateLoader {
    root: PathBuf,
    files: DashMap<PathBuf, Option<Arc<str>>>,
}

impl TemplateLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: DashMap::new(),
        }
    }

    /// `<root>/<handler module>.<ext>`.
    pub fn template_path(&self, function: &FunctionDefinition, kind: TemplateKind) -> PathBuf {
        self.root
            .join(format!("{}.{}", function.handler.module, kind.file_extension()))
    }

    pub fn resolve_templates(
        &self,
        function: &FunctionDefinition,
        event: &HttpEvent,
        kind: TemplateKind,
    ) -> Result<TemplateMap, TemplateError> {
        let inline = match kind {
            TemplateKind::Request => event.request_templates.as_ref(),
            TemplateKind::Response => event.response_templates.as_ref(),
        };
        if let Some(inline) = inline {
            return Ok(TemplateMap::new(kind, inline.clone()));
        }

        let path = self.template_path(function, kind);
        let template = match self.read_once(&path)? {
            Some(contents) => {
                tracing::debug!(
                    event = "template_file_loaded",
                    function = %function.name,
                    path = %path.display(),
                );
                contents.to_string()
            }
            None => kind.default_template().to_string(),
        };
        Ok(TemplateMap::new(
            kind,
            BTreeMap::from([(DEFAULT_CONTENT_TYPE.to_string(), template)]),
        ))
    }

    fn read_once(&self, path: &Path) -> Result<Option<Arc<str>>, TemplateError> {
        if let Some(cached) = self.files.get(path) {
            return Ok(cached.value().clone());
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(s) => Some(Arc::<str>::from(s)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(TemplateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        self.files.insert(path.to_path_buf(), contents.clone());
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{handler::HandlerRef, service::Integration};

    fn function(module: &str) -> FunctionDefinition {
        FunctionDefinition {
            name: "hello".to_string(),
            handler: HandlerRef::parse(&format!("{module}.hello")).unwrap(),
            timeout_ms: 30_000,
            memory_size_mb: 1024,
            environment: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn event() -> HttpEvent {
        HttpEvent {
            method: "GET".to_string(),
            path: "hello".to_string(),
            integration: Integration::Lambda,
            cors: None,
            request_templates: None,
            response_templates: None,
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("offline-templates-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let loader = TemplateLoader::new(scratch_dir("defaults"));
        let req = loader
            .resolve_templates(&function("handler"), &event(), TemplateKind::Request)
            .unwrap();
        assert_eq!(req.select("text/plain").unwrap(), DEFAULT_REQUEST_TEMPLATE);

        let res = loader
            .resolve_templates(&function("handler"), &event(), TemplateKind::Response)
            .unwrap();
        assert_eq!(res.select("application/json").unwrap(), "");
    }

    #[test]
    fn default_request_template_renders_the_passthrough_event() {
        use crate::context::{tests::snapshot, Context, Payload, StageConfig};

        let stage = StageConfig {
            name: "dev".to_string(),
            ..Default::default()
        };
        let payload = Payload::parse(r#"{"it's":"a \"quote\""}"#.to_string(), "application/json");
        let ctx = Context::build(&snapshot(), &stage, payload);
        let event = crate::vtl::render(DEFAULT_REQUEST_TEMPLATE, &ctx).unwrap();

        assert_eq!(event["body"], serde_json::json!({"it's": "a \"quote\""}));
        assert_eq!(event["method"], "POST");
        assert_eq!(event["stage"], "dev");
        assert_eq!(event["principalId"], "offlineContext_authorizer_principalId");
        assert_eq!(event["headers"]["User-Agent"], "curl/8");
        assert_eq!(event["query"]["tag"], "a b");
        assert_eq!(event["path"]["id"], "42");
        assert_eq!(event["identity"]["sourceIp"], "127.0.0.1");
        assert_eq!(event["stageVariables"], serde_json::json!({}));
    }

    #[test]
    fn sibling_file_beats_default() {
        let dir = scratch_dir("file");
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/handler.req.vm"), "{\"from\": \"file\"}").unwrap();

        let loader = TemplateLoader::new(&dir);
        let map = loader
            .resolve_templates(&function("src/handler"), &event(), TemplateKind::Request)
            .unwrap();
        assert_eq!(map.select("application/json").unwrap(), "{\"from\": \"file\"}");

        // Read once: later edits are not observed.
        std::fs::write(dir.join("src/handler.req.vm"), "changed").unwrap();
        let again = loader
            .resolve_templates(&function("src/handler"), &event(), TemplateKind::Request)
            .unwrap();
        assert_eq!(again.select("application/json").unwrap(), "{\"from\": \"file\"}");
    }

    #[test]
    fn inline_templates_beat_files() {
        let dir = scratch_dir("inline");
        std::fs::write(dir.join("handler.req.vm"), "file").unwrap();
        let mut ev = event();
        ev.request_templates = Some(BTreeMap::from([
            ("application/xml".to_string(), "xml".to_string()),
            ("application/json".to_string(), "json".to_string()),
        ]));

        let map = TemplateLoader::new(&dir)
            .resolve_templates(&function("handler"), &ev, TemplateKind::Request)
            .unwrap();
        assert_eq!(map.select("application/xml").unwrap(), "xml");
        assert_eq!(map.select("text/csv").unwrap(), "json");
    }

    #[test]
    fn missing_content_type_without_fallback_is_an_error() {
        let map = TemplateMap::new(
            TemplateKind::Response,
            BTreeMap::from([("text/plain".to_string(), "x".to_string())]),
        );
        assert!(matches!(
            map.select("application/xml"),
            Err(TemplateError::Missing { kind: "response", .. })
        ));
    }
}
