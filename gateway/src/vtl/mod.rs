//! Mapping-template interpreter (the Velocity subset API Gateway templates use).
//!
//! Templates see `$context`, `$input`, `$util` and `$stageVariables` from a
//! [`Context`](crate::context::Context). [`render`] requires the output to be JSON (request
//! templates build the handler event); [`render_to_string`] returns raw text (response templates).

mod eval;
mod parser;

use serde_json::{Map, Value};

use crate::{context::Context, util::UtilError};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template syntax error on line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("template evaluation failed: {0}")]
    Eval(String),
    #[error(transparent)]
    Util(#[from] UtilError),
    #[error("template output is not valid JSON: {source}")]
    NotJson {
        #[source]
        source: serde_json::Error,
        output: String,
    },
}

/// Render `template` and parse the output as JSON. Blank output renders to `{}`.
pub fn render(template: &str, context: &Context) -> Result<Value, RenderError> {
    let output = render_to_string(template, context)?;
    if output.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(&output).map_err(|source| RenderError::NotJson { source, output })
}

/// Render `template` to text.
pub fn render_to_string(template: &str, context: &Context) -> Result<String, RenderError> {
    let nodes = parser::parse(template)?;
    eval::Renderer::new(context).render(&nodes)
}
