//! Per-request failures, folded into the error body clients receive.

use offline_handler::HandlerError;

use crate::{handler::ResolveError, templates::TemplateError, util::UtilError, vtl::RenderError};

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("{}", .0.error_message)]
    Handler(HandlerError),
    #[error("handler panicked: {0}")]
    Panic(String),
}

impl From<HandlerError> for InvocationError {
    fn from(value: HandlerError) -> Self {
        Self::Handler(value)
    }
}

impl InvocationError {
    /// The `errorType` reported for this failure.
    pub fn error_type(&self) -> String {
        match self {
            InvocationError::Resolve(e) => e.kind().to_string(),
            InvocationError::Template(_) => "TemplateError".to_string(),
            InvocationError::Render(RenderError::Parse { .. } | RenderError::NotJson { .. }) => {
                "SyntaxError".to_string()
            }
            InvocationError::Render(RenderError::Util(UtilError::MalformedUri(_))) => {
                "URIError".to_string()
            }
            InvocationError::Render(RenderError::Util(UtilError::InvalidJson(_))) => {
                "SyntaxError".to_string()
            }
            InvocationError::Render(_) => "RenderError".to_string(),
            InvocationError::Handler(e) => e.error_type.clone(),
            InvocationError::Panic(_) => "Panic".to_string(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            InvocationError::Handler(e) => e.error_message.clone(),
            other => other.to_string(),
        }
    }

    /// The handler's own frames, or the error's `source()` chain.
    pub fn stack_trace(&self) -> Vec<String> {
        if let InvocationError::Handler(e) = self {
            return e.stack_trace.clone();
        }
        let mut frames = vec![format!("{}: {}", self.error_type(), self.message())];
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            frames.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        frames
    }
}
