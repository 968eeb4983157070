use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use offline_handler::{HandlerError, InvocationInfo};
use serde_json::Value;
use tokio::sync::oneshot;

pub type HandlerResult = Result<Value, HandlerError>;

/// Per-invocation context handed to a [`super::Handler`].
///
/// Besides metadata it carries the invocation's completion: a handler may answer through
/// [`LambdaContext::succeed`], [`LambdaContext::fail`] or [`LambdaContext::done`] instead of (or
/// before) returning. Only the first answer counts. Clones share the same completion.
#[derive(Debug, Clone)]
pub struct LambdaContext {
    info: Arc<InvocationInfo>,
    deadline: Instant,
    completion: Completion,
}

impl LambdaContext {
    pub fn new(info: InvocationInfo, timeout: Duration) -> (Self, CompletionReceiver) {
        let (completion, receiver) = Completion::new();
        let ctx = Self {
            info: Arc::new(info),
            deadline: Instant::now() + timeout,
            completion,
        };
        (ctx, receiver)
    }

    pub fn info(&self) -> &InvocationInfo {
        &self.info
    }

    pub fn function_name(&self) -> &str {
        &self.info.function_name
    }

    pub fn aws_request_id(&self) -> &str {
        &self.info.aws_request_id
    }

    /// Look up a variable in the function's configured environment.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.info.environment.get(key).map(String::as_str)
    }

    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns `false` if the invocation was already answered.
    pub fn succeed(&self, result: Value) -> bool {
        self.completion.resolve(Ok(result))
    }

    /// Returns `false` if the invocation was already answered.
    pub fn fail(&self, error: HandlerError) -> bool {
        self.completion.resolve(Err(error))
    }

    /// Node-style `callback(err, result)`. Returns `false` if the invocation was already answered.
    pub fn done(&self, result: HandlerResult) -> bool {
        self.completion.resolve(result)
    }
}

#[derive(Debug, Clone)]
struct Completion {
    slot: Arc<Mutex<Option<oneshot::Sender<HandlerResult>>>>,
}

impl Completion {
    fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, CompletionReceiver(rx))
    }

    fn resolve(&self, result: HandlerResult) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // The receiver may be gone already (timed out); the answer is still "first".
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// The invocation side of a [`LambdaContext`] completion.
#[derive(Debug)]
pub struct CompletionReceiver(oneshot::Receiver<HandlerResult>);

impl CompletionReceiver {
    /// Wait for an answer through the context. Never resolves if every context clone is dropped
    /// without answering.
    pub async fn wait(self) -> HandlerResult {
        match self.0.await {
            Ok(result) => result,
            Err(_) => std::future::pending().await,
        }
    }
}
