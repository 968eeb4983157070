//! In-process handlers: closures wrapped as [`Handler`]s and modules built by factories.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::{Export, Handler, HandlerResult, LambdaContext, Module, ModuleLoader, ResolveError};

/// A [`Handler`] backed by an async closure.
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value, LambdaContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Value, LambdaContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, event: Value, context: LambdaContext) -> HandlerResult {
        (self.f)(event, context).await
    }
}

/// A [`Handler`] that answers only through its context (`succeed`/`fail`/`done`).
///
/// Its own future never completes, so an invocation whose callback is never called runs into the
/// function timeout.
pub struct CallbackFn<F> {
    f: F,
}

pub fn from_callback<F>(f: F) -> CallbackFn<F>
where
    F: Fn(Value, LambdaContext) + Send + Sync + 'static,
{
    CallbackFn { f }
}

#[async_trait]
impl<F> Handler for CallbackFn<F>
where
    F: Fn(Value, LambdaContext) + Send + Sync + 'static,
{
    async fn call(&self, event: Value, context: LambdaContext) -> HandlerResult {
        (self.f)(event, context);
        std::future::pending().await
    }
}

/// A module assembled in code.
#[derive(Clone, Default)]
pub struct StaticModule {
    exports: HashMap<String, Export>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.exports
            .insert(name.into(), Export::Handler(Arc::new(handler)));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.exports.insert(name.into(), Export::Value(value));
        self
    }
}

impl Module for StaticModule {
    fn export(&self, name: &str) -> Option<Export> {
        self.exports.get(name).cloned()
    }
}

type ModuleFactory = Arc<dyn Fn() -> StaticModule + Send + Sync>;

/// Loader over module factories. Every load runs the factory again, the in-process equivalent of
/// re-reading a module from disk.
#[derive(Clone, Default)]
pub struct StaticModules {
    factories: HashMap<String, ModuleFactory>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module<F>(mut self, module: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> StaticModule + Send + Sync + 'static,
    {
        self.factories.insert(module.into(), Arc::new(factory));
        self
    }
}

impl ModuleLoader for StaticModules {
    fn load(&self, module: &str) -> Result<Arc<dyn Module>, ResolveError> {
        let factory = self
            .factories
            .get(module)
            .ok_or_else(|| ResolveError::ModuleNotFound {
                module: module.to_string(),
                reason: "no such module registered".to_string(),
            })?;
        Ok(Arc::new(factory()))
    }
}
