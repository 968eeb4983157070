//! Handler resolution.
//!
//! A function's `handler: path/to/module.export` names an export of a module. Modules come from a
//! [`ModuleLoader`] ([`StaticModules`] for in-process handlers, [`DylibLoader`] for shared
//! libraries) and are cached by [`ModuleCache`], which the invocation path invalidates before
//! every request so rebuilt handler code is picked up without restarting the gateway.

mod context;
mod dylib;
mod statics;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

pub use context::{CompletionReceiver, HandlerResult, LambdaContext};
pub use dylib::DylibLoader;
pub use statics::{from_callback, handler_fn, CallbackFn, HandlerFn, StaticModule, StaticModules};

/// `module/path.export`, split at the last `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRef {
    pub module: String,
    pub export: String,
}

impl HandlerRef {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let Some((module, export)) = s.trim().rsplit_once('.') else {
            anyhow::bail!("handler must look like \"module/path.export\", got {s:?}");
        };
        if module.is_empty() || export.is_empty() || module.ends_with('/') {
            anyhow::bail!("handler must look like \"module/path.export\", got {s:?}");
        }
        Ok(Self {
            module: module.to_string(),
            export: export.to_string(),
        })
    }
}

impl std::fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.export)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("cannot find module '{module}': {reason}")]
    ModuleNotFound { module: String, reason: String },
    #[error("failed to load module '{module}': {reason}")]
    LoadFailed { module: String, reason: String },
    #[error("module '{module}' has no export '{export}'")]
    ExportNotFound { module: String, export: String },
    #[error("export '{export}' of module '{module}' is not a function")]
    NotCallable { module: String, export: String },
}

impl ResolveError {
    /// The `errorType` reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::ModuleNotFound { .. } => "ModuleNotFoundError",
            ResolveError::LoadFailed { .. } => "LoadError",
            ResolveError::ExportNotFound { .. } => "ReferenceError",
            ResolveError::NotCallable { .. } => "TypeError",
        }
    }
}

/// User code answering one invocation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, event: Value, context: LambdaContext) -> HandlerResult;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn call(&self, event: Value, context: LambdaContext) -> HandlerResult {
        (**self).call(event, context).await
    }
}

/// One named export of a module.
#[derive(Clone)]
pub enum Export {
    Handler(Arc<dyn Handler>),
    /// Anything that isn't callable.
    Value(Value),
}

pub trait Module: Send + Sync {
    fn export(&self, name: &str) -> Option<Export>;
}

pub trait ModuleLoader: Send + Sync {
    /// Load a fresh instance of `module`.
    fn load(&self, module: &str) -> Result<Arc<dyn Module>, ResolveError>;
}

/// What the invocation path needs from handler resolution.
pub trait HandlerRegistry: Send + Sync {
    fn resolve_handler(&self, handler: &HandlerRef) -> Result<Arc<dyn Handler>, ResolveError>;

    /// Forget every loaded module so the next resolution loads fresh code.
    fn invalidate_all(&self);
}

/// Module cache keyed by module path, over any [`ModuleLoader`].
pub struct ModuleCache<L> {
    loader: L,
    modules: DashMap<String, Arc<dyn Module>>,
    loads: AtomicUsize,
}

impl<L: ModuleLoader> ModuleCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            modules: DashMap::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of module loads performed so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    fn module(&self, name: &str) -> Result<Arc<dyn Module>, ResolveError> {
        // Clone out of the map before loading; holding the shard guard across `insert` deadlocks.
        let cached = self.modules.get(name).map(|m| Arc::clone(m.value()));
        if let Some(module) = cached {
            return Ok(module);
        }

        let module = self.loader.load(name)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(event = "module_loaded", module = %name);
        self.modules.insert(name.to_string(), Arc::clone(&module));
        Ok(module)
    }
}

impl<L: ModuleLoader> HandlerRegistry for ModuleCache<L> {
    fn resolve_handler(&self, handler: &HandlerRef) -> Result<Arc<dyn Handler>, ResolveError> {
        let module = self.module(&handler.module)?;
        match module.export(&handler.export) {
            Some(Export::Handler(h)) => Ok(h),
            Some(Export::Value(_)) => Err(ResolveError::NotCallable {
                module: handler.module.clone(),
                export: handler.export.clone(),
            }),
            None => Err(ResolveError::ExportNotFound {
                module: handler.module.clone(),
                export: handler.export.clone(),
            }),
        }
    }

    fn invalidate_all(&self) {
        self.modules.clear();
    }
}

/// Convert a handler future's panic payload into a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_module() -> StaticModule {
        StaticModule::new()
            .handler("echo", handler_fn(|event, _ctx| async move { Ok(event) }))
            .value("VERSION", json!("1.0"))
    }

    #[test]
    fn parses_handler_refs_at_the_last_dot() {
        let r = HandlerRef::parse("src/handlers.v2/users.list").unwrap();
        assert_eq!(r.module, "src/handlers.v2/users");
        assert_eq!(r.export, "list");
        assert_eq!(r.to_string(), "src/handlers.v2/users.list");

        assert!(HandlerRef::parse("nodot").is_err());
        assert!(HandlerRef::parse("module.").is_err());
        assert!(HandlerRef::parse(".export").is_err());
    }

    #[tokio::test]
    async fn resolves_and_calls_a_static_handler() {
        let cache = ModuleCache::new(StaticModules::new().with_module("m", echo_module));
        let h = cache.resolve_handler(&HandlerRef::parse("m.echo").unwrap()).unwrap();
        let (ctx, _rx) = LambdaContext::new(Default::default(), std::time::Duration::from_secs(1));
        assert_eq!(h.call(json!({"a": 1}), ctx).await.unwrap(), json!({"a": 1}));
    }

    #[test]
    fn resolution_errors_are_distinguished() {
        let cache = ModuleCache::new(StaticModules::new().with_module("m", echo_module));

        let missing = cache.resolve_handler(&HandlerRef::parse("nope.echo").unwrap());
        assert!(matches!(missing, Err(ResolveError::ModuleNotFound { .. })));

        let no_export = cache.resolve_handler(&HandlerRef::parse("m.other").unwrap());
        assert!(matches!(no_export, Err(ResolveError::ExportNotFound { .. })));

        let value = cache.resolve_handler(&HandlerRef::parse("m.VERSION").unwrap());
        let Err(err) = value else {
            panic!("expected NotCallable");
        };
        assert_eq!(err.kind(), "TypeError");
    }

    #[test]
    fn cache_reuses_modules_until_invalidated() {
        let cache = ModuleCache::new(StaticModules::new().with_module("m", echo_module));
        let r = HandlerRef::parse("m.echo").unwrap();

        cache.resolve_handler(&r).unwrap();
        cache.resolve_handler(&r).unwrap();
        assert_eq!(cache.load_count(), 1);
        assert_eq!(cache.cached_modules(), 1);

        cache.invalidate_all();
        assert_eq!(cache.cached_modules(), 0);
        cache.resolve_handler(&r).unwrap();
        assert_eq!(cache.load_count(), 2);
    }
}
