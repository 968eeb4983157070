//! Handlers compiled as shared libraries against the `offline-handler` C ABI.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use libloading::Library;
use offline_handler::{
    abi::{self, RawFreeFn, RawHandlerFn, FREE_SYMBOL},
    HandlerError, InvocationInfo,
};
use serde_json::Value;

use super::{Export, Handler, HandlerResult, LambdaContext, Module, ModuleLoader, ResolveError};

/// Loads `<root>/<module dir>/<lib prefix><module name><dylib suffix>`.
///
/// Each load copies the library to a fresh file under `scratch` first: the platform loader
/// caches libraries by path, so reopening the original would hand back the old code after a
/// rebuild.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    root: PathBuf,
    scratch: PathBuf,
}

impl DylibLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch: std::env::temp_dir().join("offline-gateway"),
        }
    }

    pub fn with_scratch_dir(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    /// Where the library for `module` is expected.
    pub fn library_path(&self, module: &str) -> PathBuf {
        let rel = Path::new(module);
        let file = rel
            .file_name()
            .map(libloading::library_filename)
            .unwrap_or_default();
        match rel.parent() {
            Some(dir) => self.root.join(dir).join(file),
            None => self.root.join(file),
        }
    }

    fn stage_copy(&self, module: &str, source: &Path) -> Result<PathBuf, ResolveError> {
        let load_failed = |reason: String| ResolveError::LoadFailed {
            module: module.to_string(),
            reason,
        };
        std::fs::create_dir_all(&self.scratch)
            .map_err(|e| load_failed(format!("{}: {e}", self.scratch.display())))?;

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self
            .scratch
            .join(format!("{}-{name}", uuid::Uuid::new_v4().simple()));
        std::fs::copy(source, &target)
            .map_err(|e| load_failed(format!("copy {}: {e}", source.display())))?;
        Ok(target)
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, module: &str) -> Result<Arc<dyn Module>, ResolveError> {
        let path = self.library_path(module);
        if !path.is_file() {
            return Err(ResolveError::ModuleNotFound {
                module: module.to_string(),
                reason: format!("{} does not exist", path.display()),
            });
        }

        let copy = self.stage_copy(module, &path)?;
        let library = match unsafe { Library::new(&copy) } {
            Ok(lib) => LoadedLibrary {
                library: Some(lib),
                path: copy,
            },
            Err(err) => {
                let _ = std::fs::remove_file(&copy);
                return Err(ResolveError::LoadFailed {
                    module: module.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        let free = library
            .symbol::<RawFreeFn>(FREE_SYMBOL)
            .ok_or_else(|| ResolveError::LoadFailed {
                module: module.to_string(),
                reason: format!("missing `{FREE_SYMBOL}` export; was it built with export_handlers!?"),
            })?;

        tracing::debug!(
            event = "dylib_loaded",
            module = %module,
            path = %path.display(),
        );
        Ok(Arc::new(DylibModule {
            library: Arc::new(library),
            free,
        }))
    }
}

struct LoadedLibrary {
    library: Option<Library>,
    path: PathBuf,
}

impl LoadedLibrary {
    fn symbol<T: Copy>(&self, name: &str) -> Option<T> {
        let library = self.library.as_ref()?;
        unsafe { library.get::<T>(name.as_bytes()) }.ok().map(|sym| *sym)
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        drop(self.library.take());
        let _ = std::fs::remove_file(&self.path);
    }
}

struct DylibModule {
    library: Arc<LoadedLibrary>,
    free: RawFreeFn,
}

impl Module for DylibModule {
    fn export(&self, name: &str) -> Option<Export> {
        if name == FREE_SYMBOL {
            return None;
        }
        let func = self.library.symbol::<RawHandlerFn>(name)?;
        Some(Export::Handler(Arc::new(DylibHandler {
            library: Arc::clone(&self.library),
            func,
            free: self.free,
        })))
    }
}

struct DylibHandler {
    // Keeps `func` and `free` mapped.
    library: Arc<LoadedLibrary>,
    func: RawHandlerFn,
    free: RawFreeFn,
}

#[async_trait]
impl Handler for DylibHandler {
    async fn call(&self, event: Value, context: LambdaContext) -> HandlerResult {
        let library = Arc::clone(&self.library);
        let (func, free) = (self.func, self.free);
        let info = context.info().clone();

        let joined = tokio::task::spawn_blocking(move || {
            let _library = library;
            call_raw(func, free, &event, &info)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(HandlerError::new(err.to_string()).with_type("Panic")),
        }
    }
}

fn call_raw(
    func: RawHandlerFn,
    free: RawFreeFn,
    event: &Value,
    info: &InvocationInfo,
) -> HandlerResult {
    let event = abi::encode_arg(event)?;
    let info = abi::encode_arg(info)?;
    unsafe {
        let out = func(event.as_ptr(), info.as_ptr());
        let envelope = abi::read_envelope(out);
        free(out);
        envelope?.into()
    }
}
