//! Process-level state shared by every module instance on a backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::{Backend, CompartmentId, ExternKind, InstanceId};
use crate::cache::{ArtifactLoader, ModuleCache};
use crate::config::HostConfig;
use crate::error::Result;
use crate::message::InvocationMessage;

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

/// Declares a host-provided import module: the named objects guest imports
/// can resolve against. The behaviour behind each name lives in the backend.
#[derive(Debug, Clone)]
pub struct IntrinsicModuleDecl {
    pub name: String,
    pub exports: Vec<(String, ExternKind)>,
}

impl IntrinsicModuleDecl {
    pub fn new(name: &str) -> Self {
        IntrinsicModuleDecl {
            name: name.to_string(),
            exports: Vec::new(),
        }
    }

    pub fn func(mut self, name: &str) -> Self {
        self.exports.push((name.to_string(), ExternKind::Func));
        self
    }

    pub fn global(mut self, name: &str) -> Self {
        self.exports.push((name.to_string(), ExternKind::Global));
        self
    }
}

/// Outbound hook syncing function source files before execution.
pub trait SharedFileSync: Send + Sync {
    fn sync_python_function_file(&self, msg: &InvocationMessage) -> anyhow::Result<()>;
}

struct BaseModules {
    // The compartment owning the prototype instances; never collected.
    _compartment: CompartmentId,
    env: InstanceId,
    wasi: InstanceId,
}

/// Shared state for all module instances on one backend: the backend handle,
/// configuration, the artifact loader, and the prototype env/WASI import
/// instances that are cloned into every compartment.
///
/// The prototypes are built once, on first use; `OnceCell` gives the
/// lock-free fast path after initialisation.
pub struct Host {
    id: u64,
    backend: Arc<dyn Backend>,
    config: HostConfig,
    loader: Arc<dyn ArtifactLoader>,
    env_decl: IntrinsicModuleDecl,
    wasi_decl: IntrinsicModuleDecl,
    shared_files: Option<Arc<dyn SharedFileSync>>,
    base: OnceCell<BaseModules>,
}

impl Host {
    pub fn new(
        backend: Arc<dyn Backend>,
        loader: Arc<dyn ArtifactLoader>,
        config: HostConfig,
        env_decl: IntrinsicModuleDecl,
        wasi_decl: IntrinsicModuleDecl,
    ) -> Host {
        Host {
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            config,
            loader,
            env_decl,
            wasi_decl,
            shared_files: None,
            base: OnceCell::new(),
        }
    }

    pub fn set_shared_files(&mut self, shared_files: Arc<dyn SharedFileSync>) {
        self.shared_files = Some(shared_files);
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub(crate) fn loader(&self) -> &Arc<dyn ArtifactLoader> {
        &self.loader
    }

    pub(crate) fn shared_files(&self) -> Option<&Arc<dyn SharedFileSync>> {
        self.shared_files.as_ref()
    }

    fn base_modules(&self) -> Result<&BaseModules> {
        self.base.get_or_try_init(|| {
            let compartment = self.backend.create_compartment("base-modules");
            let env = self.backend.instantiate_intrinsic_module(
                compartment,
                &self.env_decl.name,
                &self.env_decl.exports,
            )?;
            let wasi = self.backend.instantiate_intrinsic_module(
                compartment,
                &self.wasi_decl.name,
                &self.wasi_decl.exports,
            )?;
            Ok(BaseModules {
                _compartment: compartment,
                env,
                wasi,
            })
        })
    }

    /// The prototype environment-imports instance.
    pub fn env_module(&self) -> Result<InstanceId> {
        Ok(self.base_modules()?.env)
    }

    /// The prototype WASI-imports instance.
    pub fn wasi_module(&self) -> Result<InstanceId> {
        Ok(self.base_modules()?.wasi)
    }

    /// Drop every cached module artifact.
    pub fn flush(&self) {
        ModuleCache::flush();
    }
}
