//! Process-wide cache of parsed and compiled module artifacts.
//!
//! Keyed by (host, user, function, shared-object path). Callers always get
//! a reference to the one cached `ModuleIr`; handing out copies would
//! double memory and break pointer-identity checks inside the backend.
//! Readers proceed in parallel; insertion is serialised behind the write
//! lock with a re-check, and compilation happens at most once per entry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use log::error;
use once_cell::sync::OnceCell;

use crate::backend::CompiledModuleId;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::ir::ModuleIr;

/// Fetches compiled-module bytes for the cache. Implementations decide where
/// artifacts live (local disk, blob store, ...); the engine only sees bytes.
pub trait ArtifactLoader: Send + Sync {
    /// `shared_path` is empty for the main module of `user/function`.
    fn load(&self, user: &str, function: &str, shared_path: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    host: u64,
    user: String,
    function: String,
    path: String,
}

struct CacheEntry {
    ir: Arc<ModuleIr>,
    compiled: OnceCell<CompiledModuleId>,
}

lazy_static! {
    static ref MODULE_CACHE: RwLock<HashMap<CacheKey, Arc<CacheEntry>>> =
        RwLock::new(HashMap::new());
}

/// Facade over the process-wide artifact cache.
pub struct ModuleCache;

impl ModuleCache {
    fn entry(host: &Host, user: &str, function: &str, path: &str) -> Result<Arc<CacheEntry>> {
        let key = CacheKey {
            host: host.id(),
            user: user.to_string(),
            function: function.to_string(),
            path: path.to_string(),
        };

        if let Some(entry) = MODULE_CACHE.read().unwrap().get(&key) {
            return Ok(entry.clone());
        }

        // Load and parse outside the write lock; a racing loader just does
        // the same work and loses the insert.
        let bytes = host.loader().load(user, function, path).map_err(|err| {
            error!("failed to load artifact for {}/{} {}: {}", user, function, path, err);
            Error::Artifact(err.to_string())
        })?;
        let ir = ModuleIr::parse(&bytes).map_err(|err| {
            error!("failed to parse module {}/{} {}: {}", user, function, path, err);
            Error::Artifact(err.to_string())
        })?;

        let mut cache = MODULE_CACHE.write().unwrap();
        let entry = cache.entry(key).or_insert_with(|| {
            Arc::new(CacheEntry {
                ir: Arc::new(ir),
                compiled: OnceCell::new(),
            })
        });
        Ok(entry.clone())
    }

    /// The parsed IR for a module, shared across every instance of it.
    pub fn module(host: &Host, user: &str, function: &str, path: &str) -> Result<Arc<ModuleIr>> {
        Ok(Self::entry(host, user, function, path)?.ir.clone())
    }

    /// The compiled artifact, compiling on first access.
    pub fn compiled_module(
        host: &Host,
        user: &str,
        function: &str,
        path: &str,
    ) -> Result<CompiledModuleId> {
        let entry = Self::entry(host, user, function, path)?;
        let compiled = entry
            .compiled
            .get_or_try_init(|| host.backend().compile_module(&entry.ir))
            .map_err(|err: anyhow::Error| {
                error!("failed to compile {}/{} {}: {}", user, function, path, err);
                Error::Backend(err)
            })?;
        Ok(*compiled)
    }

    /// Table elements a shared module will occupy, answered without linking.
    pub fn shared_module_table_size(
        host: &Host,
        user: &str,
        function: &str,
        path: &str,
    ) -> Result<u64> {
        Ok(Self::entry(host, user, function, path)?.ir.table_elems())
    }

    /// Bytes of initialised data a shared module carries.
    pub fn shared_module_data_size(
        host: &Host,
        user: &str,
        function: &str,
        path: &str,
    ) -> Result<u32> {
        Ok(Self::entry(host, user, function, path)?.ir.data_size())
    }

    /// Drop every cached artifact.
    pub fn flush() {
        MODULE_CACHE.write().unwrap().clear();
    }
}
