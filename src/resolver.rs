//! Import resolution and GOT maintenance.
//!
//! This is the engine's rendition of the WebAssembly dynamic-linking
//! convention (tool-conventions/DynamicLinking.md). The convention is still
//! in flux upstream, so the whole rule table lives in this one file: the
//! special `GOT.mem` / `GOT.func` namespaces, the `__memory_base` /
//! `__table_base` / `__stack_pointer` anchors handed to each shared object,
//! the shared `__indirect_function_table`, and the fallback search through
//! the host import instances and every loaded module.

use log::{debug, error, warn};

use crate::backend::{Extern, ExternKind, InstanceId};
use crate::error::{Error, LinkError, Result};
use crate::instance::ModuleInstance;
use crate::ir::{ImportRecord, InitOffset, ModuleIr};

const WASI_MODULE_NAME: &str = "wasi_snapshot_preview1";
const GOT_MEM_NAMESPACE: &str = "GOT.mem";
const GOT_FUNC_NAMESPACE: &str = "GOT.func";

impl ModuleInstance {
    /// Record a module's element segments and exported i32 globals in the
    /// GOT before it links.
    ///
    /// Only functions the module explicitly exports are recorded; adding
    /// every table element would bloat the GOT with intra-module references
    /// nothing can ever import.
    pub(crate) fn add_module_to_got(&mut self, ir: &ModuleIr, is_main: bool) -> Result<()> {
        for segment in &ir.elem_segments {
            let offset = if is_main {
                match segment.offset {
                    InitOffset::Const(value) => value.max(0) as u32,
                    InitOffset::Global(_) => {
                        debug!("skipping main-module element segment with relocated base");
                        continue;
                    }
                }
            } else {
                // The engine controls the base offset for loaded modules.
                self.last_loaded_module()?.table_bottom
            };

            for (i, func_index) in segment.func_indices.iter().enumerate() {
                let name = match element_func_name(ir, *func_index) {
                    Some(name) => name,
                    None => continue,
                };
                if ir.is_exported(name) {
                    self.got.record_function(name, offset + i as u32);
                }
            }
        }

        // Exported globals with constant i32 initialisers are the data side
        // of the GOT: pointers to structs, flags and the like. Dynamic
        // modules see them rebased onto their data region.
        let data_base = if is_main {
            0
        } else {
            self.last_loaded_module()?.data_bottom as i32
        };
        for export in &ir.exports {
            if export.kind != ExternKind::Global {
                continue;
            }
            let global = match ir.defined_global(export.index) {
                Some(g) => g,
                None => continue,
            };
            let init = match global.i32_init {
                Some(v) => v,
                None => continue,
            };
            self.got
                .record_data(&export.name, init.wrapping_add(data_base), global.mutable);
        }

        Ok(())
    }

    /// Resolve one import request against the compartment. Called for every
    /// import, in declaration order, while a module links.
    pub(crate) fn resolve_import(&mut self, import: &ImportRecord) -> Result<Extern> {
        let backend = self.backend().clone();
        let linking_main = self.main_instance.is_none();

        let namespace_instance = if import.module == WASI_MODULE_NAME {
            self.wasi_instance
        } else {
            self.env_instance
        };

        let resolved: Option<Extern> = if linking_main {
            // The main module only links against the host import surface.
            namespace_instance.and_then(|inst| backend.instance_export(inst, &import.name))
        } else if import.module == GOT_MEM_NAMESPACE {
            let entry = self.got.data_offset(&import.name).ok_or_else(|| {
                error!(
                    "memory offset not found in GOT: {}.{}",
                    import.module, import.name
                );
                Error::from(LinkError::GotMissingData(import.name.clone()))
            })?;
            debug!(
                "resolved {}.{} to ({}, {})",
                import.module, import.name, entry.value, entry.mutable
            );
            // All GOT.mem imports are mutable, whatever the source global
            // says.
            Some(self.fresh_global(&import.name, true, entry.value)?)
        } else if import.module == GOT_FUNC_NAMESPACE {
            let table_index = self.resolve_got_function(&import.name)?;
            Some(self.fresh_global(&import.name, import.global_mutable, table_index as i32)?)
        } else if import.name == "__memory_base" {
            // Where the loaded module should place its data and heap.
            let value = self.last_loaded_module()?.data_bottom;
            Some(self.fresh_global(&import.name, import.global_mutable, value as i32)?)
        } else if import.name == "__table_base" {
            let value = self.last_loaded_module()?.table_bottom;
            Some(self.fresh_global(&import.name, import.global_mutable, value as i32)?)
        } else if import.name == "__stack_pointer" {
            let value = self.last_loaded_module()?.stack_pointer;
            Some(self.fresh_global(&import.name, import.global_mutable, value as i32)?)
        } else if import.name == "__indirect_function_table" {
            // Every module shares the main instance's table.
            let main = self.main_instance()?;
            backend.default_table(main).map(Extern::Table)
        } else {
            debug!("resolving fallback for {}.{}", import.module, import.name);
            let mut found =
                namespace_instance.and_then(|inst| backend.instance_export(inst, &import.name));
            if found.is_none() {
                found = self
                    .main_instance
                    .and_then(|main| backend.instance_export(main, &import.name));
            }
            if found.is_none() {
                found = self.search_dynamic_instances(&import.name);
            }
            found
        };

        let resolved = resolved.ok_or_else(|| {
            error!(
                "missing import {}.{} ({})",
                import.module, import.name, import.kind
            );
            Error::from(LinkError::MissingImport {
                module: import.module.clone(),
                name: import.name.clone(),
            })
        })?;

        if resolved.kind() != import.kind {
            error!(
                "resolved import {}.{} to a {}, but was expecting a {}",
                import.module,
                import.name,
                resolved.kind(),
                import.kind
            );
            return Err(LinkError::TypeMismatch {
                module: import.module.clone(),
                name: import.name.clone(),
                found: resolved.kind(),
                expected: import.kind,
            }
            .into());
        }

        Ok(resolved)
    }

    /// The table index backing a `GOT.func` import, growing the table for a
    /// placeholder when the export is nowhere to be found yet.
    fn resolve_got_function(&mut self, name: &str) -> Result<u32> {
        if let Some(index) = self.got.function_offset(name) {
            debug!("resolved GOT.func {} to offset {}", name, index);
            return Ok(index);
        }

        let backend = self.backend().clone();
        let mut found = self
            .main_instance
            .and_then(|main| backend.instance_export(main, name));
        if found.is_none() {
            found = self.search_dynamic_instances(name);
        }

        if let Some(func @ Extern::Func(_)) = found {
            let index = self.add_function_to_table(func)?;
            self.got.record_function(name, index);
            return Ok(index);
        }

        // Not loaded anywhere yet: grow the table by one and leave the slot
        // to be patched when the exporter arrives.
        let table = self.default_table()?;
        let index = backend.grow_table(table, 1).map_err(Error::Backend)?;
        warn!("adding placeholder table offset: GOT.func {} at {}", name, index);
        self.got.add_missing(name, index);
        Ok(index)
    }

    fn search_dynamic_instances(&self, name: &str) -> Option<Extern> {
        let backend = self.backend();
        for (_, module) in self.registry.iter() {
            if let Some(instance) = module.instance {
                if let Some(found) = backend.instance_export(instance, name) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn fresh_global(&mut self, name: &str, mutable: bool, value: i32) -> Result<Extern> {
        let compartment = self.compartment()?;
        let global = self.backend().create_global(compartment, mutable, name);
        self.backend().initialize_global(global, value);
        Ok(Extern::Global(global))
    }

    /// After an instantiation completes, fill placeholder table slots whose
    /// exports the new instance provides. Entries nobody provides stay
    /// parked; dereferencing one is a link error at use time, not before.
    pub(crate) fn patch_missing_got_entries(&mut self, instance: InstanceId) -> Result<()> {
        if self.got.missing_count() == 0 {
            return Ok(());
        }

        let backend = self.backend().clone();
        let table = self.default_table()?;
        let entries: Vec<(String, u32)> = self
            .got
            .missing_entries()
            .map(|(name, index)| (name.to_string(), index))
            .collect();

        for (name, index) in entries {
            match backend.instance_export(instance, &name) {
                Some(func @ Extern::Func(_)) => {
                    debug!("filling gap in GOT for function: {} at {}", name, index);
                    backend
                        .set_table_element(table, index, func)
                        .map_err(Error::Backend)?;
                    self.got.promote_missing(&name);
                }
                _ => {}
            }
        }

        let unpatched = self.got.missing_count();
        if unpatched > 0 {
            warn!("{} GOT placeholder(s) still unpatched", unpatched);
        }
        Ok(())
    }
}

/// Name of an element-segment function: from the name section when present,
/// else from an export referencing the same index.
fn element_func_name(ir: &ModuleIr, func_index: u32) -> Option<&str> {
    if let Some(name) = ir.function_names.get(&func_index) {
        return Some(name.as_str());
    }
    ir.exports
        .iter()
        .find(|e| e.kind == ExternKind::Func && e.index == func_index)
        .map(|e| e.name.as_str())
}
