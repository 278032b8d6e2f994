//! A module instance: one bound function, one compartment, one lifecycle.
//!
//! An instance is created unbound, bound exactly once to a function message,
//! executed repeatedly, optionally cloned from a prepared template, and torn
//! down in a single step. Binding instantiates the main module inside a
//! fresh compartment, runs the linker-generated constructors and (by
//! default) the zygote so that clones start from pre-populated guest state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, error, info, warn};

use crate::backend::{
    Backend, CompartmentId, ContextId, Extern, FuncId, InstanceId, MemoryId, TableId,
};
use crate::cache::ModuleCache;
use crate::error::{BindingError, DynamicLoadError, Error, LayoutError, LinkError, Result};
use crate::got::GlobalOffsetTable;
use crate::layout::{LoadedDynamicModule, WASM_BYTES_PER_PAGE};
use crate::message::{InvocationMessage, WasmEnvironment};
use crate::registry::{DynamicModuleRegistry, MAIN_MODULE_HANDLE};
use crate::thread::ExecutingGuard;

pub(crate) const ENTRY_FUNC_NAME: &str = "_start";
pub(crate) const WASM_CTORS_FUNC_NAME: &str = "__wasm_call_ctors";
pub(crate) const ZYGOTE_FUNC_NAME: &str = "_zygote";

static NEXT_MODULE_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default, Clone)]
pub(crate) struct ModuleBinding {
    pub user: String,
    pub function: String,
    pub bound: bool,
}

/// A WebAssembly module bound to a serverless function.
pub struct ModuleInstance {
    pub(crate) host: Arc<crate::host::Host>,
    pub(crate) binding: ModuleBinding,

    /// File descriptor carrying a memory image for clone-shared-memory
    /// restores; 0 means none.
    pub(crate) memory_fd: i32,
    pub(crate) memory_fd_size: u64,

    pub(crate) compartment: Option<CompartmentId>,
    pub(crate) context: Option<ContextId>,
    pub(crate) env_instance: Option<InstanceId>,
    pub(crate) wasi_instance: Option<InstanceId>,
    pub(crate) main_instance: Option<InstanceId>,
    pub(crate) default_memory: Option<MemoryId>,
    pub(crate) default_table: Option<TableId>,

    pub(crate) got: GlobalOffsetTable,
    pub(crate) registry: DynamicModuleRegistry,

    /// Wasm addresses of state regions shared with host-call shims.
    pub(crate) shared_mem_ptrs: HashMap<String, u32>,

    pub(crate) argv: Vec<String>,
    pub(crate) environment: WasmEnvironment,

    /// Identifies this instance in the thread-local executing-module slot.
    pub(crate) token: u64,
}

impl ModuleInstance {
    pub fn new(host: Arc<crate::host::Host>) -> ModuleInstance {
        ModuleInstance {
            host,
            binding: ModuleBinding::default(),
            memory_fd: 0,
            memory_fd_size: 0,
            compartment: None,
            context: None,
            env_instance: None,
            wasi_instance: None,
            main_instance: None,
            default_memory: None,
            default_table: None,
            got: GlobalOffsetTable::default(),
            registry: DynamicModuleRegistry::default(),
            shared_mem_ptrs: HashMap::new(),
            argv: Vec::new(),
            environment: WasmEnvironment::default(),
            token: NEXT_MODULE_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.bound
    }

    pub fn bound_user(&self) -> &str {
        &self.binding.user
    }

    pub fn bound_function(&self) -> &str {
        &self.binding.function
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        self.host.backend()
    }

    pub(crate) fn compartment(&self) -> Result<CompartmentId> {
        self.compartment.ok_or_else(|| BindingError::NotBound.into())
    }

    pub(crate) fn context(&self) -> Result<ContextId> {
        self.context.ok_or_else(|| BindingError::NotBound.into())
    }

    pub(crate) fn main_instance(&self) -> Result<InstanceId> {
        self.main_instance
            .ok_or_else(|| BindingError::NotBound.into())
    }

    /// The bound main module's memory handle.
    pub fn default_memory(&self) -> Result<MemoryId> {
        self.default_memory
            .ok_or_else(|| BindingError::NotBound.into())
    }

    /// The bound main module's indirect function table handle.
    pub fn default_table(&self) -> Result<TableId> {
        self.default_table
            .ok_or_else(|| BindingError::NotBound.into())
    }

    /// Bind to a function, running constructors and the zygote.
    pub fn bind_to_function(&mut self, msg: &InvocationMessage) -> Result<()> {
        self.do_bind(msg, true)
    }

    /// Bind without running the zygote; used by tooling that wants the
    /// pristine post-constructor state.
    pub fn bind_to_function_no_zygote(&mut self, msg: &InvocationMessage) -> Result<()> {
        self.do_bind(msg, false)
    }

    // The order here matters: the zygote may run non-trivial code, so memory
    // and linkage must be fully set up before it starts.
    fn do_bind(&mut self, msg: &InvocationMessage, execute_zygote: bool) -> Result<()> {
        if self.binding.bound {
            error!(
                "cannot bind {} twice (already {}/{})",
                msg.label(),
                self.binding.user,
                self.binding.function
            );
            return Err(BindingError::AlreadyBound {
                user: self.binding.user.clone(),
                function: self.binding.function.clone(),
            }
            .into());
        }

        self.binding.bound = true;
        self.binding.user = msg.user.clone();
        self.binding.function = msg.function.clone();

        let label = msg.label();
        let compartment = self.backend().create_compartment(&label);
        self.compartment = Some(compartment);
        self.context = Some(self.backend().create_context(compartment));

        let main = self.create_module_instance(&label, "")?;
        self.main_instance = Some(main);

        self.default_memory = Some(
            self.backend()
                .default_memory(main)
                .ok_or_else(|| Error::Backend(anyhow!("main module exposes no memory")))?,
        );
        self.default_table = Some(
            self.backend()
                .default_table(main)
                .ok_or_else(|| Error::Backend(anyhow!("main module exposes no table")))?,
        );

        self.execute_wasm_ctors(main)?;
        if execute_zygote {
            self.execute_zygote_function()?;
        }

        // The stack must sit at the bottom of memory: anything between
        // __data_end and __heap_base would be silently clobbered.
        let heap_base = self.get_global_i32("__heap_base")?.unwrap_or(-1);
        let data_end = self.get_global_i32("__data_end")?.unwrap_or(-1);
        if heap_base > 0 && data_end > 0 && heap_base != data_end {
            error!(
                "stack is not at the bottom (__heap_base={} __data_end={})",
                heap_base, data_end
            );
            return Err(LayoutError::StackNotAtBottom {
                heap_base,
                data_end,
            }
            .into());
        }

        let memory = self.default_memory()?;
        let table = self.default_table()?;
        debug!(
            "bound {}: initial_pages={} initial_table={}",
            label,
            self.backend().memory_num_pages(memory),
            self.backend().table_num_elements(table)
        );

        Ok(())
    }

    /// Instantiate a module into this instance's compartment: the main
    /// module when `shared_path` is empty, a shared object otherwise.
    pub(crate) fn create_module_instance(
        &mut self,
        name: &str,
        shared_path: &str,
    ) -> Result<InstanceId> {
        let is_main = shared_path.is_empty();
        let compartment = self.compartment()?;
        let user = self.binding.user.clone();
        let function = self.binding.function.clone();

        // References only; the cache owns the one parsed copy.
        let ir = ModuleCache::module(&self.host, &user, &function, shared_path)?;

        if is_main {
            let env_proto = self.host.env_module()?;
            let wasi_proto = self.host.wasi_module()?;
            self.env_instance = Some(self.backend().clone_instance(env_proto, compartment)?);
            self.wasi_instance = Some(self.backend().clone_instance(wasi_proto, compartment)?);

            // The first global is the stack-top pointer; an immutable one
            // means the module was not compiled for this host.
            if let Some(stack_global) = ir.globals.first() {
                if !stack_global.mutable {
                    error!("found immutable stack top in {}/{}", user, function);
                    return Err(LayoutError::ImmutableStackTop.into());
                }
            }
        } else {
            let table = self.default_table()?;
            let n_table_elems = ModuleCache::shared_module_table_size(
                &self.host, &user, &function, shared_path,
            )?;
            let prev_elems = self.backend().grow_table(table, n_table_elems as u32)?;
            let new_elems = self.backend().table_num_elements(table);

            let data_size =
                ModuleCache::shared_module_data_size(&self.host, &user, &function, shared_path)?;

            let memory_pages = self.host.config().dynamic_module_memory_pages;
            let stack_size = self.host.config().dynamic_module_stack_size;

            // Guard the new region on both sides so stray pointer arithmetic
            // in the shared object faults instead of corrupting neighbours.
            self.create_memory_guard_region()?;
            let memory_bottom = self.mmap_pages(memory_pages)?;
            self.create_memory_guard_region()?;

            let handle = self
                .registry
                .handle_for_path(shared_path)
                .ok_or(DynamicLoadError::UnknownHandle(0))?;

            let module = LoadedDynamicModule::build(
                shared_path,
                memory_bottom,
                data_size,
                prev_elems,
                new_elems,
                memory_pages,
                stack_size,
            )?;
            // Inserted before instantiation so the resolver sees the layout.
            self.registry.insert(handle, module);
        }

        self.add_module_to_got(&ir, is_main)?;

        let mut imports = Vec::with_capacity(ir.imports.len());
        for import in &ir.imports {
            imports.push(self.resolve_import(import)?);
        }

        let compiled = ModuleCache::compiled_module(&self.host, &user, &function, shared_path)?;

        info!("instantiating module {}/{} {}", user, function, shared_path);
        let instance = self
            .backend()
            .instantiate_module(compartment, compiled, &imports, name)
            .map_err(|err| {
                error!("failed to instantiate {}/{} {}: {}", user, function, shared_path, err);
                Error::Backend(err)
            })?;

        self.patch_missing_got_entries(instance)?;

        if !is_main {
            let handle = self
                .registry
                .handle_for_path(shared_path)
                .ok_or(DynamicLoadError::UnknownHandle(0))?;
            let module = self
                .registry
                .get_mut(handle)
                .ok_or(DynamicLoadError::UnknownHandle(handle))?;
            module.instance = Some(instance);

            let module = self.registry.get(handle).ok_or(DynamicLoadError::UnknownHandle(handle))?;
            if let Err(err) = module.validate() {
                error!("invalid dynamic module {}: {}", module.path, err);
                return Err(err.into());
            }
            debug!(
                "dynamic module {} memory=[{:#x},{:#x}) data=[{:#x},{:#x}) table=[{},{})",
                module.path,
                module.memory_bottom,
                module.memory_top,
                module.data_bottom,
                module.data_top,
                module.table_bottom,
                module.table_top
            );
        }

        Ok(instance)
    }

    /// Execute the bound function described by `msg`. Guest traps and
    /// non-zero exits are outcomes, not errors: the return code lands on the
    /// message and the returned flag says whether the invocation succeeded.
    pub fn execute(&mut self, msg: &mut InvocationMessage, force_noop: bool) -> Result<bool> {
        if !self.binding.bound {
            error!("executing on unbound module");
            return Err(BindingError::NotBound.into());
        }
        if self.binding.user != msg.user || self.binding.function != msg.function {
            error!(
                "cannot execute {} on module bound to {}/{}",
                msg.label(),
                self.binding.user,
                self.binding.function
            );
            return Err(BindingError::WrongFunction {
                requested: msg.label(),
                bound: format!("{}/{}", self.binding.user, self.binding.function),
            }
            .into());
        }

        let _executing = ExecutingGuard::enter(self.token);

        // Fire-and-forget source sync for interpreter-backed functions.
        if msg.is_python {
            if let Some(files) = self.host.shared_files() {
                if let Err(err) = files.sync_python_function_file(msg) {
                    warn!("failed to sync python source for {}: {}", msg.label(), err);
                }
            }
        }

        self.prepare_parallel_context(msg);

        if msg.parallel_depth > 0 {
            self.execute_remote_parallel(msg)?;
            return Ok(true);
        }

        let (func, args) = if msg.funcptr > 0 {
            let func = self.function_from_table(msg.funcptr as u32)?;
            let args = match self.backend().function_param_count(func) {
                0 => Vec::new(),
                1 => {
                    // A single-argument pointer call is a chained thread
                    // invocation; the argument rides in the input data.
                    if msg.inputdata.is_empty() {
                        vec![0]
                    } else {
                        let arg = msg.inputdata.parse::<i32>().map_err(|_| {
                            error!("non-numeric input data for funcptr call: {:?}", msg.inputdata);
                            Error::InvalidInput(msg.inputdata.clone())
                        })?;
                        vec![arg]
                    }
                }
                n => {
                    error!("unexpected function pointer with {} params", n);
                    return Err(Error::InvalidInput(format!(
                        "function pointer takes {} parameters",
                        n
                    )));
                }
            };
            (func, args)
        } else {
            self.prepare_argc_argv(msg);
            let main = self.main_instance()?;
            let func = self.exported_function(main, ENTRY_FUNC_NAME)?;
            (func, Vec::new())
        };

        if force_noop {
            debug!("explicitly forcing a noop for {}", msg.label());
            msg.returnvalue = 0;
            return Ok(true);
        }

        let context = self.context()?;
        let (return_value, success) = match self.backend().invoke_function(context, func, &args) {
            crate::backend::InvokeOutcome::Value(v) => (v, true),
            crate::backend::InvokeOutcome::Trap(desc) => {
                error!("runtime exception: {}", desc);
                (1, false)
            }
            crate::backend::InvokeOutcome::Exit(code) => {
                debug!("guest exit with code {}", code);
                (code, code == 0)
            }
        };

        msg.returnvalue = return_value;
        Ok(success)
    }

    /// dlopen for the guest. Returns 0 on path errors (the dlopen NULL
    /// convention), 1 for the empty path (the main module), and a stable
    /// handle ≥ 2 for each distinct shared object.
    pub fn dynamic_load(&mut self, path: &str) -> Result<i32> {
        if let Some(handle) = self.registry.handle_for_path(path) {
            debug!("using cached dynamic module handle {} for {}", handle, path);
            return Ok(handle);
        }

        if path.is_empty() {
            debug!("dynamic linking main module");
            return Ok(MAIN_MODULE_HANDLE);
        }
        if Path::new(path).is_dir() {
            error!("dynamic linking a directory {}", path);
            return Ok(0);
        }
        if !Path::new(path).exists() {
            error!("dynamic module {} does not exist", path);
            return Ok(0);
        }

        let handle = self.registry.allocate(path);
        let name = format!("handle_{}", handle);

        let instance = self.create_module_instance(&name, path)?;
        self.execute_wasm_ctors(instance)?;

        debug!("loaded shared module at {} with handle {}", path, handle);
        Ok(handle)
    }

    /// Resolve an exported function of a loaded module to a fresh table
    /// index guest code can call through.
    pub fn get_dynamic_module_function(&mut self, handle: i32, func_name: &str) -> Result<u32> {
        let exported = if handle == MAIN_MODULE_HANDLE {
            let env = self.env_instance.ok_or(BindingError::NotBound)?;
            let main = self.main_instance()?;
            let wasi = self.wasi_instance.ok_or(BindingError::NotBound)?;
            self.backend()
                .instance_export(env, func_name)
                .or_else(|| self.backend().instance_export(main, func_name))
                .or_else(|| self.backend().instance_export(wasi, func_name))
        } else {
            let module = self.registry.get(handle).ok_or_else(|| {
                error!("no dynamic module registered for handle {}", handle);
                DynamicLoadError::UnknownHandle(handle)
            })?;
            let instance = module
                .instance
                .ok_or(DynamicLoadError::UnknownHandle(handle))?;
            self.backend().instance_export(instance, func_name)
        };

        let func = match exported {
            Some(Extern::Func(f)) => f,
            _ => {
                error!("unable to dynamically load function {}", func_name);
                return Err(DynamicLoadError::MissingDynamicFunction(func_name.to_string()).into());
            }
        };

        let index = self.add_function_to_table(Extern::Func(func))?;
        debug!("resolved function {} to index {}", func_name, index);
        Ok(index)
    }

    /// Grow the table by one and install `func` at the new slot.
    pub(crate) fn add_function_to_table(&mut self, func: Extern) -> Result<u32> {
        let table = self.default_table()?;
        let prev = self.backend().grow_table(table, 1).map_err(|err| {
            error!("failed to grow table by one element: {}", err);
            Error::Backend(err)
        })?;
        self.backend().set_table_element(table, prev, func)?;
        Ok(prev)
    }

    pub(crate) fn function_from_table(&self, index: u32) -> Result<FuncId> {
        let table = self.default_table()?;
        match self.backend().get_table_element(table, index) {
            Some(Extern::Func(f)) => Ok(f),
            _ => {
                // A pre-grown placeholder that was never patched surfaces
                // here, at first use.
                if let Some((name, _)) = self.got.missing_entries().find(|(_, i)| *i == index) {
                    error!("dereferenced unpatched GOT slot {} ({})", index, name);
                    return Err(LinkError::UnresolvedGotSlot {
                        name: name.to_string(),
                        index,
                    }
                    .into());
                }
                error!("no function at table index {}", index);
                Err(LinkError::EmptyTableSlot(index).into())
            }
        }
    }

    pub(crate) fn exported_function(&self, instance: InstanceId, name: &str) -> Result<FuncId> {
        match self.backend().instance_export(instance, name) {
            Some(Extern::Func(f)) => Ok(f),
            _ => {
                error!("unable to find function {}", name);
                Err(LinkError::MissingExport(name.to_string()).into())
            }
        }
    }

    /// Read an i32 global exported by the main module.
    pub fn get_global_i32(&self, name: &str) -> Result<Option<i32>> {
        let main = self.main_instance()?;
        Ok(self
            .backend()
            .instance_export(main, name)
            .and_then(|e| e.as_global())
            .map(|g| self.backend().global_value(g)))
    }

    pub(crate) fn execute_wasm_ctors(&mut self, instance: InstanceId) -> Result<()> {
        let func = self.exported_function(instance, WASM_CTORS_FUNC_NAME).map_err(|err| {
            error!(
                "did not find {} for {}/{}",
                WASM_CTORS_FUNC_NAME, self.binding.user, self.binding.function
            );
            err
        })?;
        self.run_init_function(WASM_CTORS_FUNC_NAME, func)
    }

    fn execute_zygote_function(&mut self) -> Result<()> {
        let main = self.main_instance()?;
        let zygote = match self.backend().instance_export(main, ZYGOTE_FUNC_NAME) {
            Some(Extern::Func(f)) => f,
            _ => return Ok(()),
        };
        self.run_init_function(ZYGOTE_FUNC_NAME, zygote)?;
        debug!(
            "successfully executed zygote for {}/{}",
            self.binding.user, self.binding.function
        );
        Ok(())
    }

    fn run_init_function(&mut self, name: &str, func: FuncId) -> Result<()> {
        let context = self.context()?;
        let _executing = ExecutingGuard::enter(self.token);
        match self.backend().invoke_function(context, func, &[]) {
            crate::backend::InvokeOutcome::Value(0) => Ok(()),
            crate::backend::InvokeOutcome::Value(code) => {
                error!(
                    "{} for {}/{} failed with return code {}",
                    name, self.binding.user, self.binding.function, code
                );
                Err(BindingError::ZygoteFailed {
                    func: name.to_string(),
                    code,
                }
                .into())
            }
            crate::backend::InvokeOutcome::Trap(desc) => {
                error!("{} trapped: {}", name, desc);
                Err(Error::Trap(desc))
            }
            crate::backend::InvokeOutcome::Exit(code) if code == 0 => Ok(()),
            crate::backend::InvokeOutcome::Exit(code) => {
                error!("{} exited with code {}", name, code);
                Err(BindingError::ZygoteFailed {
                    func: name.to_string(),
                    code,
                }
                .into())
            }
        }
    }

    /// Rebuild this instance as a copy of `other`, remapping every backend
    /// handle into a freshly cloned compartment.
    pub fn clone_from(&mut self, other: &ModuleInstance) -> Result<()> {
        // Reclaim anything this instance already owns before adopting the
        // template, otherwise it leaks for the worker's lifetime.
        if self.binding.bound {
            self.tear_down();
        }

        self.memory_fd = other.memory_fd;
        self.memory_fd_size = other.memory_fd_size;
        self.binding = other.binding.clone();
        self.environment = other.environment.clone();

        if !other.binding.bound {
            return Ok(());
        }

        let label = format!("{}/{}", other.binding.user, other.binding.function);
        let src_compartment = other.compartment()?;

        // With a memory fd the image is mapped over the clone afterwards, so
        // copying memory here would be wasted work.
        let clone_memory = self.memory_fd <= 0;
        let compartment =
            self.backend()
                .clone_compartment(src_compartment, &label, clone_memory)?;
        self.compartment = Some(compartment);
        self.context = Some(self.backend().clone_context(other.context()?, compartment));

        let backend = self.backend().clone();
        let remap = |inst: InstanceId| -> Result<InstanceId> {
            Ok(backend.remap_to_cloned_compartment(inst, compartment)?)
        };
        self.env_instance = Some(remap(other.env_instance.ok_or(BindingError::NotBound)?)?);
        self.wasi_instance = Some(remap(other.wasi_instance.ok_or(BindingError::NotBound)?)?);
        let main = remap(other.main_instance()?)?;
        self.main_instance = Some(main);

        self.default_memory = Some(
            self.backend()
                .default_memory(main)
                .ok_or_else(|| Error::Backend(anyhow!("cloned main module lost its memory")))?,
        );
        self.default_table = Some(
            self.backend()
                .default_table(main)
                .ok_or_else(|| Error::Backend(anyhow!("cloned main module lost its table")))?,
        );

        if self.memory_fd > 0 {
            self.map_memory_from_fd()?;
        }

        self.shared_mem_ptrs = other.shared_mem_ptrs.clone();

        self.registry = other.registry.clone();
        let handles: Vec<i32> = self.registry.iter().map(|(h, _)| h).collect();
        for handle in handles {
            let instance = self
                .registry
                .get(handle)
                .and_then(|m| m.instance)
                .ok_or(DynamicLoadError::UnknownHandle(handle))?;
            let remapped = self
                .backend()
                .remap_to_cloned_compartment(instance, compartment)?;
            if let Some(module) = self.registry.get_mut(handle) {
                module.instance = Some(remapped);
            }
        }

        self.got = other.got.clone();

        Ok(())
    }

    /// A fresh instance cloned from this one.
    pub fn fork(&self) -> Result<ModuleInstance> {
        let mut clone = ModuleInstance::new(self.host.clone());
        clone.clone_from(self)?;
        Ok(clone)
    }

    /// Clear every map, drop every backend handle and try to reclaim the
    /// compartment. Returns whether the compartment was collected; teardown
    /// succeeds either way, a leak is only diagnostics.
    pub fn tear_down(&mut self) -> bool {
        self.shared_mem_ptrs.clear();
        self.got.clear();
        self.registry.clear();

        self.default_memory = None;
        self.default_table = None;
        self.main_instance = None;
        self.env_instance = None;
        self.wasi_instance = None;
        self.context = None;

        self.binding.bound = false;

        let compartment = match self.compartment.take() {
            Some(c) => c,
            None => return true,
        };

        let collected = self.backend().try_collect_compartment(compartment);
        if collected {
            debug!("successful GC for compartment");
        } else {
            debug!("failed GC for compartment");
        }
        collected
    }

    // Accessors used by host-call shims and diagnostics.

    pub fn dynamic_module_count(&self) -> usize {
        self.registry.count()
    }

    pub fn function_offset_from_got(&self, func_name: &str) -> Result<u32> {
        self.got.function_offset(func_name).ok_or_else(|| {
            error!("function not found in GOT - {}", func_name);
            LinkError::FunctionNotInGot(func_name.to_string()).into()
        })
    }

    pub fn data_offset_from_got(&self, name: &str) -> Result<i32> {
        self.got
            .data_offset(name)
            .map(|entry| entry.value)
            .ok_or_else(|| {
                error!("data not found in GOT - {}", name);
                LinkError::DataNotInGot(name.to_string()).into()
            })
    }

    pub fn next_memory_base(&self) -> Result<u32> {
        Ok(self.last_loaded_module()?.data_bottom)
    }

    pub fn next_stack_pointer(&self) -> Result<u32> {
        Ok(self.last_loaded_module()?.stack_pointer)
    }

    pub fn next_table_base(&self) -> Result<u32> {
        Ok(self.last_loaded_module()?.table_bottom)
    }

    pub(crate) fn last_loaded_module(&self) -> Result<&LoadedDynamicModule> {
        self.registry.last_loaded().ok_or_else(|| {
            error!("no dynamic modules loaded");
            DynamicLoadError::NoModulesLoaded.into()
        })
    }

    pub fn global_offset_table(&self) -> &GlobalOffsetTable {
        &self.got
    }

    pub fn dynamic_modules(&self) -> &DynamicModuleRegistry {
        &self.registry
    }

    pub fn register_shared_mem_ptr(&mut self, key: &str, wasm_ptr: u32) {
        self.shared_mem_ptrs.insert(key.to_string(), wasm_ptr);
    }

    pub fn shared_mem_ptr(&self, key: &str) -> Option<u32> {
        self.shared_mem_ptrs.get(key).copied()
    }

    pub fn environment_mut(&mut self) -> &mut WasmEnvironment {
        &mut self.environment
    }

    /// Current linear memory size in bytes.
    pub fn memory_size_bytes(&self) -> Result<u64> {
        let memory = self.default_memory()?;
        Ok(self.backend().memory_num_pages(memory) * u64::from(WASM_BYTES_PER_PAGE))
    }

    fn prepare_argc_argv(&mut self, msg: &InvocationMessage) {
        self.argv = vec![format!("{}.wasm", msg.function)];
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        self.tear_down();
    }
}
