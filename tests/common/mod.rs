//! Shared test scaffolding: an in-process backend faithful enough to drive
//! the whole lifecycle engine, plus module sources and loaders.
//!
//! The mock models compartments, contexts, memories (real anonymous
//! mappings, so guard protection and file mappings behave), tables, globals
//! and instances. Guest functions dispatch to behaviours registered by
//! export name; unregistered functions return 0.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use more_asserts::assert_le;

use wasmcell::backend::{
    Backend, CompartmentId, CompiledModuleId, ContextId, Extern, ExternKind, FuncId, GlobalId,
    InstanceId, InvokeOutcome, MemoryId, TableId,
};
use wasmcell::error::MemoryGrowError;
use wasmcell::ir::{InitOffset, ModuleIr};
use wasmcell::{ArtifactLoader, Host, HostConfig, IntrinsicModuleDecl, WASM_BYTES_PER_PAGE};

const PAGE: usize = WASM_BYTES_PER_PAGE as usize;
const DEFAULT_RESERVED_PAGES: u64 = 2048;

pub type BehaviorFn = dyn Fn(&MockBackend, ContextId, &[i32]) -> InvokeOutcome + Send + Sync;

struct BehaviorEntry {
    params: usize,
    run: Arc<BehaviorFn>,
}

struct Compartment {
    name: String,
    instances: Vec<u64>,
    memories: Vec<u64>,
    tables: Vec<u64>,
    // Creation order; contexts index mutable globals by position here.
    globals: Vec<u64>,
    clone_map: HashMap<u64, u64>,
}

struct MemoryObj {
    base: usize,
    reserved_bytes: usize,
    pages: u64,
    max_pages: Option<u64>,
    protected: Vec<(u32, u32)>,
}

struct TableObj {
    elems: Vec<Option<u64>>,
    maximum: Option<u32>,
}

struct GlobalObj {
    compartment: u64,
    name: String,
    mutable: bool,
    value: i32,
}

struct FuncObj {
    name: String,
    param_count: usize,
}

struct ContextObj {
    compartment: u64,
    overrides: HashMap<usize, u32>,
}

struct InstanceObj {
    compartment: u64,
    name: String,
    exports: Vec<(String, Extern)>,
    default_memory: Option<u64>,
    default_table: Option<u64>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    compartments: HashMap<u64, Compartment>,
    contexts: HashMap<u64, ContextObj>,
    instances: HashMap<u64, InstanceObj>,
    memories: HashMap<u64, MemoryObj>,
    tables: HashMap<u64, TableObj>,
    globals: HashMap<u64, GlobalObj>,
    funcs: HashMap<u64, FuncObj>,
    compiled: HashMap<u64, Arc<ModuleIr>>,
    commit_limit_pages: Option<u64>,
}

impl State {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn mutable_global_value(&self, compartment: u64, index: usize) -> Option<u32> {
        let comp = self.compartments.get(&compartment)?;
        let mut seen = 0usize;
        for id in &comp.globals {
            let global = self.globals.get(id)?;
            if global.mutable {
                if seen == index {
                    return Some(global.value as u32);
                }
                seen += 1;
            }
        }
        None
    }
}

pub struct MockBackend {
    state: Mutex<State>,
    behaviors: Mutex<HashMap<String, BehaviorEntry>>,
}

fn native_alloc(bytes: usize) -> Result<usize> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        bail!("anonymous mapping of {} bytes failed", bytes);
    }
    Ok(ptr as usize)
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend {
            state: Mutex::new(State::default()),
            behaviors: Mutex::new(HashMap::new()),
        })
    }

    /// Register what the guest function exported as `name` does when
    /// invoked.
    pub fn set_behavior<F>(&self, name: &str, params: usize, run: F)
    where
        F: Fn(&MockBackend, ContextId, &[i32]) -> InvokeOutcome + Send + Sync + 'static,
    {
        self.behaviors.lock().unwrap().insert(
            name.to_string(),
            BehaviorEntry {
                params,
                run: Arc::new(run),
            },
        );
    }

    /// Whether the byte at `offset` sits inside a protected guard range.
    pub fn is_guard_protected(&self, memory: MemoryId, offset: u32) -> bool {
        let state = self.state.lock().unwrap();
        state
            .memories
            .get(&memory.0)
            .map(|m| {
                m.protected
                    .iter()
                    .any(|(start, len)| offset >= *start && offset < start + len)
            })
            .unwrap_or(false)
    }

    /// Cap total committed pages per memory, to exercise commit failures.
    pub fn set_commit_limit_pages(&self, pages: Option<u64>) {
        self.state.lock().unwrap().commit_limit_pages = pages;
    }

    fn new_memory(
        state: &mut State,
        compartment: u64,
        min_pages: u64,
        max_pages: Option<u64>,
    ) -> Result<u64> {
        let reserved_pages = max_pages.unwrap_or(DEFAULT_RESERVED_PAGES);
        assert_le!(min_pages, reserved_pages);
        let reserved_bytes = reserved_pages as usize * PAGE;
        let base = native_alloc(reserved_bytes)?;
        let id = state.alloc();
        state.memories.insert(
            id,
            MemoryObj {
                base,
                reserved_bytes,
                pages: min_pages,
                max_pages,
                protected: Vec::new(),
            },
        );
        if let Some(comp) = state.compartments.get_mut(&compartment) {
            comp.memories.push(id);
        }
        Ok(id)
    }

    fn resolve_offset(state: &State, offset: InitOffset, global_space: &[u64]) -> Result<u32> {
        match offset {
            InitOffset::Const(v) => Ok(v.max(0) as u32),
            InitOffset::Global(idx) => {
                let id = global_space
                    .get(idx as usize)
                    .ok_or_else(|| anyhow!("offset global {} out of range", idx))?;
                let global = state
                    .globals
                    .get(id)
                    .ok_or_else(|| anyhow!("dangling offset global"))?;
                Ok(global.value as u32)
            }
        }
    }
}

impl Backend for MockBackend {
    fn create_compartment(&self, name: &str) -> CompartmentId {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc();
        state.compartments.insert(
            id,
            Compartment {
                name: name.to_string(),
                instances: Vec::new(),
                memories: Vec::new(),
                tables: Vec::new(),
                globals: Vec::new(),
                clone_map: HashMap::new(),
            },
        );
        CompartmentId(id)
    }

    fn clone_compartment(
        &self,
        src: CompartmentId,
        name: &str,
        clone_memory: bool,
    ) -> Result<CompartmentId> {
        let mut state = self.state.lock().unwrap();
        let new_id = state.alloc();
        let mut clone_map: HashMap<u64, u64> = HashMap::new();

        let src_comp = state
            .compartments
            .get(&src.0)
            .ok_or_else(|| anyhow!("unknown compartment"))?;
        let src_globals = src_comp.globals.clone();
        let src_memories = src_comp.memories.clone();
        let src_tables = src_comp.tables.clone();
        let src_instances = src_comp.instances.clone();

        let mut new_globals = Vec::new();
        for id in &src_globals {
            let global = state.globals.get(id).ok_or_else(|| anyhow!("dangling global"))?;
            let copy = GlobalObj {
                compartment: new_id,
                name: global.name.clone(),
                mutable: global.mutable,
                value: global.value,
            };
            let gid = state.alloc();
            state.globals.insert(gid, copy);
            clone_map.insert(*id, gid);
            new_globals.push(gid);
        }

        let mut new_memories = Vec::new();
        for id in &src_memories {
            let (src_base, pages, max_pages, reserved_bytes, protected) = {
                let m = state.memories.get(id).ok_or_else(|| anyhow!("dangling memory"))?;
                (m.base, m.pages, m.max_pages, m.reserved_bytes, m.protected.clone())
            };
            let base = native_alloc(reserved_bytes)?;
            if clone_memory {
                // Copy committed contents, stepping over guard ranges; the
                // source side of those would fault.
                let committed = pages as usize * PAGE;
                let mut ranges = protected.clone();
                ranges.sort_unstable();
                let mut cursor = 0usize;
                let copy = |from: usize, to: usize| {
                    if to > from {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                (src_base + from) as *const u8,
                                (base + from) as *mut u8,
                                to - from,
                            );
                        }
                    }
                };
                for (start, len) in &ranges {
                    copy(cursor, (*start as usize).min(committed));
                    cursor = (*start as usize + *len as usize).min(committed);
                }
                copy(cursor, committed);
                for (start, len) in &ranges {
                    unsafe {
                        region::protect(
                            (base + *start as usize) as *const u8,
                            *len as usize,
                            region::Protection::NONE,
                        )?;
                    }
                }
            }
            let mid = state.alloc();
            state.memories.insert(
                mid,
                MemoryObj {
                    base,
                    reserved_bytes,
                    pages,
                    max_pages,
                    protected: if clone_memory { protected } else { Vec::new() },
                },
            );
            clone_map.insert(*id, mid);
            new_memories.push(mid);
        }

        let mut new_tables = Vec::new();
        for id in &src_tables {
            let (elems, maximum) = {
                let t = state.tables.get(id).ok_or_else(|| anyhow!("dangling table"))?;
                (t.elems.clone(), t.maximum)
            };
            let tid = state.alloc();
            state.tables.insert(tid, TableObj { elems, maximum });
            clone_map.insert(*id, tid);
            new_tables.push(tid);
        }

        let mut new_instances = Vec::new();
        for id in &src_instances {
            let (iname, exports, default_memory, default_table) = {
                let inst = state
                    .instances
                    .get(id)
                    .ok_or_else(|| anyhow!("dangling instance"))?;
                (
                    inst.name.clone(),
                    inst.exports.clone(),
                    inst.default_memory,
                    inst.default_table,
                )
            };
            let remap_extern = |e: Extern| -> Extern {
                match e {
                    Extern::Func(_) => e,
                    Extern::Global(g) => {
                        Extern::Global(GlobalId(*clone_map.get(&g.0).unwrap_or(&g.0)))
                    }
                    Extern::Table(t) => Extern::Table(TableId(*clone_map.get(&t.0).unwrap_or(&t.0))),
                    Extern::Memory(m) => {
                        Extern::Memory(MemoryId(*clone_map.get(&m.0).unwrap_or(&m.0)))
                    }
                }
            };
            let iid = state.alloc();
            state.instances.insert(
                iid,
                InstanceObj {
                    compartment: new_id,
                    name: iname,
                    exports: exports
                        .into_iter()
                        .map(|(n, e)| (n, remap_extern(e)))
                        .collect(),
                    default_memory: default_memory.map(|m| *clone_map.get(&m).unwrap_or(&m)),
                    default_table: default_table.map(|t| *clone_map.get(&t).unwrap_or(&t)),
                },
            );
            clone_map.insert(*id, iid);
            new_instances.push(iid);
        }

        state.compartments.insert(
            new_id,
            Compartment {
                name: name.to_string(),
                instances: new_instances,
                memories: new_memories,
                tables: new_tables,
                globals: new_globals,
                clone_map,
            },
        );
        Ok(CompartmentId(new_id))
    }

    fn try_collect_compartment(&self, compartment: CompartmentId) -> bool {
        let mut state = self.state.lock().unwrap();
        let comp = match state.compartments.remove(&compartment.0) {
            Some(c) => c,
            None => return false,
        };
        for id in &comp.memories {
            if let Some(memory) = state.memories.remove(id) {
                unsafe {
                    libc::munmap(memory.base as *mut libc::c_void, memory.reserved_bytes);
                }
            }
        }
        for id in &comp.tables {
            state.tables.remove(id);
        }
        for id in &comp.globals {
            state.globals.remove(id);
        }
        for id in &comp.instances {
            state.instances.remove(id);
        }
        state.contexts.retain(|_, ctx| ctx.compartment != compartment.0);
        true
    }

    fn create_context(&self, compartment: CompartmentId) -> ContextId {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc();
        state.contexts.insert(
            id,
            ContextObj {
                compartment: compartment.0,
                overrides: HashMap::new(),
            },
        );
        ContextId(id)
    }

    fn clone_context(&self, context: ContextId, compartment: CompartmentId) -> ContextId {
        let mut state = self.state.lock().unwrap();
        let overrides = state
            .contexts
            .get(&context.0)
            .map(|c| c.overrides.clone())
            .unwrap_or_default();
        let id = state.alloc();
        state.contexts.insert(
            id,
            ContextObj {
                compartment: compartment.0,
                overrides,
            },
        );
        ContextId(id)
    }

    fn context_mutable_global(&self, context: ContextId, index: usize) -> Option<u32> {
        let state = self.state.lock().unwrap();
        let ctx = state.contexts.get(&context.0)?;
        if let Some(value) = ctx.overrides.get(&index) {
            return Some(*value);
        }
        state.mutable_global_value(ctx.compartment, index)
    }

    fn set_context_mutable_global(&self, context: ContextId, index: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(ctx) = state.contexts.get_mut(&context.0) {
            ctx.overrides.insert(index, value);
        }
    }

    fn create_global(&self, compartment: CompartmentId, mutable: bool, name: &str) -> GlobalId {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc();
        state.globals.insert(
            id,
            GlobalObj {
                compartment: compartment.0,
                name: name.to_string(),
                mutable,
                value: 0,
            },
        );
        if let Some(comp) = state.compartments.get_mut(&compartment.0) {
            comp.globals.push(id);
        }
        GlobalId(id)
    }

    fn initialize_global(&self, global: GlobalId, value: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(g) = state.globals.get_mut(&global.0) {
            g.value = value;
        }
    }

    fn global_value(&self, global: GlobalId) -> i32 {
        let state = self.state.lock().unwrap();
        state.globals.get(&global.0).map(|g| g.value).unwrap_or(0)
    }

    fn compile_module(&self, ir: &Arc<ModuleIr>) -> Result<CompiledModuleId> {
        let mut state = self.state.lock().unwrap();
        let id = state.alloc();
        state.compiled.insert(id, ir.clone());
        Ok(CompiledModuleId(id))
    }

    fn instantiate_intrinsic_module(
        &self,
        compartment: CompartmentId,
        name: &str,
        exports: &[(String, ExternKind)],
    ) -> Result<InstanceId> {
        let behaviors = self.behaviors.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        let mut export_objs = Vec::new();
        for (export_name, kind) in exports {
            let obj = match kind {
                ExternKind::Func => {
                    let params = behaviors
                        .get(export_name)
                        .map(|entry| entry.params)
                        .unwrap_or(0);
                    let id = state.alloc();
                    state.funcs.insert(
                        id,
                        FuncObj {
                            name: export_name.clone(),
                            param_count: params,
                        },
                    );
                    Extern::Func(FuncId(id))
                }
                ExternKind::Global => {
                    let id = state.alloc();
                    state.globals.insert(
                        id,
                        GlobalObj {
                            compartment: compartment.0,
                            name: export_name.clone(),
                            mutable: false,
                            value: 0,
                        },
                    );
                    Extern::Global(GlobalId(id))
                }
                other => bail!("unsupported intrinsic export kind {}", other),
            };
            export_objs.push((export_name.clone(), obj));
        }
        let id = state.alloc();
        state.instances.insert(
            id,
            InstanceObj {
                compartment: compartment.0,
                name: name.to_string(),
                exports: export_objs,
                default_memory: None,
                default_table: None,
            },
        );
        if let Some(comp) = state.compartments.get_mut(&compartment.0) {
            comp.instances.push(id);
        }
        Ok(InstanceId(id))
    }

    fn instantiate_module(
        &self,
        compartment: CompartmentId,
        compiled: CompiledModuleId,
        imports: &[Extern],
        name: &str,
    ) -> Result<InstanceId> {
        let mut state = self.state.lock().unwrap();
        let ir = state
            .compiled
            .get(&compiled.0)
            .ok_or_else(|| anyhow!("unknown compiled module"))?
            .clone();

        if imports.len() != ir.imports.len() {
            bail!(
                "import count mismatch: got {}, module wants {}",
                imports.len(),
                ir.imports.len()
            );
        }

        // Build the index spaces, imports first.
        let mut func_space: Vec<u64> = Vec::new();
        let mut global_space: Vec<u64> = Vec::new();
        let mut imported_memory = None;
        let mut imported_table = None;
        for (record, provided) in ir.imports.iter().zip(imports) {
            match (record.kind, provided) {
                (ExternKind::Func, Extern::Func(f)) => func_space.push(f.0),
                (ExternKind::Global, Extern::Global(g)) => global_space.push(g.0),
                (ExternKind::Memory, Extern::Memory(m)) => imported_memory = Some(m.0),
                (ExternKind::Table, Extern::Table(t)) => imported_table = Some(t.0),
                (kind, other) => bail!(
                    "import {}.{} expects a {}, got {:?}",
                    record.module,
                    record.name,
                    kind,
                    other
                ),
            }
        }

        // Defined functions, attributed by export name, then name section.
        let export_names: HashMap<u32, &str> = ir
            .exports
            .iter()
            .filter(|e| e.kind == ExternKind::Func)
            .map(|e| (e.index, e.name.as_str()))
            .collect();
        let total_funcs = ir.num_imported_funcs as usize + {
            // Everything past the imports in the type-index space.
            let mut defined = 0usize;
            while ir
                .func_param_count(ir.num_imported_funcs + defined as u32)
                .is_some()
            {
                defined += 1;
            }
            defined
        };
        for idx in ir.num_imported_funcs as usize..total_funcs {
            let idx = idx as u32;
            let fname = export_names
                .get(&idx)
                .map(|s| s.to_string())
                .or_else(|| ir.function_names.get(&idx).cloned())
                .unwrap_or_else(|| format!("{}::func{}", name, idx));
            let params = ir.func_param_count(idx).unwrap_or(0);
            let id = state.alloc();
            state.funcs.insert(
                id,
                FuncObj {
                    name: fname,
                    param_count: params,
                },
            );
            func_space.push(id);
        }

        // Defined globals, in creation order so contexts can index them.
        for record in &ir.globals {
            let id = state.alloc();
            state.globals.insert(
                id,
                GlobalObj {
                    compartment: compartment.0,
                    name: String::new(),
                    mutable: record.mutable,
                    value: record.i32_init.unwrap_or(0),
                },
            );
            if let Some(comp) = state.compartments.get_mut(&compartment.0) {
                comp.globals.push(id);
            }
            global_space.push(id);
        }

        let memory_id = match (&ir.memory, imported_memory) {
            (Some(decl), _) => Some(Self::new_memory(
                &mut state,
                compartment.0,
                decl.min_pages,
                decl.max_pages,
            )?),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        };

        let table_id = match (&ir.table, imported_table) {
            (Some(decl), _) => {
                let id = state.alloc();
                state.tables.insert(
                    id,
                    TableObj {
                        elems: vec![None; decl.initial as usize],
                        maximum: decl.maximum,
                    },
                );
                if let Some(comp) = state.compartments.get_mut(&compartment.0) {
                    comp.tables.push(id);
                }
                Some(id)
            }
            (None, Some(t)) => Some(t),
            (None, None) => None,
        };

        // Apply active data segments.
        for segment in &ir.data_segments {
            let memory = memory_id.ok_or_else(|| anyhow!("data segment without memory"))?;
            let offset = Self::resolve_offset(&state, segment.offset, &global_space)? as usize;
            let m = state
                .memories
                .get(&memory)
                .ok_or_else(|| anyhow!("dangling memory"))?;
            let committed = m.pages as usize * PAGE;
            if offset + segment.bytes.len() > committed {
                bail!("data segment out of bounds at {:#x}", offset);
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    segment.bytes.as_ptr(),
                    (m.base + offset) as *mut u8,
                    segment.bytes.len(),
                );
            }
        }

        // Apply active element segments.
        for segment in &ir.elem_segments {
            let table = table_id.ok_or_else(|| anyhow!("element segment without table"))?;
            let offset = Self::resolve_offset(&state, segment.offset, &global_space)? as usize;
            let func_ids: Vec<u64> = segment
                .func_indices
                .iter()
                .map(|idx| {
                    func_space
                        .get(*idx as usize)
                        .copied()
                        .ok_or_else(|| anyhow!("element func {} out of range", idx))
                })
                .collect::<Result<_>>()?;
            let t = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| anyhow!("dangling table"))?;
            if offset + func_ids.len() > t.elems.len() {
                bail!("element segment out of bounds at {}", offset);
            }
            for (i, f) in func_ids.iter().enumerate() {
                t.elems[offset + i] = Some(*f);
            }
        }

        // Exports.
        let mut exports = Vec::new();
        for record in &ir.exports {
            let obj = match record.kind {
                ExternKind::Func => Extern::Func(FuncId(
                    *func_space
                        .get(record.index as usize)
                        .ok_or_else(|| anyhow!("export func {} out of range", record.index))?,
                )),
                ExternKind::Global => Extern::Global(GlobalId(
                    *global_space
                        .get(record.index as usize)
                        .ok_or_else(|| anyhow!("export global {} out of range", record.index))?,
                )),
                ExternKind::Memory => Extern::Memory(MemoryId(
                    memory_id.ok_or_else(|| anyhow!("memory export without memory"))?,
                )),
                ExternKind::Table => Extern::Table(TableId(
                    table_id.ok_or_else(|| anyhow!("table export without table"))?,
                )),
            };
            exports.push((record.name.clone(), obj));
        }

        let id = state.alloc();
        state.instances.insert(
            id,
            InstanceObj {
                compartment: compartment.0,
                name: name.to_string(),
                exports,
                default_memory: memory_id,
                default_table: table_id,
            },
        );
        if let Some(comp) = state.compartments.get_mut(&compartment.0) {
            comp.instances.push(id);
        }
        Ok(InstanceId(id))
    }

    fn clone_instance(&self, instance: InstanceId, compartment: CompartmentId) -> Result<InstanceId> {
        let mut state = self.state.lock().unwrap();
        let (name, exports, default_memory, default_table) = {
            let inst = state
                .instances
                .get(&instance.0)
                .ok_or_else(|| anyhow!("unknown instance"))?;
            (
                inst.name.clone(),
                inst.exports.clone(),
                inst.default_memory,
                inst.default_table,
            )
        };

        // Functions are immutable and shared; globals get fresh copies in
        // the target compartment.
        let mut new_exports = Vec::new();
        for (export_name, obj) in exports {
            let remapped = match obj {
                Extern::Global(g) => {
                    let (gname, mutable, value) = {
                        let global = state
                            .globals
                            .get(&g.0)
                            .ok_or_else(|| anyhow!("dangling global"))?;
                        (global.name.clone(), global.mutable, global.value)
                    };
                    let id = state.alloc();
                    state.globals.insert(
                        id,
                        GlobalObj {
                            compartment: compartment.0,
                            name: gname,
                            mutable,
                            value,
                        },
                    );
                    if let Some(comp) = state.compartments.get_mut(&compartment.0) {
                        comp.globals.push(id);
                    }
                    Extern::Global(GlobalId(id))
                }
                other => other,
            };
            new_exports.push((export_name, remapped));
        }

        let id = state.alloc();
        state.instances.insert(
            id,
            InstanceObj {
                compartment: compartment.0,
                name,
                exports: new_exports,
                default_memory,
                default_table,
            },
        );
        if let Some(comp) = state.compartments.get_mut(&compartment.0) {
            comp.instances.push(id);
        }
        Ok(InstanceId(id))
    }

    fn remap_to_cloned_compartment(
        &self,
        instance: InstanceId,
        compartment: CompartmentId,
    ) -> Result<InstanceId> {
        let state = self.state.lock().unwrap();
        let comp = state
            .compartments
            .get(&compartment.0)
            .ok_or_else(|| anyhow!("unknown compartment"))?;
        comp.clone_map
            .get(&instance.0)
            .map(|id| InstanceId(*id))
            .ok_or_else(|| anyhow!("instance has no counterpart in cloned compartment"))
    }

    fn instance_export(&self, instance: InstanceId, name: &str) -> Option<Extern> {
        let state = self.state.lock().unwrap();
        let inst = state.instances.get(&instance.0)?;
        inst.exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, obj)| *obj)
    }

    fn function_param_count(&self, func: FuncId) -> usize {
        let state = self.state.lock().unwrap();
        state
            .funcs
            .get(&func.0)
            .map(|f| f.param_count)
            .unwrap_or(0)
    }

    fn invoke_function(&self, context: ContextId, func: FuncId, args: &[i32]) -> InvokeOutcome {
        let fname = {
            let state = self.state.lock().unwrap();
            match state.funcs.get(&func.0) {
                Some(f) => f.name.clone(),
                None => return InvokeOutcome::Trap("unknown function".to_string()),
            }
        };
        let behavior = {
            let behaviors = self.behaviors.lock().unwrap();
            behaviors.get(&fname).map(|entry| entry.run.clone())
        };
        match behavior {
            Some(run) => run(self, context, args),
            None => InvokeOutcome::Value(0),
        }
    }

    fn default_memory(&self, instance: InstanceId) -> Option<MemoryId> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(&instance.0)
            .and_then(|i| i.default_memory)
            .map(MemoryId)
    }

    fn grow_memory(&self, memory: MemoryId, pages: u64) -> std::result::Result<u64, MemoryGrowError> {
        let mut state = self.state.lock().unwrap();
        let limit = state.commit_limit_pages;
        let m = state
            .memories
            .get_mut(&memory.0)
            .ok_or(MemoryGrowError::Unknown)?;
        let new_pages = m.pages + pages;
        if let Some(max) = m.max_pages {
            if new_pages > max {
                return Err(MemoryGrowError::OutOfMaxSize);
            }
        }
        if new_pages as usize * PAGE > m.reserved_bytes {
            return Err(MemoryGrowError::OutOfMaxSize);
        }
        if let Some(limit) = limit {
            if new_pages > limit {
                return Err(MemoryGrowError::OutOfMemory);
            }
        }
        let prev = m.pages;
        m.pages = new_pages;
        Ok(prev)
    }

    fn memory_num_pages(&self, memory: MemoryId) -> u64 {
        let state = self.state.lock().unwrap();
        state.memories.get(&memory.0).map(|m| m.pages).unwrap_or(0)
    }

    fn memory_max_pages(&self, memory: MemoryId) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state.memories.get(&memory.0).and_then(|m| m.max_pages)
    }

    fn memory_base_address(&self, memory: MemoryId) -> *mut u8 {
        let state = self.state.lock().unwrap();
        state
            .memories
            .get(&memory.0)
            .map(|m| m.base as *mut u8)
            .unwrap_or(std::ptr::null_mut())
    }

    fn protect_memory_region(&self, memory: MemoryId, offset: u32, len: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let m = state
            .memories
            .get_mut(&memory.0)
            .ok_or_else(|| anyhow!("unknown memory"))?;
        let committed = m.pages as usize * PAGE;
        if offset as usize + len as usize > committed {
            bail!("guard range outside committed memory");
        }
        unsafe {
            region::protect(
                (m.base + offset as usize) as *const u8,
                len as usize,
                region::Protection::NONE,
            )?;
        }
        m.protected.push((offset, len));
        Ok(())
    }

    fn default_table(&self, instance: InstanceId) -> Option<TableId> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(&instance.0)
            .and_then(|i| i.default_table)
            .map(TableId)
    }

    fn grow_table(&self, table: TableId, delta: u32) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let t = state
            .tables
            .get_mut(&table.0)
            .ok_or_else(|| anyhow!("unknown table"))?;
        let prev = t.elems.len() as u32;
        if let Some(max) = t.maximum {
            if prev + delta > max {
                bail!("table growth beyond maximum of {}", max);
            }
        }
        t.elems.resize(prev as usize + delta as usize, None);
        Ok(prev)
    }

    fn table_num_elements(&self, table: TableId) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&table.0)
            .map(|t| t.elems.len() as u32)
            .unwrap_or(0)
    }

    fn set_table_element(&self, table: TableId, index: u32, value: Extern) -> Result<()> {
        let func = match value {
            Extern::Func(f) => f.0,
            other => bail!("only functions can live in the table, got {:?}", other),
        };
        let mut state = self.state.lock().unwrap();
        let t = state
            .tables
            .get_mut(&table.0)
            .ok_or_else(|| anyhow!("unknown table"))?;
        let slot = t
            .elems
            .get_mut(index as usize)
            .ok_or_else(|| anyhow!("table index {} out of bounds", index))?;
        *slot = Some(func);
        Ok(())
    }

    fn get_table_element(&self, table: TableId, index: u32) -> Option<Extern> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&table.0)?
            .elems
            .get(index as usize)?
            .map(|f| Extern::Func(FuncId(f)))
    }
}

// ---------------------------------------------------------------------------
// Loaders and host construction
// ---------------------------------------------------------------------------

/// Main modules come from an in-memory map; shared objects are read from
/// disk, matching how dlopen-style paths reach the engine.
pub struct TestLoader {
    mains: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl TestLoader {
    pub fn new() -> Arc<TestLoader> {
        Arc::new(TestLoader {
            mains: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_main(&self, user: &str, function: &str, bytes: Vec<u8>) {
        self.mains
            .lock()
            .unwrap()
            .insert((user.to_string(), function.to_string()), bytes);
    }
}

impl ArtifactLoader for TestLoader {
    fn load(&self, user: &str, function: &str, shared_path: &str) -> Result<Vec<u8>> {
        if shared_path.is_empty() {
            self.mains
                .lock()
                .unwrap()
                .get(&(user.to_string(), function.to_string()))
                .cloned()
                .ok_or_else(|| anyhow!("no artifact registered for {}/{}", user, function))
        } else {
            Ok(fs::read(shared_path)?)
        }
    }
}

pub fn setup_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn env_decl() -> IntrinsicModuleDecl {
    IntrinsicModuleDecl::new("env").func("host_log")
}

pub fn wasi_decl() -> IntrinsicModuleDecl {
    IntrinsicModuleDecl::new("wasi_snapshot_preview1").func("proc_exit")
}

pub fn test_host(backend: Arc<MockBackend>, loader: Arc<TestLoader>) -> Arc<Host> {
    test_host_with_config(backend, loader, HostConfig::default())
}

pub fn test_host_with_config(
    backend: Arc<MockBackend>,
    loader: Arc<TestLoader>,
    config: HostConfig,
) -> Arc<Host> {
    Arc::new(Host::new(backend, loader, config, env_decl(), wasi_decl()))
}

// ---------------------------------------------------------------------------
// Module sources
// ---------------------------------------------------------------------------

/// A conventional main module: exported memory and table, mutable
/// stack-pointer global first, `__heap_base == __data_end`, an entry point,
/// ctors, and one exported worker wired into the table.
pub const MAIN_MODULE_WAT: &str = r#"
(module
  (import "env" "host_log" (func $host_log (param i32)))
  (memory (export "memory") 4 2000)
  (table (export "__indirect_function_table") 2 funcref)
  (global (mut i32) (i32.const 4194304))
  (global (export "__heap_base") i32 (i32.const 65536))
  (global (export "__data_end") i32 (i32.const 65536))
  (global (export "a_flag") i32 (i32.const 24))
  (func $start (export "_start") (result i32) i32.const 0)
  (func (export "__wasm_call_ctors"))
  (func $worker (export "worker") (param i32) (result i32) local.get 0)
  (elem (i32.const 1) $worker)
)
"#;

/// Same shape plus a zygote export.
pub const ZYGOTE_MODULE_WAT: &str = r#"
(module
  (import "env" "host_log" (func $host_log (param i32)))
  (memory (export "memory") 4 2000)
  (table (export "__indirect_function_table") 2 funcref)
  (global (mut i32) (i32.const 4194304))
  (global (export "__heap_base") i32 (i32.const 65536))
  (global (export "__data_end") i32 (i32.const 65536))
  (func (export "_start") (result i32) i32.const 0)
  (func (export "__wasm_call_ctors"))
  (func (export "_zygote") (result i32) i32.const 0)
)
"#;

/// A shared object exporting `f`: position-independent imports, an element
/// segment based at `__table_base`, data based at `__memory_base`.
pub const SIDE_MODULE_F_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "__indirect_function_table" (table 0 funcref))
  (import "env" "__memory_base" (global $mb i32))
  (import "env" "__table_base" (global $tb i32))
  (import "env" "__stack_pointer" (global $sp (mut i32)))
  (func $f (export "f") (result i32) i32.const 5)
  (func (export "__wasm_call_ctors"))
  (global (export "b_flag") i32 (i32.const 16))
  (elem (global.get $tb) $f)
  (data (global.get $mb) "\01\02\03\04")
)
"#;

/// Imports `g` through `GOT.func` before anything exports it.
pub const SIDE_MODULE_NEEDS_G_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "__indirect_function_table" (table 0 funcref))
  (import "env" "__table_base" (global $tb i32))
  (import "GOT.func" "g" (global $g_ptr (mut i32)))
  (func $call_g (export "call_g") (result i32) global.get $g_ptr)
  (func (export "__wasm_call_ctors"))
  (elem (global.get $tb) $call_g)
)
"#;

/// Exports `g`, satisfying the placeholder left by the module above.
pub const SIDE_MODULE_EXPORTS_G_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "__indirect_function_table" (table 0 funcref))
  (import "env" "__table_base" (global $tb i32))
  (func $g (export "g") (result i32) i32.const 99)
  (func (export "__wasm_call_ctors"))
  (elem (global.get $tb) $g)
)
"#;

/// Imports the main module's exported `a_flag` global through `GOT.mem`.
pub const SIDE_MODULE_GOT_MEM_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "__indirect_function_table" (table 0 funcref))
  (import "env" "__table_base" (global $tb i32))
  (import "GOT.mem" "a_flag" (global $a_flag (mut i32)))
  (func $peek (export "peek") (result i32) global.get $a_flag)
  (func (export "__wasm_call_ctors"))
  (elem (global.get $tb) $peek)
)
"#;

/// Imports a data symbol nothing ever exports.
pub const SIDE_MODULE_BAD_GOT_MEM_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "__indirect_function_table" (table 0 funcref))
  (import "env" "__table_base" (global $tb i32))
  (import "GOT.mem" "unknown_symbol" (global $u (mut i32)))
  (func $poke (export "poke") (result i32) global.get $u)
  (func (export "__wasm_call_ctors"))
  (elem (global.get $tb) $poke)
)
"#;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write a compiled module to a unique temp path, returning the path.
pub fn write_side_module(tag: &str, wat_source: &str) -> PathBuf {
    let bytes = wat::parse_str(wat_source).expect("valid wat");
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "wasmcell-test-{}-{}-{}.so",
        std::process::id(),
        tag,
        seq
    ));
    fs::write(&path, bytes).expect("write side module");
    path
}

pub fn main_module_bytes() -> Vec<u8> {
    wat::parse_str(MAIN_MODULE_WAT).expect("valid wat")
}

pub fn zygote_module_bytes() -> Vec<u8> {
    wat::parse_str(ZYGOTE_MODULE_WAT).expect("valid wat")
}
