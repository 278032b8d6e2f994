//! The capability interface the engine requires from a WebAssembly backend.
//!
//! The backend owns compiled code, compartments and the native allocations
//! behind memories and tables; the engine owns layout and linkage. Everything
//! crosses this boundary as a `Copy` handle so that the engine can be cloned
//! and torn down without holding borrows into backend internals.

use std::sync::Arc;

use anyhow::Result;

use crate::error::MemoryGrowError;
use crate::ir::ModuleIr;

macro_rules! backend_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

backend_id!(
    /// An isolation domain owning memories, tables, globals and instances.
    CompartmentId
);
backend_id!(
    /// An execution stack frame pointer bound to one compartment.
    ContextId
);
backend_id!(
    /// A live, linked realisation of a compiled module.
    InstanceId
);
backend_id!(FuncId);
backend_id!(GlobalId);
backend_id!(TableId);
backend_id!(MemoryId);
backend_id!(
    /// A compiled module artifact owned by the backend.
    CompiledModuleId
);

/// The classes of object that can satisfy an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Global,
    Table,
    Memory,
}

impl std::fmt::Display for ExternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExternKind::Func => "function",
            ExternKind::Global => "global",
            ExternKind::Table => "table",
            ExternKind::Memory => "memory",
        };
        f.write_str(s)
    }
}

/// A backend object handed across the capability boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extern {
    Func(FuncId),
    Global(GlobalId),
    Table(TableId),
    Memory(MemoryId),
}

impl Extern {
    pub fn kind(&self) -> ExternKind {
        match self {
            Extern::Func(_) => ExternKind::Func,
            Extern::Global(_) => ExternKind::Global,
            Extern::Table(_) => ExternKind::Table,
            Extern::Memory(_) => ExternKind::Memory,
        }
    }

    pub fn as_func(&self) -> Option<FuncId> {
        match self {
            Extern::Func(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<GlobalId> {
        match self {
            Extern::Global(g) => Some(*g),
            _ => None,
        }
    }
}

/// The result of driving a guest function to completion.
///
/// A clean `exit(code)` from the guest unwinds the invoker and surfaces here
/// as `Exit`; any trap or backend runtime exception surfaces as `Trap` with a
/// human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    Value(i32),
    Trap(String),
    Exit(i32),
}

/// The set of operations the engine needs from a backend.
///
/// Object-safe by construction: the engine holds an `Arc<dyn Backend>` and
/// threads it through every instance it creates.
pub trait Backend: Send + Sync {
    // Compartments.

    fn create_compartment(&self, name: &str) -> CompartmentId;

    /// Clone a compartment, including every instance, table and global it
    /// owns. When `clone_memory` is false the new default memory has the same
    /// page count but unspecified contents; the caller is expected to map
    /// contents over it.
    fn clone_compartment(
        &self,
        src: CompartmentId,
        name: &str,
        clone_memory: bool,
    ) -> Result<CompartmentId>;

    /// Attempt to reclaim a compartment. Returns whether it was collected;
    /// `false` means something still references it.
    fn try_collect_compartment(&self, compartment: CompartmentId) -> bool;

    // Contexts.

    fn create_context(&self, compartment: CompartmentId) -> ContextId;
    fn clone_context(&self, context: ContextId, compartment: CompartmentId) -> ContextId;

    /// Read the context's mutable-global slot at `index` (0 is the stack
    /// pointer for toolchain-conventional modules).
    fn context_mutable_global(&self, context: ContextId, index: usize) -> Option<u32>;
    fn set_context_mutable_global(&self, context: ContextId, index: usize, value: u32);

    // Globals.

    fn create_global(&self, compartment: CompartmentId, mutable: bool, name: &str) -> GlobalId;
    fn initialize_global(&self, global: GlobalId, value: i32);
    fn global_value(&self, global: GlobalId) -> i32;

    // Modules and instances.

    fn compile_module(&self, ir: &Arc<ModuleIr>) -> Result<CompiledModuleId>;

    /// Instantiate a host-provided import module exposing the named objects.
    fn instantiate_intrinsic_module(
        &self,
        compartment: CompartmentId,
        name: &str,
        exports: &[(String, ExternKind)],
    ) -> Result<InstanceId>;

    /// Instantiate a compiled module with imports in declaration order.
    fn instantiate_module(
        &self,
        compartment: CompartmentId,
        compiled: CompiledModuleId,
        imports: &[Extern],
        name: &str,
    ) -> Result<InstanceId>;

    /// Copy an instance from another compartment into `compartment`.
    fn clone_instance(
        &self,
        instance: InstanceId,
        compartment: CompartmentId,
    ) -> Result<InstanceId>;

    /// Find the counterpart of `instance` inside a compartment produced by
    /// [`Backend::clone_compartment`].
    fn remap_to_cloned_compartment(
        &self,
        instance: InstanceId,
        compartment: CompartmentId,
    ) -> Result<InstanceId>;

    fn instance_export(&self, instance: InstanceId, name: &str) -> Option<Extern>;

    // Functions.

    fn function_param_count(&self, func: FuncId) -> usize;
    fn invoke_function(&self, context: ContextId, func: FuncId, args: &[i32]) -> InvokeOutcome;

    // Memories.

    fn default_memory(&self, instance: InstanceId) -> Option<MemoryId>;

    /// Grow by `pages`, returning the previous page count.
    fn grow_memory(
        &self,
        memory: MemoryId,
        pages: u64,
    ) -> std::result::Result<u64, MemoryGrowError>;
    fn memory_num_pages(&self, memory: MemoryId) -> u64;
    fn memory_max_pages(&self, memory: MemoryId) -> Option<u64>;
    fn memory_base_address(&self, memory: MemoryId) -> *mut u8;

    /// Mark a byte range of the memory's native backing as inaccessible.
    /// Any guest or host access to the range afterwards faults.
    fn protect_memory_region(&self, memory: MemoryId, offset: u32, len: u32) -> Result<()>;

    // Tables.

    fn default_table(&self, instance: InstanceId) -> Option<TableId>;

    /// Grow by `delta` elements, returning the previous element count.
    fn grow_table(&self, table: TableId, delta: u32) -> Result<u32>;
    fn table_num_elements(&self, table: TableId) -> u32;
    fn set_table_element(&self, table: TableId, index: u32, value: Extern) -> Result<()>;
    fn get_table_element(&self, table: TableId, index: u32) -> Option<Extern>;
}
