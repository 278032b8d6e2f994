//! Error taxonomy for the lifecycle engine.
//!
//! Guest traps and clean guest exits are *outcomes* of `execute`, not errors;
//! they are reported through the invocation message and the `bool` success
//! flag. Everything here aborts the operation that raised it, and an instance
//! left in an error state is expected to be torn down rather than retried.

use thiserror::Error;

/// Failures of the bind protocol or the ctor/zygote handshake.
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("module is already bound to {user}/{function}")]
    AlreadyBound { user: String, function: String },

    #[error("module must be bound before executing")]
    NotBound,

    #[error("cannot execute {requested} on module bound to {bound}")]
    WrongFunction { requested: String, bound: String },

    #[error("{func} returned non-zero code {code}")]
    ZygoteFailed { func: String, code: i32 },
}

/// Failures of import resolution and GOT bookkeeping.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("missing import {module}.{name}")]
    MissingImport { module: String, name: String },

    #[error("import {module}.{name} resolved to a {found}, expected a {expected}")]
    TypeMismatch {
        module: String,
        name: String,
        found: crate::backend::ExternKind,
        expected: crate::backend::ExternKind,
    },

    #[error("no data offset recorded in GOT for {0}")]
    GotMissingData(String),

    #[error("table slot {index} for {name} was never patched")]
    UnresolvedGotSlot { name: String, index: u32 },

    #[error("no function at table index {0}")]
    EmptyTableSlot(u32),

    #[error("missing exported function {0}")]
    MissingExport(String),

    #[error("function {0} not present in GOT")]
    FunctionNotInGot(String),

    #[error("data symbol {0} not present in GOT")]
    DataNotInGot(String),
}

/// Violations of the linear-memory layout contract.
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("data size {data_size} exceeds the {region} bytes reserved for a dynamic module")]
    DataRegionOverflow { data_size: u32, region: u32 },

    #[error("first global of the main module (stack top) is immutable")]
    ImmutableStackTop,

    #[error("stack is not at the bottom of memory (__heap_base={heap_base}, __data_end={data_end})")]
    StackNotAtBottom { heap_base: i32, data_end: i32 },

    #[error("invalid dynamic module layout for {path}: {detail}")]
    InvalidDynamicLayout { path: String, detail: String },

    #[error("expected first mutable context global to be the stack pointer (found {0})")]
    UnexpectedStackGlobal(u32),
}

/// The four ways a backend memory growth can fail.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryGrowError {
    #[error("backend failed to commit pages")]
    OutOfMemory,
    #[error("growth exceeds the memory's maximum size")]
    OutOfMaxSize,
    #[error("memory resource quota exceeded")]
    OutOfQuota,
    #[error("unknown backend growth failure")]
    Unknown,
}

/// Failures of the engine-side memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("cannot commit {pages} additional pages")]
    OutOfMemory { pages: u64 },

    #[error("growing by {pages} pages would exceed the memory maximum of {max} pages")]
    OutOfMaxSize { pages: u64, max: u64 },

    #[error("memory resource quota exceeded growing by {pages} pages")]
    OutOfQuota { pages: u64 },

    #[error("unknown backend failure growing by {pages} pages")]
    Unknown { pages: u64 },

    #[error("requested mapping of zero pages")]
    ZeroPages,

    #[error("file mapping landed at {actual:#x} instead of {expected:#x}")]
    RemapMismatch { expected: usize, actual: usize },

    #[error("mmap of file descriptor {fd} failed: {errno}")]
    FileMap { fd: i32, errno: i32 },

    #[error("failed to protect guard region: {0}")]
    GuardProtect(String),

    #[error("access at {addr:#x}+{len} is outside linear memory of {size} bytes")]
    OutOfBounds { addr: u32, len: usize, size: usize },

    #[error("snapshot holds {snapshot_pages} pages but memory already has {current_pages}; restore only grows")]
    RestoreShrink {
        snapshot_pages: u64,
        current_pages: u64,
    },
}

/// Failures of the dlopen-like dynamic loading surface.
///
/// Path problems (directory, missing file) are not raised; `dynamic_load`
/// reports them by returning handle 0 the way dlopen returns NULL.
#[derive(Error, Debug)]
pub enum DynamicLoadError {
    #[error("no dynamic module registered for handle {0}")]
    UnknownHandle(i32),

    #[error("no dynamic modules have been loaded")]
    NoModulesLoaded,

    #[error("function {0} is not exported by the requested module")]
    MissingDynamicFunction(String),
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    DynamicLoad(#[from] DynamicLoadError),

    #[error("guest trap: {0}")]
    Trap(String),

    #[error("backend error: {0}")]
    Backend(anyhow::Error),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("invalid invocation input: {0}")]
    InvalidInput(String),

    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Backend(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
