//! Module instance lifecycle engine for a serverless WebAssembly host.
//!
//! Each invocation binds a compiled module to a worker and runs a named
//! function inside a sandboxed compartment. This crate owns the hard part of
//! that: instantiating the main module, dynamically linking shared-object
//! modules into its compartment at runtime via a Global Offset Table, laying
//! out linear memory with guard regions, and fast cloning from a prepared
//! zygote plus snapshot/restore of bound memory.
//!
//! Executing WebAssembly is delegated to a backend implementing the
//! [`backend::Backend`] capability trait; the engine never touches compiled
//! code, only layout and linkage.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod got;
pub mod host;
pub mod instance;
pub mod ir;
pub mod layout;
pub mod message;
pub mod registry;
pub mod snapshot;
pub mod thread;

mod memory;
mod resolver;

pub use crate::backend::{Backend, Extern, ExternKind, InvokeOutcome};
pub use crate::cache::{ArtifactLoader, ModuleCache};
pub use crate::config::HostConfig;
pub use crate::error::{
    BindingError, DynamicLoadError, Error, LayoutError, LinkError, MemoryError, MemoryGrowError,
    Result,
};
pub use crate::host::{Host, IntrinsicModuleDecl, SharedFileSync};
pub use crate::instance::ModuleInstance;
pub use crate::layout::{
    LoadedDynamicModule, DYNAMIC_MODULE_MEMORY_PAGES, DYNAMIC_MODULE_STACK_SIZE,
    THREAD_STACK_SIZE, WASM_BYTES_PER_PAGE,
};
pub use crate::message::{InvocationMessage, WasmEnvironment};
pub use crate::registry::MAIN_MODULE_HANDLE;
pub use crate::thread::{executing_module_token, ParallelLevel, WasmThreadSpec};
