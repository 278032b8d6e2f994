//! Per-thread execution state: the executing-module slot consulted by
//! host-call shims, fork-join level bookkeeping, and worker-thread entry
//! with a private stack.

use std::cell::{Cell, RefCell};

use log::{debug, error};

use crate::backend::{FuncId, InvokeOutcome};
use crate::error::{Error, LayoutError, Result};
use crate::instance::ModuleInstance;
use crate::layout::THREAD_STACK_SIZE;
use crate::message::InvocationMessage;

thread_local! {
    static EXECUTING_MODULE: Cell<Option<u64>> = Cell::new(None);
    static PARALLEL_STATE: RefCell<Option<ParallelState>> = RefCell::new(None);
}

/// Scoped setter for the executing-module slot. Host-call shims receive no
/// context argument, so they recover the owning instance through this
/// thread-local token; the guard restores the previous value on drop so
/// nested invocations unwind correctly.
pub(crate) struct ExecutingGuard {
    prev: Option<u64>,
}

impl ExecutingGuard {
    pub(crate) fn enter(token: u64) -> ExecutingGuard {
        let prev = EXECUTING_MODULE.with(|slot| slot.replace(Some(token)));
        ExecutingGuard { prev }
    }
}

impl Drop for ExecutingGuard {
    fn drop(&mut self) {
        EXECUTING_MODULE.with(|slot| slot.set(self.prev));
    }
}

/// Token of the module currently executing on this thread, if any.
pub fn executing_module_token() -> Option<u64> {
    EXECUTING_MODULE.with(|slot| slot.get())
}

/// Fork-join nesting state for the current invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelLevel {
    pub depth: i32,
    pub effective_depth: i32,
    pub max_active_levels: i32,
    pub num_threads: i32,
}

#[derive(Debug, Clone)]
struct ParallelState {
    thread_num: i32,
    level: ParallelLevel,
}

pub(crate) fn set_parallel_state(thread_num: i32, level: ParallelLevel) {
    PARALLEL_STATE.with(|slot| {
        *slot.borrow_mut() = Some(ParallelState { thread_num, level });
    });
}

pub fn current_parallel_level() -> Option<ParallelLevel> {
    PARALLEL_STATE.with(|slot| slot.borrow().as_ref().map(|s| s.level.clone()))
}

pub fn current_parallel_thread_num() -> Option<i32> {
    PARALLEL_STATE.with(|slot| slot.borrow().as_ref().map(|s| s.thread_num))
}

/// Everything a worker thread needs to run one guest function.
pub struct WasmThreadSpec {
    pub func: FuncId,
    pub args: Vec<i32>,
    /// Bottom of the worker's private stack region.
    pub stack_base: u32,
}

impl ModuleInstance {
    /// Carve a private 2 MiB stack for a worker thread out of linear memory.
    pub fn allocate_thread_stack(&mut self) -> Result<u32> {
        self.mmap_memory(THREAD_STACK_SIZE)
    }

    pub(crate) fn prepare_parallel_context(&mut self, msg: &InvocationMessage) {
        let level = if msg.parallel_depth > 0 {
            ParallelLevel {
                depth: msg.parallel_depth,
                effective_depth: msg.parallel_effective_depth,
                max_active_levels: msg.parallel_max_active_levels,
                num_threads: msg.parallel_num_threads,
            }
        } else {
            ParallelLevel {
                depth: 0,
                effective_depth: 0,
                max_active_levels: 1,
                num_threads: self.host.config().thread_pool_size as i32,
            }
        };
        set_parallel_state(msg.parallel_thread_num, level);
    }

    /// A fork-join worker invocation relayed from another host: dispatch the
    /// requested function pointer with (thread_num, argc, args...) and
    /// record its return code.
    pub(crate) fn execute_remote_parallel(&mut self, msg: &mut InvocationMessage) -> Result<()> {
        let func = self.function_from_table(msg.funcptr as u32)?;
        let thread_num = msg.parallel_thread_num;
        let argc = msg.parallel_function_args.len() as i32;

        debug!(
            "running parallel thread #{} for function {} (argc={})",
            thread_num, msg.funcptr, argc
        );

        let mut args = vec![thread_num, argc];
        args.extend(msg.parallel_function_args.iter().rev());

        let stack_base = self.allocate_thread_stack()?;
        let code = self.execute_thread_locally(WasmThreadSpec {
            func,
            args,
            stack_base,
        })?;
        msg.returnvalue = code;
        Ok(())
    }

    /// Run one guest function on a fresh context with its own stack.
    ///
    /// The worker's context is cloned from the parent so it sees the same
    /// compartment; only the stack pointer is rewritten, after checking the
    /// untouched value still equals the compiled-in stack size.
    pub fn execute_thread_locally(&mut self, spec: WasmThreadSpec) -> Result<i32> {
        let backend = self.backend().clone();
        let compartment = self.compartment()?;
        let stack_top = spec.stack_base + THREAD_STACK_SIZE - 1;

        let thread_context = backend.clone_context(self.context()?, compartment);

        let prior = backend
            .context_mutable_global(thread_context, 0)
            .ok_or_else(|| Error::from(LayoutError::UnexpectedStackGlobal(0)))?;
        if prior != self.host.config().main_stack_size {
            error!(
                "expected first mutable global in context to be the stack pointer ({})",
                prior
            );
            return Err(LayoutError::UnexpectedStackGlobal(prior).into());
        }
        backend.set_context_mutable_global(thread_context, 0, stack_top);

        let _executing = ExecutingGuard::enter(self.token);
        let code = match backend.invoke_function(thread_context, spec.func, &spec.args) {
            InvokeOutcome::Value(v) => v,
            InvokeOutcome::Trap(desc) => {
                error!("runtime exception: {}", desc);
                1
            }
            InvokeOutcome::Exit(code) => {
                debug!("caught guest exit (code {})", code);
                code
            }
        };
        Ok(code)
    }
}
