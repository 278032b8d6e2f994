//! Host configuration.

use crate::layout::{DYNAMIC_MODULE_MEMORY_PAGES, DYNAMIC_MODULE_STACK_SIZE};

/// Tunables for module layout and execution.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Pages reserved for each dynamically loaded module.
    pub dynamic_module_memory_pages: u64,

    /// Stack bytes at the bottom of each dynamic module's region.
    pub dynamic_module_stack_size: u32,

    /// No-access pages mapped before and after each dynamic allocation.
    pub guard_region_pages: u64,

    /// Stack size main modules are compiled with; worker threads verify the
    /// untouched stack-pointer global against this before overwriting it.
    pub main_stack_size: u32,

    /// Width of the fork-join worker pool.
    pub thread_pool_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            dynamic_module_memory_pages: DYNAMIC_MODULE_MEMORY_PAGES,
            dynamic_module_stack_size: DYNAMIC_MODULE_STACK_SIZE,
            guard_region_pages: 1,
            main_stack_size: 4 * 1024 * 1024,
            thread_pool_size: 4,
        }
    }
}
