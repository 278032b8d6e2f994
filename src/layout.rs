//! Linear-memory layout for dynamically loaded modules.
//!
//! Every shared module gets a fixed-size window of the instance's linear
//! memory, carved as stack / data / heap from the bottom up, with no-access
//! guard regions mapped on either side by the caller. The layout record is
//! immutable once its instance exists.

use crate::backend::InstanceId;
use crate::error::LayoutError;

/// Bytes per WebAssembly page.
pub const WASM_BYTES_PER_PAGE: u32 = 65536;

/// Pages reserved for each dynamically loaded module.
pub const DYNAMIC_MODULE_MEMORY_PAGES: u64 = 30;

/// Bytes of stack at the bottom of each dynamic module's region.
pub const DYNAMIC_MODULE_STACK_SIZE: u32 = 64 * 1024;

/// Private stack handed to each fork-join worker thread.
pub const THREAD_STACK_SIZE: u32 = 2 * 1024 * 1024;

/// One loaded shared-object module and its slice of memory and table.
///
/// Address fields are wasm byte offsets; table fields are element indices.
#[derive(Debug, Clone)]
pub struct LoadedDynamicModule {
    pub path: String,
    pub instance: Option<InstanceId>,

    pub memory_bottom: u32,
    pub memory_top: u32,

    pub stack_size: u32,
    pub stack_top: u32,
    pub stack_pointer: u32,

    pub data_bottom: u32,
    pub data_top: u32,
    pub heap_bottom: u32,

    pub table_bottom: u32,
    pub table_top: u32,
}

impl LoadedDynamicModule {
    /// Compute the layout for a module whose region starts at
    /// `memory_bottom`, with `data_size` bytes of initialised data and table
    /// elements `[table_bottom, table_top)`.
    pub fn build(
        path: &str,
        memory_bottom: u32,
        data_size: u32,
        table_bottom: u32,
        table_top: u32,
        memory_pages: u64,
        stack_size: u32,
    ) -> Result<LoadedDynamicModule, LayoutError> {
        let region = memory_pages as u32 * WASM_BYTES_PER_PAGE;
        let memory_top = memory_bottom + region;
        let stack_top = memory_bottom + stack_size;

        if data_size > memory_top - stack_top {
            return Err(LayoutError::DataRegionOverflow {
                data_size,
                region: memory_top - stack_top,
            });
        }

        let data_bottom = stack_top;
        let data_top = data_bottom + data_size;

        Ok(LoadedDynamicModule {
            path: path.to_string(),
            instance: None,
            memory_bottom,
            memory_top,
            stack_size,
            stack_top,
            stack_pointer: stack_top - 1,
            data_bottom,
            data_top,
            heap_bottom: data_top,
            table_bottom,
            table_top,
        })
    }

    /// Check the region invariants after instantiation.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let check = |ok: bool, detail: &str| {
            if ok {
                Ok(())
            } else {
                Err(LayoutError::InvalidDynamicLayout {
                    path: self.path.clone(),
                    detail: detail.to_string(),
                })
            }
        };

        check(self.memory_bottom > 0, "memory bottom at zero")?;
        check(self.memory_bottom < self.stack_top, "stack below memory bottom")?;
        check(self.stack_top <= self.data_bottom, "data overlaps stack")?;
        check(self.data_bottom <= self.data_top, "negative data region")?;
        check(self.heap_bottom == self.data_top, "heap does not follow data")?;
        check(self.data_top <= self.memory_top, "data beyond region top")?;
        check(self.table_bottom < self.table_top, "empty table window")?;
        Ok(())
    }
}

/// Pages needed to hold `bytes`.
pub fn pages_for_bytes(bytes: u32) -> u64 {
    (u64::from(bytes) + u64::from(WASM_BYTES_PER_PAGE) - 1) / u64::from(WASM_BYTES_PER_PAGE)
}
