//! Registry of dynamically loaded modules.
//!
//! Handles follow dlopen conventions expected by guest code: 0 means the
//! load failed, 1 is the main module, real shared objects start at 2. A path
//! maps to exactly one handle for the lifetime of the instance, and the
//! registry remembers which module was loaded last so that linkage can read
//! its layout while the instantiation is still in flight.

use std::collections::{BTreeMap, HashMap};

use crate::layout::LoadedDynamicModule;

/// Handle guest code uses to refer to the main module.
pub const MAIN_MODULE_HANDLE: i32 = 1;

const FIRST_DYNAMIC_HANDLE: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct DynamicModuleRegistry {
    modules: BTreeMap<i32, LoadedDynamicModule>,
    path_to_handle: HashMap<String, i32>,
    last_loaded: i32,
}

impl DynamicModuleRegistry {
    pub fn handle_for_path(&self, path: &str) -> Option<i32> {
        self.path_to_handle.get(path).copied()
    }

    /// Reserve a handle for a new path and mark it as the last loaded
    /// module. The layout record is inserted separately, before the module
    /// instantiates, so the resolver can see it.
    pub fn allocate(&mut self, path: &str) -> i32 {
        debug_assert!(!self.path_to_handle.contains_key(path));
        let handle = FIRST_DYNAMIC_HANDLE + self.path_to_handle.len() as i32;
        self.path_to_handle.insert(path.to_string(), handle);
        self.last_loaded = handle;
        handle
    }

    pub fn insert(&mut self, handle: i32, module: LoadedDynamicModule) {
        self.modules.insert(handle, module);
    }

    pub fn get(&self, handle: i32) -> Option<&LoadedDynamicModule> {
        self.modules.get(&handle)
    }

    pub fn get_mut(&mut self, handle: i32) -> Option<&mut LoadedDynamicModule> {
        self.modules.get_mut(&handle)
    }

    pub fn last_loaded(&self) -> Option<&LoadedDynamicModule> {
        self.modules.get(&self.last_loaded)
    }

    pub fn last_loaded_handle(&self) -> i32 {
        self.last_loaded
    }

    pub fn set_last_loaded_handle(&mut self, handle: i32) {
        self.last_loaded = handle;
    }

    /// Loaded modules in insertion order (handles are allocated
    /// monotonically, so handle order is load order).
    pub fn iter(&self) -> impl Iterator<Item = (i32, &LoadedDynamicModule)> {
        self.modules.iter().map(|(h, m)| (*h, m))
    }

    pub fn count(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.path_to_handle.is_empty()
    }

    pub fn clear(&mut self) {
        self.modules.clear();
        self.path_to_handle.clear();
        self.last_loaded = 0;
    }
}
