//! The Global Offset Table bridging dynamic modules to each other's exports.
//!
//! Two maps plus a set of placeholders: function names resolve to table
//! indices, data names resolve to initialised i32 values, and names imported
//! before their exporter is loaded sit in `missing` with a pre-grown table
//! slot until patch-up. A name is never in `missing` and the function map at
//! the same time, which keeps patch-up idempotent.

use std::collections::HashMap;

/// An initialised data symbol: its value and the source mutability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotDataEntry {
    pub value: i32,
    pub mutable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalOffsetTable {
    function_offsets: HashMap<String, u32>,
    data_offsets: HashMap<String, GotDataEntry>,
    missing: HashMap<String, u32>,
}

impl GlobalOffsetTable {
    pub fn function_offset(&self, name: &str) -> Option<u32> {
        self.function_offsets.get(name).copied()
    }

    pub fn data_offset(&self, name: &str) -> Option<GotDataEntry> {
        self.data_offsets.get(name).copied()
    }

    pub fn record_function(&mut self, name: &str, table_index: u32) {
        self.function_offsets.insert(name.to_string(), table_index);
    }

    pub fn record_data(&mut self, name: &str, value: i32, mutable: bool) {
        self.data_offsets
            .insert(name.to_string(), GotDataEntry { value, mutable });
    }

    /// Park a name whose export has not been loaded yet at a pre-grown table
    /// slot.
    pub fn add_missing(&mut self, name: &str, table_index: u32) {
        debug_assert!(!self.function_offsets.contains_key(name));
        self.missing.insert(name.to_string(), table_index);
    }

    pub fn missing_entries(&self) -> impl Iterator<Item = (&str, u32)> {
        self.missing.iter().map(|(name, idx)| (name.as_str(), *idx))
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    /// Move a resolved placeholder into the function map. If the name was
    /// recorded through an element segment in the meantime, that index wins;
    /// the placeholder slot is still patched by the caller either way.
    pub fn promote_missing(&mut self, name: &str) {
        if let Some(index) = self.missing.remove(name) {
            self.function_offsets.entry(name.to_string()).or_insert(index);
        }
    }

    pub fn function_count(&self) -> usize {
        self.function_offsets.len()
    }

    pub fn data_count(&self) -> usize {
        self.data_offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.function_offsets.is_empty() && self.data_offsets.is_empty() && self.missing.is_empty()
    }

    pub fn clear(&mut self) {
        self.function_offsets.clear();
        self.data_offsets.clear();
        self.missing.clear();
    }
}
