//! Snapshot and restore of linear memory.
//!
//! The stream framing is a `u64` little-endian page count followed by that
//! many raw 64 KiB pages. No version tag and no architecture check; feeding
//! a blob across incompatible builds is the caller's problem.

use std::io::{Read, Write};

use log::error;

use crate::error::{MemoryError, Result};
use crate::instance::ModuleInstance;
use crate::layout::WASM_BYTES_PER_PAGE;

pub(crate) fn write_header<W: Write>(out: &mut W, pages: u64) -> std::io::Result<()> {
    out.write_all(&pages.to_le_bytes())
}

pub(crate) fn read_header<R: Read>(input: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl ModuleInstance {
    /// Serialise the current linear memory to `out`.
    pub fn snapshot<W: Write>(&self, out: &mut W) -> Result<()> {
        let memory = self.default_memory()?;
        let pages = self.backend().memory_num_pages(memory);
        let num_bytes = (pages * u64::from(WASM_BYTES_PER_PAGE)) as usize;
        let base = self.backend().memory_base_address(memory);

        write_header(out, pages)?;
        let contents = unsafe { std::slice::from_raw_parts(base, num_bytes) };
        out.write_all(contents)?;
        Ok(())
    }

    /// Restore linear memory from `input`, growing to the snapshot's page
    /// count first. A snapshot smaller than the current memory is rejected;
    /// restore only grows.
    pub fn restore<R: Read>(&mut self, input: &mut R) -> Result<()> {
        let snapshot_pages = read_header(input)?;

        let memory = self.default_memory()?;
        let current_pages = self.backend().memory_num_pages(memory);
        if snapshot_pages < current_pages {
            error!(
                "snapshot has {} pages but memory already has {}",
                snapshot_pages, current_pages
            );
            return Err(MemoryError::RestoreShrink {
                snapshot_pages,
                current_pages,
            }
            .into());
        }
        if snapshot_pages > current_pages {
            self.mmap_pages(snapshot_pages - current_pages)?;
        }

        let num_bytes = (snapshot_pages * u64::from(WASM_BYTES_PER_PAGE)) as usize;
        let base = self.backend().memory_base_address(memory);
        let contents = unsafe { std::slice::from_raw_parts_mut(base, num_bytes) };
        input.read_exact(contents)?;
        Ok(())
    }
}
