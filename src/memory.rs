//! Linear-memory management for a bound instance.
//!
//! Growth goes through the backend; raw byte access, file mappings and the
//! memory-fd snapshot path operate on the native base address the backend
//! hands back. All addresses here are wasm byte offsets unless a native
//! pointer is explicitly named.

use std::io;
use std::os::unix::io::RawFd;

use log::{debug, error};

use crate::error::{Error, MemoryError, MemoryGrowError, Result};
use crate::instance::ModuleInstance;
use crate::layout::{pages_for_bytes, WASM_BYTES_PER_PAGE};

impl ModuleInstance {
    /// Grow the default memory by `pages`, returning the wasm byte offset of
    /// the newly mapped region. Growth is all-or-nothing.
    pub fn mmap_pages(&mut self, pages: u64) -> Result<u32> {
        if pages == 0 {
            error!("requesting mapping of zero pages");
            return Err(MemoryError::ZeroPages.into());
        }

        let memory = self.default_memory()?;
        let backend = self.backend();
        let current = backend.memory_num_pages(memory);

        if let Some(max) = backend.memory_max_pages(memory) {
            if current + pages > max {
                error!(
                    "mmap would exceed max of {} pages (growing by {} from {})",
                    max, pages, current
                );
                return Err(MemoryError::OutOfMaxSize { pages, max }.into());
            }
        }

        let prev = backend.grow_memory(memory, pages).map_err(|err| {
            let mapped = match err {
                MemoryGrowError::OutOfMemory => {
                    error!(
                        "committing new pages failed (growing by {} from {})",
                        pages, current
                    );
                    MemoryError::OutOfMemory { pages }
                }
                MemoryGrowError::OutOfMaxSize => {
                    error!("no memory for mapping (growing by {} from {})", pages, current);
                    MemoryError::OutOfMaxSize {
                        pages,
                        max: current,
                    }
                }
                MemoryGrowError::OutOfQuota => {
                    error!(
                        "memory resource quota exceeded (growing by {} from {})",
                        pages, current
                    );
                    MemoryError::OutOfQuota { pages }
                }
                MemoryGrowError::Unknown => {
                    error!(
                        "unknown memory mapping error (growing by {} from {})",
                        pages, current
                    );
                    MemoryError::Unknown { pages }
                }
            };
            Error::from(mapped)
        })?;

        debug!(
            "mmap - growing memory from {} to {} pages",
            current,
            current + pages
        );

        u32::try_from(prev * u64::from(WASM_BYTES_PER_PAGE))
            .map_err(|_| MemoryError::Unknown { pages }.into())
    }

    /// Grow by at least `length` bytes, rounded up to whole pages.
    pub fn mmap_memory(&mut self, length: u32) -> Result<u32> {
        self.mmap_pages(pages_for_bytes(length))
    }

    /// Map `length` bytes of `fd` read-only into fresh linear memory.
    ///
    /// The fresh allocation is unmapped and the file mapped in its place;
    /// the kernel must land the file exactly where the allocation was.
    pub fn mmap_file(&mut self, fd: RawFd, length: u32) -> Result<u32> {
        let wasm_ptr = self.mmap_memory(length)?;
        let target = self.native_pointer(wasm_ptr, length as usize)?;

        unsafe {
            libc::munmap(target.cast(), length as usize);
            let mapped = libc::mmap(
                target.cast(),
                length as usize,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if mapped == libc::MAP_FAILED {
                let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                error!("failed mmapping file descriptor {} (errno {})", fd, errno);
                return Err(MemoryError::FileMap { fd, errno }.into());
            }
            if mapped as usize != target as usize {
                error!("unable to map file into required location");
                return Err(MemoryError::RemapMismatch {
                    expected: target as usize,
                    actual: mapped as usize,
                }
                .into());
            }
        }

        Ok(wasm_ptr)
    }

    /// Map a no-access region so stray pointers fault immediately.
    pub(crate) fn create_memory_guard_region(&mut self) -> Result<u32> {
        let pages = self.host.config().guard_region_pages;
        let region_size = (pages * u64::from(WASM_BYTES_PER_PAGE)) as u32;

        let wasm_offset = self.mmap_pages(pages)?;
        let memory = self.default_memory()?;
        self.backend()
            .protect_memory_region(memory, wasm_offset, region_size)
            .map_err(|err| {
                error!("failed to create memory guard: {}", err);
                Error::from(MemoryError::GuardProtect(err.to_string()))
            })?;

        debug!(
            "created guard region {:#x}-{:#x}",
            wasm_offset,
            wasm_offset + region_size
        );
        Ok(wasm_offset)
    }

    /// Native pointer for `len` bytes at `wasm_addr`, bounds-checked against
    /// the current memory size.
    pub(crate) fn native_pointer(&self, wasm_addr: u32, len: usize) -> Result<*mut u8> {
        let memory = self.default_memory()?;
        let size =
            (self.backend().memory_num_pages(memory) * u64::from(WASM_BYTES_PER_PAGE)) as usize;
        let addr = wasm_addr as usize;
        if addr.checked_add(len).map_or(true, |end| end > size) {
            error!(
                "memory access at {:#x}+{} outside linear memory of {} bytes",
                wasm_addr, len, size
            );
            return Err(MemoryError::OutOfBounds {
                addr: wasm_addr,
                len,
                size,
            }
            .into());
        }
        Ok(unsafe { self.backend().memory_base_address(memory).add(addr) })
    }

    pub fn write_memory(&mut self, wasm_addr: u32, bytes: &[u8]) -> Result<()> {
        let ptr = self.native_pointer(wasm_addr, bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    pub fn read_memory(&self, wasm_addr: u32, out: &mut [u8]) -> Result<()> {
        let ptr = self.native_pointer(wasm_addr, out.len())?;
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Write NUL-terminated strings at `buffer` and an array of pointers to
    /// them at `pointers`, the argv/envp convention guest runtimes expect.
    pub fn write_string_array_to_memory(
        &mut self,
        strings: &[String],
        pointers: u32,
        buffer: u32,
    ) -> Result<()> {
        let mut next_buffer = buffer;
        let mut next_pointer = pointers;

        for s in strings {
            self.write_memory(next_buffer, s.as_bytes())?;
            self.write_memory(next_buffer + s.len() as u32, &[0])?;
            self.write_memory(next_pointer, &next_buffer.to_le_bytes())?;

            next_buffer += s.len() as u32 + 1;
            next_pointer += 4;
        }
        Ok(())
    }

    pub fn write_argv_to_memory(&mut self, argv_pointers: u32, argv_buffer: u32) -> Result<()> {
        let argv = self.argv.clone();
        self.write_string_array_to_memory(&argv, argv_pointers, argv_buffer)
    }

    pub fn write_env_to_memory(&mut self, env_pointers: u32, env_buffer: u32) -> Result<()> {
        let vars = self.environment.vars().to_vec();
        self.write_string_array_to_memory(&vars, env_pointers, env_buffer)
    }

    /// Record `fd` as this instance's memory image and write the full linear
    /// memory to it. Clones then map the image instead of copying memory.
    pub fn write_memory_to_fd(&mut self, fd: RawFd) -> Result<()> {
        self.memory_fd = fd;
        debug!(
            "writing memory for {}/{} to fd {}",
            self.bound_user(),
            self.bound_function(),
            fd
        );

        let memory = self.default_memory()?;
        let num_bytes =
            self.backend().memory_num_pages(memory) * u64::from(WASM_BYTES_PER_PAGE);
        let base = self.backend().memory_base_address(memory);
        self.memory_fd_size = num_bytes;

        unsafe {
            if libc::ftruncate(fd, num_bytes as libc::off_t) != 0 {
                error!("ftruncate of memory fd {} failed", fd);
                return Err(io::Error::last_os_error().into());
            }
            let mut written = 0usize;
            while written < num_bytes as usize {
                let n = libc::write(
                    fd,
                    base.add(written).cast(),
                    num_bytes as usize - written,
                );
                if n < 0 {
                    error!("write to memory fd {} failed", fd);
                    return Err(io::Error::last_os_error().into());
                }
                written += n as usize;
            }
        }
        Ok(())
    }

    /// Map the recorded memory image over the memory base, copy-on-write.
    pub(crate) fn map_memory_from_fd(&mut self) -> Result<()> {
        debug!(
            "mapping memory for {}/{} from fd {}",
            self.bound_user(),
            self.bound_function(),
            self.memory_fd
        );

        let memory = self.default_memory()?;
        let base = self.backend().memory_base_address(memory);

        unsafe {
            let mapped = libc::mmap(
                base.cast(),
                self.memory_fd_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                self.memory_fd,
                0,
            );
            if mapped == libc::MAP_FAILED {
                let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                error!("failed mapping memory fd {} (errno {})", self.memory_fd, errno);
                return Err(MemoryError::FileMap {
                    fd: self.memory_fd,
                    errno,
                }
                .into());
            }
        }
        Ok(())
    }
}
