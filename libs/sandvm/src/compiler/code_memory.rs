// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr;

use crate::errors::Error;

/// Executable memory holding the machine code of one module.
///
/// The code is copied into a fresh read/write mapping which is then switched to read/execute,
/// the mapping is never writable and executable at the same time.
#[derive(Debug)]
pub(super) struct CodeMemory {
    ptr: *mut u8,
    len: usize,
}

// Safety: the mapping is immutable after publishing and owned exclusively by this value
unsafe impl Send for CodeMemory {}
// Safety: the mapping is immutable after publishing
unsafe impl Sync for CodeMemory {}

impl CodeMemory {
    /// Maps `text` as executable code.
    pub(super) fn publish(text: &[u8]) -> crate::Result<Self> {
        if text.is_empty() {
            return Ok(Self {
                ptr: ptr::null_mut(),
                len: 0,
            });
        }

        let ptr = sys::map_executable(text)?;
        tracing::trace!(len = text.len(), ?ptr, "published code");
        Ok(Self {
            ptr,
            len: text.len(),
        })
    }

    /// The address of the byte at `offset`.
    pub(super) fn resolve(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.len);
        self.ptr.wrapping_add(offset).cast_const()
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        if self.len > 0 {
            sys::unmap(self.ptr, self.len);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sys {
            use core::ffi::c_void;
            use core::ptr;

            use rustix::mm::{self, MapFlags, MprotectFlags, ProtFlags};

            use super::Error;

            pub(super) fn map_executable(text: &[u8]) -> crate::Result<*mut u8> {
                // Safety: an anonymous private mapping does not alias any existing memory
                let base = unsafe {
                    mm::mmap_anonymous(
                        ptr::null_mut(),
                        text.len(),
                        ProtFlags::READ | ProtFlags::WRITE,
                        MapFlags::PRIVATE,
                    )
                }
                .map_err(|_| Error::MmapFailed)?;

                // Safety: the mapping is at least `text.len()` bytes and writable
                unsafe {
                    ptr::copy_nonoverlapping(text.as_ptr(), base.cast::<u8>(), text.len());
                }

                // Safety: `base` and `text.len()` describe the mapping created above
                if let Err(e) = unsafe {
                    mm::mprotect(base, text.len(), MprotectFlags::READ | MprotectFlags::EXEC)
                } {
                    tracing::error!(%e, "failed to make code executable");
                    unmap(base.cast(), text.len());
                    return Err(Error::MmapFailed);
                }

                Ok(base.cast())
            }

            pub(super) fn unmap(ptr: *mut u8, len: usize) {
                // Safety: callers pass a mapping created by `map_executable`
                if let Err(e) = unsafe { mm::munmap(ptr.cast::<c_void>(), len) } {
                    tracing::error!(%e, "failed to unmap code memory");
                }
            }
        }
    } else {
        mod sys {
            use super::Error;

            pub(super) fn map_executable(_text: &[u8]) -> crate::Result<*mut u8> {
                Err(Error::MmapFailed)
            }

            pub(super) fn unmap(_ptr: *mut u8, _len: usize) {}
        }
    }
}
