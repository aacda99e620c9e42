// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Linear memory.
//!
//! Every guest and host access to linear memory goes through [`LinearMemory`], which checks
//! `offset + len` against the current size before touching the buffer. Out-of-bounds accesses
//! report [`Trap::MemoryOutOfBounds`] and leave the buffer untouched.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::trap::Trap;
use crate::types::MemoryType;
use crate::{WASM_PAGE_SIZE, WASM32_MAX_PAGES};

/// A growable, bounds-checked, byte-addressable memory region.
///
/// Views handed out by [`slice`](Self::slice) and friends borrow the memory, so they can never
/// outlive a [`grow`](Self::grow) that may move the buffer.
pub struct LinearMemory {
    buf: Vec<u8>,
    /// The maximum size in pages, the smaller of the declared maximum and the runtime limit.
    maximum: u32,
}

impl fmt::Debug for LinearMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearMemory")
            .field("pages", &self.size())
            .field("maximum", &self.maximum)
            .finish_non_exhaustive()
    }
}

impl LinearMemory {
    /// Allocates a zeroed memory with the declared minimum size.
    ///
    /// Returns `None` if the minimum exceeds `limit_pages` or the allocation fails.
    pub fn new(ty: MemoryType, limit_pages: u32) -> Option<Self> {
        let limit = limit_pages.min(WASM32_MAX_PAGES);
        let maximum = ty.maximum.map_or(limit, |max| max.min(limit));
        if ty.minimum > maximum {
            return None;
        }

        let mut buf = Vec::new();
        let len = pages_to_bytes(ty.minimum);
        buf.try_reserve_exact(len).ok()?;
        buf.resize(len, 0);

        Some(Self { buf, maximum })
    }

    /// The current size in pages.
    pub fn size(&self) -> u32 {
        // the buffer length is always a whole number of pages, at most 2^16 of them
        u32::try_from(self.buf.len() / WASM_PAGE_SIZE).unwrap_or(u32::MAX)
    }

    /// The current size in bytes.
    pub fn byte_size(&self) -> usize {
        self.buf.len()
    }

    /// The maximum size in pages this memory may grow to.
    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// Grows the memory by `delta` pages, returning the previous size in pages.
    ///
    /// Returns `None` without changing anything if the new size would exceed the maximum or the
    /// allocation fails. Memory never shrinks.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.size();
        if delta == 0 {
            return Some(old);
        }

        let new = old.checked_add(delta)?;
        if new > self.maximum {
            tracing::trace!(old, delta, maximum = self.maximum, "memory.grow failed");
            return None;
        }

        let new_len = pages_to_bytes(new);
        self.buf
            .try_reserve_exact(new_len - self.buf.len())
            .ok()?;
        self.buf.resize(new_len, 0);

        tracing::trace!(old, new, "memory.grow");
        Some(old)
    }

    /// Returns the byte range `offset..offset + len` if it lies entirely within the memory.
    #[inline]
    pub fn checked_range(&self, offset: u64, len: usize) -> Result<Range<usize>, Trap> {
        let start = usize::try_from(offset).map_err(|_| Trap::MemoryOutOfBounds)?;
        let end = start.checked_add(len).ok_or(Trap::MemoryOutOfBounds)?;
        if end > self.buf.len() {
            return Err(Trap::MemoryOutOfBounds);
        }
        Ok(start..end)
    }

    /// Returns whether `offset..offset + len` lies entirely within the memory.
    pub fn is_valid_range(&self, offset: u64, len: usize) -> bool {
        self.checked_range(offset, len).is_ok()
    }

    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8], Trap> {
        let range = self.checked_range(offset, len)?;
        Ok(&self.buf[range])
    }

    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8], Trap> {
        let range = self.checked_range(offset, len)?;
        Ok(&mut self.buf[range])
    }

    /// Copies `len` bytes starting at `offset` out of the memory.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, Trap> {
        self.slice(offset, len).map(<[u8]>::to_vec)
    }

    /// Copies `bytes` into the memory at `offset`.
    ///
    /// Either all bytes are written or, if any would land out of bounds, none are.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Trap> {
        self.slice_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    #[inline]
    fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N], Trap> {
        let range = self.checked_range(offset, N)?;
        let mut out = [0; N];
        out.copy_from_slice(&self.buf[range]);
        Ok(out)
    }

    #[inline]
    pub fn read_u8(&self, offset: u64) -> Result<u8, Trap> {
        self.read_array::<1>(offset).map(u8::from_le_bytes)
    }
    #[inline]
    pub fn read_u16_le(&self, offset: u64) -> Result<u16, Trap> {
        self.read_array(offset).map(u16::from_le_bytes)
    }
    #[inline]
    pub fn read_u32_le(&self, offset: u64) -> Result<u32, Trap> {
        self.read_array(offset).map(u32::from_le_bytes)
    }
    #[inline]
    pub fn read_u64_le(&self, offset: u64) -> Result<u64, Trap> {
        self.read_array(offset).map(u64::from_le_bytes)
    }

    #[inline]
    pub fn write_u8(&mut self, offset: u64, val: u8) -> Result<(), Trap> {
        self.write(offset, &[val])
    }
    #[inline]
    pub fn write_u16_le(&mut self, offset: u64, val: u16) -> Result<(), Trap> {
        self.write(offset, &val.to_le_bytes())
    }
    #[inline]
    pub fn write_u32_le(&mut self, offset: u64, val: u32) -> Result<(), Trap> {
        self.write(offset, &val.to_le_bytes())
    }
    #[inline]
    pub fn write_u64_le(&mut self, offset: u64, val: u64) -> Result<(), Trap> {
        self.write(offset, &val.to_le_bytes())
    }

    /// Sets `len` bytes starting at `offset` to `val`, the semantics of `memory.fill`.
    pub fn fill(&mut self, offset: u64, val: u8, len: usize) -> Result<(), Trap> {
        self.slice_mut(offset, len)?.fill(val);
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`, the ranges may overlap. The semantics of
    /// `memory.copy`.
    pub fn copy_within(&mut self, dst: u64, src: u64, len: usize) -> Result<(), Trap> {
        let src = self.checked_range(src, len)?;
        let dst = self.checked_range(dst, len)?;
        self.buf.copy_within(src, dst.start);
        Ok(())
    }

    /// Raw base pointer and length for compiled code.
    ///
    /// The pointer is only valid until the next call to [`grow`](Self::grow).
    pub(crate) fn as_raw_parts(&mut self) -> (*mut u8, usize) {
        (self.buf.as_mut_ptr(), self.buf.len())
    }
}

fn pages_to_bytes(pages: u32) -> usize {
    usize::try_from(pages).unwrap_or(usize::MAX) * WASM_PAGE_SIZE
}
