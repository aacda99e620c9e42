// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The context compiled code runs against.
//!
//! Every compiled function receives a pointer to a [`VMContext`] and a pointer to a values array.
//! Parameters are read from the array on entry and results are written back to it, each value
//! occupying one 8-byte slot. Functions return a status word: [`STATUS_OK`], [`STATUS_ERROR`]
//! when an error was parked in the [`HostState`], or a trap status built by [`trap_status`].

use core::ffi::c_void;
use core::mem::offset_of;
use core::ptr;

use super::builtins::Builtins;
use crate::errors::Error;
use crate::instance::{Activation, InstanceState};
use crate::trap::Trap;
use crate::values::VMVal;

/// The native signature of every compiled function.
pub(super) type WasmFn = unsafe extern "C" fn(*mut VMContext, *mut VMVal) -> u32;

pub(super) const STATUS_OK: u32 = 0;
pub(super) const STATUS_ERROR: u32 = 1;
const STATUS_TRAP_BASE: u32 = 2;

pub(super) fn trap_status(trap: Trap) -> u32 {
    STATUS_TRAP_BASE + u32::from(u8::from(trap))
}

fn status_trap(status: u32) -> Option<Trap> {
    let code = status.checked_sub(STATUS_TRAP_BASE)?;
    Trap::try_from(u8::try_from(code).ok()?).ok()
}

/// Shared between compiled code and the builtins it calls.
///
/// Compiled code reloads the memory and globals pointers on every access, builtins refresh them
/// with [`VMContext::sync`] whenever they may have moved.
#[repr(C)]
#[derive(Debug)]
pub(super) struct VMContext {
    pub(super) memory_base: *mut u8,
    pub(super) memory_len: u64,
    pub(super) globals: *mut VMVal,
    /// Entry points of the defined functions, by defined function index.
    pub(super) funcs: *const WasmFn,
    pub(super) builtins: *const Builtins,
    pub(super) depth: u32,
    pub(super) max_depth: u32,
    /// Stack slots charged to the current activations, see `Module::frame_slots`.
    pub(super) slots: u32,
    pub(super) max_slots: u32,
    /// Compiled code continues on a new stack segment once the stack pointer drops below this.
    pub(super) stack_limit: usize,
    /// Points to the [`HostState`] of the current invocation.
    pub(super) host: *mut c_void,
}

impl VMContext {
    pub(super) const MEMORY_BASE: i32 = offset_of!(VMContext, memory_base) as i32;
    pub(super) const MEMORY_LEN: i32 = offset_of!(VMContext, memory_len) as i32;
    pub(super) const GLOBALS: i32 = offset_of!(VMContext, globals) as i32;
    pub(super) const FUNCS: i32 = offset_of!(VMContext, funcs) as i32;
    pub(super) const BUILTINS: i32 = offset_of!(VMContext, builtins) as i32;
    pub(super) const DEPTH: i32 = offset_of!(VMContext, depth) as i32;
    pub(super) const MAX_DEPTH: i32 = offset_of!(VMContext, max_depth) as i32;
    pub(super) const SLOTS: i32 = offset_of!(VMContext, slots) as i32;
    pub(super) const MAX_SLOTS: i32 = offset_of!(VMContext, max_slots) as i32;
    pub(super) const STACK_LIMIT: i32 = offset_of!(VMContext, stack_limit) as i32;

    pub(super) fn new(funcs: *const WasmFn, builtins: *const Builtins) -> Self {
        Self {
            memory_base: ptr::null_mut(),
            memory_len: 0,
            globals: ptr::null_mut(),
            funcs,
            builtins,
            depth: 0,
            max_depth: 0,
            slots: 0,
            max_slots: 0,
            stack_limit: 0,
            host: ptr::null_mut(),
        }
    }

    /// Re-derives the memory and globals pointers from the instance state.
    pub(super) fn sync(&mut self, state: &mut InstanceState) {
        match state.memory.as_mut() {
            Some(memory) => {
                let (base, len) = memory.as_raw_parts();
                self.memory_base = base;
                self.memory_len = len as u64;
            }
            None => {
                self.memory_base = ptr::null_mut();
                self.memory_len = 0;
            }
        }
        self.globals = state.globals.as_mut_ptr();
    }
}

/// The Rust side of an invocation, reachable from builtins through [`VMContext::host`].
pub(super) struct HostState<'a, 'b> {
    pub(super) cx: &'a mut Activation<'b>,
    /// The error behind a [`STATUS_ERROR`].
    pub(super) pending: Option<Error>,
}

impl HostState<'_, '_> {
    /// Turns the status compiled code returned into a result.
    pub(super) fn finish(&mut self, status: u32) -> crate::Result<()> {
        if status == STATUS_OK {
            return Ok(());
        }
        if let Some(trap) = status_trap(status) {
            return Err(trap.into());
        }
        Err(self.pending.take().unwrap_or_else(|| {
            Error::Unsupported(alloc::format!("compiled code failed with status {status}"))
        }))
    }
}
