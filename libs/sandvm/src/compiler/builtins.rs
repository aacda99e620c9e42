// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime functions compiled code calls for everything it does not inline.
//!
//! They are reached through a table of function pointers in the [`VMContext`], so the generated
//! machine code never needs relocations.

use alloc::vec;
use core::mem::{self, offset_of};
use core::slice;
use std::panic::{self, AssertUnwindSafe};

use cranelift_codegen::ir::{AbiParam, Signature, types};
use cranelift_codegen::isa::CallConv;
use cranelift_entity::EntityRef;

use super::stack;
use super::vmcontext::{HostState, STATUS_ERROR, STATUS_OK, VMContext, WasmFn, trap_status};
use crate::errors::Error;
use crate::indices::{DataIndex, ElemIndex, FuncIndex, TypeIndex};
use crate::instance::Activation;
use crate::trap::Trap;
use crate::values::VMVal;

macro_rules! foreach_builtin {
    ($mac:ident) => {
        $mac! {
            memory_grow(vmctx: ptr, delta: i32) -> i32;
            memory_copy(vmctx: ptr, dst: i32, src: i32, len: i32) -> i32;
            memory_fill(vmctx: ptr, dst: i32, val: i32, len: i32) -> i32;
            memory_init(vmctx: ptr, data: i32, dst: i32, src: i32, len: i32) -> i32;
            data_drop(vmctx: ptr, data: i32) -> i32;
            table_init(vmctx: ptr, elem: i32, dst: i32, src: i32, len: i32) -> i32;
            elem_drop(vmctx: ptr, elem: i32) -> i32;
            table_copy(vmctx: ptr, dst: i32, src: i32, len: i32) -> i32;
            call_import(vmctx: ptr, func: i32, values: ptr) -> i32;
            call_indirect(vmctx: ptr, index: i32, ty: i32, values: ptr) -> i32;
            grow_stack(vmctx: ptr, values: ptr, func: i32) -> i32;
        }
    };
}

macro_rules! rust_ty {
    (ptr) => { *mut VMContext };
    (i32) => { u32 };
    (i64) => { u64 };
}

macro_rules! declare_builtins {
    ($($name:ident($($pname:ident: $param:ident),*) -> $result:ident;)*) => {
        /// The builtin function table, laid out the way compiled code indexes it.
        #[repr(C)]
        #[allow(dead_code, reason = "fields are only read by compiled code")]
        pub(super) struct Builtins {
            $(pub(super) $name: unsafe extern "C" fn($(declare_builtins!(@param $pname $param)),*) -> rust_ty!($result),)*
        }

        /// Names a builtin on the compiling side.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types, reason = "variants are named after the builtin functions")]
        pub(super) enum Builtin {
            $($name,)*
        }

        impl Builtin {
            /// The byte offset of the builtin's entry in [`Builtins`].
            pub(super) fn offset(self) -> i32 {
                match self {
                    $(Self::$name => offset_of!(Builtins, $name) as i32,)*
                }
            }

            pub(super) fn signature(self, call_conv: CallConv) -> Signature {
                match self {
                    $(Self::$name => Signature {
                        params: vec![$(abi_param!($param)),*],
                        returns: vec![abi_param!($result)],
                        call_conv,
                    },)*
                }
            }
        }

        pub(super) static BUILTINS: Builtins = Builtins {
            $($name,)*
        };
    };
    (@param vmctx ptr) => { *mut VMContext };
    (@param values ptr) => { *mut VMVal };
    (@param $pname:ident $param:ident) => { rust_ty!($param) };
}

macro_rules! abi_param {
    (ptr) => {
        AbiParam::new(types::I64)
    };
    (i32) => {
        AbiParam::new(types::I32)
    };
    (i64) => {
        AbiParam::new(types::I64)
    };
}

foreach_builtin!(declare_builtins);

/// Runs `f` against the activation behind `vmctx`.
///
/// A failure or panic is parked in the host state and reported as [`STATUS_ERROR`]. The memory
/// and globals pointers of `vmctx` are refreshed afterwards.
///
/// # Safety
///
/// `vmctx` must be the context of the current invocation and no other reference to its host
/// state may be live.
unsafe fn run(
    vmctx: *mut VMContext,
    f: impl FnOnce(&mut Activation<'_>) -> crate::Result<()>,
) -> u32 {
    // Safety: ensured by the caller
    let host = unsafe { &mut *(*vmctx).host.cast::<HostState<'_, '_>>() };
    // Safety: ensured by the caller
    unsafe {
        host.cx.set_depth((*vmctx).depth);
        host.cx.set_slots((*vmctx).slots);
    }

    let status = match panic::catch_unwind(AssertUnwindSafe(|| f(host.cx))) {
        Ok(Ok(())) => STATUS_OK,
        Ok(Err(e)) => {
            host.pending = Some(e);
            STATUS_ERROR
        }
        Err(_) => {
            host.pending = Some(Error::Unsupported("runtime builtin panicked".into()));
            STATUS_ERROR
        }
    };

    // Safety: ensured by the caller
    unsafe { (*vmctx).sync(host.cx.state) };
    status
}

unsafe extern "C" fn memory_grow(vmctx: *mut VMContext, delta: u32) -> u32 {
    let mut old = -1;
    // Safety: called by compiled code with its own context
    let status = unsafe {
        run(vmctx, |cx| {
            old = cx.memory_grow(delta);
            Ok(())
        })
    };
    if status == STATUS_OK { old as u32 } else { u32::MAX }
}

unsafe extern "C" fn memory_copy(vmctx: *mut VMContext, dst: u32, src: u32, len: u32) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe { run(vmctx, |cx| Ok(cx.memory_copy(dst, src, len)?)) }
}

unsafe extern "C" fn memory_fill(vmctx: *mut VMContext, dst: u32, val: u32, len: u32) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe { run(vmctx, |cx| Ok(cx.memory_fill(dst, val as u8, len)?)) }
}

unsafe extern "C" fn memory_init(
    vmctx: *mut VMContext,
    data: u32,
    dst: u32,
    src: u32,
    len: u32,
) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe {
        run(vmctx, |cx| {
            Ok(cx.memory_init(DataIndex::from_u32(data), dst, src, len)?)
        })
    }
}

unsafe extern "C" fn data_drop(vmctx: *mut VMContext, data: u32) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe {
        run(vmctx, |cx| {
            cx.data_drop(DataIndex::from_u32(data));
            Ok(())
        })
    }
}

unsafe extern "C" fn table_init(
    vmctx: *mut VMContext,
    elem: u32,
    dst: u32,
    src: u32,
    len: u32,
) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe {
        run(vmctx, |cx| {
            Ok(cx.table_init(ElemIndex::from_u32(elem), dst, src, len)?)
        })
    }
}

unsafe extern "C" fn elem_drop(vmctx: *mut VMContext, elem: u32) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe {
        run(vmctx, |cx| {
            cx.elem_drop(ElemIndex::from_u32(elem));
            Ok(())
        })
    }
}

unsafe extern "C" fn table_copy(vmctx: *mut VMContext, dst: u32, src: u32, len: u32) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe { run(vmctx, |cx| Ok(cx.table_copy(dst, src, len)?)) }
}

/// Calls an imported function, `values` is sized for its signature.
unsafe extern "C" fn call_import(vmctx: *mut VMContext, func: u32, values: *mut VMVal) -> u32 {
    // Safety: called by compiled code with its own context
    unsafe {
        run(vmctx, |cx| {
            let func = FuncIndex::from_u32(func);
            let len = cx.module().func_type(func).value_slots();
            // Safety: compiled code sizes the values array for the callee's signature
            let values = slice::from_raw_parts_mut(values, len);
            cx.call_import(func, values)
        })
    }
}

/// Resolves and calls a table entry. Defined functions are entered directly with the same
/// context, imports go through the activation.
unsafe extern "C" fn call_indirect(
    vmctx: *mut VMContext,
    index: u32,
    ty: u32,
    values: *mut VMVal,
) -> u32 {
    let mut target = None;
    // Safety: called by compiled code with its own context
    let status = unsafe {
        run(vmctx, |cx| {
            let func = cx.resolve_indirect(index, TypeIndex::from_u32(ty))?;
            match cx.module().defined_func_index(func) {
                Some(defined) => {
                    target = Some(defined);
                    Ok(())
                }
                None => {
                    let len = cx.module().func_type(func).value_slots();
                    // Safety: compiled code sizes the values array for the expected signature,
                    // which the resolved function matches
                    let values = slice::from_raw_parts_mut(values, len);
                    cx.call_import(func, values)
                }
            }
        })
    };

    match target {
        Some(defined) if status == STATUS_OK => {
            // Safety: `funcs` holds one entry per defined function and no reference into the
            // host state is live anymore
            unsafe {
                let entry: WasmFn = *(*vmctx).funcs.add(defined.index());
                entry(vmctx, values)
            }
        }
        _ => status,
    }
}

/// Runs a defined function on a new stack segment, called from its prologue once the current
/// segment is used up. The function starts over there, the frame that called this only passes
/// the status on.
unsafe extern "C" fn grow_stack(vmctx: *mut VMContext, values: *mut VMVal, func: u32) -> u32 {
    // Safety: called by compiled code with its own context, `funcs` holds one entry per
    // defined function
    let entry: WasmFn = unsafe { *(*vmctx).funcs.add(func as usize) };
    tracing::trace!(func, "continuing on a new stack segment");

    stack::on_new_segment(|limit| {
        // Safety: `vmctx` and `values` belong to the calling frame which waits for this call,
        // `entry` has the `wasm_signature`
        unsafe {
            let outer = mem::replace(&mut (*vmctx).stack_limit, limit);
            let status = entry(vmctx, values);
            (*vmctx).stack_limit = outer;
            status
        }
    })
    .unwrap_or_else(|| trap_status(Trap::StackOverflow))
}
