// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stack-pointer calling convention.
//!
//! Some guest toolchains import every host function as `(param i32)` and pass the logical
//! parameters in linear memory instead: parameter `k` lives at `sp + 8 * (k + 1)` and result `j`
//! is written to `sp + 8 * (params + j + 1)`. Each slot is 8 bytes wide, 32-bit values use the
//! low 4 bytes.

use alloc::sync::Arc;

use smallvec::SmallVec;

use crate::func::host::{Caller, HostFunc, IntoFunc};
use crate::memory::LinearMemory;
use crate::trap::Trap;
use crate::types::{FuncType, ValType};
use crate::values::VMVal;

/// Adapts a host function with a native signature to the stack-pointer convention.
#[derive(Debug)]
pub struct StackPointerFunc {
    inner: Arc<HostFunc>,
}

impl StackPointerFunc {
    pub fn new(inner: HostFunc) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Wraps a Rust closure, see [`HostFunc::wrap`].
    pub fn wrap<Params, Results>(func: impl IntoFunc<Params, Results>) -> Self {
        Self::new(HostFunc::wrap(func))
    }

    /// The signature the wrapped function works with, before the adaptation.
    pub fn logical_ty(&self) -> &FuncType {
        self.inner.ty()
    }

    /// The function as guest code imports it, `(param i32)`.
    pub fn into_host_func(self) -> HostFunc {
        let inner = self.inner;
        HostFunc::new(
            FuncType::new([ValType::I32], []),
            move |mut caller: Caller<'_>, values: &mut [VMVal]| {
                let sp = u64::from(values[0].get_u32());
                let ty = inner.ty();
                let params = ty.params().len();

                let mut buf: SmallVec<[VMVal; 8]> =
                    SmallVec::from_elem(VMVal::default(), ty.value_slots());
                {
                    let mem = caller.memory()?;
                    for (k, ty) in ty.params().iter().enumerate() {
                        buf[k] = read_slot(mem, slot_offset(sp, k), *ty)?;
                    }
                }

                inner.call_inner(caller.sub_caller(), &mut buf)?;

                let mem = caller.memory()?;
                for (j, ty) in ty.results().iter().enumerate() {
                    write_slot(mem, slot_offset(sp, params + j), *ty, buf[j])?;
                }
                Ok(())
            },
        )
    }
}

impl From<StackPointerFunc> for HostFunc {
    fn from(func: StackPointerFunc) -> Self {
        func.into_host_func()
    }
}

/// The address of the `index`th slot after the stack pointer.
fn slot_offset(sp: u64, index: usize) -> u64 {
    sp + 8 * (index as u64 + 1)
}

fn read_slot(mem: &LinearMemory, offset: u64, ty: ValType) -> Result<VMVal, Trap> {
    match ty {
        ValType::I32 | ValType::F32 => Ok(VMVal::u32(mem.read_u32_le(offset)?)),
        ValType::I64 | ValType::F64 => Ok(VMVal::u64(mem.read_u64_le(offset)?)),
    }
}

fn write_slot(mem: &mut LinearMemory, offset: u64, ty: ValType, val: VMVal) -> Result<(), Trap> {
    match ty {
        ValType::I32 | ValType::F32 => mem.write_u32_le(offset, val.get_u32()),
        ValType::I64 | ValType::F64 => mem.write_u64_le(offset, val.get_u64()),
    }
}
