// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;

use smallvec::{SmallVec, smallvec};

use super::InterpretedCode;
use super::lower::{Branch, Instr};
use super::num;
use crate::indices::{DefinedFuncIndex, FuncIndex};
use crate::instance::Activation;
use crate::trap::Trap;
use crate::translate::LoadKind;
use crate::translate::StoreKind;
use crate::values::VMVal;

#[derive(Debug, Clone, Copy)]
struct Frame {
    func: DefinedFuncIndex,
    pc: usize,
    /// Index of the first parameter on the value stack.
    base: usize,
}

/// Runs `entry` to completion. `values` holds the parameters on entry and the results on return.
///
/// On error the activation's call depth is left as is, the caller restores it.
pub(super) fn execute(
    code: &InterpretedCode,
    cx: &mut Activation<'_>,
    entry: DefinedFuncIndex,
    values: &mut [VMVal],
) -> crate::Result<()> {
    let func = &code.funcs[entry];

    let mut stack = Vec::with_capacity(64);
    stack.extend_from_slice(&values[..func.num_params as usize]);

    run(code, cx, &mut stack, entry, values)
}

#[inline]
fn pop(stack: &mut Vec<VMVal>) -> VMVal {
    // Validation guarantees the stack never underflows.
    stack.pop().unwrap_or_default()
}

fn enter(
    code: &InterpretedCode,
    cx: &mut Activation<'_>,
    stack: &mut Vec<VMVal>,
    func: DefinedFuncIndex,
) -> Result<Frame, Trap> {
    let f = &code.funcs[func];
    cx.enter_frame(f.frame_slots)?;
    let base = stack.len() - f.num_params as usize;
    stack.resize(stack.len() + f.num_locals as usize, VMVal::default());
    Ok(Frame { func, pc: 0, base })
}

fn branch(stack: &mut Vec<VMVal>, branch: Branch) -> usize {
    if branch.drop > 0 {
        let len = stack.len();
        let keep = branch.keep as usize;
        let dest = len - keep - branch.drop as usize;
        stack.copy_within(len - keep..len, dest);
        stack.truncate(dest + keep);
    }
    branch.target as usize
}

fn call_import(
    code: &InterpretedCode,
    cx: &mut Activation<'_>,
    stack: &mut Vec<VMVal>,
    func: FuncIndex,
) -> crate::Result<()> {
    let ty = code.module.func_type(func);
    let (params, results) = (ty.params().len(), ty.results().len());

    let mut buf: SmallVec<[VMVal; 8]> = smallvec![VMVal::default(); params.max(results)];
    let split = stack.len() - params;
    buf[..params].copy_from_slice(&stack[split..]);
    stack.truncate(split);

    cx.call_import(func, &mut buf)?;
    stack.extend_from_slice(&buf[..results]);
    Ok(())
}

fn run(
    code: &InterpretedCode,
    cx: &mut Activation<'_>,
    stack: &mut Vec<VMVal>,
    entry: DefinedFuncIndex,
    values: &mut [VMVal],
) -> crate::Result<()> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut frame = enter(code, cx, stack, entry)?;
    let mut func = &code.funcs[frame.func];

    loop {
        let instr = &func.code[frame.pc];
        frame.pc += 1;

        match instr {
            Instr::Unreachable => return Err(Trap::UnreachableCodeReached.into()),
            Instr::Br(br) => frame.pc = branch(stack, *br),
            Instr::BrIf(br) => {
                if pop(stack).get_i32() != 0 {
                    frame.pc = branch(stack, *br);
                }
            }
            Instr::BrIfEqz(target) => {
                if pop(stack).get_i32() == 0 {
                    frame.pc = *target as usize;
                }
            }
            Instr::BrTable { start, len } => {
                let index = pop(stack).get_u32().min(len - 1);
                let br = func.br_tables[(start + index) as usize];
                frame.pc = branch(stack, br);
            }
            Instr::Return => {
                let results = func.num_results as usize;
                let len = stack.len();
                stack.copy_within(len - results..len, frame.base);
                stack.truncate(frame.base + results);
                cx.leave_frame(func.frame_slots);

                match frames.pop() {
                    Some(caller) => {
                        frame = caller;
                        func = &code.funcs[frame.func];
                    }
                    None => {
                        values[..results].copy_from_slice(stack);
                        return Ok(());
                    }
                }
            }
            Instr::Call(callee) => match code.module.defined_func_index(*callee) {
                Some(callee) => {
                    frames.push(frame);
                    frame = enter(code, cx, stack, callee)?;
                    func = &code.funcs[callee];
                }
                None => call_import(code, cx, stack, *callee)?,
            },
            Instr::CallIndirect(ty) => {
                let index = pop(stack).get_u32();
                let callee = cx.resolve_indirect(index, *ty)?;
                match code.module.defined_func_index(callee) {
                    Some(callee) => {
                        frames.push(frame);
                        frame = enter(code, cx, stack, callee)?;
                        func = &code.funcs[callee];
                    }
                    None => call_import(code, cx, stack, callee)?,
                }
            }
            Instr::Drop => {
                pop(stack);
            }
            Instr::Select => {
                let cond = pop(stack).get_i32();
                let b = pop(stack);
                let a = pop(stack);
                stack.push(if cond != 0 { a } else { b });
            }
            Instr::LocalGet(idx) => {
                let val = stack[frame.base + *idx as usize];
                stack.push(val);
            }
            Instr::LocalSet(idx) => {
                let val = pop(stack);
                stack[frame.base + *idx as usize] = val;
            }
            Instr::LocalTee(idx) => {
                let val = stack[stack.len() - 1];
                stack[frame.base + *idx as usize] = val;
            }
            Instr::GlobalGet(idx) => stack.push(cx.global(*idx)),
            Instr::GlobalSet(idx) => {
                let val = pop(stack);
                cx.set_global(*idx, val);
            }
            Instr::Load { kind, offset } => {
                let addr = u64::from(pop(stack).get_u32()) + offset;
                let mem = cx.memory()?;
                let val = match kind {
                    LoadKind::I32 | LoadKind::F32 => VMVal::u32(mem.read_u32_le(addr)?),
                    LoadKind::I64 | LoadKind::F64 => VMVal::u64(mem.read_u64_le(addr)?),
                    LoadKind::I32_8S => VMVal::i32(i32::from(mem.read_u8(addr)? as i8)),
                    LoadKind::I32_8U => VMVal::u32(u32::from(mem.read_u8(addr)?)),
                    LoadKind::I32_16S => VMVal::i32(i32::from(mem.read_u16_le(addr)? as i16)),
                    LoadKind::I32_16U => VMVal::u32(u32::from(mem.read_u16_le(addr)?)),
                    LoadKind::I64_8S => VMVal::i64(i64::from(mem.read_u8(addr)? as i8)),
                    LoadKind::I64_8U => VMVal::u64(u64::from(mem.read_u8(addr)?)),
                    LoadKind::I64_16S => VMVal::i64(i64::from(mem.read_u16_le(addr)? as i16)),
                    LoadKind::I64_16U => VMVal::u64(u64::from(mem.read_u16_le(addr)?)),
                    LoadKind::I64_32S => VMVal::i64(i64::from(mem.read_u32_le(addr)? as i32)),
                    LoadKind::I64_32U => VMVal::u64(u64::from(mem.read_u32_le(addr)?)),
                };
                stack.push(val);
            }
            Instr::Store { kind, offset } => {
                let val = pop(stack);
                let addr = u64::from(pop(stack).get_u32()) + offset;
                let mem = cx.memory()?;
                match kind {
                    StoreKind::I32 | StoreKind::F32 | StoreKind::I64_32 => {
                        mem.write_u32_le(addr, val.get_u32())?;
                    }
                    StoreKind::I64 | StoreKind::F64 => mem.write_u64_le(addr, val.get_u64())?,
                    StoreKind::I32_8 | StoreKind::I64_8 => mem.write_u8(addr, val.get_u32() as u8)?,
                    StoreKind::I32_16 | StoreKind::I64_16 => {
                        mem.write_u16_le(addr, val.get_u32() as u16)?;
                    }
                }
            }
            Instr::MemorySize => stack.push(VMVal::u32(cx.memory_size())),
            Instr::MemoryGrow => {
                let delta = pop(stack).get_u32();
                stack.push(VMVal::i32(cx.memory_grow(delta)));
            }
            Instr::MemoryCopy => {
                let len = pop(stack).get_u32();
                let src = pop(stack).get_u32();
                let dst = pop(stack).get_u32();
                cx.memory_copy(dst, src, len)?;
            }
            Instr::MemoryFill => {
                let len = pop(stack).get_u32();
                let val = pop(stack).get_u32() as u8;
                let dst = pop(stack).get_u32();
                cx.memory_fill(dst, val, len)?;
            }
            Instr::MemoryInit(data) => {
                let len = pop(stack).get_u32();
                let src = pop(stack).get_u32();
                let dst = pop(stack).get_u32();
                cx.memory_init(*data, dst, src, len)?;
            }
            Instr::DataDrop(data) => cx.data_drop(*data),
            Instr::TableInit(elem) => {
                let len = pop(stack).get_u32();
                let src = pop(stack).get_u32();
                let dst = pop(stack).get_u32();
                cx.table_init(*elem, dst, src, len)?;
            }
            Instr::ElemDrop(elem) => cx.elem_drop(*elem),
            Instr::TableCopy => {
                let len = pop(stack).get_u32();
                let src = pop(stack).get_u32();
                let dst = pop(stack).get_u32();
                cx.table_copy(dst, src, len)?;
            }
            Instr::Const(bits) => stack.push(VMVal::u64(*bits)),
            Instr::I32Eqz => {
                let a = pop(stack).get_i32();
                stack.push(VMVal::i32(i32::from(a == 0)));
            }
            Instr::I64Eqz => {
                let a = pop(stack).get_i64();
                stack.push(VMVal::i32(i32::from(a == 0)));
            }
            Instr::I32Bin(op) => {
                let b = pop(stack).get_i32();
                let a = pop(stack).get_i32();
                stack.push(VMVal::i32(num::i32_bin(*op, a, b)?));
            }
            Instr::I64Bin(op) => {
                let b = pop(stack).get_i64();
                let a = pop(stack).get_i64();
                stack.push(VMVal::i64(num::i64_bin(*op, a, b)?));
            }
            Instr::I32Un(op) => {
                let a = pop(stack).get_i32();
                stack.push(VMVal::i32(num::i32_un(*op, a)));
            }
            Instr::I64Un(op) => {
                let a = pop(stack).get_i64();
                stack.push(VMVal::i64(num::i64_un(*op, a)));
            }
            Instr::I32Cmp(op) => {
                let b = pop(stack).get_i32();
                let a = pop(stack).get_i32();
                stack.push(VMVal::i32(i32::from(num::i32_cmp(*op, a, b))));
            }
            Instr::I64Cmp(op) => {
                let b = pop(stack).get_i64();
                let a = pop(stack).get_i64();
                stack.push(VMVal::i32(i32::from(num::i64_cmp(*op, a, b))));
            }
            Instr::F32Bin(op) => {
                let b = pop(stack).get_f32();
                let a = pop(stack).get_f32();
                stack.push(VMVal::f32(num::f32_bin(*op, a, b)));
            }
            Instr::F64Bin(op) => {
                let b = pop(stack).get_f64();
                let a = pop(stack).get_f64();
                stack.push(VMVal::f64(num::f64_bin(*op, a, b)));
            }
            Instr::F32Un(op) => {
                let a = pop(stack).get_f32();
                stack.push(VMVal::f32(num::f32_un(*op, a)));
            }
            Instr::F64Un(op) => {
                let a = pop(stack).get_f64();
                stack.push(VMVal::f64(num::f64_un(*op, a)));
            }
            Instr::F32Cmp(op) => {
                let b = pop(stack).get_f32();
                let a = pop(stack).get_f32();
                stack.push(VMVal::i32(i32::from(num::f32_cmp(*op, a, b))));
            }
            Instr::F64Cmp(op) => {
                let b = pop(stack).get_f64();
                let a = pop(stack).get_f64();
                stack.push(VMVal::i32(i32::from(num::f64_cmp(*op, a, b))));
            }
            Instr::Convert(op) => {
                let a = pop(stack);
                stack.push(num::convert(*op, a)?);
            }
        }
    }
}
