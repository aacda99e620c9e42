// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Translation of validated function bodies into Cranelift IR.
//!
//! Every fault the interpreter detects is checked explicitly before the instruction that could
//! cause it, and reported by returning a trap status from the function. Nothing in the
//! generated code relies on hardware traps or signal handlers.

use alloc::vec::Vec;
use core::slice;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift_codegen::ir::types::{F32, F64, I8, I16, I32, I64};
use cranelift_codegen::ir::{
    self, InstBuilder, JumpTableData, MemFlags, StackSlotData, StackSlotKind,
};
use cranelift_codegen::isa::CallConv;
use cranelift_entity::EntityRef;
use cranelift_entity::packed_option::ReservedValue;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use super::builtins::Builtin;
use super::state::{ControlFrame, ElseData, State, malformed};
use super::vmcontext::{STATUS_OK, VMContext, trap_status};
use super::wasm_signature;
use crate::errors::Error;
use crate::indices::{DefinedFuncIndex, FuncIndex, GlobalIndex};
use crate::interpreter::num::{F32_CANONICAL_NAN, F64_CANONICAL_NAN};
use crate::module::Module;
use crate::translate::{
    BlockType, ConvOp, FBinOp, FCmp, FUnOp, IBinOp, ICmp, IUnOp, LoadKind, Op, StoreKind,
};
use crate::trap::Trap;
use crate::types::{FuncType, ValType};
use crate::wasm_unsupported;

pub(super) struct FuncTranslator {
    func_ctx: FunctionBuilderContext,
    state: State,
}

impl FuncTranslator {
    pub(super) fn new() -> Self {
        Self {
            func_ctx: FunctionBuilderContext::new(),
            state: State::new(),
        }
    }

    /// Translates the body of `index` into `func`, which must be empty and have the
    /// [`wasm_signature`].
    pub(super) fn translate(
        &mut self,
        module: &Module,
        call_conv: CallConv,
        index: DefinedFuncIndex,
        func: &mut ir::Function,
    ) -> crate::Result<()> {
        let func_index = module.func_index(index);
        self.translate_body(module, call_conv, func_index, index, func)
            .map_err(|e| match e {
                Error::Cranelift { func_name, message } if func_name.is_empty() => {
                    Error::Cranelift {
                        func_name: module.func_name(func_index).into_owned(),
                        message,
                    }
                }
                e => e,
            })
    }

    fn translate_body(
        &mut self,
        module: &Module,
        call_conv: CallConv,
        func_index: FuncIndex,
        index: DefinedFuncIndex,
        func: &mut ir::Function,
    ) -> crate::Result<()> {
        let ty = module.func_type(func_index);
        let body = &module.bodies[index];
        tracing::trace!(
            func = %module.func_name(func_index),
            ops = body.ops.len(),
            "translating function"
        );
        debug_assert_eq!(func.dfg.num_blocks(), 0, "Function must be empty");

        let mut builder = FunctionBuilder::new(func, &mut self.func_ctx);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);
        builder.ensure_inserted_block();

        let (vmctx, values) = {
            let params = builder.block_params(entry_block);
            (params[0], params[1])
        };

        // Every trap leaves through this block, its parameter is the status to return.
        let trap_block = builder.create_block();
        builder.append_block_param(trap_block, I32);
        builder.set_cold_block(trap_block);

        let mut env = FuncEnv {
            module,
            call_conv,
            vmctx,
            values,
            trap_block,
            wasm_sig: None,
            builtin_sigs: HashMap::new(),
        };

        env.prologue(&mut builder, index, ty, &body.locals)?;

        let exit_block = block_with_params(&mut builder, ty.results());
        self.state.initialize(exit_block, ty.results().len());

        for op in &body.ops {
            translate_operator(op, &mut builder, &mut self.state, &mut env)?;
        }

        // The final `end` left us in the exit block, unless the end of the function cannot be
        // reached at all.
        if self.state.reachable && !builder.is_unreachable() {
            env.epilogue(&mut builder, index, &self.state.stack)?;
        }
        self.state.stack.clear();
        self.state.control_stack.clear();

        builder.switch_to_block(trap_block);
        builder.seal_block(trap_block);
        let status = builder.block_params(trap_block)[0];
        builder.ins().return_(&[status]);

        builder.finalize();
        tracing::trace!("translated to CLIF:\n{}", func.display());
        Ok(())
    }
}

/// What the translation of one function needs to know besides the operand stacks.
struct FuncEnv<'a> {
    module: &'a Module,
    call_conv: CallConv,
    vmctx: ir::Value,
    values: ir::Value,
    trap_block: ir::Block,
    wasm_sig: Option<ir::SigRef>,
    builtin_sigs: HashMap<Builtin, ir::SigRef>,
}

impl FuncEnv<'_> {
    /// Moves to a new stack segment if this one is used up, charges the activation against
    /// the call depth and the stack slot budget, then moves the parameters out of the values
    /// array into variables and zeroes the locals.
    fn prologue(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        index: DefinedFuncIndex,
        ty: &FuncType,
        locals: &[ValType],
    ) -> crate::Result<()> {
        let flags = MemFlags::trusted();

        let sp = builder.ins().get_stack_pointer(I64);
        let limit = builder
            .ins()
            .load(I64, flags, self.vmctx, VMContext::STACK_LIMIT);
        let below_limit = builder.ins().icmp(IntCC::UnsignedLessThan, sp, limit);
        let grow_block = builder.create_block();
        let continuation = builder.create_block();
        builder.set_cold_block(grow_block);
        builder
            .ins()
            .brif(below_limit, grow_block, &[], continuation, &[]);

        // The whole call runs on the new segment, this frame only returns its status.
        builder.switch_to_block(grow_block);
        builder.seal_block(grow_block);
        let func = builder.ins().iconst(I32, i64::from(index.as_u32()));
        let args = [self.vmctx, self.values, func];
        let status = self.call_builtin(builder, Builtin::grow_stack, &args);
        builder.ins().return_(&[status]);

        builder.switch_to_block(continuation);
        builder.seal_block(continuation);

        let depth = builder.ins().load(I32, flags, self.vmctx, VMContext::DEPTH);
        let max_depth = builder
            .ins()
            .load(I32, flags, self.vmctx, VMContext::MAX_DEPTH);
        let exhausted = builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, depth, max_depth);
        self.trap_if(builder, exhausted, Trap::StackOverflow);

        let frame_slots = self.frame_slots(index);
        let slots = builder.ins().load(I32, flags, self.vmctx, VMContext::SLOTS);
        let max_slots = builder
            .ins()
            .load(I32, flags, self.vmctx, VMContext::MAX_SLOTS);
        let wide_slots = builder.ins().uextend(I64, slots);
        let charged = builder.ins().iadd_imm(wide_slots, i64::from(frame_slots));
        let wide_max = builder.ins().uextend(I64, max_slots);
        let exhausted = builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThan, charged, wide_max);
        self.trap_if(builder, exhausted, Trap::StackOverflow);

        let depth = builder.ins().iadd_imm(depth, 1);
        builder.ins().store(flags, depth, self.vmctx, VMContext::DEPTH);
        let slots = builder.ins().ireduce(I32, charged);
        builder.ins().store(flags, slots, self.vmctx, VMContext::SLOTS);

        for (i, ty) in ty.params().iter().enumerate() {
            let var = Variable::new(i);
            builder.declare_var(var, ir_type(*ty));
            let val = builder
                .ins()
                .load(ir_type(*ty), flags, self.values, slot_offset(i)?);
            builder.def_var(var, val);
        }

        let num_params = ty.params().len();
        for (i, ty) in locals.iter().enumerate() {
            let var = Variable::new(num_params + i);
            builder.declare_var(var, ir_type(*ty));
            let zero = zero(builder, *ty);
            builder.def_var(var, zero);
        }

        Ok(())
    }

    /// Leaves the frame and writes `results` back into the values array.
    fn epilogue(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        index: DefinedFuncIndex,
        results: &[ir::Value],
    ) -> crate::Result<()> {
        let flags = MemFlags::trusted();

        let depth = builder.ins().load(I32, flags, self.vmctx, VMContext::DEPTH);
        let one = builder.ins().iconst(I32, 1);
        let depth = builder.ins().isub(depth, one);
        builder.ins().store(flags, depth, self.vmctx, VMContext::DEPTH);

        let frame_slots = builder.ins().iconst(I32, i64::from(self.frame_slots(index)));
        let slots = builder.ins().load(I32, flags, self.vmctx, VMContext::SLOTS);
        let slots = builder.ins().isub(slots, frame_slots);
        builder.ins().store(flags, slots, self.vmctx, VMContext::SLOTS);

        for (j, val) in results.iter().enumerate() {
            let raw = to_slot(builder, *val);
            builder.ins().store(flags, raw, self.values, slot_offset(j)?);
        }

        let ok = builder.ins().iconst(I32, i64::from(STATUS_OK));
        builder.ins().return_(&[ok]);
        Ok(())
    }

    fn frame_slots(&self, index: DefinedFuncIndex) -> u32 {
        self.module.frame_slots(index)
    }

    fn trap(&self, builder: &mut FunctionBuilder<'_>, trap: Trap) {
        let status = builder.ins().iconst(I32, i64::from(trap_status(trap)));
        builder.ins().jump(self.trap_block, &[status]);
    }

    /// Leaves with `trap` if `cond` is nonzero.
    fn trap_if(&self, builder: &mut FunctionBuilder<'_>, cond: ir::Value, trap: Trap) {
        let status = builder.ins().iconst(I32, i64::from(trap_status(trap)));
        let continuation = builder.create_block();
        builder
            .ins()
            .brif(cond, self.trap_block, &[status], continuation, &[]);
        builder.seal_block(continuation);
        builder.switch_to_block(continuation);
    }

    /// Leaves with `status` if it is anything but [`STATUS_OK`].
    fn check_status(&self, builder: &mut FunctionBuilder<'_>, status: ir::Value) {
        let continuation = builder.create_block();
        builder
            .ins()
            .brif(status, self.trap_block, &[status], continuation, &[]);
        builder.seal_block(continuation);
        builder.switch_to_block(continuation);
    }

    fn trap_if_zero(&self, builder: &mut FunctionBuilder<'_>, val: ir::Value) {
        let is_zero = builder.ins().icmp_imm(IntCC::Equal, val, 0);
        self.trap_if(builder, is_zero, Trap::IntegerDivisionByZero);
    }

    /// Loads the builtin from the context and calls it, returning its only result.
    fn call_builtin(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        builtin: Builtin,
        args: &[ir::Value],
    ) -> ir::Value {
        let flags = MemFlags::trusted().with_readonly();
        let table = builder
            .ins()
            .load(I64, flags, self.vmctx, VMContext::BUILTINS);
        let callee = builder.ins().load(I64, flags, table, builtin.offset());

        let sig = match self.builtin_sigs.entry(builtin) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                *entry.insert(builder.import_signature(builtin.signature(self.call_conv)))
            }
        };

        let call = builder.ins().call_indirect(sig, callee, args);
        builder.inst_results(call)[0]
    }

    /// Calls the compiled code of a function defined in this module.
    fn call_defined(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        callee: DefinedFuncIndex,
        values: ir::Value,
    ) -> crate::Result<ir::Value> {
        let flags = MemFlags::trusted().with_readonly();
        let funcs = builder.ins().load(I64, flags, self.vmctx, VMContext::FUNCS);
        let entry = builder
            .ins()
            .load(I64, flags, funcs, slot_offset(callee.index())?);

        let sig = match self.wasm_sig {
            Some(sig) => sig,
            None => *self
                .wasm_sig
                .insert(builder.import_signature(wasm_signature(self.call_conv))),
        };

        let call = builder
            .ins()
            .call_indirect(sig, entry, &[self.vmctx, values]);
        Ok(builder.inst_results(call)[0])
    }

    /// Pops the arguments of a call with type `ty` into a fresh values array on the stack.
    fn spill_args(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        state: &mut State,
        ty: &FuncType,
    ) -> crate::Result<ir::Value> {
        let size = ty
            .value_slots()
            .max(1)
            .checked_mul(8)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or_else(|| wasm_unsupported!("call signature too large"))?;
        let slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            3,
        ));
        let values = builder.ins().stack_addr(I64, slot, 0);

        let num_params = ty.params().len();
        for (i, arg) in state.peekn(num_params)?.iter().enumerate() {
            let raw = to_slot(builder, *arg);
            builder
                .ins()
                .store(MemFlags::trusted(), raw, values, slot_offset(i)?);
        }
        state.popn(num_params)?;

        Ok(values)
    }

    fn reload_results(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        state: &mut State,
        values: ir::Value,
        ty: &FuncType,
    ) -> crate::Result<()> {
        for (j, ty) in ty.results().iter().enumerate() {
            let val = builder.ins().load(
                ir_type(*ty),
                MemFlags::trusted(),
                values,
                slot_offset(j)?,
            );
            state.push1(val);
        }
        Ok(())
    }

    /// Computes the host address of a linear memory access, trapping if any of its `width`
    /// bytes lies outside the memory.
    fn memory_addr(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        index: ir::Value,
        offset: u64,
        width: usize,
    ) -> crate::Result<ir::Value> {
        let out_of_range = || wasm_unsupported!("memory offset {offset:#x} out of range");
        let start = i64::try_from(offset).map_err(|_| out_of_range())?;
        let end = i64::try_from(width)
            .ok()
            .and_then(|width| start.checked_add(width))
            .ok_or_else(out_of_range)?;

        let flags = MemFlags::trusted();
        let index = builder.ins().uextend(I64, index);
        let len = builder
            .ins()
            .load(I64, flags, self.vmctx, VMContext::MEMORY_LEN);
        let access_end = builder.ins().iadd_imm(index, end);
        let oob = builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThan, access_end, len);
        self.trap_if(builder, oob, Trap::MemoryOutOfBounds);

        let base = builder
            .ins()
            .load(I64, flags, self.vmctx, VMContext::MEMORY_BASE);
        let addr = builder.ins().iadd(base, index);
        Ok(builder.ins().iadd_imm(addr, start))
    }

    fn global_slot(
        &self,
        builder: &mut FunctionBuilder<'_>,
        index: GlobalIndex,
    ) -> crate::Result<(ir::Value, i32)> {
        let base = builder
            .ins()
            .load(I64, MemFlags::trusted(), self.vmctx, VMContext::GLOBALS);
        Ok((base, slot_offset(index.index())?))
    }

    fn float_round(builder: &mut FunctionBuilder<'_>, op: FUnOp, val: ir::Value) -> ir::Value {
        let rounded = match op {
            FUnOp::Ceil => builder.ins().ceil(val),
            FUnOp::Floor => builder.ins().floor(val),
            FUnOp::Trunc => builder.ins().trunc(val),
            _ => builder.ins().nearest(val),
        };
        canonicalize_nan(builder, rounded)
    }

    fn convert(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        op: ConvOp,
        val: ir::Value,
    ) -> crate::Result<ir::Value> {
        Ok(match op {
            ConvOp::I32WrapI64 => builder.ins().ireduce(I32, val),
            ConvOp::I64ExtendI32S => builder.ins().sextend(I64, val),
            ConvOp::I64ExtendI32U => builder.ins().uextend(I64, val),
            ConvOp::I32TruncF32S | ConvOp::I32TruncF64S => self.trunc(builder, val, I32, true),
            ConvOp::I32TruncF32U | ConvOp::I32TruncF64U => self.trunc(builder, val, I32, false),
            ConvOp::I64TruncF32S | ConvOp::I64TruncF64S => self.trunc(builder, val, I64, true),
            ConvOp::I64TruncF32U | ConvOp::I64TruncF64U => self.trunc(builder, val, I64, false),
            ConvOp::I32TruncSatF32S | ConvOp::I32TruncSatF64S => {
                builder.ins().fcvt_to_sint_sat(I32, val)
            }
            ConvOp::I32TruncSatF32U | ConvOp::I32TruncSatF64U => {
                builder.ins().fcvt_to_uint_sat(I32, val)
            }
            ConvOp::I64TruncSatF32S | ConvOp::I64TruncSatF64S => {
                builder.ins().fcvt_to_sint_sat(I64, val)
            }
            ConvOp::I64TruncSatF32U | ConvOp::I64TruncSatF64U => {
                builder.ins().fcvt_to_uint_sat(I64, val)
            }
            ConvOp::F32ConvertI32S | ConvOp::F32ConvertI64S => builder.ins().fcvt_from_sint(F32, val),
            ConvOp::F32ConvertI32U | ConvOp::F32ConvertI64U => builder.ins().fcvt_from_uint(F32, val),
            ConvOp::F64ConvertI32S | ConvOp::F64ConvertI64S => builder.ins().fcvt_from_sint(F64, val),
            ConvOp::F64ConvertI32U | ConvOp::F64ConvertI64U => builder.ins().fcvt_from_uint(F64, val),
            ConvOp::F32DemoteF64 => {
                let demoted = builder.ins().fdemote(F32, val);
                canonicalize_nan(builder, demoted)
            }
            ConvOp::F64PromoteF32 => {
                let promoted = builder.ins().fpromote(F64, val);
                canonicalize_nan(builder, promoted)
            }
            ConvOp::I32ReinterpretF32 => builder.ins().bitcast(I32, MemFlags::new(), val),
            ConvOp::I64ReinterpretF64 => builder.ins().bitcast(I64, MemFlags::new(), val),
            ConvOp::F32ReinterpretI32 => builder.ins().bitcast(F32, MemFlags::new(), val),
            ConvOp::F64ReinterpretI64 => builder.ins().bitcast(F64, MemFlags::new(), val),
        })
    }

    /// Truncates `val` towards zero, trapping on NaN and on values outside of the range of `to`.
    fn trunc(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        val: ir::Value,
        to: ir::Type,
        signed: bool,
    ) -> ir::Value {
        let is_nan = builder.ins().fcmp(FloatCC::Unordered, val, val);
        self.trap_if(builder, is_nan, Trap::BadConversionToInteger);

        let from = builder.func.dfg.value_type(val);
        let (lower, lower_cc, upper) = trunc_bounds(from, to, signed);
        let lower = float_const(builder, from, lower);
        let upper = float_const(builder, from, upper);
        let above = builder.ins().fcmp(lower_cc, val, lower);
        let below = builder.ins().fcmp(FloatCC::LessThan, val, upper);
        let in_range = builder.ins().band(above, below);
        let overflow = builder.ins().icmp_imm(IntCC::Equal, in_range, 0);
        self.trap_if(builder, overflow, Trap::IntegerOverflow);

        if signed {
            builder.ins().fcvt_to_sint_sat(to, val)
        } else {
            builder.ins().fcvt_to_uint_sat(to, val)
        }
    }

    fn int_bin(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        op: IBinOp,
        a: ir::Value,
        b: ir::Value,
    ) -> ir::Value {
        let ty = builder.func.dfg.value_type(a);
        match op {
            IBinOp::Add => builder.ins().iadd(a, b),
            IBinOp::Sub => builder.ins().isub(a, b),
            IBinOp::Mul => builder.ins().imul(a, b),
            IBinOp::DivS => {
                self.trap_if_zero(builder, b);
                let min = iconst_of(builder, ty, 1 << (ty.bits() - 1));
                let minus_one = iconst_of(builder, ty, u64::MAX);
                let is_min = builder.ins().icmp(IntCC::Equal, a, min);
                let is_minus_one = builder.ins().icmp(IntCC::Equal, b, minus_one);
                let overflow = builder.ins().band(is_min, is_minus_one);
                self.trap_if(builder, overflow, Trap::IntegerOverflow);
                builder.ins().sdiv(a, b)
            }
            IBinOp::DivU => {
                self.trap_if_zero(builder, b);
                builder.ins().udiv(a, b)
            }
            IBinOp::RemS => {
                self.trap_if_zero(builder, b);
                builder.ins().srem(a, b)
            }
            IBinOp::RemU => {
                self.trap_if_zero(builder, b);
                builder.ins().urem(a, b)
            }
            IBinOp::And => builder.ins().band(a, b),
            IBinOp::Or => builder.ins().bor(a, b),
            IBinOp::Xor => builder.ins().bxor(a, b),
            IBinOp::Shl => builder.ins().ishl(a, b),
            IBinOp::ShrS => builder.ins().sshr(a, b),
            IBinOp::ShrU => builder.ins().ushr(a, b),
            IBinOp::Rotl => builder.ins().rotl(a, b),
            IBinOp::Rotr => builder.ins().rotr(a, b),
        }
    }
}

/// Translates one operator, see the module documentation for how faults are handled.
fn translate_operator(
    op: &Op,
    builder: &mut FunctionBuilder<'_>,
    state: &mut State,
    env: &mut FuncEnv<'_>,
) -> crate::Result<()> {
    if !state.reachable {
        return translate_unreachable_operator(op, builder, state, env);
    }

    // Given that we believe the current block is reachable, the FunctionBuilder ought to agree.
    debug_assert!(!builder.is_unreachable());

    let module = env.module;
    let vmctx = env.vmctx;
    match op {
        Op::Unreachable => {
            env.trap(builder, Trap::UnreachableCodeReached);
            state.reachable = false;
        }
        Op::Nop => {}
        Op::Drop => {
            state.pop1()?;
        }
        Op::Select => {
            let (a, b, cond) = state.pop3()?;
            state.push1(builder.ins().select(cond, a, b));
        }

        Op::Block(blockty) => {
            let (params, results) = blocktype_params_results(module, *blockty);
            let next = block_with_params(builder, results);
            state.push_block(next, params.len(), results.len());
        }
        Op::Loop(blockty) => {
            let (params, results) = blocktype_params_results(module, *blockty);
            let loop_body = block_with_params(builder, params);
            let next = block_with_params(builder, results);
            builder.ins().jump(loop_body, state.peekn(params.len())?);
            state.push_loop(loop_body, next, params.len(), results.len());

            // Control flow joins at the top of the loop, the body sees the block params.
            state.popn(params.len())?;
            state.pushn(builder.block_params(loop_body));

            builder.switch_to_block(loop_body);
        }
        Op::If(blockty) => {
            let cond = state.pop1()?;

            let next_block = builder.create_block();
            let (params, results) = blocktype_params_results(module, *blockty);
            let destination = block_with_params(builder, results);
            let else_data = if params == results {
                // An `else` is optional here, the false edge goes straight to the
                // destination until one is found.
                let branch_inst = builder.ins().brif(
                    cond,
                    next_block,
                    &[],
                    destination,
                    state.peekn(params.len())?,
                );
                ElseData::NoElse {
                    branch_inst,
                    placeholder: destination,
                }
            } else {
                let else_block = block_with_params(builder, params);
                builder.ins().brif(
                    cond,
                    next_block,
                    &[],
                    else_block,
                    state.peekn(params.len())?,
                );
                builder.seal_block(else_block);
                ElseData::WithElse { else_block }
            };

            builder.seal_block(next_block);
            builder.switch_to_block(next_block);
            state.push_if(
                destination,
                else_data,
                *blockty,
                params.len(),
                results.len(),
            );
        }
        Op::Else => {
            let (else_data, head_is_reachable, num_returns, block_type, destination) =
                enter_else(state)?;

            if head_is_reachable {
                state.reachable = true;

                let else_block = match else_data {
                    ElseData::NoElse {
                        branch_inst,
                        placeholder,
                    } => {
                        let (params, _) = blocktype_params_results(module, block_type);
                        let else_block = block_with_params(builder, params);
                        builder.ins().jump(destination, state.peekn(params.len())?);
                        state.popn(params.len())?;

                        builder.change_jump_destination(branch_inst, placeholder, else_block);
                        builder.seal_block(else_block);
                        else_block
                    }
                    ElseData::WithElse { else_block } => {
                        builder.ins().jump(destination, state.peekn(num_returns)?);
                        state.popn(num_returns)?;
                        else_block
                    }
                };

                // The parameters of the `else` arm are already on the stack, `push_if` pushed
                // them twice.
                builder.switch_to_block(else_block);
            }
        }
        Op::End => {
            let frame = state
                .control_stack
                .pop()
                .ok_or_else(|| malformed("unbalanced end"))?;
            let next_block = frame.next_block();
            builder
                .ins()
                .jump(next_block, state.peekn(frame.num_returns())?);

            builder.switch_to_block(next_block);
            builder.seal_block(next_block);

            if let ControlFrame::Loop { body, .. } = frame {
                builder.seal_block(body);
            }

            state.truncate_value_stack_to_original_size(&frame);
            state.pushn(builder.block_params(next_block));
        }

        Op::Br(relative_depth) => {
            let (destination, arity) = branch_target(state, *relative_depth)?;
            builder.ins().jump(destination, state.peekn(arity)?);
            state.popn(arity)?;
            state.reachable = false;
        }
        Op::BrIf(relative_depth) => {
            let cond = state.pop1()?;
            let (destination, arity) = branch_target(state, *relative_depth)?;
            let next_block = builder.create_block();
            builder
                .ins()
                .brif(cond, destination, state.peekn(arity)?, next_block, &[]);

            builder.seal_block(next_block);
            builder.switch_to_block(next_block);
        }
        Op::BrTable { targets, default } => {
            translate_br_table(targets, *default, builder, state)?;
            state.reachable = false;
        }
        Op::Return => {
            let frame = state
                .control_stack
                .first_mut()
                .ok_or_else(|| malformed("return outside of a function"))?;
            frame.set_branched_to_exit();
            let (exit_block, arity) = (frame.next_block(), frame.num_returns());
            builder.ins().jump(exit_block, state.peekn(arity)?);
            state.popn(arity)?;
            state.reachable = false;
        }

        Op::Call(func) => {
            let ty = module.func_type(*func);
            let values = env.spill_args(builder, state, ty)?;
            let status = match module.defined_func_index(*func) {
                Some(defined) => env.call_defined(builder, defined, values)?,
                None => {
                    let func = builder.ins().iconst(I32, i64::from(func.as_u32()));
                    env.call_builtin(builder, Builtin::call_import, &[vmctx, func, values])
                }
            };
            env.check_status(builder, status);
            env.reload_results(builder, state, values, ty)?;
        }
        Op::CallIndirect(type_index) => {
            let ty = &module.types[*type_index];
            let index = state.pop1()?;
            let values = env.spill_args(builder, state, ty)?;
            let type_index = builder.ins().iconst(I32, i64::from(type_index.as_u32()));
            let status = env.call_builtin(
                builder,
                Builtin::call_indirect,
                &[vmctx, index, type_index, values],
            );
            env.check_status(builder, status);
            env.reload_results(builder, state, values, ty)?;
        }

        Op::LocalGet(index) => {
            let val = builder.use_var(Variable::new(index.index()));
            state.push1(val);
        }
        Op::LocalSet(index) => {
            let val = state.pop1()?;
            builder.def_var(Variable::new(index.index()), val);
        }
        Op::LocalTee(index) => {
            let val = state.peek1()?;
            builder.def_var(Variable::new(index.index()), val);
        }
        Op::GlobalGet(index) => {
            let ty = module.globals[*index].content_type;
            let (base, offset) = env.global_slot(builder, *index)?;
            let val = builder
                .ins()
                .load(ir_type(ty), MemFlags::trusted(), base, offset);
            state.push1(val);
        }
        Op::GlobalSet(index) => {
            let val = state.pop1()?;
            let raw = to_slot(builder, val);
            let (base, offset) = env.global_slot(builder, *index)?;
            builder.ins().store(MemFlags::trusted(), raw, base, offset);
        }

        Op::Load { kind, offset } => {
            let index = state.pop1()?;
            let addr = env.memory_addr(builder, index, *offset, kind.width())?;
            state.push1(translate_load(builder, *kind, addr));
        }
        Op::Store { kind, offset } => {
            let (index, val) = state.pop2()?;
            let addr = env.memory_addr(builder, index, *offset, kind.width())?;
            translate_store(builder, *kind, addr, val);
        }
        Op::MemorySize => {
            let len = builder.ins().load(
                I64,
                MemFlags::trusted(),
                env.vmctx,
                VMContext::MEMORY_LEN,
            );
            let pages = builder.ins().ushr_imm(len, 16);
            state.push1(builder.ins().ireduce(I32, pages));
        }
        Op::MemoryGrow => {
            let delta = state.pop1()?;
            let old = env.call_builtin(builder, Builtin::memory_grow, &[vmctx, delta]);
            state.push1(old);
        }
        Op::MemoryCopy => {
            let (dst, src, len) = state.pop3()?;
            let status = env.call_builtin(builder, Builtin::memory_copy, &[vmctx, dst, src, len]);
            env.check_status(builder, status);
        }
        Op::MemoryFill => {
            let (dst, val, len) = state.pop3()?;
            let status = env.call_builtin(builder, Builtin::memory_fill, &[vmctx, dst, val, len]);
            env.check_status(builder, status);
        }
        Op::MemoryInit(data) => {
            let (dst, src, len) = state.pop3()?;
            let data = builder.ins().iconst(I32, i64::from(data.as_u32()));
            let status = env.call_builtin(
                builder,
                Builtin::memory_init,
                &[vmctx, data, dst, src, len],
            );
            env.check_status(builder, status);
        }
        Op::DataDrop(data) => {
            let data = builder.ins().iconst(I32, i64::from(data.as_u32()));
            let status = env.call_builtin(builder, Builtin::data_drop, &[vmctx, data]);
            env.check_status(builder, status);
        }
        Op::TableInit(elem) => {
            let (dst, src, len) = state.pop3()?;
            let elem = builder.ins().iconst(I32, i64::from(elem.as_u32()));
            let status = env.call_builtin(
                builder,
                Builtin::table_init,
                &[vmctx, elem, dst, src, len],
            );
            env.check_status(builder, status);
        }
        Op::ElemDrop(elem) => {
            let elem = builder.ins().iconst(I32, i64::from(elem.as_u32()));
            let status = env.call_builtin(builder, Builtin::elem_drop, &[vmctx, elem]);
            env.check_status(builder, status);
        }
        Op::TableCopy => {
            let (dst, src, len) = state.pop3()?;
            let status = env.call_builtin(builder, Builtin::table_copy, &[vmctx, dst, src, len]);
            env.check_status(builder, status);
        }

        Op::Const(ty, bits) => {
            let val = match ty {
                ValType::I32 | ValType::I64 => iconst_of(builder, ir_type(*ty), *bits),
                ValType::F32 => builder
                    .ins()
                    .f32const(Ieee32::with_bits(*bits as u32)),
                ValType::F64 => builder.ins().f64const(Ieee64::with_bits(*bits)),
            };
            state.push1(val);
        }
        Op::I32Eqz | Op::I64Eqz => {
            let val = state.pop1()?;
            let is_zero = builder.ins().icmp_imm(IntCC::Equal, val, 0);
            state.push1(builder.ins().uextend(I32, is_zero));
        }
        Op::I32Bin(op) | Op::I64Bin(op) => {
            let (a, b) = state.pop2()?;
            let val = env.int_bin(builder, *op, a, b);
            state.push1(val);
        }
        Op::I32Un(op) | Op::I64Un(op) => {
            let val = state.pop1()?;
            let ty = builder.func.dfg.value_type(val);
            let val = match op {
                IUnOp::Clz => builder.ins().clz(val),
                IUnOp::Ctz => builder.ins().ctz(val),
                IUnOp::Popcnt => builder.ins().popcnt(val),
                IUnOp::Extend8S => sign_extend_from(builder, val, I8, ty),
                IUnOp::Extend16S => sign_extend_from(builder, val, I16, ty),
                IUnOp::Extend32S => sign_extend_from(builder, val, I32, ty),
            };
            state.push1(val);
        }
        Op::I32Cmp(op) | Op::I64Cmp(op) => {
            let (a, b) = state.pop2()?;
            let cmp = builder.ins().icmp(int_cc(*op), a, b);
            state.push1(builder.ins().uextend(I32, cmp));
        }
        Op::F32Bin(op) | Op::F64Bin(op) => {
            let (a, b) = state.pop2()?;
            let val = match op {
                FBinOp::Add => builder.ins().fadd(a, b),
                FBinOp::Sub => builder.ins().fsub(a, b),
                FBinOp::Mul => builder.ins().fmul(a, b),
                FBinOp::Div => builder.ins().fdiv(a, b),
                FBinOp::Min => builder.ins().fmin(a, b),
                FBinOp::Max => builder.ins().fmax(a, b),
                FBinOp::Copysign => builder.ins().fcopysign(a, b),
            };
            let val = if *op == FBinOp::Copysign {
                val
            } else {
                canonicalize_nan(builder, val)
            };
            state.push1(val);
        }
        Op::F32Un(op) | Op::F64Un(op) => {
            let val = state.pop1()?;
            let val = match op {
                FUnOp::Abs => builder.ins().fabs(val),
                FUnOp::Neg => builder.ins().fneg(val),
                FUnOp::Sqrt => {
                    let root = builder.ins().sqrt(val);
                    canonicalize_nan(builder, root)
                }
                FUnOp::Ceil | FUnOp::Floor | FUnOp::Trunc | FUnOp::Nearest => {
                    FuncEnv::float_round(builder, *op, val)
                }
            };
            state.push1(val);
        }
        Op::F32Cmp(op) | Op::F64Cmp(op) => {
            let (a, b) = state.pop2()?;
            let cmp = builder.ins().fcmp(float_cc(*op), a, b);
            state.push1(builder.ins().uextend(I32, cmp));
        }
        Op::Convert(op) => {
            let val = state.pop1()?;
            let val = env.convert(builder, *op, val)?;
            state.push1(val);
        }
    }

    Ok(())
}

/// Deals with an operator in an unreachable portion of the code. Most are dropped, but
/// structured control operators have to keep the control stack balanced and `else` or `end` may
/// make code reachable again.
fn translate_unreachable_operator(
    op: &Op,
    builder: &mut FunctionBuilder<'_>,
    state: &mut State,
    env: &FuncEnv<'_>,
) -> crate::Result<()> {
    debug_assert!(!state.reachable);
    match op {
        Op::If(blockty) => {
            // Push a placeholder frame, the `if` is unreachable so nothing branches anywhere.
            state.push_if(
                ir::Block::reserved_value(),
                ElseData::NoElse {
                    branch_inst: ir::Inst::reserved_value(),
                    placeholder: ir::Block::reserved_value(),
                },
                *blockty,
                0,
                0,
            );
        }
        Op::Loop(_) | Op::Block(_) => {
            state.push_block(ir::Block::reserved_value(), 0, 0);
        }
        Op::Else => {
            let (else_data, head_is_reachable, _, block_type, _) = enter_else(state)?;

            if head_is_reachable {
                // The head of the `if` branches to the `else`.
                state.reachable = true;

                let else_block = match else_data {
                    ElseData::NoElse {
                        branch_inst,
                        placeholder,
                    } => {
                        let (params, _) = blocktype_params_results(env.module, block_type);
                        let else_block = block_with_params(builder, params);
                        state.truncate_value_stack_to_else_params();

                        builder.change_jump_destination(branch_inst, placeholder, else_block);
                        builder.seal_block(else_block);
                        else_block
                    }
                    ElseData::WithElse { else_block } => {
                        state.truncate_value_stack_to_else_params();
                        else_block
                    }
                };

                builder.switch_to_block(else_block);
            }
        }
        Op::End => {
            let frame = state
                .control_stack
                .pop()
                .ok_or_else(|| malformed("unbalanced end"))?;
            state.truncate_value_stack_to_original_size(&frame);

            let reachable_anyway = match &frame {
                ControlFrame::Loop { body, .. } => {
                    builder.seal_block(*body);
                    // Loops can't have branches to the end.
                    false
                }
                // The alternative just ended unreachable, so the following block is reachable
                // exactly if the consequent ended reachable.
                ControlFrame::If {
                    head_is_reachable,
                    consequent_ends_reachable: Some(consequent_ends_reachable),
                    ..
                } => *head_is_reachable && *consequent_ends_reachable,
                // There was no `else`, the false edge of the head reaches the following block.
                ControlFrame::If {
                    head_is_reachable,
                    consequent_ends_reachable: None,
                    ..
                } => *head_is_reachable,
                ControlFrame::Block { .. } => false,
            };

            if frame.exit_is_branched_to() || reachable_anyway {
                let next_block = frame.next_block();
                builder.switch_to_block(next_block);
                builder.seal_block(next_block);

                state.pushn(builder.block_params(next_block));
                state.reachable = true;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Records the end of the consequent of the innermost `if`, returning what the `else` needs
/// to know about the frame.
fn enter_else(state: &mut State) -> crate::Result<(ElseData, bool, usize, BlockType, ir::Block)> {
    let reachable = state.reachable;
    match state.control_stack.last_mut() {
        Some(ControlFrame::If {
            else_data,
            head_is_reachable,
            consequent_ends_reachable,
            num_returns,
            block_type,
            next_block,
            ..
        }) => {
            debug_assert!(consequent_ends_reachable.is_none());
            *consequent_ends_reachable = Some(reachable);
            Ok((
                *else_data,
                *head_is_reachable,
                *num_returns,
                *block_type,
                *next_block,
            ))
        }
        _ => Err(malformed("else without a matching if")),
    }
}

/// Marks the frame `relative_depth` levels up as branched to, returning its branch
/// destination and the number of values the branch carries.
fn branch_target(state: &mut State, relative_depth: u32) -> crate::Result<(ir::Block, usize)> {
    let i = state.frame_index(relative_depth)?;
    let frame = &mut state.control_stack[i];
    frame.set_branched_to_exit();
    Ok((frame.br_destination(), frame.br_arity()))
}

/// `br_table` does not take block arguments. When the targets expect values, every distinct
/// target gets its own block that jumps to the real destination with the arguments.
fn translate_br_table(
    targets: &[u32],
    default: u32,
    builder: &mut FunctionBuilder<'_>,
    state: &mut State,
) -> crate::Result<()> {
    let min_depth = targets.iter().copied().fold(default, u32::min);
    let arity = {
        let i = state.frame_index(min_depth)?;
        state.control_stack[i].br_arity()
    };
    let index = state.pop1()?;

    let mut data = Vec::with_capacity(targets.len());
    if arity == 0 {
        for depth in targets {
            let (block, _) = branch_target(state, *depth)?;
            data.push(builder.func.dfg.block_call(block, &[]));
        }
        let (block, _) = branch_target(state, default)?;
        let default = builder.func.dfg.block_call(block, &[]);
        let jt = builder.create_jump_table(JumpTableData::new(default, &data));
        builder.ins().br_table(index, jt);
    } else {
        // One edge-splitting block per distinct target depth.
        let mut dest_block_sequence = Vec::new();
        let mut dest_block_map = HashMap::new();
        let mut branch_block = |builder: &mut FunctionBuilder<'_>, depth: u32| {
            *dest_block_map.entry(depth).or_insert_with(|| {
                let block = builder.create_block();
                dest_block_sequence.push((depth, block));
                block
            })
        };

        for depth in targets {
            let block = branch_block(builder, *depth);
            data.push(builder.func.dfg.block_call(block, &[]));
        }
        let block = branch_block(builder, default);
        let default = builder.func.dfg.block_call(block, &[]);
        let jt = builder.create_jump_table(JumpTableData::new(default, &data));
        builder.ins().br_table(index, jt);

        for (depth, block) in dest_block_sequence {
            builder.switch_to_block(block);
            builder.seal_block(block);
            let (destination, _) = branch_target(state, depth)?;
            builder.ins().jump(destination, state.peekn(arity)?);
        }
        state.popn(arity)?;
    }

    Ok(())
}

fn translate_load(builder: &mut FunctionBuilder<'_>, kind: LoadKind, addr: ir::Value) -> ir::Value {
    let flags = heap_flags();
    let b = builder.ins();
    match kind {
        LoadKind::I32 => b.load(I32, flags, addr, 0),
        LoadKind::I64 => b.load(I64, flags, addr, 0),
        LoadKind::F32 => b.load(F32, flags, addr, 0),
        LoadKind::F64 => b.load(F64, flags, addr, 0),
        LoadKind::I32_8S => b.sload8(I32, flags, addr, 0),
        LoadKind::I32_8U => b.uload8(I32, flags, addr, 0),
        LoadKind::I32_16S => b.sload16(I32, flags, addr, 0),
        LoadKind::I32_16U => b.uload16(I32, flags, addr, 0),
        LoadKind::I64_8S => b.sload8(I64, flags, addr, 0),
        LoadKind::I64_8U => b.uload8(I64, flags, addr, 0),
        LoadKind::I64_16S => b.sload16(I64, flags, addr, 0),
        LoadKind::I64_16U => b.uload16(I64, flags, addr, 0),
        LoadKind::I64_32S => b.sload32(flags, addr, 0),
        LoadKind::I64_32U => b.uload32(flags, addr, 0),
    }
}

fn translate_store(
    builder: &mut FunctionBuilder<'_>,
    kind: StoreKind,
    addr: ir::Value,
    val: ir::Value,
) {
    let flags = heap_flags();
    let b = builder.ins();
    match kind {
        StoreKind::I32 | StoreKind::I64 | StoreKind::F32 | StoreKind::F64 => {
            b.store(flags, val, addr, 0)
        }
        StoreKind::I32_8 | StoreKind::I64_8 => b.istore8(flags, val, addr, 0),
        StoreKind::I32_16 | StoreKind::I64_16 => b.istore16(flags, val, addr, 0),
        StoreKind::I64_32 => b.istore32(flags, val, addr, 0),
    };
}

/// Linear memory is bounds checked before every access, and may be unaligned.
fn heap_flags() -> MemFlags {
    MemFlags::new()
        .with_notrap()
        .with_endianness(ir::Endianness::Little)
}

/// The parameter and result types of a structured control instruction.
fn blocktype_params_results(module: &Module, ty: BlockType) -> (&[ValType], &[ValType]) {
    match ty {
        BlockType::Empty => (&[], &[]),
        BlockType::Value(ty) => (&[], single(ty)),
        BlockType::Func(index) => {
            let ty = &module.types[index];
            (ty.params(), ty.results())
        }
    }
}

fn single(ty: ValType) -> &'static [ValType] {
    match ty {
        ValType::I32 => slice::from_ref(&ValType::I32),
        ValType::I64 => slice::from_ref(&ValType::I64),
        ValType::F32 => slice::from_ref(&ValType::F32),
        ValType::F64 => slice::from_ref(&ValType::F64),
    }
}

fn block_with_params(builder: &mut FunctionBuilder<'_>, params: &[ValType]) -> ir::Block {
    let block = builder.create_block();
    for ty in params {
        builder.append_block_param(block, ir_type(*ty));
    }
    block
}

pub(super) fn ir_type(ty: ValType) -> ir::Type {
    match ty {
        ValType::I32 => I32,
        ValType::I64 => I64,
        ValType::F32 => F32,
        ValType::F64 => F64,
    }
}

fn zero(builder: &mut FunctionBuilder<'_>, ty: ValType) -> ir::Value {
    match ty {
        ValType::I32 => builder.ins().iconst(I32, 0),
        ValType::I64 => builder.ins().iconst(I64, 0),
        ValType::F32 => builder.ins().f32const(Ieee32::with_bits(0)),
        ValType::F64 => builder.ins().f64const(Ieee64::with_bits(0)),
    }
}

/// An integer constant from its raw bits, zero-extended the way Cranelift expects.
fn iconst_of(builder: &mut FunctionBuilder<'_>, ty: ir::Type, bits: u64) -> ir::Value {
    if ty == I32 {
        builder.ins().iconst(I32, i64::from(bits as u32))
    } else {
        builder.ins().iconst(I64, bits as i64)
    }
}

fn sign_extend_from(
    builder: &mut FunctionBuilder<'_>,
    val: ir::Value,
    narrow: ir::Type,
    ty: ir::Type,
) -> ir::Value {
    let narrowed = builder.ins().ireduce(narrow, val);
    builder.ins().sextend(ty, narrowed)
}

/// Replaces any NaN with the canonical NaN of its type.
fn canonicalize_nan(builder: &mut FunctionBuilder<'_>, val: ir::Value) -> ir::Value {
    let ty = builder.func.dfg.value_type(val);
    let canonical = if ty == F32 {
        builder.ins().f32const(Ieee32::with_bits(F32_CANONICAL_NAN))
    } else {
        builder.ins().f64const(Ieee64::with_bits(F64_CANONICAL_NAN))
    };
    let is_nan = builder.ins().fcmp(FloatCC::Unordered, val, val);
    builder.ins().select(is_nan, canonical, val)
}

/// Widens a value to the 8-byte slot representation: integers zero-extended, floats as bits.
fn to_slot(builder: &mut FunctionBuilder<'_>, val: ir::Value) -> ir::Value {
    let ty = builder.func.dfg.value_type(val);
    if ty == I32 {
        builder.ins().uextend(I64, val)
    } else if ty == F32 {
        let bits = builder.ins().bitcast(I32, MemFlags::new(), val);
        builder.ins().uextend(I64, bits)
    } else if ty == F64 {
        builder.ins().bitcast(I64, MemFlags::new(), val)
    } else {
        val
    }
}

/// The byte offset of the `index`th slot of a values array.
fn slot_offset(index: usize) -> crate::Result<i32> {
    index
        .checked_mul(8)
        .and_then(|offset| i32::try_from(offset).ok())
        .ok_or_else(|| wasm_unsupported!("too many values"))
}

fn int_cc(op: ICmp) -> IntCC {
    match op {
        ICmp::Eq => IntCC::Equal,
        ICmp::Ne => IntCC::NotEqual,
        ICmp::LtS => IntCC::SignedLessThan,
        ICmp::LtU => IntCC::UnsignedLessThan,
        ICmp::GtS => IntCC::SignedGreaterThan,
        ICmp::GtU => IntCC::UnsignedGreaterThan,
        ICmp::LeS => IntCC::SignedLessThanOrEqual,
        ICmp::LeU => IntCC::UnsignedLessThanOrEqual,
        ICmp::GeS => IntCC::SignedGreaterThanOrEqual,
        ICmp::GeU => IntCC::UnsignedGreaterThanOrEqual,
    }
}

/// The exclusive upper bound of truncating `from` into `to`, and the lower bound together with
/// the comparison that accepts it. All bounds are exact in `from`.
fn trunc_bounds(from: ir::Type, to: ir::Type, signed: bool) -> (f64, FloatCC, f64) {
    match (signed, to == I32) {
        (true, true) if from == F64 => (-2_147_483_649.0, FloatCC::GreaterThan, 2_147_483_648.0),
        (true, true) => (-2_147_483_648.0, FloatCC::GreaterThanOrEqual, 2_147_483_648.0),
        (true, false) => (
            -9_223_372_036_854_775_808.0,
            FloatCC::GreaterThanOrEqual,
            9_223_372_036_854_775_808.0,
        ),
        (false, true) => (-1.0, FloatCC::GreaterThan, 4_294_967_296.0),
        (false, false) => (-1.0, FloatCC::GreaterThan, 18_446_744_073_709_551_616.0),
    }
}

fn float_const(builder: &mut FunctionBuilder<'_>, ty: ir::Type, val: f64) -> ir::Value {
    if ty == F32 {
        builder.ins().f32const(Ieee32::with_float(val as f32))
    } else {
        builder.ins().f64const(Ieee64::with_float(val))
    }
}

fn float_cc(op: FCmp) -> FloatCC {
    match op {
        FCmp::Eq => FloatCC::Equal,
        // `ne` is true for unordered operands
        FCmp::Ne => FloatCC::NotEqual,
        FCmp::Lt => FloatCC::LessThan,
        FCmp::Gt => FloatCC::GreaterThan,
        FCmp::Le => FloatCC::LessThanOrEqual,
        FCmp::Ge => FloatCC::GreaterThanOrEqual,
    }
}
