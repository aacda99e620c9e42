// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lowers structured control flow into flat instructions with resolved branch targets.
//!
//! Validation guarantees the operand stack height at every program point is static, so each
//! branch knows ahead of time how many values it keeps and how many it drops beneath them.
//! Code following an unconditional branch is unreachable and not emitted.

use alloc::boxed::Box;
use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::indices::{DataIndex, ElemIndex, FuncIndex, TypeIndex};
use crate::module::{FunctionBody, Module};
use crate::translate::{
    BlockType, ConvOp, FBinOp, FCmp, FUnOp, IBinOp, ICmp, IUnOp, LoadKind, Op, StoreKind,
};
use crate::types::FuncType;

/// A resolved branch: jump to `target` keeping the top `keep` values and dropping the
/// `drop` values beneath them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub target: u32,
    pub drop: u32,
    pub keep: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Unreachable,
    Br(Branch),
    /// Pops an `i32` and branches if it is non-zero.
    BrIf(Branch),
    /// Pops an `i32` and jumps if it is zero, the false edge of an `if`.
    BrIfEqz(u32),
    /// Pops an index into the function's branch table slice `start..start + len`, the last
    /// entry is the default.
    BrTable {
        start: u32,
        len: u32,
    },
    Return,
    Call(FuncIndex),
    CallIndirect(TypeIndex),
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load {
        kind: LoadKind,
        offset: u64,
    },
    Store {
        kind: StoreKind,
        offset: u64,
    },
    MemorySize,
    MemoryGrow,
    MemoryCopy,
    MemoryFill,
    MemoryInit(DataIndex),
    DataDrop(DataIndex),
    TableInit(ElemIndex),
    ElemDrop(ElemIndex),
    TableCopy,
    Const(u64),
    I32Eqz,
    I64Eqz,
    I32Bin(IBinOp),
    I64Bin(IBinOp),
    I32Un(IUnOp),
    I64Un(IUnOp),
    I32Cmp(ICmp),
    I64Cmp(ICmp),
    F32Bin(FBinOp),
    F64Bin(FBinOp),
    F32Un(FUnOp),
    F64Un(FUnOp),
    F32Cmp(FCmp),
    F64Cmp(FCmp),
    Convert(ConvOp),
}

/// A function body ready for the interpreter.
#[derive(Debug)]
pub struct LoweredFunc {
    pub code: Box<[Instr]>,
    pub br_tables: Box<[Branch]>,
    pub num_params: u32,
    pub num_results: u32,
    /// Declared locals, excluding the parameters.
    pub num_locals: u32,
    /// See [`FunctionBody::frame_slots`].
    pub frame_slots: u32,
}

#[derive(Debug, Clone, Copy)]
enum Fixup {
    Instr(usize),
    Table(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    Block,
    Loop,
    /// `else_fixup` is the `BrIfEqz` to patch once the `else` or `end` is reached.
    If { else_fixup: Option<usize> },
}

#[derive(Debug)]
struct Control {
    kind: ControlKind,
    /// Operand stack height at entry, below the block parameters.
    height: u32,
    params: u32,
    results: u32,
    /// Branch target of a loop.
    start: u32,
    fixups: SmallVec<[Fixup; 4]>,
}

impl Control {
    fn branch_arity(&self) -> u32 {
        match self.kind {
            ControlKind::Loop => self.params,
            _ => self.results,
        }
    }
}

struct Lowerer<'a> {
    module: &'a Module,
    code: Vec<Instr>,
    br_tables: Vec<Branch>,
    controls: Vec<Control>,
    height: u32,
    /// Set after an unconditional branch until the enclosing block ends.
    unreachable: bool,
    /// Nesting depth of blocks opened inside unreachable code.
    dead_depth: u32,
}

pub fn lower(module: &Module, ty: &FuncType, body: &FunctionBody) -> LoweredFunc {
    let num_results = len_u32(ty.results().len());
    let mut lowerer = Lowerer {
        module,
        code: Vec::with_capacity(body.ops.len()),
        br_tables: Vec::new(),
        controls: Vec::new(),
        height: 0,
        unreachable: false,
        dead_depth: 0,
    };

    // The function body is an implicit block whose end returns.
    lowerer.controls.push(Control {
        kind: ControlKind::Block,
        height: 0,
        params: 0,
        results: num_results,
        start: 0,
        fixups: SmallVec::new(),
    });

    for op in &body.ops {
        lowerer.lower_op(op);
    }

    LoweredFunc {
        code: lowerer.code.into_boxed_slice(),
        br_tables: lowerer.br_tables.into_boxed_slice(),
        num_params: len_u32(ty.params().len()),
        num_results,
        num_locals: len_u32(body.locals.len()),
        frame_slots: body.frame_slots(ty),
    }
}

fn len_u32(len: usize) -> u32 {
    // Validation limits parameters, results and locals well below `u32::MAX`.
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Lowerer<'_> {
    fn pc(&self) -> u32 {
        len_u32(self.code.len())
    }

    fn block_arity(&self, ty: BlockType) -> (u32, u32) {
        match ty {
            BlockType::Empty => (0, 0),
            BlockType::Value(_) => (0, 1),
            BlockType::Func(idx) => {
                let ty = &self.module.types[idx];
                (len_u32(ty.params().len()), len_u32(ty.results().len()))
            }
        }
    }

    fn push_control(&mut self, kind: ControlKind, ty: BlockType) {
        let (params, results) = self.block_arity(ty);
        self.controls.push(Control {
            kind,
            height: self.height - params,
            params,
            results,
            start: self.pc(),
            fixups: SmallVec::new(),
        });
    }

    /// Resolves a branch to the label `depth` levels up, registering a fixup for forward labels.
    fn branch(&mut self, depth: u32, fixup: Fixup) -> Branch {
        let idx = self.controls.len() - 1 - depth as usize;
        let frame = &mut self.controls[idx];
        let keep = frame.branch_arity();
        let drop = self.height - frame.height - keep;
        let target = if frame.kind == ControlKind::Loop {
            frame.start
        } else {
            frame.fixups.push(fixup);
            u32::MAX
        };
        Branch { target, drop, keep }
    }

    fn patch(&mut self, fixups: &[Fixup], target: u32) {
        for fixup in fixups {
            match *fixup {
                Fixup::Instr(at) => match &mut self.code[at] {
                    Instr::Br(branch) | Instr::BrIf(branch) => branch.target = target,
                    Instr::BrIfEqz(to) => *to = target,
                    _ => unreachable!("fixup does not point at a branch"),
                },
                Fixup::Table(at) => self.br_tables[at].target = target,
            }
        }
    }

    fn emit(&mut self, instr: Instr, pops: u32, pushes: u32) {
        self.height = self.height - pops + pushes;
        self.code.push(instr);
    }

    fn call_effect(ty: &FuncType) -> (u32, u32) {
        (len_u32(ty.params().len()), len_u32(ty.results().len()))
    }

    fn lower_op(&mut self, op: &Op) {
        if self.unreachable {
            match op {
                Op::Block(_) | Op::Loop(_) | Op::If(_) => {
                    self.dead_depth += 1;
                    return;
                }
                Op::End if self.dead_depth > 0 => {
                    self.dead_depth -= 1;
                    return;
                }
                Op::End | Op::Else if self.dead_depth == 0 => {}
                _ => return,
            }
        }

        match op {
            Op::Unreachable => {
                self.code.push(Instr::Unreachable);
                self.unreachable = true;
            }
            Op::Nop => {}
            Op::Block(ty) => self.push_control(ControlKind::Block, *ty),
            Op::Loop(ty) => self.push_control(ControlKind::Loop, *ty),
            Op::If(ty) => {
                self.height -= 1;
                let at = self.code.len();
                self.code.push(Instr::BrIfEqz(u32::MAX));
                self.push_control(ControlKind::If { else_fixup: None }, *ty);
                if let Some(frame) = self.controls.last_mut() {
                    frame.kind = ControlKind::If {
                        else_fixup: Some(at),
                    };
                }
            }
            Op::Else => {
                let at = self.code.len();
                self.code.push(Instr::Br(Branch {
                    target: u32::MAX,
                    drop: 0,
                    keep: 0,
                }));
                let else_pc = self.pc();
                let Some(frame) = self.controls.last_mut() else {
                    return;
                };
                frame.fixups.push(Fixup::Instr(at));
                let else_fixup = match frame.kind {
                    ControlKind::If { else_fixup } => else_fixup,
                    _ => None,
                };
                frame.kind = ControlKind::If { else_fixup: None };
                self.height = frame.height + frame.params;
                if let Some(at) = else_fixup {
                    self.patch(&[Fixup::Instr(at)], else_pc);
                }
                self.unreachable = false;
            }
            Op::End => {
                let Some(frame) = self.controls.pop() else {
                    return;
                };
                let end = self.pc();
                if let ControlKind::If {
                    else_fixup: Some(at),
                } = frame.kind
                {
                    self.patch(&[Fixup::Instr(at)], end);
                }
                self.patch(&frame.fixups, end);
                self.height = frame.height + frame.results;
                self.unreachable = false;
                if self.controls.is_empty() {
                    self.code.push(Instr::Return);
                }
            }
            Op::Br(depth) => {
                let branch = self.branch(*depth, Fixup::Instr(self.code.len()));
                self.code.push(Instr::Br(branch));
                self.unreachable = true;
            }
            Op::BrIf(depth) => {
                self.height -= 1;
                let branch = self.branch(*depth, Fixup::Instr(self.code.len()));
                self.code.push(Instr::BrIf(branch));
            }
            Op::BrTable { targets, default } => {
                self.height -= 1;
                let start = self.br_tables.len();
                for depth in targets.iter().chain(core::iter::once(default)) {
                    let branch = self.branch(*depth, Fixup::Table(self.br_tables.len()));
                    self.br_tables.push(branch);
                }
                self.code.push(Instr::BrTable {
                    start: len_u32(start),
                    len: len_u32(self.br_tables.len() - start),
                });
                self.unreachable = true;
            }
            Op::Return => {
                self.code.push(Instr::Return);
                self.unreachable = true;
            }
            Op::Call(func) => {
                let (pops, pushes) = Self::call_effect(self.module.func_type(*func));
                self.emit(Instr::Call(*func), pops, pushes);
            }
            Op::CallIndirect(ty) => {
                let (pops, pushes) = Self::call_effect(&self.module.types[*ty]);
                self.emit(Instr::CallIndirect(*ty), pops + 1, pushes);
            }
            Op::Drop => self.emit(Instr::Drop, 1, 0),
            Op::Select => self.emit(Instr::Select, 3, 1),
            Op::LocalGet(idx) => self.emit(Instr::LocalGet(idx.as_u32()), 0, 1),
            Op::LocalSet(idx) => self.emit(Instr::LocalSet(idx.as_u32()), 1, 0),
            Op::LocalTee(idx) => self.emit(Instr::LocalTee(idx.as_u32()), 1, 1),
            Op::GlobalGet(idx) => self.emit(Instr::GlobalGet(idx.as_u32()), 0, 1),
            Op::GlobalSet(idx) => self.emit(Instr::GlobalSet(idx.as_u32()), 1, 0),
            Op::Load { kind, offset } => self.emit(
                Instr::Load {
                    kind: *kind,
                    offset: *offset,
                },
                1,
                1,
            ),
            Op::Store { kind, offset } => self.emit(
                Instr::Store {
                    kind: *kind,
                    offset: *offset,
                },
                2,
                0,
            ),
            Op::MemorySize => self.emit(Instr::MemorySize, 0, 1),
            Op::MemoryGrow => self.emit(Instr::MemoryGrow, 1, 1),
            Op::MemoryCopy => self.emit(Instr::MemoryCopy, 3, 0),
            Op::MemoryFill => self.emit(Instr::MemoryFill, 3, 0),
            Op::MemoryInit(idx) => self.emit(Instr::MemoryInit(*idx), 3, 0),
            Op::DataDrop(idx) => self.emit(Instr::DataDrop(*idx), 0, 0),
            Op::TableInit(idx) => self.emit(Instr::TableInit(*idx), 3, 0),
            Op::ElemDrop(idx) => self.emit(Instr::ElemDrop(*idx), 0, 0),
            Op::TableCopy => self.emit(Instr::TableCopy, 3, 0),
            Op::Const(_, bits) => self.emit(Instr::Const(*bits), 0, 1),
            Op::I32Eqz => self.emit(Instr::I32Eqz, 1, 1),
            Op::I64Eqz => self.emit(Instr::I64Eqz, 1, 1),
            Op::I32Bin(op) => self.emit(Instr::I32Bin(*op), 2, 1),
            Op::I64Bin(op) => self.emit(Instr::I64Bin(*op), 2, 1),
            Op::I32Un(op) => self.emit(Instr::I32Un(*op), 1, 1),
            Op::I64Un(op) => self.emit(Instr::I64Un(*op), 1, 1),
            Op::I32Cmp(op) => self.emit(Instr::I32Cmp(*op), 2, 1),
            Op::I64Cmp(op) => self.emit(Instr::I64Cmp(*op), 2, 1),
            Op::F32Bin(op) => self.emit(Instr::F32Bin(*op), 2, 1),
            Op::F64Bin(op) => self.emit(Instr::F64Bin(*op), 2, 1),
            Op::F32Un(op) => self.emit(Instr::F32Un(*op), 1, 1),
            Op::F64Un(op) => self.emit(Instr::F64Un(*op), 1, 1),
            Op::F32Cmp(op) => self.emit(Instr::F32Cmp(*op), 2, 1),
            Op::F64Cmp(op) => self.emit(Instr::F64Cmp(*op), 2, 1),
            Op::Convert(op) => self.emit(Instr::Convert(*op), 1, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::indices::DefinedFuncIndex;

    fn lower_first(wat: &str) -> LoweredFunc {
        let bytes = wat::parse_str(wat).unwrap();
        let module = Module::from_binary(&Config::default(), &bytes).unwrap();
        let func = module.func_index(DefinedFuncIndex::from_u32(0));
        lower(
            &module,
            module.func_type(func),
            &module.bodies[DefinedFuncIndex::from_u32(0)],
        )
    }

    #[test]
    fn branches_out_of_blocks_drop_intermediate_values() {
        let func = lower_first(
            r#"
            (module
                (func (result i32)
                    (block (result i32)
                        i32.const 1
                        i32.const 2
                        br 0)))
            "#,
        );
        assert_eq!(
            &*func.code,
            &[
                Instr::Const(1),
                Instr::Const(2),
                Instr::Br(Branch {
                    target: 3,
                    drop: 1,
                    keep: 1
                }),
                Instr::Return,
            ]
        );
    }

    #[test]
    fn loops_branch_backwards() {
        let func = lower_first(
            r#"
            (module
                (func (param i32)
                    (loop
                        local.get 0
                        br_if 0)))
            "#,
        );
        assert_eq!(
            &*func.code,
            &[
                Instr::LocalGet(0),
                Instr::BrIf(Branch {
                    target: 0,
                    drop: 0,
                    keep: 0
                }),
                Instr::Return,
            ]
        );
    }

    #[test]
    fn if_else_targets() {
        let func = lower_first(
            r#"
            (module
                (func (param i32) (result i32)
                    (if (result i32) (local.get 0)
                        (then i32.const 1)
                        (else i32.const 2))))
            "#,
        );
        assert_eq!(
            &*func.code,
            &[
                Instr::LocalGet(0),
                Instr::BrIfEqz(4),
                Instr::Const(1),
                Instr::Br(Branch {
                    target: 5,
                    drop: 0,
                    keep: 0
                }),
                Instr::Const(2),
                Instr::Return,
            ]
        );
    }

    #[test]
    fn unreachable_code_is_skipped() {
        let func = lower_first(
            r#"
            (module
                (func (result i32)
                    i32.const 7
                    return
                    (block (drop (i32.const 1)))
                    i32.const 8))
            "#,
        );
        assert_eq!(
            &*func.code,
            &[Instr::Const(7), Instr::Return, Instr::Return]
        );
    }

    #[test]
    fn br_table_entries_resolve() {
        let func = lower_first(
            r#"
            (module
                (func (param i32) (result i32)
                    (block
                        (block
                            local.get 0
                            br_table 0 1 1)
                        i32.const 10
                        return)
                    i32.const 20))
            "#,
        );
        assert_eq!(func.br_tables.len(), 3);
        assert_eq!(func.br_tables[0].target, 2);
        assert_eq!(func.br_tables[1].target, 4);
        assert_eq!(func.br_tables[2].target, 4);
    }
}
