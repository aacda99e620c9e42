// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_entity::EntityRef;
use smallvec::SmallVec;

use crate::indices::{FuncIndex, GlobalIndex};
use crate::values::VMVal;
use crate::wasm_unsupported;

/// A constant expression.
///
/// These are used to initialize globals and to compute the offsets of active segments.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConstExpr {
    ops: SmallVec<[ConstOp; 2]>,
}

impl ConstExpr {
    /// Create a new const expression from a `wasmparser` const expression.
    pub fn from_wasmparser(expr: &wasmparser::ConstExpr<'_>) -> crate::Result<Self> {
        let mut iter = expr
            .get_operators_reader()
            .into_iter_with_offsets()
            .peekable();

        let mut ops = SmallVec::<[ConstOp; 2]>::new();
        while let Some(res) = iter.next() {
            let (op, offset) = res?;

            // The trailing `end` terminates the expression.
            if matches!(op, wasmparser::Operator::End) && iter.peek().is_none() {
                break;
            }

            ops.push(ConstOp::from_wasmparser(op, offset)?);
        }
        Ok(Self { ops })
    }

    /// A constant expression producing a single `i32`.
    #[cfg(test)]
    pub(crate) fn i32(value: i32) -> Self {
        Self {
            ops: smallvec::smallvec![ConstOp::I32Const(value)],
        }
    }

    pub fn ops(&self) -> impl ExactSizeIterator<Item = ConstOp> + use<'_> {
        self.ops.iter().copied()
    }

    /// Evaluates a numeric constant expression against the already initialized `globals`.
    pub(crate) fn eval(&self, globals: &[VMVal]) -> VMVal {
        let mut stack = SmallVec::<[VMVal; 2]>::new();
        for op in self.ops() {
            let val = match op {
                ConstOp::I32Const(v) => VMVal::i32(v),
                ConstOp::I64Const(v) => VMVal::i64(v),
                ConstOp::F32Const(bits) => VMVal::u32(bits),
                ConstOp::F64Const(bits) => VMVal::u64(bits),
                ConstOp::GlobalGet(idx) => globals[idx.index()],
                // The validator ensures element expressions are only evaluated through
                // `as_func_ref` and global initializers never produce references.
                ConstOp::RefNull | ConstOp::RefFunc(_) => VMVal::u64(0),
            };
            stack.push(val);
        }
        stack.pop().unwrap_or(VMVal::u64(0))
    }

    /// Interprets an element segment item: `Some(func)` for `ref.func`, `None` for `ref.null`.
    pub(crate) fn as_func_ref(&self) -> crate::Result<Option<FuncIndex>> {
        match self.ops.as_slice() {
            [ConstOp::RefFunc(idx)] => Ok(Some(*idx)),
            [ConstOp::RefNull] => Ok(None),
            ops => Err(wasm_unsupported!("element expression {ops:?}")),
        }
    }
}

/// The subset of Wasm opcodes that are constant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConstOp {
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    GlobalGet(GlobalIndex),
    RefNull,
    RefFunc(FuncIndex),
}

impl ConstOp {
    /// Convert a `wasmparser::Operator` to a `ConstOp`.
    pub fn from_wasmparser(op: wasmparser::Operator<'_>, offset: usize) -> crate::Result<Self> {
        use wasmparser::Operator as O;
        Ok(match op {
            O::I32Const { value } => Self::I32Const(value),
            O::I64Const { value } => Self::I64Const(value),
            O::F32Const { value } => Self::F32Const(value.bits()),
            O::F64Const { value } => Self::F64Const(value.bits()),
            O::RefNull { hty: _ } => Self::RefNull,
            O::RefFunc { function_index } => Self::RefFunc(FuncIndex::from_u32(function_index)),
            O::GlobalGet { global_index } => Self::GlobalGet(GlobalIndex::from_u32(global_index)),
            op => {
                return Err(wasm_unsupported!(
                    "unsupported opcode in const expression at offset {offset:#x}: {op:?}",
                ));
            }
        })
    }
}
