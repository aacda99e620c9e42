// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The owned instruction representation both engines consume.
//!
//! Function bodies are validated operator by operator while they are decoded and then stored as
//! a flat sequence of [`Op`]s. Operators that only differ in their operand type share a variant
//! (`I32Bin(IBinOp::Add)`, `I64Bin(IBinOp::Add)`) so each engine implements every arithmetic
//! operation once per width.

use alloc::boxed::Box;

use crate::indices::{DataIndex, ElemIndex, FuncIndex, GlobalIndex, LocalIndex, TypeIndex};
use crate::types::ValType;
use crate::wasm_unsupported;

/// The signature of a structured control instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    Func(TypeIndex),
}

impl BlockType {
    fn from_wasmparser(ty: wasmparser::BlockType) -> crate::Result<Self> {
        Ok(match ty {
            wasmparser::BlockType::Empty => Self::Empty,
            wasmparser::BlockType::Type(ty) => Self::Value(ValType::from_wasmparser(ty)?),
            wasmparser::BlockType::FuncType(idx) => Self::Func(TypeIndex::from_u32(idx)),
        })
    }
}

/// The width and extension of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32_8S,
    I32_8U,
    I32_16S,
    I32_16U,
    I64_8S,
    I64_8U,
    I64_16S,
    I64_16U,
    I64_32S,
    I64_32U,
}

impl LoadKind {
    /// The number of bytes read from memory.
    pub fn width(self) -> usize {
        match self {
            Self::I32_8S | Self::I32_8U | Self::I64_8S | Self::I64_8U => 1,
            Self::I32_16S | Self::I32_16U | Self::I64_16S | Self::I64_16U => 2,
            Self::I32 | Self::F32 | Self::I64_32S | Self::I64_32U => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// The type of the value pushed onto the stack.
    pub fn result_type(self) -> ValType {
        match self {
            Self::I32 | Self::I32_8S | Self::I32_8U | Self::I32_16S | Self::I32_16U => ValType::I32,
            Self::F32 => ValType::F32,
            Self::F64 => ValType::F64,
            _ => ValType::I64,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::I32_8S | Self::I32_16S | Self::I64_8S | Self::I64_16S | Self::I64_32S
        )
    }
}

/// The width of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32_8,
    I32_16,
    I64_8,
    I64_16,
    I64_32,
}

impl StoreKind {
    pub fn width(self) -> usize {
        match self {
            Self::I32_8 | Self::I64_8 => 1,
            Self::I32_16 | Self::I64_16 => 2,
            Self::I32 | Self::F32 | Self::I64_32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IBinOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IUnOp {
    Clz,
    Ctz,
    Popcnt,
    Extend8S,
    Extend16S,
    /// Only valid on `i64`.
    Extend32S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ICmp {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Copysign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FUnOp {
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Conversions between value types.
///
/// The `Trunc*` variants trap on NaN and out-of-range inputs, the `TruncSat*` variants saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvOp {
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F32DemoteF64,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
}

impl ConvOp {
    /// The operand and result types of the conversion.
    pub fn signature(self) -> (ValType, ValType) {
        use ValType::{F32, F64, I32, I64};
        match self {
            Self::I32WrapI64 => (I64, I32),
            Self::I64ExtendI32S | Self::I64ExtendI32U => (I32, I64),
            Self::I32TruncF32S | Self::I32TruncF32U => (F32, I32),
            Self::I32TruncF64S | Self::I32TruncF64U => (F64, I32),
            Self::I64TruncF32S | Self::I64TruncF32U => (F32, I64),
            Self::I64TruncF64S | Self::I64TruncF64U => (F64, I64),
            Self::I32TruncSatF32S | Self::I32TruncSatF32U => (F32, I32),
            Self::I32TruncSatF64S | Self::I32TruncSatF64U => (F64, I32),
            Self::I64TruncSatF32S | Self::I64TruncSatF32U => (F32, I64),
            Self::I64TruncSatF64S | Self::I64TruncSatF64U => (F64, I64),
            Self::F32ConvertI32S | Self::F32ConvertI32U => (I32, F32),
            Self::F32ConvertI64S | Self::F32ConvertI64U => (I64, F32),
            Self::F64ConvertI32S | Self::F64ConvertI32U => (I32, F64),
            Self::F64ConvertI64S | Self::F64ConvertI64U => (I64, F64),
            Self::F32DemoteF64 => (F64, F32),
            Self::F64PromoteF32 => (F32, F64),
            Self::I32ReinterpretF32 => (F32, I32),
            Self::I64ReinterpretF64 => (F64, I64),
            Self::F32ReinterpretI32 => (I32, F32),
            Self::F64ReinterpretI64 => (I64, F64),
        }
    }
}

/// A single validated instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Box<[u32]>, default: u32 },
    Return,
    Call(FuncIndex),
    CallIndirect(TypeIndex),
    Drop,
    Select,
    LocalGet(LocalIndex),
    LocalSet(LocalIndex),
    LocalTee(LocalIndex),
    GlobalGet(GlobalIndex),
    GlobalSet(GlobalIndex),
    Load { kind: LoadKind, offset: u64 },
    Store { kind: StoreKind, offset: u64 },
    MemorySize,
    MemoryGrow,
    MemoryCopy,
    MemoryFill,
    MemoryInit(DataIndex),
    DataDrop(DataIndex),
    TableInit(ElemIndex),
    ElemDrop(ElemIndex),
    TableCopy,
    /// A constant, as raw bits of its type.
    Const(ValType, u64),
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

impl Op {
    /// Converts a validated `wasmparser` operator.
    ///
    /// Operators from proposals neither engine executes, vector instructions for example,
    /// are rejected with [`Error::Unsupported`](crate::Error::Unsupported).
    pub fn from_wasmparser(op: &wasmparser::Operator<'_>, offset: usize) -> crate::Result<Self> {
        use wasmparser::Operator as O;

        fn mem(memarg: wasmparser::MemArg) -> crate::Result<u64> {
            if memarg.memory != 0 {
                return Err(wasm_unsupported!("multiple memories"));
            }
            Ok(memarg.offset)
        }

        Ok(match *op {
            O::Unreachable => Self::Unreachable,
            O::Nop => Self::Nop,
            O::Block { blockty } => Self::Block(BlockType::from_wasmparser(blockty)?),
            O::Loop { blockty } => Self::Loop(BlockType::from_wasmparser(blockty)?),
            O::If { blockty } => Self::If(BlockType::from_wasmparser(blockty)?),
            O::Else => Self::Else,
            O::End => Self::End,
            O::Br { relative_depth } => Self::Br(relative_depth),
            O::BrIf { relative_depth } => Self::BrIf(relative_depth),
            O::BrTable { ref targets } => Self::BrTable {
                targets: targets.targets().collect::<Result<_, _>>()?,
                default: targets.default(),
            },
            O::Return => Self::Return,
            O::Call { function_index } => Self::Call(FuncIndex::from_u32(function_index)),
            O::CallIndirect {
                type_index,
                table_index: 0,
            } => Self::CallIndirect(TypeIndex::from_u32(type_index)),
            O::Drop => Self::Drop,
            O::Select => Self::Select,
            O::TypedSelect { ty } => {
                ValType::from_wasmparser(ty)?;
                Self::Select
            }
            O::LocalGet { local_index } => Self::LocalGet(LocalIndex::from_u32(local_index)),
            O::LocalSet { local_index } => Self::LocalSet(LocalIndex::from_u32(local_index)),
            O::LocalTee { local_index } => Self::LocalTee(LocalIndex::from_u32(local_index)),
            O::GlobalGet { global_index } => Self::GlobalGet(GlobalIndex::from_u32(global_index)),
            O::GlobalSet { global_index } => Self::GlobalSet(GlobalIndex::from_u32(global_index)),

            O::I32Load { memarg } => Self::load(LoadKind::I32, mem(memarg)?),
            O::I64Load { memarg } => Self::load(LoadKind::I64, mem(memarg)?),
            O::F32Load { memarg } => Self::load(LoadKind::F32, mem(memarg)?),
            O::F64Load { memarg } => Self::load(LoadKind::F64, mem(memarg)?),
            O::I32Load8S { memarg } => Self::load(LoadKind::I32_8S, mem(memarg)?),
            O::I32Load8U { memarg } => Self::load(LoadKind::I32_8U, mem(memarg)?),
            O::I32Load16S { memarg } => Self::load(LoadKind::I32_16S, mem(memarg)?),
            O::I32Load16U { memarg } => Self::load(LoadKind::I32_16U, mem(memarg)?),
            O::I64Load8S { memarg } => Self::load(LoadKind::I64_8S, mem(memarg)?),
            O::I64Load8U { memarg } => Self::load(LoadKind::I64_8U, mem(memarg)?),
            O::I64Load16S { memarg } => Self::load(LoadKind::I64_16S, mem(memarg)?),
            O::I64Load16U { memarg } => Self::load(LoadKind::I64_16U, mem(memarg)?),
            O::I64Load32S { memarg } => Self::load(LoadKind::I64_32S, mem(memarg)?),
            O::I64Load32U { memarg } => Self::load(LoadKind::I64_32U, mem(memarg)?),
            O::I32Store { memarg } => Self::store(StoreKind::I32, mem(memarg)?),
            O::I64Store { memarg } => Self::store(StoreKind::I64, mem(memarg)?),
            O::F32Store { memarg } => Self::store(StoreKind::F32, mem(memarg)?),
            O::F64Store { memarg } => Self::store(StoreKind::F64, mem(memarg)?),
            O::I32Store8 { memarg } => Self::store(StoreKind::I32_8, mem(memarg)?),
            O::I32Store16 { memarg } => Self::store(StoreKind::I32_16, mem(memarg)?),
            O::I64Store8 { memarg } => Self::store(StoreKind::I64_8, mem(memarg)?),
            O::I64Store16 { memarg } => Self::store(StoreKind::I64_16, mem(memarg)?),
            O::I64Store32 { memarg } => Self::store(StoreKind::I64_32, mem(memarg)?),
            O::MemorySize { mem: 0 } => Self::MemorySize,
            O::MemoryGrow { mem: 0 } => Self::MemoryGrow,
            O::MemoryCopy {
                dst_mem: 0,
                src_mem: 0,
            } => Self::MemoryCopy,
            O::MemoryFill { mem: 0 } => Self::MemoryFill,
            O::MemoryInit { data_index, mem: 0 } => Self::MemoryInit(DataIndex::from_u32(data_index)),
            O::DataDrop { data_index } => Self::DataDrop(DataIndex::from_u32(data_index)),
            O::TableInit {
                elem_index,
                table: 0,
            } => Self::TableInit(ElemIndex::from_u32(elem_index)),
            O::ElemDrop { elem_index } => Self::ElemDrop(ElemIndex::from_u32(elem_index)),
            O::TableCopy {
                dst_table: 0,
                src_table: 0,
            } => Self::TableCopy,

            O::I32Const { value } => Self::Const(ValType::I32, u64::from(value as u32)),
            O::I64Const { value } => Self::Const(ValType::I64, value as u64),
            O::F32Const { value } => Self::Const(ValType::F32, u64::from(value.bits())),
            O::F64Const { value } => Self::Const(ValType::F64, value.bits()),

            O::I32Eqz => Self::I32Eqz,
            O::I32Eq => Self::I32Cmp(ICmp::Eq),
            O::I32Ne => Self::I32Cmp(ICmp::Ne),
            O::I32LtS => Self::I32Cmp(ICmp::LtS),
            O::I32LtU => Self::I32Cmp(ICmp::LtU),
            O::I32GtS => Self::I32Cmp(ICmp::GtS),
            O::I32GtU => Self::I32Cmp(ICmp::GtU),
            O::I32LeS => Self::I32Cmp(ICmp::LeS),
            O::I32LeU => Self::I32Cmp(ICmp::LeU),
            O::I32GeS => Self::I32Cmp(ICmp::GeS),
            O::I32GeU => Self::I32Cmp(ICmp::GeU),
            O::I64Eqz => Self::I64Eqz,
            O::I64Eq => Self::I64Cmp(ICmp::Eq),
            O::I64Ne => Self::I64Cmp(ICmp::Ne),
            O::I64LtS => Self::I64Cmp(ICmp::LtS),
            O::I64LtU => Self::I64Cmp(ICmp::LtU),
            O::I64GtS => Self::I64Cmp(ICmp::GtS),
            O::I64GtU => Self::I64Cmp(ICmp::GtU),
            O::I64LeS => Self::I64Cmp(ICmp::LeS),
            O::I64LeU => Self::I64Cmp(ICmp::LeU),
            O::I64GeS => Self::I64Cmp(ICmp::GeS),
            O::I64GeU => Self::I64Cmp(ICmp::GeU),
            O::F32Eq => Self::F32Cmp(FCmp::Eq),
            O::F32Ne => Self::F32Cmp(FCmp::Ne),
            O::F32Lt => Self::F32Cmp(FCmp::Lt),
            O::F32Gt => Self::F32Cmp(FCmp::Gt),
            O::F32Le => Self::F32Cmp(FCmp::Le),
            O::F32Ge => Self::F32Cmp(FCmp::Ge),
            O::F64Eq => Self::F64Cmp(FCmp::Eq),
            O::F64Ne => Self::F64Cmp(FCmp::Ne),
            O::F64Lt => Self::F64Cmp(FCmp::Lt),
            O::F64Gt => Self::F64Cmp(FCmp::Gt),
            O::F64Le => Self::F64Cmp(FCmp::Le),
            O::F64Ge => Self::F64Cmp(FCmp::Ge),

            O::I32Clz => Self::I32Un(IUnOp::Clz),
            O::I32Ctz => Self::I32Un(IUnOp::Ctz),
            O::I32Popcnt => Self::I32Un(IUnOp::Popcnt),
            O::I32Extend8S => Self::I32Un(IUnOp::Extend8S),
            O::I32Extend16S => Self::I32Un(IUnOp::Extend16S),
            O::I64Clz => Self::I64Un(IUnOp::Clz),
            O::I64Ctz => Self::I64Un(IUnOp::Ctz),
            O::I64Popcnt => Self::I64Un(IUnOp::Popcnt),
            O::I64Extend8S => Self::I64Un(IUnOp::Extend8S),
            O::I64Extend16S => Self::I64Un(IUnOp::Extend16S),
            O::I64Extend32S => Self::I64Un(IUnOp::Extend32S),

            O::I32Add => Self::I32Bin(IBinOp::Add),
            O::I32Sub => Self::I32Bin(IBinOp::Sub),
            O::I32Mul => Self::I32Bin(IBinOp::Mul),
            O::I32DivS => Self::I32Bin(IBinOp::DivS),
            O::I32DivU => Self::I32Bin(IBinOp::DivU),
            O::I32RemS => Self::I32Bin(IBinOp::RemS),
            O::I32RemU => Self::I32Bin(IBinOp::RemU),
            O::I32And => Self::I32Bin(IBinOp::And),
            O::I32Or => Self::I32Bin(IBinOp::Or),
            O::I32Xor => Self::I32Bin(IBinOp::Xor),
            O::I32Shl => Self::I32Bin(IBinOp::Shl),
            O::I32ShrS => Self::I32Bin(IBinOp::ShrS),
            O::I32ShrU => Self::I32Bin(IBinOp::ShrU),
            O::I32Rotl => Self::I32Bin(IBinOp::Rotl),
            O::I32Rotr => Self::I32Bin(IBinOp::Rotr),
            O::I64Add => Self::I64Bin(IBinOp::Add),
            O::I64Sub => Self::I64Bin(IBinOp::Sub),
            O::I64Mul => Self::I64Bin(IBinOp::Mul),
            O::I64DivS => Self::I64Bin(IBinOp::DivS),
            O::I64DivU => Self::I64Bin(IBinOp::DivU),
            O::I64RemS => Self::I64Bin(IBinOp::RemS),
            O::I64RemU => Self::I64Bin(IBinOp::RemU),
            O::I64And => Self::I64Bin(IBinOp::And),
            O::I64Or => Self::I64Bin(IBinOp::Or),
            O::I64Xor => Self::I64Bin(IBinOp::Xor),
            O::I64Shl => Self::I64Bin(IBinOp::Shl),
            O::I64ShrS => Self::I64Bin(IBinOp::ShrS),
            O::I64ShrU => Self::I64Bin(IBinOp::ShrU),
            O::I64Rotl => Self::I64Bin(IBinOp::Rotl),
            O::I64Rotr => Self::I64Bin(IBinOp::Rotr),

            O::F32Abs => Self::F32Un(FUnOp::Abs),
            O::F32Neg => Self::F32Un(FUnOp::Neg),
            O::F32Ceil => Self::F32Un(FUnOp::Ceil),
            O::F32Floor => Self::F32Un(FUnOp::Floor),
            O::F32Trunc => Self::F32Un(FUnOp::Trunc),
            O::F32Nearest => Self::F32Un(FUnOp::Nearest),
            O::F32Sqrt => Self::F32Un(FUnOp::Sqrt),
            O::F32Add => Self::F32Bin(FBinOp::Add),
            O::F32Sub => Self::F32Bin(FBinOp::Sub),
            O::F32Mul => Self::F32Bin(FBinOp::Mul),
            O::F32Div => Self::F32Bin(FBinOp::Div),
            O::F32Min => Self::F32Bin(FBinOp::Min),
            O::F32Max => Self::F32Bin(FBinOp::Max),
            O::F32Copysign => Self::F32Bin(FBinOp::Copysign),
            O::F64Abs => Self::F64Un(FUnOp::Abs),
            O::F64Neg => Self::F64Un(FUnOp::Neg),
            O::F64Ceil => Self::F64Un(FUnOp::Ceil),
            O::F64Floor => Self::F64Un(FUnOp::Floor),
            O::F64Trunc => Self::F64Un(FUnOp::Trunc),
            O::F64Nearest => Self::F64Un(FUnOp::Nearest),
            O::F64Sqrt => Self::F64Un(FUnOp::Sqrt),
            O::F64Add => Self::F64Bin(FBinOp::Add),
            O::F64Sub => Self::F64Bin(FBinOp::Sub),
            O::F64Mul => Self::F64Bin(FBinOp::Mul),
            O::F64Div => Self::F64Bin(FBinOp::Div),
            O::F64Min => Self::F64Bin(FBinOp::Min),
            O::F64Max => Self::F64Bin(FBinOp::Max),
            O::F64Copysign => Self::F64Bin(FBinOp::Copysign),

            O::I32WrapI64 => Self::Convert(ConvOp::I32WrapI64),
            O::I64ExtendI32S => Self::Convert(ConvOp::I64ExtendI32S),
            O::I64ExtendI32U => Self::Convert(ConvOp::I64ExtendI32U),
            O::I32TruncF32S => Self::Convert(ConvOp::I32TruncF32S),
            O::I32TruncF32U => Self::Convert(ConvOp::I32TruncF32U),
            O::I32TruncF64S => Self::Convert(ConvOp::I32TruncF64S),
            O::I32TruncF64U => Self::Convert(ConvOp::I32TruncF64U),
            O::I64TruncF32S => Self::Convert(ConvOp::I64TruncF32S),
            O::I64TruncF32U => Self::Convert(ConvOp::I64TruncF32U),
            O::I64TruncF64S => Self::Convert(ConvOp::I64TruncF64S),
            O::I64TruncF64U => Self::Convert(ConvOp::I64TruncF64U),
            O::I32TruncSatF32S => Self::Convert(ConvOp::I32TruncSatF32S),
            O::I32TruncSatF32U => Self::Convert(ConvOp::I32TruncSatF32U),
            O::I32TruncSatF64S => Self::Convert(ConvOp::I32TruncSatF64S),
            O::I32TruncSatF64U => Self::Convert(ConvOp::I32TruncSatF64U),
            O::I64TruncSatF32S => Self::Convert(ConvOp::I64TruncSatF32S),
            O::I64TruncSatF32U => Self::Convert(ConvOp::I64TruncSatF32U),
            O::I64TruncSatF64S => Self::Convert(ConvOp::I64TruncSatF64S),
            O::I64TruncSatF64U => Self::Convert(ConvOp::I64TruncSatF64U),
            O::F32ConvertI32S => Self::Convert(ConvOp::F32ConvertI32S),
            O::F32ConvertI32U => Self::Convert(ConvOp::F32ConvertI32U),
            O::F32ConvertI64S => Self::Convert(ConvOp::F32ConvertI64S),
            O::F32ConvertI64U => Self::Convert(ConvOp::F32ConvertI64U),
            O::F64ConvertI32S => Self::Convert(ConvOp::F64ConvertI32S),
            O::F64ConvertI32U => Self::Convert(ConvOp::F64ConvertI32U),
            O::F64ConvertI64S => Self::Convert(ConvOp::F64ConvertI64S),
            O::F64ConvertI64U => Self::Convert(ConvOp::F64ConvertI64U),
            O::F32DemoteF64 => Self::Convert(ConvOp::F32DemoteF64),
            O::F64PromoteF32 => Self::Convert(ConvOp::F64PromoteF32),
            O::I32ReinterpretF32 => Self::Convert(ConvOp::I32ReinterpretF32),
            O::I64ReinterpretF64 => Self::Convert(ConvOp::I64ReinterpretF64),
            O::F32ReinterpretI32 => Self::Convert(ConvOp::F32ReinterpretI32),
            O::F64ReinterpretI64 => Self::Convert(ConvOp::F64ReinterpretI64),

            ref op => {
                return Err(wasm_unsupported!(
                    "unsupported operator at offset {offset:#x}: {op:?}"
                ));
            }
        })
    }

    fn load(kind: LoadKind, offset: u64) -> Self {
        Self::Load { kind, offset }
    }

    fn store(kind: StoreKind, offset: u64) -> Self {
        Self::Store { kind, offset }
    }
}
