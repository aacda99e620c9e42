// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::types::ValType;

/// The raw, untyped representation of a value as stored in globals, the interpreter's value stack
/// and the values array shared with compiled code.
///
/// 32-bit values occupy the low half, the upper half is zero.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct VMVal(u64);

static_assertions::const_assert_eq!(size_of::<VMVal>(), 8);

impl VMVal {
    #[inline]
    pub const fn i32(i: i32) -> Self {
        Self(i as u32 as u64)
    }
    #[inline]
    pub const fn u32(i: u32) -> Self {
        Self(i as u64)
    }
    #[inline]
    pub const fn i64(i: i64) -> Self {
        Self(i as u64)
    }
    #[inline]
    pub const fn u64(i: u64) -> Self {
        Self(i)
    }
    #[inline]
    pub const fn f32(bits: u32) -> Self {
        Self(bits as u64)
    }
    #[inline]
    pub const fn f64(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn get_i32(self) -> i32 {
        self.0 as u32 as i32
    }
    #[inline]
    pub const fn get_u32(self) -> u32 {
        self.0 as u32
    }
    #[inline]
    pub const fn get_i64(self) -> i64 {
        self.0 as i64
    }
    #[inline]
    pub const fn get_u64(self) -> u64 {
        self.0
    }
    #[inline]
    pub const fn get_f32(self) -> u32 {
        self.get_u32()
    }
    #[inline]
    pub const fn get_f64(self) -> u64 {
        self.0
    }
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VMVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VMVal({:#018x})", self.0)
    }
}

/// A typed WebAssembly value.
///
/// Floats are carried as their bit patterns so NaN payloads survive a round trip through the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
}

impl Val {
    pub const fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// The zero value of the given type, used to initialize locals.
    pub const fn default_for_ty(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
        }
    }

    pub fn to_vmval(self) -> VMVal {
        match self {
            Val::I32(v) => VMVal::i32(v),
            Val::I64(v) => VMVal::i64(v),
            Val::F32(v) => VMVal::f32(v),
            Val::F64(v) => VMVal::f64(v),
        }
    }

    pub fn from_vmval(raw: VMVal, ty: ValType) -> Self {
        match ty {
            ValType::I32 => Val::I32(raw.get_i32()),
            ValType::I64 => Val::I64(raw.get_i64()),
            ValType::F32 => Val::F32(raw.get_f32()),
            ValType::F64 => Val::F64(raw.get_f64()),
        }
    }

    pub fn i32(&self) -> Option<i32> {
        if let Val::I32(v) = self { Some(*v) } else { None }
    }

    pub fn i64(&self) -> Option<i64> {
        if let Val::I64(v) = self { Some(*v) } else { None }
    }

    pub fn f32(&self) -> Option<f32> {
        if let Val::F32(v) = self { Some(f32::from_bits(*v)) } else { None }
    }

    pub fn f64(&self) -> Option<f64> {
        if let Val::F64(v) = self { Some(f64::from_bits(*v)) } else { None }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::I32(v) => write!(f, "{v}:i32"),
            Val::I64(v) => write!(f, "{v}:i64"),
            Val::F32(v) => write!(f, "{}:f32", f32::from_bits(*v)),
            Val::F64(v) => write!(f, "{}:f64", f64::from_bits(*v)),
        }
    }
}

impl From<i32> for Val {
    fn from(value: i32) -> Self {
        Val::I32(value)
    }
}

impl From<i64> for Val {
    fn from(value: i64) -> Self {
        Val::I64(value)
    }
}

impl From<f32> for Val {
    fn from(value: f32) -> Self {
        Val::F32(value.to_bits())
    }
}

impl From<f64> for Val {
    fn from(value: f64) -> Self {
        Val::F64(value.to_bits())
    }
}
