// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::fmt;

use crate::wasm_unsupported;

/// The type of a WebAssembly value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }

    pub(crate) fn from_wasmparser(ty: wasmparser::ValType) -> crate::Result<Self> {
        match ty {
            wasmparser::ValType::I32 => Ok(Self::I32),
            wasmparser::ValType::I64 => Ok(Self::I64),
            wasmparser::ValType::F32 => Ok(Self::F32),
            wasmparser::ValType::F64 => Ok(Self::F64),
            wasmparser::ValType::V128 => Err(wasm_unsupported!("v128 value type")),
            wasmparser::ValType::Ref(ty) => Err(wasm_unsupported!("reference value type {ty:?}")),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// The number of value slots needed to pass the parameters in and the results out.
    pub(crate) fn value_slots(&self) -> usize {
        self.params.len().max(self.results.len())
    }

    pub(crate) fn from_wasmparser(ty: &wasmparser::FuncType) -> crate::Result<Self> {
        let params = ty
            .params()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<crate::Result<_>>()?;
        let results = ty
            .results()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<crate::Result<_>>()?;
        Ok(Self { params, results })
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(func")?;
        if !self.params.is_empty() {
            f.write_str(" (param")?;
            for ty in &self.params {
                write!(f, " {ty}")?;
            }
            f.write_str(")")?;
        }
        if !self.results.is_empty() {
            f.write_str(" (result")?;
            for ty in &self.results {
                write!(f, " {ty}")?;
            }
            f.write_str(")")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content_type: ValType,
    pub mutable: bool,
}

impl GlobalType {
    pub(crate) fn from_wasmparser(ty: wasmparser::GlobalType) -> crate::Result<Self> {
        if ty.shared {
            return Err(wasm_unsupported!("shared globals"));
        }
        Ok(Self {
            content_type: ValType::from_wasmparser(ty.content_type)?,
            mutable: ty.mutable,
        })
    }
}

/// Linear memory limits in units of WebAssembly pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub minimum: u32,
    pub maximum: Option<u32>,
}

impl MemoryType {
    pub(crate) fn from_wasmparser(ty: wasmparser::MemoryType) -> crate::Result<Self> {
        if ty.memory64 {
            return Err(wasm_unsupported!("64-bit linear memory"));
        }
        if ty.shared {
            return Err(wasm_unsupported!("shared linear memory"));
        }
        if ty.page_size_log2.is_some() {
            return Err(wasm_unsupported!("custom page sizes"));
        }
        // The validator caps wasm32 memories at 65536 pages, so these always fit.
        let minimum = u32::try_from(ty.initial)
            .map_err(|_| wasm_unsupported!("memory minimum {} out of range", ty.initial))?;
        let maximum = ty
            .maximum
            .map(|max| {
                u32::try_from(max).map_err(|_| wasm_unsupported!("memory maximum {max} out of range"))
            })
            .transpose()?;
        Ok(Self { minimum, maximum })
    }
}

/// A table of function references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableType {
    pub minimum: u32,
    pub maximum: Option<u32>,
}

impl TableType {
    pub(crate) fn from_wasmparser(ty: wasmparser::TableType) -> crate::Result<Self> {
        if !ty.element_type.is_func_ref() {
            return Err(wasm_unsupported!("table of {:?}", ty.element_type));
        }
        if ty.table64 {
            return Err(wasm_unsupported!("64-bit tables"));
        }
        let minimum = u32::try_from(ty.initial)
            .map_err(|_| wasm_unsupported!("table minimum {} out of range", ty.initial))?;
        let maximum = ty
            .maximum
            .map(|max| {
                u32::try_from(max).map_err(|_| wasm_unsupported!("table maximum {max} out of range"))
            })
            .transpose()?;
        Ok(Self { minimum, maximum })
    }
}

/// The type of an imported or exported entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityType {
    Function(FuncType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl EntityType {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            EntityType::Function(_) => "function",
            EntityType::Table(_) => "table",
            EntityType::Memory(_) => "memory",
            EntityType::Global(_) => "global",
        }
    }
}
