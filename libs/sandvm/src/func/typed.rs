// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec;
use core::fmt;
use core::iter;
use core::marker::PhantomData;

use crate::func::Func;
use crate::types::ValType;
use crate::values::VMVal;

/// A Rust type that corresponds to a WebAssembly value type.
pub trait WasmTy: Send + 'static {
    fn valtype() -> ValType;
    fn from_vmval(raw: VMVal) -> Self;
    fn into_vmval(self) -> VMVal;
}

macro_rules! impl_wasm_ty {
    ($($ty:ty => $valtype:ident, $get:ident, $make:ident;)*) => {
        $(
            impl WasmTy for $ty {
                #[inline]
                fn valtype() -> ValType {
                    ValType::$valtype
                }
                #[inline]
                fn from_vmval(raw: VMVal) -> Self {
                    raw.$get()
                }
                #[inline]
                fn into_vmval(self) -> VMVal {
                    VMVal::$make(self)
                }
            }
        )*
    };
}

impl_wasm_ty! {
    i32 => I32, get_i32, i32;
    u32 => I32, get_u32, u32;
    i64 => I64, get_i64, i64;
    u64 => I64, get_u64, u64;
}

impl WasmTy for f32 {
    #[inline]
    fn valtype() -> ValType {
        ValType::F32
    }
    #[inline]
    fn from_vmval(raw: VMVal) -> Self {
        f32::from_bits(raw.get_f32())
    }
    #[inline]
    fn into_vmval(self) -> VMVal {
        VMVal::f32(self.to_bits())
    }
}

impl WasmTy for f64 {
    #[inline]
    fn valtype() -> ValType {
        ValType::F64
    }
    #[inline]
    fn from_vmval(raw: VMVal) -> Self {
        f64::from_bits(raw.get_f64())
    }
    #[inline]
    fn into_vmval(self) -> VMVal {
        VMVal::f64(self.to_bits())
    }
}

/// The parameters of a [`TypedFunc`], a single [`WasmTy`] or a tuple of them.
pub trait WasmParams: Send {
    fn valtypes() -> impl Iterator<Item = ValType>;
    fn store(self, values: &mut [VMVal]);
}

/// The results of a [`TypedFunc`], a single [`WasmTy`] or a tuple of them.
pub trait WasmResults: Send {
    fn valtypes() -> impl Iterator<Item = ValType>;
    fn load(values: &[VMVal]) -> Self;
}

impl<T: WasmTy> WasmParams for T {
    fn valtypes() -> impl Iterator<Item = ValType> {
        iter::once(T::valtype())
    }
    fn store(self, values: &mut [VMVal]) {
        values[0] = self.into_vmval();
    }
}

impl<T: WasmTy> WasmResults for T {
    fn valtypes() -> impl Iterator<Item = ValType> {
        iter::once(T::valtype())
    }
    fn load(values: &[VMVal]) -> Self {
        T::from_vmval(values[0])
    }
}

macro_rules! impl_wasm_params_results {
    ($n:tt $($t:ident)*) => {
        #[allow(non_snake_case, reason = "argument names above are uppercase")]
        #[allow(unused_mut, reason = "the zero-arity expansion never advances the iterator")]
        impl<$($t: WasmTy,)*> WasmParams for ($($t,)*) {
            fn valtypes() -> impl Iterator<Item = ValType> {
                IntoIterator::into_iter([$($t::valtype(),)*])
            }

            fn store(self, _values: &mut [VMVal]) {
                let ($($t,)*) = self;
                let mut _slots = _values.iter_mut();
                $(
                    if let Some(slot) = _slots.next() {
                        *slot = $t.into_vmval();
                    }
                )*
            }
        }

        #[allow(non_snake_case, reason = "argument names above are uppercase")]
        #[allow(unused_mut, reason = "the zero-arity expansion never advances the iterator")]
        impl<$($t: WasmTy,)*> WasmResults for ($($t,)*) {
            fn valtypes() -> impl Iterator<Item = ValType> {
                IntoIterator::into_iter([$($t::valtype(),)*])
            }

            fn load(_values: &[VMVal]) -> Self {
                let mut _slots = _values.iter().copied();
                ($($t::from_vmval(_slots.next().unwrap_or_default()),)*)
            }
        }
    };
}
for_each_function_signature!(impl_wasm_params_results);

/// A function whose signature was checked against `Params` and `Results` once, so calls skip
/// the dynamic type checks.
pub struct TypedFunc<Params, Results> {
    func: Func,
    _marker: PhantomData<fn(Params) -> Results>,
}

impl<Params, Results> Clone for TypedFunc<Params, Results> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Params, Results> fmt::Debug for TypedFunc<Params, Results> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedFunc").field("func", &self.func).finish()
    }
}

impl<Params, Results> TypedFunc<Params, Results>
where
    Params: WasmParams,
    Results: WasmResults,
{
    pub(super) fn new(func: Func) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }

    pub fn func(&self) -> &Func {
        &self.func
    }

    pub fn call(&self, params: Params) -> crate::Result<Results> {
        let mut values = vec![VMVal::default(); self.func.ty().value_slots()];
        params.store(&mut values);
        self.func
            .instance()
            .invoke_raw(self.func.index(), &mut values)?;
        Ok(Results::load(&values))
    }
}
