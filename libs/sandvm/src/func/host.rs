// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::iter;
use std::panic::{self, AssertUnwindSafe};

use crate::errors::Error;
use crate::func::typed::WasmTy;
use crate::instance::{Activation, Instance};
use crate::memory::LinearMemory;
use crate::sys::SysContext;
use crate::trap::Trap;
use crate::types::{FuncType, ValType};
use crate::values::{VMVal, Val};

type HostFn = dyn Fn(Caller<'_>, &mut [VMVal]) -> crate::Result<()> + Send + Sync;

/// A host-implemented function that guest code can import.
pub struct HostFunc {
    ty: FuncType,
    func: Box<HostFn>,
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

impl HostFunc {
    /// Creates a host function working on untyped values.
    ///
    /// `func` receives the arguments in the leading slots of the values slice and writes its
    /// results to the leading slots of the same slice. The slice is as long as the larger of the
    /// parameter and result lists of `ty`.
    pub fn new<F>(ty: FuncType, func: F) -> Self
    where
        F: Fn(Caller<'_>, &mut [VMVal]) -> crate::Result<()> + Send + Sync + 'static,
    {
        Self {
            ty,
            func: Box::new(func),
        }
    }

    /// Creates a host function from a Rust closure, deriving its type from the closure's
    /// signature.
    pub fn wrap<Params, Results>(func: impl IntoFunc<Params, Results>) -> Self {
        func.into_func()
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    fn from_closure<F, Params, Results>(func: F) -> Self
    where
        F: Fn(Caller<'_>, Params) -> Results + Send + Sync + 'static,
        Params: HostParams,
        Results: HostResults,
    {
        let ty = FuncType::new(Params::valtypes(), Results::valtypes());
        Self::new(ty, move |caller, values| {
            let params = Params::load(values);
            func(caller, params).store(values)
        })
    }

    /// Calls the function, turning a panic into an [`Error::HostFunction`].
    pub(crate) fn call(&self, caller: Caller<'_>, values: &mut [VMVal]) -> crate::Result<()> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(caller, values))) {
            Ok(res) => res,
            Err(payload) => Err(Error::host(panic_message(&*payload))),
        }
    }

    /// Calls the function without catching panics, for adapters that are themselves called
    /// through [`HostFunc::call`].
    pub(super) fn call_inner(&self, caller: Caller<'_>, values: &mut [VMVal]) -> crate::Result<()> {
        (self.func)(caller, values)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "Box<dyn Any>"
    };
    alloc::format!("host function panicked: {msg}")
}

/// The calling instance, as seen by a host function.
///
/// Gives bounded access to the caller's memory and system context, and lets the host call back
/// into the guest.
pub struct Caller<'a> {
    cx: Activation<'a>,
}

impl fmt::Debug for Caller<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("instance", &self.cx.instance().name())
            .finish_non_exhaustive()
    }
}

impl<'a> Caller<'a> {
    pub(crate) fn new(cx: Activation<'a>) -> Self {
        Self { cx }
    }

    pub fn instance(&self) -> &'a Instance {
        self.cx.instance()
    }

    pub fn sys(&self) -> &'a SysContext {
        self.cx.instance().sys()
    }

    /// The caller's linear memory. Fails with an out-of-bounds trap if the module declares none.
    pub fn memory(&mut self) -> Result<&mut LinearMemory, Trap> {
        self.cx.memory()
    }

    /// Reads a global of the calling instance by export name.
    pub fn get_global(&self, name: &str) -> Option<Val> {
        let module = self.cx.module();
        match module.export(name)? {
            crate::indices::EntityIndex::Global(index) => Some(Val::from_vmval(
                self.cx.state.globals[index.as_u32() as usize],
                module.globals[index].content_type,
            )),
            _ => None,
        }
    }

    /// Requests termination of the calling instance with `code`.
    ///
    /// The first exit request wins: it closes the instance and returns [`Error::Exit`], which the
    /// host function should propagate so the current call ends. Later requests are no-ops
    /// returning `Ok`.
    pub fn exit(&mut self, code: u32) -> crate::Result<()> {
        let instance = self.cx.instance();
        if instance.latch_exit(code) {
            Err(Error::Exit {
                module: String::from(instance.name()),
                code,
            })
        } else {
            Ok(())
        }
    }

    /// Calls an export of the calling instance, reusing the state of the in-flight call.
    pub fn call(&mut self, name: &str, args: &[Val]) -> crate::Result<Vec<Val>> {
        self.cx.call_export(name, args)
    }

    pub fn sub_caller(&mut self) -> Caller<'_> {
        Caller {
            cx: self.cx.reborrow(),
        }
    }
}

/// Closures that can be turned into a [`HostFunc`].
///
/// Implemented for `Fn(A1, .., An) -> R` and `Fn(Caller<'_>, A1, .., An) -> R` where every `Ai`
/// is a [`WasmTy`] and `R` is a [`HostResults`].
pub trait IntoFunc<Params, Results>: Send + Sync + 'static {
    fn into_func(self) -> HostFunc;
}

/// The parameter list of a typed host function.
pub trait HostParams {
    fn valtypes() -> impl Iterator<Item = ValType>;
    fn load(values: &[VMVal]) -> Self;
}

/// The return type of a typed host function: a [`WasmTy`], a tuple of them, or a
/// [`Result`](crate::Result) wrapping either.
pub trait HostResults {
    fn valtypes() -> impl Iterator<Item = ValType>;
    fn store(self, values: &mut [VMVal]) -> crate::Result<()>;
}

macro_rules! impl_into_func {
    ($num:tt $($args:ident)*) => {
        #[allow(non_snake_case, reason = "argument names above are uppercase")]
        impl<F, $($args,)* R> IntoFunc<($($args,)*), R> for F
        where
            F: Fn($($args),*) -> R + Send + Sync + 'static,
            $($args: WasmTy,)*
            R: HostResults,
        {
            fn into_func(self) -> HostFunc {
                HostFunc::from_closure(move |_: Caller<'_>, ($($args,)*): ($($args,)*)| {
                    self($($args),*)
                })
            }
        }

        #[allow(non_snake_case, reason = "argument names above are uppercase")]
        impl<F, $($args,)* R> IntoFunc<(Caller<'_>, $($args,)*), R> for F
        where
            F: Fn(Caller<'_>, $($args),*) -> R + Send + Sync + 'static,
            $($args: WasmTy,)*
            R: HostResults,
        {
            fn into_func(self) -> HostFunc {
                HostFunc::from_closure(move |caller: Caller<'_>, ($($args,)*): ($($args,)*)| {
                    self(caller, $($args),*)
                })
            }
        }
    };
}
for_each_function_signature!(impl_into_func);

macro_rules! impl_host_params_results {
    ($n:tt $($t:ident)*) => {
        #[allow(non_snake_case, reason = "argument names above are uppercase")]
        #[allow(unused_mut, reason = "the zero-arity expansion never advances the iterator")]
        impl<$($t: WasmTy,)*> HostParams for ($($t,)*) {
            fn valtypes() -> impl Iterator<Item = ValType> {
                IntoIterator::into_iter([$($t::valtype(),)*])
            }

            fn load(_values: &[VMVal]) -> Self {
                let mut _slots = _values.iter().copied();
                ($($t::from_vmval(_slots.next().unwrap_or_default()),)*)
            }
        }

        #[allow(non_snake_case, reason = "argument names above are uppercase")]
        #[allow(unused_mut, reason = "the zero-arity expansion never advances the iterator")]
        impl<$($t: WasmTy,)*> HostResults for ($($t,)*) {
            fn valtypes() -> impl Iterator<Item = ValType> {
                IntoIterator::into_iter([$($t::valtype(),)*])
            }

            fn store(self, _values: &mut [VMVal]) -> crate::Result<()> {
                let ($($t,)*) = self;
                let mut _slots = _values.iter_mut();
                $(
                    if let Some(slot) = _slots.next() {
                        *slot = $t.into_vmval();
                    }
                )*
                Ok(())
            }
        }
    };
}
for_each_function_signature!(impl_host_params_results);

impl<T: WasmTy> HostResults for T {
    fn valtypes() -> impl Iterator<Item = ValType> {
        iter::once(T::valtype())
    }

    fn store(self, values: &mut [VMVal]) -> crate::Result<()> {
        values[0] = self.into_vmval();
        Ok(())
    }
}

impl<T: HostResults> HostResults for crate::Result<T> {
    fn valtypes() -> impl Iterator<Item = ValType> {
        T::valtypes()
    }

    fn store(self, values: &mut [VMVal]) -> crate::Result<()> {
        self.and_then(|val| val.store(values))
    }
}
