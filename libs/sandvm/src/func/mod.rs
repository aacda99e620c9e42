// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

macro_rules! for_each_function_signature {
    ($mac:ident) => {
        $mac!(0);
        $mac!(1 A1);
        $mac!(2 A1 A2);
        $mac!(3 A1 A2 A3);
        $mac!(4 A1 A2 A3 A4);
        $mac!(5 A1 A2 A3 A4 A5);
        $mac!(6 A1 A2 A3 A4 A5 A6);
        $mac!(7 A1 A2 A3 A4 A5 A6 A7);
        $mac!(8 A1 A2 A3 A4 A5 A6 A7 A8);
        $mac!(9 A1 A2 A3 A4 A5 A6 A7 A8 A9);
        $mac!(10 A1 A2 A3 A4 A5 A6 A7 A8 A9 A10);
        $mac!(11 A1 A2 A3 A4 A5 A6 A7 A8 A9 A10 A11);
        $mac!(12 A1 A2 A3 A4 A5 A6 A7 A8 A9 A10 A11 A12);
    };
}

mod host;
mod stack_pointer;
mod typed;

use alloc::vec::Vec;
use core::fmt;

pub use host::{Caller, HostFunc, HostParams, HostResults, IntoFunc};
pub use stack_pointer::StackPointerFunc;
pub use typed::{TypedFunc, WasmParams, WasmResults, WasmTy};

use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::types::FuncType;
use crate::values::Val;

/// A function of an instance, exported or otherwise reachable from the host.
#[derive(Clone)]
pub struct Func {
    instance: Instance,
    index: FuncIndex,
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("instance", &self.instance.name())
            .field("index", &self.index)
            .finish()
    }
}

// ===== impl Func =====

impl Func {
    pub(crate) fn new(instance: Instance, index: FuncIndex) -> Self {
        Self { instance, index }
    }

    pub fn ty(&self) -> &FuncType {
        self.instance.module().func_type(self.index)
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Calls the function with dynamically typed arguments.
    pub fn call(&self, args: &[Val]) -> crate::Result<Vec<Val>> {
        self.instance.call_index(self.index, args)
    }

    /// Checks the function's signature against `Params` and `Results` and returns a statically
    /// typed handle to it.
    pub fn typed<Params, Results>(&self) -> crate::Result<TypedFunc<Params, Results>>
    where
        Params: WasmParams,
        Results: WasmResults,
    {
        let ty = self.ty();
        let params_match = Params::valtypes().eq(ty.params().iter().copied());
        let results_match = Results::valtypes().eq(ty.results().iter().copied());
        if !params_match || !results_match {
            let expected = FuncType::new(Params::valtypes(), Results::valtypes());
            return Err(Error::Type(alloc::format!(
                "function has type {ty}, not {expected}"
            )));
        }

        Ok(TypedFunc::new(self.clone()))
    }

    pub(crate) fn index(&self) -> FuncIndex {
        self.index
    }
}
