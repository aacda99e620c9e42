// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A portable engine that executes lowered function bodies directly.

mod exec;
mod lower;
pub(crate) mod num;

use alloc::sync::Arc;

use cranelift_entity::PrimaryMap;

use crate::engine::{CompiledCode, Engine};
use crate::indices::DefinedFuncIndex;
use crate::instance::Activation;
use crate::module::Module;
use crate::values::VMVal;
use lower::LoweredFunc;

pub const ENGINE_NAME: &str = "interpreter";

#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl Engine for Interpreter {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn compile(&self, module: &Arc<Module>) -> crate::Result<Arc<dyn CompiledCode>> {
        let funcs: PrimaryMap<DefinedFuncIndex, LoweredFunc> = module
            .bodies
            .iter()
            .map(|(index, body)| {
                let ty = module.func_type(module.func_index(index));
                lower::lower(module, ty, body)
            })
            .collect();

        tracing::debug!(funcs = funcs.len(), "lowered module");

        Ok(Arc::new(InterpretedCode {
            module: module.clone(),
            funcs,
        }))
    }
}

pub(crate) struct InterpretedCode {
    module: Arc<Module>,
    funcs: PrimaryMap<DefinedFuncIndex, LoweredFunc>,
}

impl CompiledCode for InterpretedCode {
    fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn invoke(
        &self,
        cx: &mut Activation<'_>,
        func: DefinedFuncIndex,
        values: &mut [VMVal],
    ) -> crate::Result<()> {
        exec::execute(self, cx, func, values)
    }
}
