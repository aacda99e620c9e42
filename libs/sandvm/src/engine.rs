// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::fmt::Debug;

use crate::compiler::{self, Compiler};
use crate::config::{Config, Strategy};
use crate::errors::Error;
use crate::indices::DefinedFuncIndex;
use crate::instance::Activation;
use crate::interpreter::Interpreter;
use crate::module::Module;
use crate::values::VMVal;

/// Turns validated modules into executable code.
///
/// Both engines share instantiation, host calls and traps; they only differ in how function
/// bodies run and must produce bit-identical results for the same inputs.
pub(crate) trait Engine: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn compile(&self, module: &Arc<Module>) -> crate::Result<Arc<dyn CompiledCode>>;
}

/// Executable code for all defined functions of one module.
pub(crate) trait CompiledCode: Send + Sync {
    fn engine_name(&self) -> &'static str;

    /// Runs `func` to completion.
    ///
    /// `values` holds the arguments on entry and receives the results, it is at least as long
    /// as the larger of the two.
    fn invoke(
        &self,
        cx: &mut Activation<'_>,
        func: DefinedFuncIndex,
        values: &mut [VMVal],
    ) -> crate::Result<()>;
}

/// Picks the engine for `config`.
pub(crate) fn select(config: &Config) -> crate::Result<Arc<dyn Engine>> {
    let engine: Arc<dyn Engine> = match config.strategy {
        Strategy::Interpreter => Arc::new(Interpreter),
        Strategy::Compiler if compiler::is_supported() => Arc::new(Compiler::new()?),
        Strategy::Compiler => {
            return Err(Error::Unsupported(
                "the compiler does not support this host".into(),
            ));
        }
        Strategy::Auto if compiler::is_supported() => Arc::new(Compiler::new()?),
        Strategy::Auto => Arc::new(Interpreter),
    };

    tracing::debug!(engine = engine.name(), "selected engine");
    Ok(engine)
}
