// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use std::io;

use wasmparser::WasmFeatures;

use crate::sys::{Nanotime, Walltime};

use crate::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STACK_SLOTS, WASM32_MAX_PAGES};

/// Which execution engine a [`Runtime`](crate::Runtime) uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Use the compiler where the host supports it, the interpreter otherwise.
    #[default]
    Auto,
    /// Always use the interpreter.
    Interpreter,
    /// Always use the compiler, failing on hosts it does not support.
    Compiler,
}

/// Global runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) features: WasmFeatures,
    pub(crate) strategy: Strategy,
    pub(crate) max_call_depth: u32,
    pub(crate) max_stack_slots: u32,
    pub(crate) memory_limit_pages: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            features: Self::default_features(),
            strategy: Strategy::Auto,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_stack_slots: DEFAULT_MAX_STACK_SLOTS,
            memory_limit_pages: WASM32_MAX_PAGES,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// The proposals enabled unless configured otherwise.
    ///
    /// `GC_TYPES` only admits the `funcref` type MVP tables need, the garbage collection
    /// proposal itself stays disabled.
    pub fn default_features() -> WasmFeatures {
        WasmFeatures::MUTABLE_GLOBAL
            | WasmFeatures::SATURATING_FLOAT_TO_INT
            | WasmFeatures::SIGN_EXTENSION
            | WasmFeatures::MULTI_VALUE
            | WasmFeatures::BULK_MEMORY
            | WasmFeatures::FLOATS
            | WasmFeatures::GC_TYPES
    }

    /// Sets the WebAssembly proposals the validator accepts.
    pub fn wasm_features(&mut self, features: WasmFeatures) -> &mut Self {
        self.features = features;
        self
    }

    /// Enables or disables the fixed-width SIMD proposal.
    ///
    /// Vector instructions pass validation when enabled but neither engine executes them, so
    /// compiling a module that uses them fails with [`Error::Unsupported`](crate::Error::Unsupported).
    pub fn wasm_simd(&mut self, enable: bool) -> &mut Self {
        self.features.set(WasmFeatures::SIMD, enable);
        self
    }

    pub fn strategy(&mut self, strategy: Strategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Sets the maximum number of nested guest function activations before a call traps with
    /// [`Trap::StackOverflow`](crate::Trap::StackOverflow).
    pub fn max_call_depth(&mut self, depth: u32) -> &mut Self {
        self.max_call_depth = depth;
        self
    }

    /// Sets how many value slots the activations of one call may occupy together.
    ///
    /// Every activation is charged for its parameters, locals and the deepest operand stack of
    /// its body. Exceeding the budget traps with
    /// [`Trap::StackOverflow`](crate::Trap::StackOverflow), in both engines at the same call.
    pub fn max_stack_slots(&mut self, slots: u32) -> &mut Self {
        self.max_stack_slots = slots;
        self
    }

    /// Sets the absolute ceiling for linear memory, in pages.
    pub fn memory_limit_pages(&mut self, pages: u32) -> &mut Self {
        self.memory_limit_pages = pages.min(WASM32_MAX_PAGES);
        self
    }

    pub fn features(&self) -> WasmFeatures {
        self.features
    }
}

/// Per-instantiation configuration.
#[derive(Default)]
pub struct ModuleConfig {
    pub(crate) name: Option<String>,
    pub(crate) skip_start: bool,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) stdin: Option<Box<dyn io::Read + Send>>,
    pub(crate) stdout: Option<Box<dyn io::Write + Send>>,
    pub(crate) stderr: Option<Box<dyn io::Write + Send>>,
    pub(crate) walltime: Option<Box<dyn Walltime>>,
    pub(crate) nanotime: Option<Box<dyn Nanotime>>,
    pub(crate) random: Option<Box<dyn io::Read + Send>>,
    pub(crate) deterministic_seed: Option<u64>,
}

impl fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("name", &self.name)
            .field("skip_start", &self.skip_start)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("deterministic_seed", &self.deterministic_seed)
            .finish_non_exhaustive()
    }
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the instance, overriding the name section. Named instances are registered in their
    /// namespace so later instantiations can import their exports.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Skips running the start function during instantiation.
    #[must_use]
    pub fn with_start_disabled(mut self) -> Self {
        self.skip_start = true;
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl io::Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    /// Binds the guest's standard output. Output is discarded by default.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl io::Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    /// Binds the guest's standard error. Output is discarded by default.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl io::Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    #[must_use]
    pub fn with_walltime(mut self, clock: impl Walltime + 'static) -> Self {
        self.walltime = Some(Box::new(clock));
        self
    }

    #[must_use]
    pub fn with_nanotime(mut self, clock: impl Nanotime + 'static) -> Self {
        self.nanotime = Some(Box::new(clock));
        self
    }

    /// Overrides the random source, by default a ChaCha20 generator seeded by the OS.
    #[must_use]
    pub fn with_random_source(mut self, source: impl io::Read + Send + 'static) -> Self {
        self.random = Some(Box::new(source));
        self
    }

    /// Fixes the clocks and seeds the random source so runs are reproducible.
    #[must_use]
    pub fn with_deterministic_sys(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }
}
