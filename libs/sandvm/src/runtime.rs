// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{Config, ModuleConfig};
use crate::engine::{self, Engine};
use crate::errors::Error;
use crate::instance::Instance;
use crate::module::{CompiledModule, Module};
use crate::namespace::Namespace;

/// The entry point of the embedding API: compiles modules with the configured engine and owns
/// the namespaces they are instantiated into.
pub struct Runtime {
    config: Config,
    engine: Arc<dyn Engine>,
    default_namespace: Namespace,
    namespaces: spin::Mutex<Vec<Namespace>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("engine", &self.engine.name())
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime, selecting the engine according to `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] if the compiler was requested explicitly but the host does
    /// not support it.
    pub fn new(config: Config) -> crate::Result<Self> {
        let engine = engine::select(&config)?;
        Ok(Self {
            config,
            engine,
            default_namespace: Namespace::new(),
            namespaces: spin::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The name of the active engine, `"interpreter"` or `"compiler"`.
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Decodes, validates and compiles `bytes`.
    pub fn compile(&self, bytes: &[u8]) -> crate::Result<CompiledModule> {
        let module = Arc::new(Module::from_binary(&self.config, bytes)?);
        let code = self.engine.compile(&module)?;
        tracing::debug!(
            module = module.name().unwrap_or("<unnamed>"),
            engine = self.engine.name(),
            "compiled module"
        );
        Ok(CompiledModule::new(&self.config, module, code))
    }

    /// Instantiates `module` into the default namespace.
    pub fn instantiate(
        &self,
        module: &CompiledModule,
        config: ModuleConfig,
    ) -> crate::Result<Instance> {
        self.default_namespace.instantiate(module, config)
    }

    /// The namespace [`Runtime::instantiate`] uses.
    pub fn namespace(&self) -> &Namespace {
        &self.default_namespace
    }

    /// Creates an empty namespace that is closed together with the runtime.
    pub fn new_namespace(&self) -> Namespace {
        let namespace = Namespace::new();
        self.namespaces.lock().push(namespace.clone());
        namespace
    }

    /// Closes every namespace this runtime created, and with them all their instances.
    ///
    /// Every namespace is closed even if some fail, the failures are collected into
    /// [`Error::CloseFailed`].
    pub fn close(&self) -> crate::Result<()> {
        let namespaces = core::mem::take(&mut *self.namespaces.lock());

        let mut errors = Vec::new();
        for namespace in core::iter::once(&self.default_namespace).chain(&namespaces) {
            match namespace.close() {
                Ok(()) => {}
                Err(Error::CloseFailed(errs)) => errors.extend(errs),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            tracing::warn!(errors = errors.len(), "errors while closing runtime");
            Err(Error::CloseFailed(errors))
        }
    }
}
