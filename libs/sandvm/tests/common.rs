// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use sandvm::{
    Compiler, Config, Error, Instance, ModuleConfig, Namespace, Runtime, Strategy, Trap, Val,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

pub fn trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// The engines available on this host.
pub fn strategies() -> Vec<Strategy> {
    if Compiler::is_supported() {
        vec![Strategy::Interpreter, Strategy::Compiler]
    } else {
        vec![Strategy::Interpreter]
    }
}

pub fn runtime(strategy: Strategy) -> Runtime {
    Runtime::new(Config::default().strategy(strategy).clone()).unwrap()
}

/// Runs one script against an instance of the same module on every available engine and checks
/// that all of them agree bit for bit.
pub struct Harness {
    instances: Vec<(Strategy, Instance)>,
}

impl Harness {
    pub fn new(wat: &str) -> Self {
        Self::with_imports(wat, |_| {})
    }

    /// Like [`Harness::new`], `define` populates each engine's namespace before instantiation.
    pub fn with_imports(wat: &str, define: impl Fn(&Namespace)) -> Self {
        Self::build(wat, |_| {}, define)
    }

    /// Like [`Harness::new`], `configure` adjusts each engine's runtime configuration.
    pub fn with_config(wat: &str, configure: impl Fn(&mut Config)) -> Self {
        Self::build(wat, configure, |_| {})
    }

    fn build(wat: &str, configure: impl Fn(&mut Config), define: impl Fn(&Namespace)) -> Self {
        let wasm = wat::parse_str(wat).unwrap();
        let instances = strategies()
            .into_iter()
            .map(|strategy| {
                let mut config = Config::default();
                configure(config.strategy(strategy));
                let rt = Runtime::new(config).unwrap();
                define(rt.namespace());
                let module = rt.compile(&wasm).unwrap();
                let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();
                (strategy, instance)
            })
            .collect();
        Self { instances }
    }

    fn each(&self, name: &str, args: &[Val]) -> Vec<(Strategy, sandvm::Result<Vec<Val>>)> {
        self.instances
            .iter()
            .map(|(strategy, instance)| (*strategy, instance.call(name, args)))
            .collect()
    }

    /// Calls `name` and returns the results all engines agreed on.
    pub fn invoke(&self, name: &str, args: &[Val]) -> Vec<Val> {
        let mut agreed = None;
        for (strategy, res) in self.each(name, args) {
            let res = res.unwrap_or_else(|e| panic!("{strategy:?}: {name}{args:?} failed: {e}"));
            match &agreed {
                None => agreed = Some(res),
                Some(expected) => assert_eq!(&res, expected, "{strategy:?}: {name}{args:?}"),
            }
        }
        agreed.unwrap()
    }

    /// Calls `name` and returns the outcome all engines agreed on, a trap counts as an outcome.
    pub fn outcome(&self, name: &str, args: &[Val]) -> Result<Vec<Val>, Trap> {
        let mut agreed = None;
        for (strategy, res) in self.each(name, args) {
            let res = match res {
                Ok(results) => Ok(results),
                Err(Error::Trap(trap)) => Err(trap),
                Err(e) => panic!("{strategy:?}: {name}{args:?} failed: {e}"),
            };
            match &agreed {
                None => agreed = Some(res),
                Some(expected) => assert_eq!(&res, expected, "{strategy:?}: {name}{args:?}"),
            }
        }
        agreed.unwrap()
    }

    pub fn assert_return(&self, name: &str, args: &[Val], expected: &[Val]) {
        for (strategy, res) in self.each(name, args) {
            match res {
                Ok(results) => assert_eq!(results, expected, "{strategy:?}: {name}{args:?}"),
                Err(e) => panic!("{strategy:?}: {name}{args:?} failed: {e}"),
            }
        }
    }

    pub fn assert_trap(&self, name: &str, args: &[Val], expected: Trap) {
        for (strategy, res) in self.each(name, args) {
            match res {
                Err(Error::Trap(trap)) => {
                    assert_eq!(trap, expected, "{strategy:?}: {name}{args:?}");
                }
                other => panic!("{strategy:?}: {name}{args:?} expected trap {expected}, got {other:?}"),
            }
        }
    }

    pub fn assert_exit(&self, name: &str, args: &[Val], code: u32) {
        for (strategy, res) in self.each(name, args) {
            match res {
                Err(e) => assert_eq!(e.exit_code(), Some(code), "{strategy:?}: {name}{args:?}"),
                Ok(results) => panic!("{strategy:?}: {name}{args:?} returned {results:?}"),
            }
        }
        for (strategy, instance) in &self.instances {
            assert!(instance.is_closed(), "{strategy:?}");
            assert_eq!(instance.exit_code(), Some(code), "{strategy:?}");
        }
    }
}

/// A writer that can be inspected after it was moved into an instance.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn f32(v: f32) -> Val {
    Val::F32(v.to_bits())
}

pub fn f64(v: f64) -> Val {
    Val::F64(v.to_bits())
}
