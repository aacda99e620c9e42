// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::PathBuf;
use std::process::ExitCode;
use std::{fs, io, iter};

use anyhow::{Context, anyhow};
use clap::{Parser, ValueEnum, ValueHint};
use sandvm::{
    Config, Error, Instance, InstantiationError, ModuleConfig, Runtime, Strategy, Val, ValType,
};

#[derive(Debug, Parser)]
pub struct Cmd {
    /// The WebAssembly module to run
    #[clap(value_hint = ValueHint::FilePath)]
    module: PathBuf,
    /// The exported function to call. Defaults to `_start`, or to `run` for Go guests
    #[clap(long)]
    invoke: Option<String>,
    /// The engine to execute the module with
    #[clap(long, value_enum, default_value_t = Engine::Auto)]
    engine: Engine,
    /// The import convention the module was built for
    #[clap(long, value_enum, default_value_t = Abi::Native)]
    abi: Abi,
    /// Sets an environment variable for the guest, `KEY=VALUE`
    #[clap(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,
    /// Arguments for the guest. When `--invoke` names a function with parameters they are
    /// parsed as its arguments
    #[clap(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    Auto,
    Interpreter,
    Compiler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Abi {
    /// Plain WebAssembly, imports nothing the host has to provide
    Native,
    /// Built by the Go toolchain for `GOOS=js GOARCH=wasm`
    Go,
}

impl From<Engine> for Strategy {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Auto => Strategy::Auto,
            Engine::Interpreter => Strategy::Interpreter,
            Engine::Compiler => Strategy::Compiler,
        }
    }
}

impl Cmd {
    pub fn run(&self) -> anyhow::Result<ExitCode> {
        let bytes = fs::read(&self.module)
            .with_context(|| format!("failed to read {}", self.module.display()))?;

        let rt = Runtime::new(Config::default().strategy(self.engine.into()).clone())?;
        if self.abi == Abi::Go {
            sandvm_gojs::instantiate(rt.namespace())?;
        }

        let module = rt.compile(&bytes)?;
        tracing::info!(
            module = %self.module.display(),
            engine = rt.engine_name(),
            "compiled module"
        );

        let outcome = rt
            .instantiate(&module, self.module_config())
            .and_then(|instance| self.call(&instance));
        finish(&rt, outcome)
    }

    fn module_config(&self) -> ModuleConfig {
        let argv0 = self
            .module
            .file_name()
            .map_or_else(|| "main".into(), |name| name.to_string_lossy().into_owned());

        let config = ModuleConfig::new()
            .with_args(iter::once(argv0).chain(self.args.iter().cloned()))
            .with_stdin(io::stdin())
            .with_stdout(io::stdout())
            .with_stderr(io::stderr());

        self.env
            .iter()
            .fold(config, |config, (key, value)| config.with_env(key, value))
    }

    fn call(&self, instance: &Instance) -> sandvm::Result<Vec<Val>> {
        let entry = match (&self.invoke, self.abi) {
            (Some(name), _) => name.as_str(),
            (None, Abi::Go) => return sandvm_gojs::run(instance).map(|()| Vec::new()),
            (None, Abi::Native) => "_start",
        };

        let params = match instance.get_func(entry) {
            Some(func) => parse_params(func.ty().params(), &self.args)?,
            None => return Err(Error::UnknownExport(entry.into())),
        };
        tracing::debug!(entry, ?params, "calling entry point");
        instance.call(entry, &params)
    }
}

/// Reports `outcome` and closes the runtime, also when the outcome is an error.
fn finish(rt: &Runtime, outcome: sandvm::Result<Vec<Val>>) -> anyhow::Result<ExitCode> {
    let code = report(outcome);
    if let Err(e) = rt.close() {
        tracing::warn!("failed to close runtime: {e}");
    }
    code
}

/// Prints the results of a successful call and maps the outcome to the process exit code.
fn report(outcome: sandvm::Result<Vec<Val>>) -> anyhow::Result<ExitCode> {
    match outcome {
        Ok(results) => {
            for val in results {
                println!("{val}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => match exit_code(&e) {
            Some(code) => {
                tracing::debug!(code, "guest exited");
                Ok(ExitCode::from(saturating_exit_code(code)))
            }
            None => Err(anyhow!(e)),
        },
    }
}

/// The code of an exit request, also one raised by a start function.
fn exit_code(e: &Error) -> Option<u32> {
    match e {
        Error::Instantiation(InstantiationError::Start(e)) => exit_code(e),
        e => e.exit_code(),
    }
}

/// Process exit codes are 8 bits wide, larger codes must not wrap to success.
fn saturating_exit_code(code: u32) -> u8 {
    u8::try_from(code).unwrap_or(u8::MAX)
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("`{s}` is not of the form KEY=VALUE"))
}

fn parse_params(types: &[ValType], args: &[String]) -> sandvm::Result<Vec<Val>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    if types.len() != args.len() {
        return Err(Error::Type(format!(
            "expected {} arguments, got {}",
            types.len(),
            args.len()
        )));
    }

    types
        .iter()
        .zip(args)
        .map(|(ty, arg)| parse_val(*ty, arg).map_err(Error::Type))
        .collect()
}

fn parse_val(ty: ValType, s: &str) -> Result<Val, String> {
    let invalid = |e: &dyn std::fmt::Display| format!("invalid {ty} argument `{s}`: {e}");
    match ty {
        ValType::I32 => s
            .parse::<i32>()
            .or_else(|_| s.parse::<u32>().map(|v| v as i32))
            .map(Val::I32)
            .map_err(|e| invalid(&e)),
        ValType::I64 => s
            .parse::<i64>()
            .or_else(|_| s.parse::<u64>().map(|v| v as i64))
            .map(Val::I64)
            .map_err(|e| invalid(&e)),
        ValType::F32 => s
            .parse::<f32>()
            .map(|v| Val::F32(v.to_bits()))
            .map_err(|e| invalid(&e)),
        ValType::F64 => s
            .parse::<f64>()
            .map(|v| Val::F64(v.to_bits()))
            .map_err(|e| invalid(&e)),
    }
}
