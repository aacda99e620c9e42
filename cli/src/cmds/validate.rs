// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueHint};
use sandvm::{Config, Module};

#[derive(Debug, Parser)]
pub struct Cmd {
    /// The WebAssembly module to check
    #[clap(value_hint = ValueHint::FilePath)]
    module: PathBuf,
    /// Also accept SIMD instructions
    #[clap(long)]
    simd: bool,
}

impl Cmd {
    pub fn run(&self) -> anyhow::Result<()> {
        let bytes = fs::read(&self.module)
            .with_context(|| format!("failed to read {}", self.module.display()))?;

        let module = Module::from_binary(Config::default().wasm_simd(self.simd), &bytes)
            .with_context(|| format!("{} is not a valid module", self.module.display()))?;

        println!(
            "{}: valid, {} functions, {} imports, {} exports",
            self.module.display(),
            module.num_functions(),
            module.imports().len(),
            module.exports().len(),
        );
        for import in module.imports() {
            tracing::info!("import {import:?}");
        }
        for export in module.exports() {
            tracing::info!("export {export:?}");
        }
        Ok(())
    }
}
