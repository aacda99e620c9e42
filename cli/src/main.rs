// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod cmds;
mod logger;

use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

/// Helper for passing VERSION to opt.
/// If `CARGO_VERSION_INFO` is set, use it, otherwise use `CARGO_PKG_VERSION`.
fn version() -> &'static str {
    option_env!("CARGO_VERSION_INFO").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Runs WebAssembly modules in a sandbox.
#[derive(Debug, Parser)]
#[clap(version = version())]
struct Options {
    #[clap(subcommand)]
    cmd: Cmd,
    #[clap(flatten)]
    common: Common,
}

#[derive(Debug, Parser)]
struct Common {
    /// Enables verbose logging
    #[clap(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Compiles, instantiates and runs a module
    Run(cmds::run::Cmd),
    /// Decodes and validates a module without running it
    Validate(cmds::validate::Cmd),
}

fn main() -> ExitCode {
    let opts = Options::parse();

    logger::init(opts.common.verbose);

    let res = match &opts.cmd {
        Cmd::Run(cmd) => cmd.run(),
        Cmd::Validate(cmd) => cmd.run().map(|()| ExitCode::SUCCESS),
    };

    match res {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
