// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `go` import module used by binaries the Go toolchain builds for `GOOS=js GOARCH=wasm`.
//!
//! Every function is imported as `(param i32)` and exchanges its logical parameters and results
//! through linear memory, see [`StackPointerFunc`].
//!
//! ```no_run
//! # fn main() -> sandvm::Result<()> {
//! let rt = sandvm::Runtime::new(sandvm::Config::default())?;
//! sandvm_gojs::instantiate(rt.namespace())?;
//!
//! let module = rt.compile(&std::fs::read("main.wasm").unwrap())?;
//! let instance = rt.instantiate(&module, sandvm::ModuleConfig::new().with_args(["main"]))?;
//! sandvm_gojs::run(&instance)?;
//! # Ok(())
//! # }
//! ```

mod scheduler;

use std::time::Duration;

use sandvm::{Caller, Error, Instance, LinearMemory, Namespace, StackPointerFunc, Trap, Val};

pub use scheduler::{RESUME_EXPORT, Scheduler};

/// The import module name Go guests use.
pub const MODULE_NAME: &str = "go";
/// The guest's entry point, `run(argc, argv)`.
pub const RUN_EXPORT: &str = "run";
/// Where [`run`] lays out the guest's arguments and environment.
pub const ARGS_OFFSET: u32 = 4096;
/// The Go linker places data from here on, arguments must end below it.
const MIN_DATA_ADDR: u32 = 4096 + 8192;

/// Defines the `go` module in `ns`.
pub fn instantiate(ns: &Namespace) -> sandvm::Result<()> {
    ns.define_func(MODULE_NAME, "runtime.wasmExit", StackPointerFunc::wrap(wasm_exit))?
        .define_func(MODULE_NAME, "runtime.wasmWrite", StackPointerFunc::wrap(wasm_write))?
        .define_func(
            MODULE_NAME,
            "runtime.resetMemoryDataView",
            StackPointerFunc::wrap(reset_memory_data_view),
        )?
        .define_func(MODULE_NAME, "runtime.nanotime1", StackPointerFunc::wrap(nanotime1))?
        .define_func(MODULE_NAME, "runtime.walltime", StackPointerFunc::wrap(walltime))?
        .define_func(
            MODULE_NAME,
            "runtime.scheduleTimeoutEvent",
            StackPointerFunc::wrap(schedule_timeout_event),
        )?
        .define_func(
            MODULE_NAME,
            "runtime.clearTimeoutEvent",
            StackPointerFunc::wrap(clear_timeout_event),
        )?
        .define_func(
            MODULE_NAME,
            "runtime.getRandomData",
            StackPointerFunc::wrap(get_random_data),
        )?;

    tracing::debug!("defined the go module");
    Ok(())
}

/// Runs a Go guest: lays out its arguments and environment, calls `run(argc, argv)` and waits
/// until no scheduled timeout is left.
///
/// Returns [`Error::Exit`] if the guest exited, either during `run` or from a later `resume`.
pub fn run(instance: &Instance) -> sandvm::Result<()> {
    let sys = instance.sys();
    let (argc, argv) = instance.with_memory(|mem| write_args(mem, sys.args(), sys.env()))??;

    tracing::debug!(instance = instance.name(), argc, argv, "running go guest");
    instance.call(RUN_EXPORT, &[Val::I32(argc as i32), Val::I32(argv as i32)])?;
    Scheduler::of(instance).wait_idle();

    match instance.exit_code() {
        Some(code) => Err(Error::Exit {
            module: instance.name().into(),
            code,
        }),
        None => Ok(()),
    }
}

/// `func wasmExit(code int32)`
fn wasm_exit(mut caller: Caller<'_>, code: u32) -> sandvm::Result<()> {
    caller.exit(code)
}

/// `func wasmWrite(fd uintptr, p unsafe.Pointer, n int32)`
fn wasm_write(mut caller: Caller<'_>, fd: u64, p: u64, n: u32) -> sandvm::Result<()> {
    let sys = caller.sys();
    let buf = caller.memory()?.slice(p, n as usize)?;
    tracing::trace!(fd, n, "wasmWrite");

    let res = match fd as u32 {
        1 => sys.write_stdout(buf),
        2 => sys.write_stderr(buf),
        _ => return Err(Error::host(format!("unexpected fd {fd}"))),
    };
    res.map_err(Error::host)
}

/// `func resetMemoryDataView()`
///
/// Host views of memory are borrows that never outlive a grow, there is nothing to reset.
fn reset_memory_data_view() {}

/// `func nanotime1() int64`
fn nanotime1(caller: Caller<'_>) -> i64 {
    caller.sys().nanotime()
}

/// `func walltime() (sec int64, nsec int32)`
fn walltime(caller: Caller<'_>) -> (i64, u32) {
    let (sec, nsec) = caller.sys().walltime();
    (sec, nsec as u32)
}

/// `func scheduleTimeoutEvent(delay int64) int32`
fn schedule_timeout_event(caller: Caller<'_>, delay_ms: i64) -> sandvm::Result<u32> {
    let instance = caller.instance();
    let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0));
    Scheduler::of(instance).schedule(instance, delay)
}

/// `func clearTimeoutEvent(id int32)`
fn clear_timeout_event(caller: Caller<'_>, id: u32) {
    Scheduler::of(caller.instance()).cancel(id);
}

/// `func getRandomData(r []byte)`, the slice header's pointer and length.
fn get_random_data(mut caller: Caller<'_>, buf: u64, len: u64) -> sandvm::Result<()> {
    let sys = caller.sys();
    let len = usize::try_from(len).map_err(|_| Trap::MemoryOutOfBounds)?;
    let dst = caller.memory()?.slice_mut(buf, len)?;

    let n = sys.read_random(dst).map_err(Error::host)?;
    if n != len {
        return Err(Error::host(format!("random source read {n} of {len} bytes")));
    }
    Ok(())
}

/// Writes `args` and `env` the way `wasm_exec.js` does: NUL-terminated strings at
/// [`ARGS_OFFSET`], each 8-byte aligned, followed by an array of 8-byte pointers to the
/// arguments, a null pointer, pointers to the `KEY=VALUE` entries sorted by key and another null
/// pointer. Returns `argc` and the address of that array.
fn write_args(
    mem: &mut LinearMemory,
    args: &[String],
    env: &[(String, String)],
) -> sandvm::Result<(u32, u32)> {
    let mut env: Vec<_> = env.iter().collect();
    env.sort_by(|a, b| a.0.cmp(&b.0));

    let mut offset = u64::from(ARGS_OFFSET);
    let mut push = |mem: &mut LinearMemory, bytes: &[&[u8]]| -> sandvm::Result<u64> {
        let ptr = offset;
        for part in bytes.iter().copied().chain([b"\0".as_slice()]) {
            fits(offset + part.len() as u64)?;
            mem.write(offset, part)?;
            offset += part.len() as u64;
        }
        offset = offset.next_multiple_of(8);
        Ok(ptr)
    };

    let mut ptrs = Vec::with_capacity(args.len() + env.len() + 2);
    for arg in args {
        ptrs.push(push(mem, &[arg.as_bytes()])?);
    }
    ptrs.push(0);
    for (key, value) in &env {
        ptrs.push(push(mem, &[key.as_bytes(), b"=".as_slice(), value.as_bytes()])?);
    }
    ptrs.push(0);

    let argv = offset;
    for ptr in ptrs {
        fits(offset + 8)?;
        mem.write_u64_le(offset, ptr)?;
        offset += 8;
    }

    // `fits` bounds every offset below `MIN_DATA_ADDR`
    Ok((args.len() as u32, argv as u32))
}

fn fits(end: u64) -> sandvm::Result<()> {
    if end > u64::from(MIN_DATA_ADDR) {
        Err(Error::Unsupported(format!(
            "command line and environment exceed {} bytes",
            MIN_DATA_ADDR - ARGS_OFFSET
        )))
    } else {
        Ok(())
    }
}
