// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The system-call emulation surface host functions use: clocks, a random source, standard
//! streams, arguments and environment.
//!
//! Each instance owns one [`SysContext`], built from its [`ModuleConfig`](crate::ModuleConfig).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Reads the wall clock as seconds and nanoseconds since the unix epoch.
pub trait Walltime: Send + Sync {
    fn walltime(&self) -> (i64, i32);
}

/// Reads a monotonic clock in nanoseconds.
pub trait Nanotime: Send + Sync {
    fn nanotime(&self) -> i64;
}

impl<F> Walltime for F
where
    F: Fn() -> (i64, i32) + Send + Sync,
{
    fn walltime(&self) -> (i64, i32) {
        self()
    }
}

impl<F> Nanotime for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn nanotime(&self) -> i64 {
        self()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemWalltime;

impl Walltime for SystemWalltime {
    fn walltime(&self) -> (i64, i32) {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => (
                i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                i32::try_from(d.subsec_nanos()).unwrap_or(0),
            ),
            Err(_) => (0, 0),
        }
    }
}

/// Nanoseconds elapsed since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicNanotime(Instant);

impl MonotonicNanotime {
    pub fn new() -> Self {
        Self(Instant::now())
    }
}

impl Default for MonotonicNanotime {
    fn default() -> Self {
        Self::new()
    }
}

impl Nanotime for MonotonicNanotime {
    fn nanotime(&self) -> i64 {
        i64::try_from(self.0.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Adapts a random number generator to `io::Read`, the interface random sources are consumed by.
#[derive(Debug)]
pub struct RngReader<R>(pub R);

impl<R: RngCore> io::Read for RngReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.fill_bytes(buf);
        Ok(buf.len())
    }
}

/// The epoch used by the deterministic clocks, 2022-01-01T00:00:00Z.
pub const DETERMINISTIC_EPOCH_SECS: i64 = 1_640_995_200;

/// Per-instance system state.
pub struct SysContext {
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    stdin: Mutex<Box<dyn io::Read + Send>>,
    stdout: Mutex<Box<dyn io::Write + Send>>,
    stderr: Mutex<Box<dyn io::Write + Send>>,
    walltime: Box<dyn Walltime>,
    nanotime: Box<dyn Nanotime>,
    random: Mutex<Box<dyn io::Read + Send>>,
}

impl fmt::Debug for SysContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysContext")
            .field("args", &self.args)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl SysContext {
    pub(crate) fn new(config: crate::ModuleConfig) -> Self {
        let deterministic = config.deterministic_seed;
        let walltime = config.walltime.unwrap_or_else(|| match deterministic {
            Some(_) => Box::new(|| (DETERMINISTIC_EPOCH_SECS, 0)) as Box<dyn Walltime>,
            None => Box::new(SystemWalltime),
        });
        let nanotime = config.nanotime.unwrap_or_else(|| match deterministic {
            Some(_) => Box::new(|| 0_i64) as Box<dyn Nanotime>,
            None => Box::new(MonotonicNanotime::new()),
        });
        let random = config.random.unwrap_or_else(|| match deterministic {
            Some(seed) => {
                Box::new(RngReader(ChaCha20Rng::seed_from_u64(seed))) as Box<dyn Read + Send>
            }
            None => Box::new(RngReader(ChaCha20Rng::from_os_rng())),
        });

        Self {
            args: config.args,
            env: config.env,
            stdin: Mutex::new(config.stdin.unwrap_or_else(|| Box::new(io::empty()))),
            stdout: Mutex::new(config.stdout.unwrap_or_else(|| Box::new(io::sink()))),
            stderr: Mutex::new(config.stderr.unwrap_or_else(|| Box::new(io::sink()))),
            walltime,
            nanotime,
            random: Mutex::new(random),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn walltime(&self) -> (i64, i32) {
        self.walltime.walltime()
    }

    pub fn nanotime(&self) -> i64 {
        self.nanotime.nanotime()
    }

    /// Writes all of `buf` to the guest's standard output.
    pub fn write_stdout(&self, buf: &[u8]) -> io::Result<()> {
        let mut out = lock(&self.stdout);
        out.write_all(buf)?;
        out.flush()
    }

    /// Writes all of `buf` to the guest's standard error.
    pub fn write_stderr(&self, buf: &[u8]) -> io::Result<()> {
        let mut out = lock(&self.stderr);
        out.write_all(buf)?;
        out.flush()
    }

    pub fn read_stdin(&self, buf: &mut [u8]) -> io::Result<usize> {
        lock(&self.stdin).read(buf)
    }

    /// Reads up to `buf.len()` random bytes, returning how many were read.
    pub fn read_random(&self, buf: &mut [u8]) -> io::Result<usize> {
        lock(&self.random).read(buf)
    }
}

/// Locks `mutex`, ignoring poisoning. The guarded streams keep no invariants of their own.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
