// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use sandvm::{
    Caller, Config, DETERMINISTIC_EPOCH_SECS, Error, Instance, IntoFunc, ModuleConfig, Runtime,
    Trap, Val,
};
use sandvm_gojs::Scheduler;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Calls each import the way the Go runtime does, with the stack pointer at 1024.
const GUEST: &str = r#"(module
    (import "go" "runtime.wasmExit" (func $wasm_exit (param i32)))
    (import "go" "runtime.wasmWrite" (func $wasm_write (param i32)))
    (import "go" "runtime.resetMemoryDataView" (func $reset (param i32)))
    (import "go" "runtime.nanotime1" (func $nanotime (param i32)))
    (import "go" "runtime.walltime" (func $walltime (param i32)))
    (import "go" "runtime.scheduleTimeoutEvent" (func $schedule (param i32)))
    (import "go" "runtime.clearTimeoutEvent" (func $clear (param i32)))
    (import "go" "runtime.getRandomData" (func $random (param i32)))
    (import "env" "tick" (func $tick))
    (memory (export "mem") 1)
    (data (i32.const 256) "hello from go\n")
    (global $sp i32 (i32.const 1024))

    (func (export "run") (param $argc i32) (param $argv i32)
        (i32.store (i32.const 0) (local.get $argc))
        (i32.store (i32.const 4) (local.get $argv)))

    (func (export "resume") (call $tick))

    (func (export "exit") (param i32)
        (i32.store (i32.const 1032) (local.get 0))
        (call $wasm_exit (global.get $sp)))

    (func (export "write") (param $fd i64)
        (i64.store (i32.const 1032) (local.get $fd))
        (i64.store (i32.const 1040) (i64.const 256))
        (i32.store (i32.const 1048) (i32.const 14))
        (call $wasm_write (global.get $sp)))

    (func (export "walltime") (result i64 i32)
        (call $walltime (global.get $sp))
        (i64.load (i32.const 1032))
        (i32.load (i32.const 1040)))

    (func (export "nanotime") (result i64)
        (call $nanotime (global.get $sp))
        (i64.load (i32.const 1032)))

    (func (export "random") (param $ptr i64) (param $len i64)
        (i64.store (i32.const 1032) (local.get $ptr))
        (i64.store (i32.const 1040) (local.get $len))
        (call $random (global.get $sp)))

    (func (export "schedule") (param $ms i64) (result i32)
        (i64.store (i32.const 1032) (local.get $ms))
        (call $schedule (global.get $sp))
        (i32.load (i32.const 1040)))

    (func (export "clear") (param $id i32)
        (i32.store (i32.const 1032) (local.get $id))
        (call $clear (global.get $sp)))

    (func (export "reset") (call $reset (global.get $sp))))"#;

fn trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

fn guest<P, R>(config: ModuleConfig, tick: impl IntoFunc<P, R>) -> (Runtime, Instance) {
    let rt = Runtime::new(Config::default()).unwrap();
    sandvm_gojs::instantiate(rt.namespace()).unwrap();
    rt.namespace().func_wrap("env", "tick", tick).unwrap();
    let module = rt.compile(&wat::parse_str(GUEST).unwrap()).unwrap();
    let instance = rt.instantiate(&module, config).unwrap();
    (rt, instance)
}

fn counting_guest() -> (Runtime, Instance, Arc<AtomicUsize>) {
    let ticks = Arc::new(AtomicUsize::new(0));
    let (rt, instance) = guest(ModuleConfig::new(), {
        let ticks = ticks.clone();
        move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        }
    });
    (rt, instance, ticks)
}

fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
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

fn c_str(instance: &Instance, ptr: u64) -> String {
    instance
        .with_memory(|mem| {
            let bytes: Vec<u8> = (ptr..)
                .map(|addr| mem.read_u8(addr).unwrap())
                .take_while(|b| *b != 0)
                .collect();
            String::from_utf8(bytes).unwrap()
        })
        .unwrap()
}

#[test]
fn run_passes_args_and_env() {
    let _trace = trace();
    let (_rt, instance) = guest(
        ModuleConfig::new()
            .with_args(["app", "-v"])
            .with_env("B", "2")
            .with_env("A", "1"),
        || {},
    );

    sandvm_gojs::run(&instance).unwrap();

    let (argc, argv) = instance
        .with_memory(|mem| (mem.read_u32_le(0).unwrap(), mem.read_u32_le(4).unwrap()))
        .unwrap();
    assert_eq!(argc, 2);
    let ptrs: Vec<u64> = instance
        .with_memory(|mem| {
            (0..6)
                .map(|k| mem.read_u64_le(u64::from(argv) + 8 * k).unwrap())
                .collect()
        })
        .unwrap();

    assert_eq!(ptrs[0], u64::from(sandvm_gojs::ARGS_OFFSET));
    assert_eq!(c_str(&instance, ptrs[0]), "app");
    assert_eq!(c_str(&instance, ptrs[1]), "-v");
    assert_eq!(ptrs[2], 0);
    assert_eq!(c_str(&instance, ptrs[3]), "A=1");
    assert_eq!(c_str(&instance, ptrs[4]), "B=2");
    assert_eq!(ptrs[5], 0);
}

#[test]
fn writes_go_to_stdout_and_stderr() {
    let _trace = trace();
    let stdout = SharedBuf::default();
    let stderr = SharedBuf::default();
    let (_rt, instance) = guest(
        ModuleConfig::new()
            .with_stdout(stdout.clone())
            .with_stderr(stderr.clone()),
        || {},
    );

    instance.call("write", &[Val::I64(1)]).unwrap();
    instance.call("write", &[Val::I64(2)]).unwrap();
    instance.call("write", &[Val::I64(2)]).unwrap();
    // a uintptr is 32 bits wide, the upper half of the slot is ignored
    instance.call("write", &[Val::I64(1 | (1 << 32))]).unwrap();
    assert_eq!(stdout.contents(), b"hello from go\nhello from go\n");
    assert_eq!(stderr.contents(), b"hello from go\nhello from go\n");

    match instance.call("write", &[Val::I64(3)]).unwrap_err() {
        Error::HostFunction { func, source } => {
            assert_eq!(func, "go.runtime.wasmWrite");
            assert_eq!(source.to_string(), "unexpected fd 3");
        }
        e => panic!("unexpected error {e:?}"),
    }
}

#[test]
fn clocks_come_from_the_sys_context() {
    let _trace = trace();
    let (_rt, instance) = guest(ModuleConfig::new().with_deterministic_sys(1), || {});
    assert_eq!(
        instance.call("walltime", &[]).unwrap(),
        [Val::I64(DETERMINISTIC_EPOCH_SECS), Val::I32(0)]
    );
    assert_eq!(instance.call("nanotime", &[]).unwrap(), [Val::I64(0)]);

    let (_rt, instance) = guest(
        ModuleConfig::new()
            .with_walltime(|| (1_700_000_000_i64, 250_i32))
            .with_nanotime(|| 42_i64),
        || {},
    );
    assert_eq!(
        instance.call("walltime", &[]).unwrap(),
        [Val::I64(1_700_000_000), Val::I32(250)]
    );
    assert_eq!(instance.call("nanotime", &[]).unwrap(), [Val::I64(42)]);
    instance.call("reset", &[]).unwrap();
}

#[test]
fn random_data_comes_from_the_seeded_source() {
    let _trace = trace();
    let read = |instance: &Instance| {
        instance
            .call("random", &[Val::I64(2048), Val::I64(32)])
            .unwrap();
        instance.with_memory(|mem| mem.read(2048, 32).unwrap()).unwrap()
    };

    let (_rt, a) = guest(ModuleConfig::new().with_deterministic_sys(7), || {});
    let (_rt, b) = guest(ModuleConfig::new().with_deterministic_sys(7), || {});
    let bytes = read(&a);
    assert_eq!(bytes, read(&b));
    assert!(bytes.iter().any(|b| *b != 0));

    let err = a
        .call("random", &[Val::I64(65530), Val::I64(32)])
        .unwrap_err();
    assert_eq!(err.as_trap(), Some(Trap::MemoryOutOfBounds));
}

#[test]
fn short_random_reads_fail() {
    let _trace = trace();
    let (_rt, instance) = guest(
        ModuleConfig::new().with_random_source(io::repeat(1).take(8)),
        || {},
    );
    assert!(matches!(
        instance.call("random", &[Val::I64(2048), Val::I64(16)]),
        Err(Error::HostFunction { .. })
    ));
}

#[test]
fn exit_closes_the_instance() {
    let _trace = trace();
    let (_rt, instance) = guest(ModuleConfig::new(), || {});

    let err = instance.call("exit", &[Val::I32(7)]).unwrap_err();
    assert_eq!(err.exit_code(), Some(7));
    assert_eq!(instance.exit_code(), Some(7));
    assert!(matches!(
        instance.call("reset", &[]),
        Err(Error::Closed {
            exit_code: Some(7),
            ..
        })
    ));
}

#[test]
fn timeouts_resume_the_guest() {
    let _trace = trace();
    let (_rt, instance, ticks) = counting_guest();

    let first = instance.call("schedule", &[Val::I64(5)]).unwrap();
    let second = instance.call("schedule", &[Val::I64(10)]).unwrap();
    assert_eq!(first, [Val::I32(1)]);
    assert_eq!(second, [Val::I32(2)]);

    eventually("both timeouts", || ticks.load(Ordering::SeqCst) == 2);
    Scheduler::of(&instance).wait_idle();
    assert_eq!(Scheduler::of(&instance).pending(), 0);
}

#[test]
fn cancelled_timeouts_never_fire() {
    let _trace = trace();
    let (_rt, instance, ticks) = counting_guest();

    let id = instance.call("schedule", &[Val::I64(300)]).unwrap()[0]
        .i32()
        .unwrap();
    instance.call("clear", &[Val::I32(id)]).unwrap();
    assert_eq!(Scheduler::of(&instance).pending(), 0);

    // clearing twice is harmless
    instance.call("clear", &[Val::I32(id)]).unwrap();

    thread::sleep(Duration::from_millis(600));
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_waits_for_an_in_flight_timeout() {
    let _trace = trace();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (_rt, instance) = guest(ModuleConfig::new(), {
        let started = started.clone();
        let finished = finished.clone();
        move || {
            started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            finished.store(true, Ordering::SeqCst);
        }
    });

    let scheduler = Scheduler::of(&instance);
    let id = scheduler.schedule(&instance, Duration::ZERO).unwrap();
    eventually("the timeout to fire", || started.load(Ordering::SeqCst));

    assert!(scheduler.cancel(id));
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn run_reports_an_exit_from_resume() {
    let _trace = trace();
    let (_rt, instance) = guest(
        ModuleConfig::new(),
        |mut caller: Caller<'_>| -> sandvm::Result<()> { caller.exit(9) },
    );

    instance.call("schedule", &[Val::I64(200)]).unwrap();
    let err = sandvm_gojs::run(&instance).unwrap_err();
    assert_eq!(err.exit_code(), Some(9));
    assert!(instance.is_closed());
}

#[test]
fn closing_cancels_scheduled_timeouts() {
    let _trace = trace();
    let (_rt, instance, ticks) = counting_guest();
    let scheduler = Scheduler::of(&instance);

    instance.call("schedule", &[Val::I64(200)]).unwrap();
    instance.call("schedule", &[Val::I64(250)]).unwrap();
    assert_eq!(scheduler.pending(), 2);

    instance.close().unwrap();
    assert_eq!(scheduler.pending(), 0);
    thread::sleep(Duration::from_millis(500));
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}
