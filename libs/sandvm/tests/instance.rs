// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use common::{SharedBuf, runtime, strategies, trace};
use sandvm::{
    Caller, Error, InstantiationError, ModuleConfig, StackPointerFunc, Trap, Val,
};

const WRITER: &str = r#"(module
    (import "env" "write" (func $write (param i32 i32 i32)))
    (memory 1)
    (data (i32.const 8) "hello, world\n")
    (func (export "run")
        (call $write (i32.const 1) (i32.const 8) (i32.const 13))))"#;

fn define_write(ns: &sandvm::Namespace) {
    ns.func_wrap(
        "env",
        "write",
        |mut caller: Caller<'_>, fd: u32, ptr: u32, len: u32| -> sandvm::Result<()> {
            let bytes = caller.memory()?.read(u64::from(ptr), len as usize)?;
            let res = match fd {
                1 => caller.sys().write_stdout(&bytes),
                2 => caller.sys().write_stderr(&bytes),
                _ => return Err(Error::host(format!("bad file descriptor {fd}"))),
            };
            res.map_err(Error::host)
        },
    )
    .unwrap();
}

#[test]
fn writes_reach_the_bound_stdout() {
    let _trace = trace();
    for strategy in strategies() {
        let rt = runtime(strategy);
        define_write(rt.namespace());
        let module = rt.compile(&wat::parse_str(WRITER).unwrap()).unwrap();

        let stdout = SharedBuf::default();
        let stderr = SharedBuf::default();
        let instance = rt
            .instantiate(
                &module,
                ModuleConfig::new()
                    .with_stdout(stdout.clone())
                    .with_stderr(stderr.clone()),
            )
            .unwrap();

        instance.call("run", &[]).unwrap();
        instance.call("run", &[]).unwrap();
        assert_eq!(stdout.contents(), b"hello, world\nhello, world\n", "{strategy:?}");
        assert!(stderr.contents().is_empty(), "{strategy:?}");
    }
}

#[test]
fn division_by_zero_traps() {
    let _trace = trace();
    let wasm = wat::parse_str(
        r#"(module
            (func (export "div") (param i32) (result i32)
                (i32.div_u (i32.const 10) (local.get 0))))"#,
    )
    .unwrap();

    for strategy in strategies() {
        let rt = runtime(strategy);
        let module = rt.compile(&wasm).unwrap();
        let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();

        let err = instance.call("div", &[Val::I32(0)]).unwrap_err();
        assert_eq!(err.as_trap(), Some(Trap::IntegerDivisionByZero), "{strategy:?}");
        assert_eq!(err.to_string(), "wasm trap: integer divide by zero");
        assert_eq!(instance.call("div", &[Val::I32(5)]).unwrap(), [Val::I32(2)]);
    }
}

#[test]
fn missing_imports_fail_atomically() {
    let _trace = trace();
    let rt = runtime(strategies()[0]);
    rt.namespace()
        .func_wrap("env", "present", || {})
        .unwrap();
    let module = rt
        .compile(
            &wat::parse_str(
                r#"(module
                    (import "env" "present" (func))
                    (import "env" "absent" (func (param i32)))
                    (func (export "run")))"#,
            )
            .unwrap(),
        )
        .unwrap();

    let err = rt
        .instantiate(&module, ModuleConfig::new().with_name("app"))
        .unwrap_err();
    match err {
        Error::Instantiation(InstantiationError::MissingImport { module, field, .. }) => {
            assert_eq!(module, "env");
            assert_eq!(field, "absent");
        }
        e => panic!("unexpected error {e:?}"),
    }
    assert!(rt.namespace().get_instance("app").is_none());

    // the name was not taken by the failed attempt
    rt.namespace()
        .func_wrap("env", "absent", |_: i32| {})
        .unwrap();
    let instance = rt
        .instantiate(&module, ModuleConfig::new().with_name("app"))
        .unwrap();
    assert!(rt.namespace().get_instance("app").is_some());
    instance.call("run", &[]).unwrap();
}

#[test]
fn concurrent_instantiations_claim_a_name_once() {
    let _trace = trace();
    let rt = runtime(strategies()[0]);
    let module = rt
        .compile(&wat::parse_str(r#"(module (func (export "run")))"#).unwrap())
        .unwrap();

    let barrier = Barrier::new(8);
    let created = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                barrier.wait();
                match rt.instantiate(&module, ModuleConfig::new().with_name("svc")) {
                    Ok(_) => {
                        created.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(Error::Instantiation(InstantiationError::AlreadyDefined {
                        module,
                        ..
                    })) => assert_eq!(module, "svc"),
                    Err(e) => panic!("unexpected error {e:?}"),
                }
            });
        }
    });

    assert_eq!(created.load(Ordering::Relaxed), 1);
    assert!(rt.namespace().get_instance("svc").is_some());
}

#[test]
fn export_collisions_release_the_name() {
    let _trace = trace();
    let rt = runtime(strategies()[0]);
    rt.namespace().func_wrap("svc", "run", || {}).unwrap();
    let module = rt
        .compile(&wat::parse_str(r#"(module (func (export "run")))"#).unwrap())
        .unwrap();

    let err = rt
        .instantiate(&module, ModuleConfig::new().with_name("svc"))
        .unwrap_err();
    match err {
        Error::Instantiation(InstantiationError::AlreadyDefined { module, field }) => {
            assert_eq!(module, "svc");
            assert_eq!(field, "run");
        }
        e => panic!("unexpected error {e:?}"),
    }
    assert!(rt.namespace().get_instance("svc").is_none());

    // a module without the colliding export can take the name
    let other = rt
        .compile(&wat::parse_str(r#"(module (func (export "start")))"#).unwrap())
        .unwrap();
    rt.instantiate(&other, ModuleConfig::new().with_name("svc"))
        .unwrap();
    assert!(rt.namespace().get_instance("svc").is_some());
    rt.close().unwrap();
}

#[test]
fn mismatched_imports_are_rejected() {
    let _trace = trace();
    let rt = runtime(strategies()[0]);
    rt.namespace()
        .func_wrap("env", "f", |x: i64| x)
        .unwrap();
    let module = rt
        .compile(&wat::parse_str(r#"(module (import "env" "f" (func (param i32) (result i32))))"#).unwrap())
        .unwrap();

    let err = rt.instantiate(&module, ModuleConfig::new()).unwrap_err();
    assert!(matches!(
        err,
        Error::Instantiation(InstantiationError::IncompatibleImport { .. })
    ));
}

#[test]
fn host_panics_become_host_function_errors() {
    let _trace = trace();
    let wasm = wat::parse_str(
        r#"(module
            (import "env" "boom" (func $boom (param i32)))
            (func (export "run") (param i32) (call $boom (local.get 0)))
            (func (export "ok") (result i32) (i32.const 1)))"#,
    )
    .unwrap();

    for strategy in strategies() {
        let rt = runtime(strategy);
        rt.namespace()
            .func_wrap("env", "boom", |x: i32| {
                assert!(x < 10, "value too large: {x}");
            })
            .unwrap();
        let module = rt.compile(&wasm).unwrap();
        let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();

        instance.call("run", &[Val::I32(1)]).unwrap();
        match instance.call("run", &[Val::I32(11)]).unwrap_err() {
            Error::HostFunction { func, source } => {
                assert_eq!(func, "env.boom");
                assert!(source.to_string().contains("value too large: 11"), "{source}");
            }
            e => panic!("{strategy:?}: unexpected error {e:?}"),
        }
        assert_eq!(instance.call("ok", &[]).unwrap(), [Val::I32(1)]);
    }
}

#[test]
fn stack_pointer_convention() {
    let _trace = trace();
    let wasm = wat::parse_str(
        r#"(module
            (import "env" "mul_add" (func $mul_add (param i32)))
            (memory 1)
            (func (export "run") (param i64 i32) (result i64)
                ;; sp = 1024, parameters at sp+8 and sp+16, the result at sp+24
                (i64.store (i32.const 1032) (local.get 0))
                (i32.store (i32.const 1040) (local.get 1))
                (i32.store (i32.const 1044) (i32.const -1))
                (call $mul_add (i32.const 1024))
                (i64.load (i32.const 1048)))
            (func (export "oob")
                (call $mul_add (i32.const 65530))))"#,
    )
    .unwrap();

    for strategy in strategies() {
        let rt = runtime(strategy);
        rt.namespace()
            .define_func(
                "env",
                "mul_add",
                StackPointerFunc::wrap(|a: i64, b: u32| -> i64 { a * 3 + i64::from(b) }),
            )
            .unwrap();
        let module = rt.compile(&wasm).unwrap();
        let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();

        // only the low 4 bytes of an i32 slot are read
        assert_eq!(
            instance.call("run", &[Val::I64(-5), Val::I32(7)]).unwrap(),
            [Val::I64(-8)],
            "{strategy:?}"
        );
        let err = instance.call("oob", &[]).unwrap_err();
        assert_eq!(err.as_trap(), Some(Trap::MemoryOutOfBounds), "{strategy:?}");
    }
}

#[test]
fn instances_do_not_share_state() {
    let _trace = trace();
    let wasm = wat::parse_str(
        r#"(module
            (memory (export "memory") 1)
            (global $g (export "g") (mut i32) (i32.const 0))
            (func (export "set") (param i32)
                (global.set $g (local.get 0))
                (i32.store (i32.const 100) (local.get 0)))
            (func (export "get") (result i32) (i32.load (i32.const 100))))"#,
    )
    .unwrap();

    for strategy in strategies() {
        let rt = runtime(strategy);
        let module = rt.compile(&wasm).unwrap();
        let a = rt.instantiate(&module, ModuleConfig::new()).unwrap();
        let b = rt.instantiate(&module, ModuleConfig::new()).unwrap();

        a.call("set", &[Val::I32(42)]).unwrap();
        assert_eq!(a.call("get", &[]).unwrap(), [Val::I32(42)]);
        assert_eq!(a.get_global("g"), Some(Val::I32(42)));
        assert_eq!(b.call("get", &[]).unwrap(), [Val::I32(0)], "{strategy:?}");
        assert_eq!(b.get_global("g"), Some(Val::I32(0)));

        b.with_memory(|mem| mem.write_u32_le(100, 7)).unwrap().unwrap();
        assert_eq!(b.call("get", &[]).unwrap(), [Val::I32(7)]);
        assert_eq!(a.call("get", &[]).unwrap(), [Val::I32(42)]);
    }
}

#[test]
fn exit_latches_once() {
    let _trace = trace();
    let wasm = wat::parse_str(
        r#"(module
            (import "env" "exit" (func $exit (param i32)))
            (func (export "exit") (param i32) (call $exit (local.get 0)))
            (func (export "ok") (result i32) (i32.const 1)))"#,
    )
    .unwrap();

    for strategy in strategies() {
        let rt = runtime(strategy);
        let entered = Arc::new(Barrier::new(2));
        rt.namespace()
            .func_wrap(
                "env",
                "exit",
                |mut caller: Caller<'_>, code: u32| -> sandvm::Result<()> {
                    let first = caller.exit(code);
                    // later requests are no-ops
                    assert!(caller.exit(code + 100).is_ok());
                    first
                },
            )
            .unwrap();
        let module = rt.compile(&wasm).unwrap();
        let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();

        let handles: Vec<_> = [3_i32, 4]
            .into_iter()
            .map(|code| {
                let instance = instance.clone();
                let entered = entered.clone();
                thread::spawn(move || {
                    entered.wait();
                    instance.call("exit", &[Val::I32(code)])
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winner = instance.exit_code().unwrap();
        assert!(winner == 3 || winner == 4, "{strategy:?}");
        let exits = results
            .iter()
            .filter(|res| matches!(res, Err(Error::Exit { code, .. }) if *code == winner))
            .count();
        assert_eq!(exits, 1, "{strategy:?}: {results:?}");
        for res in &results {
            match res {
                Err(Error::Exit { .. }) => {}
                Err(Error::Closed { exit_code, .. }) => assert_eq!(*exit_code, Some(winner)),
                other => panic!("{strategy:?}: unexpected result {other:?}"),
            }
        }

        assert!(instance.is_closed());
        assert!(matches!(
            instance.call("ok", &[]),
            Err(Error::Closed {
                exit_code: Some(_),
                ..
            })
        ));
    }
}

#[test]
fn calls_into_one_instance_are_serialized() {
    let _trace = trace();
    let wasm = wat::parse_str(
        r#"(module
            (memory 1)
            (func (export "bump") (param i32)
                (local i32)
                (loop $again
                    (i32.store (i32.const 0) (i32.add (i32.load (i32.const 0)) (i32.const 1)))
                    (local.set 1 (i32.add (local.get 1) (i32.const 1)))
                    (br_if $again (i32.lt_u (local.get 1) (local.get 0)))))
            (func (export "count") (result i32) (i32.load (i32.const 0))))"#,
    )
    .unwrap();

    for strategy in strategies() {
        let rt = runtime(strategy);
        let module = rt.compile(&wasm).unwrap();
        let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();

        thread::scope(|s| {
            for _ in 0..4 {
                let instance = &instance;
                s.spawn(move || {
                    for _ in 0..10 {
                        instance.call("bump", &[Val::I32(1000)]).unwrap();
                    }
                });
            }
        });

        assert_eq!(instance.call("count", &[]).unwrap(), [Val::I32(40_000)], "{strategy:?}");
    }
}

#[test]
fn close_runs_hooks_once() {
    let _trace = trace();
    let rt = runtime(strategies()[0]);
    let module = rt
        .compile(&wat::parse_str(r#"(module (func (export "f")))"#).unwrap())
        .unwrap();
    let instance = rt.instantiate(&module, ModuleConfig::new()).unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    instance.on_close({
        let closed = closed.clone();
        move || {
            closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    instance.call("f", &[]).unwrap();
    instance.close().unwrap();
    instance.close().unwrap();
    rt.close().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        instance.call("f", &[]),
        Err(Error::Closed {
            exit_code: None,
            ..
        })
    ));
}

#[test]
fn start_failures_leave_no_instance() {
    let _trace = trace();
    let rt = runtime(strategies()[0]);
    let module = rt
        .compile(&wat::parse_str(r#"(module (func $s unreachable) (start $s))"#).unwrap())
        .unwrap();

    let err = rt
        .instantiate(&module, ModuleConfig::new().with_name("broken"))
        .unwrap_err();
    match err {
        Error::Instantiation(InstantiationError::Start(e)) => {
            assert_eq!(e.as_trap(), Some(Trap::UnreachableCodeReached));
        }
        e => panic!("unexpected error {e:?}"),
    }
    assert!(rt.namespace().get_instance("broken").is_none());

    rt.instantiate(&module, ModuleConfig::new().with_start_disabled())
        .unwrap();
}
