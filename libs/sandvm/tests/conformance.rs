// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::fmt::Write;

use common::{Harness, f32, f64, trace};
use sandvm::{Caller, DEFAULT_MAX_CALL_DEPTH, Trap, Val};

const CANONICAL_NAN_F32: u32 = 0x7fc0_0000;
const CANONICAL_NAN_F64: u64 = 0x7ff8_0000_0000_0000;

#[test]
fn integer_arithmetic() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (func (export "add") (param i32 i32) (result i32) (i32.add (local.get 0) (local.get 1)))
            (func (export "sub64") (param i64 i64) (result i64) (i64.sub (local.get 0) (local.get 1)))
            (func (export "mul") (param i32 i32) (result i32) (i32.mul (local.get 0) (local.get 1)))
            (func (export "div_s") (param i32 i32) (result i32) (i32.div_s (local.get 0) (local.get 1)))
            (func (export "div_u") (param i32 i32) (result i32) (i32.div_u (local.get 0) (local.get 1)))
            (func (export "rem_s") (param i32 i32) (result i32) (i32.rem_s (local.get 0) (local.get 1)))
            (func (export "rem_s64") (param i64 i64) (result i64) (i64.rem_s (local.get 0) (local.get 1)))
            (func (export "div_s64") (param i64 i64) (result i64) (i64.div_s (local.get 0) (local.get 1)))
            (func (export "shl") (param i32 i32) (result i32) (i32.shl (local.get 0) (local.get 1)))
            (func (export "shr_s") (param i32 i32) (result i32) (i32.shr_s (local.get 0) (local.get 1)))
            (func (export "rotl64") (param i64 i64) (result i64) (i64.rotl (local.get 0) (local.get 1)))
            (func (export "clz") (param i32) (result i32) (i32.clz (local.get 0)))
            (func (export "ctz64") (param i64) (result i64) (i64.ctz (local.get 0)))
            (func (export "popcnt") (param i32) (result i32) (i32.popcnt (local.get 0)))
            (func (export "extend8") (param i32) (result i32) (i32.extend8_s (local.get 0)))
            (func (export "extend32") (param i64) (result i64) (i64.extend32_s (local.get 0)))
            (func (export "lt_u") (param i32 i32) (result i32) (i32.lt_u (local.get 0) (local.get 1)))
            (func (export "ge_s64") (param i64 i64) (result i32) (i64.ge_s (local.get 0) (local.get 1)))
            (func (export "eqz64") (param i64) (result i32) (i64.eqz (local.get 0))))"#,
    );

    h.assert_return("add", &[Val::I32(i32::MAX), Val::I32(1)], &[Val::I32(i32::MIN)]);
    h.assert_return("sub64", &[Val::I64(0), Val::I64(1)], &[Val::I64(-1)]);
    h.assert_return("mul", &[Val::I32(0x1000_0001), Val::I32(16)], &[Val::I32(16)]);
    h.assert_return("div_s", &[Val::I32(-7), Val::I32(2)], &[Val::I32(-3)]);
    h.assert_return("div_u", &[Val::I32(-1), Val::I32(2)], &[Val::I32(i32::MAX)]);
    h.assert_return("rem_s", &[Val::I32(-7), Val::I32(2)], &[Val::I32(-1)]);
    h.assert_return("rem_s", &[Val::I32(i32::MIN), Val::I32(-1)], &[Val::I32(0)]);
    h.assert_return("rem_s64", &[Val::I64(i64::MIN), Val::I64(-1)], &[Val::I64(0)]);
    h.assert_return("shl", &[Val::I32(1), Val::I32(33)], &[Val::I32(2)]);
    h.assert_return("shr_s", &[Val::I32(-8), Val::I32(1)], &[Val::I32(-4)]);
    h.assert_return(
        "rotl64",
        &[Val::I64(0x8000_0000_0000_0001_u64 as i64), Val::I64(1)],
        &[Val::I64(3)],
    );
    h.assert_return("clz", &[Val::I32(0)], &[Val::I32(32)]);
    h.assert_return("clz", &[Val::I32(1)], &[Val::I32(31)]);
    h.assert_return("ctz64", &[Val::I64(0)], &[Val::I64(64)]);
    h.assert_return("popcnt", &[Val::I32(-1)], &[Val::I32(32)]);
    h.assert_return("extend8", &[Val::I32(0x80)], &[Val::I32(-128)]);
    h.assert_return("extend32", &[Val::I64(0xffff_ffff)], &[Val::I64(-1)]);
    h.assert_return("lt_u", &[Val::I32(1), Val::I32(-1)], &[Val::I32(1)]);
    h.assert_return("ge_s64", &[Val::I64(-1), Val::I64(0)], &[Val::I32(0)]);
    h.assert_return("eqz64", &[Val::I64(0)], &[Val::I32(1)]);

    h.assert_trap("div_s", &[Val::I32(1), Val::I32(0)], Trap::IntegerDivisionByZero);
    h.assert_trap("div_u", &[Val::I32(1), Val::I32(0)], Trap::IntegerDivisionByZero);
    h.assert_trap("rem_s", &[Val::I32(1), Val::I32(0)], Trap::IntegerDivisionByZero);
    h.assert_trap("div_s", &[Val::I32(i32::MIN), Val::I32(-1)], Trap::IntegerOverflow);
    h.assert_trap("div_s64", &[Val::I64(i64::MIN), Val::I64(-1)], Trap::IntegerOverflow);
}

#[test]
fn float_nans_are_canonical() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (func (export "add") (param f32 f32) (result f32) (f32.add (local.get 0) (local.get 1)))
            (func (export "div64") (param f64 f64) (result f64) (f64.div (local.get 0) (local.get 1)))
            (func (export "sqrt") (param f32) (result f32) (f32.sqrt (local.get 0)))
            (func (export "neg") (param f32) (result f32) (f32.neg (local.get 0)))
            (func (export "copysign64") (param f64 f64) (result f64) (f64.copysign (local.get 0) (local.get 1)))
            (func (export "promote") (param f32) (result f64) (f64.promote_f32 (local.get 0)))
            (func (export "demote") (param f64) (result f32) (f32.demote_f64 (local.get 0))))"#,
    );

    // a signalling NaN with a payload
    let snan = Val::F32(0x7fa0_0001);
    h.assert_return("add", &[snan, f32(1.0)], &[Val::F32(CANONICAL_NAN_F32)]);
    h.assert_return("sqrt", &[f32(-1.0)], &[Val::F32(CANONICAL_NAN_F32)]);
    h.assert_return("div64", &[f64(0.0), f64(0.0)], &[Val::F64(CANONICAL_NAN_F64)]);
    h.assert_return("promote", &[snan], &[Val::F64(CANONICAL_NAN_F64)]);
    h.assert_return(
        "demote",
        &[Val::F64(0xfff0_0000_0000_0001)],
        &[Val::F32(CANONICAL_NAN_F32)],
    );

    // bitwise operations keep the payload
    h.assert_return("neg", &[snan], &[Val::F32(0xffa0_0001)]);
    h.assert_return(
        "copysign64",
        &[Val::F64(0x7ff0_0000_0000_0001), f64(-1.0)],
        &[Val::F64(0xfff0_0000_0000_0001)],
    );

    h.assert_return("add", &[f32(0.1), f32(0.2)], &[f32(0.1 + 0.2)]);
    h.assert_return("div64", &[f64(1.0), f64(0.0)], &[f64(f64::INFINITY)]);
}

#[test]
fn float_min_max_and_rounding() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (func (export "min") (param f32 f32) (result f32) (f32.min (local.get 0) (local.get 1)))
            (func (export "max64") (param f64 f64) (result f64) (f64.max (local.get 0) (local.get 1)))
            (func (export "nearest") (param f32) (result f32) (f32.nearest (local.get 0)))
            (func (export "nearest64") (param f64) (result f64) (f64.nearest (local.get 0)))
            (func (export "ceil") (param f32) (result f32) (f32.ceil (local.get 0)))
            (func (export "floor64") (param f64) (result f64) (f64.floor (local.get 0)))
            (func (export "trunc") (param f32) (result f32) (f32.trunc (local.get 0)))
            (func (export "trunc64") (param f64) (result f64) (f64.trunc (local.get 0)))
            (func (export "lt") (param f64 f64) (result i32) (f64.lt (local.get 0) (local.get 1)))
            (func (export "ne") (param f32 f32) (result i32) (f32.ne (local.get 0) (local.get 1))))"#,
    );

    h.assert_return("min", &[f32(0.0), f32(-0.0)], &[f32(-0.0)]);
    h.assert_return("min", &[f32(-0.0), f32(0.0)], &[f32(-0.0)]);
    h.assert_return("max64", &[f64(-0.0), f64(0.0)], &[f64(0.0)]);
    h.assert_return("min", &[Val::F32(0x7f80_0001), f32(1.0)], &[Val::F32(CANONICAL_NAN_F32)]);
    h.assert_return("max64", &[f64(1.0), f64(f64::NAN)], &[Val::F64(CANONICAL_NAN_F64)]);

    h.assert_return("nearest", &[f32(2.5)], &[f32(2.0)]);
    h.assert_return("nearest", &[f32(3.5)], &[f32(4.0)]);
    h.assert_return("nearest", &[f32(-0.5)], &[f32(-0.0)]);
    h.assert_return("nearest64", &[f64(-1.5)], &[f64(-2.0)]);
    h.assert_return("ceil", &[f32(-0.5)], &[f32(-0.0)]);
    h.assert_return("floor64", &[f64(-0.5)], &[f64(-1.0)]);
    h.assert_return("trunc", &[f32(-1.9)], &[f32(-1.0)]);
    h.assert_return("ceil", &[Val::F32(0x7fa0_0001)], &[Val::F32(CANONICAL_NAN_F32)]);
    h.assert_return("nearest64", &[Val::F64(0x7ff0_0000_0000_0001)], &[Val::F64(CANONICAL_NAN_F64)]);
    h.assert_return("trunc64", &[f64(-2_251_799_813_685_249.5)], &[f64(-2_251_799_813_685_249.0)]);
    h.assert_return("nearest", &[f32(f32::INFINITY)], &[f32(f32::INFINITY)]);

    h.assert_return("lt", &[f64(f64::NAN), f64(1.0)], &[Val::I32(0)]);
    h.assert_return("ne", &[f32(f32::NAN), f32(f32::NAN)], &[Val::I32(1)]);
}

#[test]
fn conversions() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (func (export "trunc_s") (param f32) (result i32) (i32.trunc_f32_s (local.get 0)))
            (func (export "trunc_u64") (param f64) (result i64) (i64.trunc_f64_u (local.get 0)))
            (func (export "trunc_u") (param f64) (result i32) (i32.trunc_f64_u (local.get 0)))
            (func (export "trunc_s64") (param f64) (result i32) (i32.trunc_f64_s (local.get 0)))
            (func (export "trunc_u32") (param f32) (result i32) (i32.trunc_f32_u (local.get 0)))
            (func (export "trunc_i64") (param f32) (result i64) (i64.trunc_f32_s (local.get 0)))
            (func (export "sat_s") (param f32) (result i32) (i32.trunc_sat_f32_s (local.get 0)))
            (func (export "sat_u64") (param f64) (result i64) (i64.trunc_sat_f64_u (local.get 0)))
            (func (export "convert_u64") (param i64) (result f32) (f32.convert_i64_u (local.get 0)))
            (func (export "convert_u64_f64") (param i64) (result f64) (f64.convert_i64_u (local.get 0)))
            (func (export "convert_s") (param i32) (result f64) (f64.convert_i32_s (local.get 0)))
            (func (export "wrap") (param i64) (result i32) (i32.wrap_i64 (local.get 0)))
            (func (export "extend_u") (param i32) (result i64) (i64.extend_i32_u (local.get 0)))
            (func (export "reinterpret") (param f32) (result i32) (i32.reinterpret_f32 (local.get 0))))"#,
    );

    h.assert_return("trunc_s", &[f32(-3.9)], &[Val::I32(-3)]);
    h.assert_return("trunc_u64", &[f64(1e19)], &[Val::I64(10_000_000_000_000_000_000_u64 as i64)]);
    h.assert_return("trunc_u", &[f64(-0.9)], &[Val::I32(0)]);
    h.assert_trap("trunc_s", &[f32(f32::NAN)], Trap::BadConversionToInteger);
    h.assert_trap("trunc_s", &[f32(2_147_483_648.0)], Trap::IntegerOverflow);
    h.assert_trap("trunc_u", &[f64(-1.0)], Trap::IntegerOverflow);
    h.assert_trap("trunc_u64", &[f64(f64::INFINITY)], Trap::IntegerOverflow);
    h.assert_trap("trunc_u64", &[f64(f64::NAN)], Trap::BadConversionToInteger);
    h.assert_trap("trunc_u64", &[f64(18_446_744_073_709_551_616.0)], Trap::IntegerOverflow);

    // the edges of each integer range
    h.assert_return("trunc_s64", &[f64(-2_147_483_648.9)], &[Val::I32(i32::MIN)]);
    h.assert_trap("trunc_s64", &[f64(-2_147_483_649.0)], Trap::IntegerOverflow);
    h.assert_return("trunc_s64", &[f64(2_147_483_647.9)], &[Val::I32(i32::MAX)]);
    h.assert_trap("trunc_s64", &[f64(2_147_483_648.0)], Trap::IntegerOverflow);
    h.assert_return("trunc_u32", &[f32(4_294_967_040.0)], &[Val::I32(-256)]);
    h.assert_trap("trunc_u32", &[f32(4_294_967_296.0)], Trap::IntegerOverflow);
    h.assert_return("trunc_u32", &[f32(-0.5)], &[Val::I32(0)]);
    h.assert_return("trunc_i64", &[f32(-9_223_372_036_854_775_808.0)], &[Val::I64(i64::MIN)]);
    h.assert_trap("trunc_i64", &[f32(9_223_372_036_854_775_808.0)], Trap::IntegerOverflow);
    h.assert_trap("trunc_i64", &[f32(f32::NEG_INFINITY)], Trap::IntegerOverflow);

    h.assert_return("sat_s", &[f32(f32::NAN)], &[Val::I32(0)]);
    h.assert_return("sat_s", &[f32(1e10)], &[Val::I32(i32::MAX)]);
    h.assert_return("sat_s", &[f32(-1e10)], &[Val::I32(i32::MIN)]);
    h.assert_return("sat_u64", &[f64(-5.0)], &[Val::I64(0)]);
    h.assert_return("sat_u64", &[f64(1e30)], &[Val::I64(-1)]);

    h.assert_return("convert_u64", &[Val::I64(-1)], &[f32(18_446_744_073_709_551_616.0)]);
    h.assert_return(
        "convert_u64_f64",
        &[Val::I64(-1)],
        &[f64(18_446_744_073_709_551_616.0)],
    );
    h.assert_return("convert_s", &[Val::I32(-5)], &[f64(-5.0)]);
    h.assert_return("convert_u64", &[Val::I64(i64::MIN)], &[f32(9_223_372_036_854_775_808.0)]);
    h.assert_return("wrap", &[Val::I64(0x1_0000_0005)], &[Val::I32(5)]);
    h.assert_return("extend_u", &[Val::I32(-1)], &[Val::I64(0xffff_ffff)]);
    h.assert_return("reinterpret", &[f32(-0.0)], &[Val::I32(i32::MIN)]);
}

#[test]
fn memory_access() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (memory 1 2)
            (data (i32.const 16) "\80\ff\01\02")
            (func (export "load8_s") (param i32) (result i32) (i32.load8_s (local.get 0)))
            (func (export "load16_u") (param i32) (result i32) (i32.load16_u (local.get 0)))
            (func (export "load32_s") (param i32) (result i64) (i64.load32_s offset=16 (local.get 0)))
            (func (export "store") (param i32 i64) (i64.store (local.get 0) (local.get 1)))
            (func (export "load") (param i32) (result i64) (i64.load (local.get 0)))
            (func (export "store8") (param i32 i32) (i32.store8 (local.get 0) (local.get 1)))
            (func (export "size") (result i32) (memory.size))
            (func (export "grow") (param i32) (result i32) (memory.grow (local.get 0))))"#,
    );

    h.assert_return("load8_s", &[Val::I32(16)], &[Val::I32(-128)]);
    h.assert_return("load16_u", &[Val::I32(16)], &[Val::I32(0xff80)]);
    h.assert_return("load32_s", &[Val::I32(0)], &[Val::I64(0x0201_ff80)]);

    // unaligned access and byte order
    h.assert_return("store", &[Val::I32(3), Val::I64(0x0102_0304_0506_0708)], &[]);
    h.assert_return("load8_s", &[Val::I32(3)], &[Val::I32(8)]);
    h.assert_return("load", &[Val::I32(3)], &[Val::I64(0x0102_0304_0506_0708)]);
    h.assert_return("store8", &[Val::I32(65535), Val::I32(0x1ff)], &[]);
    h.assert_return("load16_u", &[Val::I32(65534)], &[Val::I32(0xff00)]);

    // an out of bounds store leaves memory untouched
    h.assert_trap("store", &[Val::I32(65530), Val::I64(-1)], Trap::MemoryOutOfBounds);
    h.assert_return("load8_s", &[Val::I32(65530)], &[Val::I32(0)]);
    h.assert_trap("load", &[Val::I32(-1)], Trap::MemoryOutOfBounds);
    h.assert_trap("load32_s", &[Val::I32(65520)], Trap::MemoryOutOfBounds);

    h.assert_return("size", &[], &[Val::I32(1)]);
    h.assert_return("grow", &[Val::I32(1)], &[Val::I32(1)]);
    h.assert_return("size", &[], &[Val::I32(2)]);
    h.assert_return("grow", &[Val::I32(1)], &[Val::I32(-1)]);
    h.assert_return("size", &[], &[Val::I32(2)]);
    // the grown page is accessible, in compiled code too
    h.assert_return("load", &[Val::I32(65536 + 8)], &[Val::I64(0)]);
    h.assert_trap("load", &[Val::I32(2 * 65536 - 7)], Trap::MemoryOutOfBounds);
}

#[test]
fn bulk_memory() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (memory 1)
            (data $d "hello")
            (func (export "init") (param i32 i32 i32) (memory.init $d (local.get 0) (local.get 1) (local.get 2)))
            (func (export "drop") (data.drop $d))
            (func (export "fill") (param i32 i32 i32) (memory.fill (local.get 0) (local.get 1) (local.get 2)))
            (func (export "copy") (param i32 i32 i32) (memory.copy (local.get 0) (local.get 1) (local.get 2)))
            (func (export "load") (param i32) (result i64) (i64.load (local.get 0))))"#,
    );

    h.assert_return("init", &[Val::I32(0), Val::I32(1), Val::I32(4)], &[]);
    h.assert_return("load", &[Val::I32(0)], &[Val::I64(0x6f6c_6c65)]);
    h.assert_trap("init", &[Val::I32(0), Val::I32(2), Val::I32(4)], Trap::MemoryOutOfBounds);

    // overlapping copy
    h.assert_return("copy", &[Val::I32(1), Val::I32(0), Val::I32(4)], &[]);
    h.assert_return("load", &[Val::I32(0)], &[Val::I64(0x6f_6c6c_6565)]);

    h.assert_return("fill", &[Val::I32(0), Val::I32(0x1aa), Val::I32(2)], &[]);
    h.assert_return("load", &[Val::I32(0)], &[Val::I64(0x6f_6c6c_aaaa)]);
    h.assert_trap("fill", &[Val::I32(65535), Val::I32(0), Val::I32(2)], Trap::MemoryOutOfBounds);
    h.assert_trap("copy", &[Val::I32(0), Val::I32(65535), Val::I32(2)], Trap::MemoryOutOfBounds);

    // a dropped segment behaves as empty
    h.assert_return("drop", &[], &[]);
    h.assert_return("init", &[Val::I32(0), Val::I32(0), Val::I32(0)], &[]);
    h.assert_trap("init", &[Val::I32(0), Val::I32(0), Val::I32(1)], Trap::MemoryOutOfBounds);
}

#[test]
fn control_flow() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (func (export "fac") (param i64) (result i64)
                (local i64)
                (local.set 1 (i64.const 1))
                (block $done
                    (loop $again
                        (br_if $done (i64.le_u (local.get 0) (i64.const 1)))
                        (local.set 1 (i64.mul (local.get 1) (local.get 0)))
                        (local.set 0 (i64.sub (local.get 0) (i64.const 1)))
                        (br $again)))
                (local.get 1))
            (func (export "switch") (param i32) (result i32)
                (block $d (result i32)
                    (block $c (result i32)
                        (block $b (result i32)
                            (block $a (result i32)
                                (i32.const 100)
                                (local.get 0)
                                (br_table $a $b $c $d))
                            (i32.add (i32.const 1)))
                        (i32.add (i32.const 2)))
                    (i32.add (i32.const 3))))
            (func (export "switch_empty") (param i32) (result i32)
                (block $b
                    (block $a
                        (br_table $a $b $a (local.get 0)))
                    (return (i32.const 10)))
                (i32.const 20))
            (func (export "swap") (param i32 i32) (result i32 i32)
                (local.get 1) (local.get 0))
            (func (export "block_params") (param i32) (result i32)
                (local.get 0)
                (block (param i32) (result i32)
                    (i32.const 2)
                    (i32.mul)))
            (func (export "if_params") (param i32 i32) (result i32)
                (local.get 0)
                (if (param i32) (result i32) (local.get 1)
                    (then (i32.const 1) (i32.add))
                    (else (i32.const 1) (i32.sub))))
            (func (export "if_no_else") (param i32) (result i32)
                (local i32)
                (if (local.get 0) (then (local.set 1 (i32.const 7))))
                (local.get 1))
            (func (export "select") (param i32 i64 i64) (result i64)
                (select (local.get 1) (local.get 2) (local.get 0)))
            (func (export "early_return") (param i32) (result i32)
                (if (local.get 0) (then (return (i32.const 1))))
                (unreachable))
            (func (export "dead_code") (result i32)
                (block (result i32)
                    (br 0 (i32.const 5))
                    (drop)
                    (i32.const 6))))"#,
    );

    h.assert_return("fac", &[Val::I64(20)], &[Val::I64(2_432_902_008_176_640_000)]);
    h.assert_return("switch", &[Val::I32(0)], &[Val::I32(106)]);
    h.assert_return("switch", &[Val::I32(1)], &[Val::I32(105)]);
    h.assert_return("switch", &[Val::I32(2)], &[Val::I32(103)]);
    h.assert_return("switch", &[Val::I32(3)], &[Val::I32(100)]);
    h.assert_return("switch", &[Val::I32(-1)], &[Val::I32(100)]);
    h.assert_return("switch_empty", &[Val::I32(0)], &[Val::I32(10)]);
    h.assert_return("switch_empty", &[Val::I32(1)], &[Val::I32(20)]);
    h.assert_return("switch_empty", &[Val::I32(7)], &[Val::I32(10)]);
    h.assert_return("swap", &[Val::I32(1), Val::I32(2)], &[Val::I32(2), Val::I32(1)]);
    h.assert_return("block_params", &[Val::I32(21)], &[Val::I32(42)]);
    h.assert_return("if_params", &[Val::I32(5), Val::I32(1)], &[Val::I32(6)]);
    h.assert_return("if_params", &[Val::I32(5), Val::I32(0)], &[Val::I32(4)]);
    h.assert_return("if_no_else", &[Val::I32(1)], &[Val::I32(7)]);
    h.assert_return("if_no_else", &[Val::I32(0)], &[Val::I32(0)]);
    h.assert_return("select", &[Val::I32(1), Val::I64(1), Val::I64(2)], &[Val::I64(1)]);
    h.assert_return("select", &[Val::I32(0), Val::I64(1), Val::I64(2)], &[Val::I64(2)]);
    h.assert_return("early_return", &[Val::I32(1)], &[Val::I32(1)]);
    h.assert_trap("early_return", &[Val::I32(0)], Trap::UnreachableCodeReached);
    h.assert_return("dead_code", &[], &[Val::I32(5)]);
}

#[test]
fn globals() {
    let _trace = trace();
    let h = Harness::with_imports(
        r#"(module
            (import "env" "base" (global $base i64))
            (global $counter (export "counter") (mut i32) (i32.const 0))
            (global $scale (mut f64) (f64.const 1.5))
            (func (export "bump") (result i32)
                (global.set $counter (i32.add (global.get $counter) (i32.const 1)))
                (global.get $counter))
            (func (export "scaled") (param f64) (result f64)
                (f64.mul (local.get 0) (global.get $scale)))
            (func (export "base") (result i64) (global.get $base)))"#,
        |ns| {
            ns.define_global("env", "base", Val::I64(-42)).unwrap();
        },
    );

    h.assert_return("bump", &[], &[Val::I32(1)]);
    h.assert_return("bump", &[], &[Val::I32(2)]);
    h.assert_return("scaled", &[f64(2.0)], &[f64(3.0)]);
    h.assert_return("base", &[], &[Val::I64(-42)]);
}

#[test]
fn calls() {
    let _trace = trace();
    let h = Harness::with_imports(
        r#"(module
            (type $binop (func (param i32 i32) (result i32)))
            (type $unop (func (param i32) (result i32)))
            (import "env" "mul_add" (func $mul_add (param i64 i32 f64) (result f64)))
            (table 4 funcref)
            (elem (i32.const 0) $add $sub $neg)
            (func $add (type $binop) (i32.add (local.get 0) (local.get 1)))
            (func $sub (type $binop) (i32.sub (local.get 0) (local.get 1)))
            (func $neg (type $unop) (i32.sub (i32.const 0) (local.get 0)))
            (func (export "dispatch") (param i32 i32 i32) (result i32)
                (call_indirect (type $binop) (local.get 1) (local.get 2) (local.get 0)))
            (func (export "host") (param i64) (result f64)
                (call $mul_add (local.get 0) (i32.const 3) (f64.const 0.5)))
            (func $fib (export "fib") (param i64) (result i64)
                (if (result i64) (i64.lt_u (local.get 0) (i64.const 2))
                    (then (local.get 0))
                    (else
                        (i64.add
                            (call $fib (i64.sub (local.get 0) (i64.const 1)))
                            (call $fib (i64.sub (local.get 0) (i64.const 2)))))))
            (func $forever (export "forever") (param i32) (result i32)
                (call $forever (i32.add (local.get 0) (i32.const 1)))))"#,
        |ns| {
            ns.func_wrap("env", "mul_add", |a: i64, b: i32, c: f64| -> f64 {
                a as f64 * f64::from(b) + c
            })
            .unwrap();
        },
    );

    h.assert_return("dispatch", &[Val::I32(0), Val::I32(5), Val::I32(3)], &[Val::I32(8)]);
    h.assert_return("dispatch", &[Val::I32(1), Val::I32(5), Val::I32(3)], &[Val::I32(2)]);
    h.assert_trap("dispatch", &[Val::I32(2), Val::I32(5), Val::I32(3)], Trap::BadSignature);
    h.assert_trap("dispatch", &[Val::I32(3), Val::I32(5), Val::I32(3)], Trap::IndirectCallToNull);
    h.assert_trap("dispatch", &[Val::I32(4), Val::I32(5), Val::I32(3)], Trap::TableOutOfBounds);

    h.assert_return("host", &[Val::I64(4)], &[f64(12.5)]);
    h.assert_return("fib", &[Val::I64(24)], &[Val::I64(46368)]);
    h.assert_trap("forever", &[Val::I32(0)], Trap::StackOverflow);
    // the instance stays usable after a trap
    h.assert_return("fib", &[Val::I64(10)], &[Val::I64(55)]);
}

/// A recursive function with `locals` i64 locals, all of them live across the call.
fn wide_recursion(locals: usize) -> String {
    let mut wat = String::from("(module (memory 1)\n(func $rec (export \"rec\") (param $n i32) (result i64)");
    for i in 0..locals {
        write!(wat, " (local $l{i} i64)").unwrap();
    }
    for i in 0..locals {
        write!(
            wat,
            "\n(local.set $l{i} (i64.add (i64.load offset={} (i32.const 0)) (i64.const {i})))",
            i * 8
        )
        .unwrap();
    }
    wat.push_str(
        "\n(if (result i64) (i32.eqz (local.get $n)) (then (i64.const 0)) (else \
         (call $rec (i32.sub (local.get $n) (i32.const 1)))",
    );
    for i in 0..locals {
        write!(wat, " (local.get $l{i}) i64.add").unwrap();
    }
    wat.push_str("))))");
    wat
}

#[test]
fn deep_recursion_with_wide_frames() {
    let _trace = trace();
    let h = Harness::new(&wide_recursion(200));
    let per_frame: i64 = (0..200).sum();

    for n in [2000, 5000, 9000] {
        h.assert_return("rec", &[Val::I32(n)], &[Val::I64(i64::from(n) * per_frame)]);
    }
}

#[test]
fn call_depth_limit_is_shared() {
    let _trace = trace();
    let h = Harness::new(
        r#"(module
            (func $rec (export "rec") (param i32) (result i32)
                (if (result i32) (i32.eqz (local.get 0))
                    (then (i32.const 0))
                    (else (i32.add (i32.const 1) (call $rec (i32.sub (local.get 0) (i32.const 1))))))))"#,
    );

    // `rec(n)` runs n + 1 activations
    let deepest = DEFAULT_MAX_CALL_DEPTH - 1;
    h.assert_return("rec", &[Val::I32(deepest as i32)], &[Val::I32(deepest as i32)]);
    h.assert_trap("rec", &[Val::I32(deepest as i32 + 1)], Trap::StackOverflow);
    // the instance stays usable after an overflow
    h.assert_return("rec", &[Val::I32(10)], &[Val::I32(10)]);
}

#[test]
fn stack_slot_limit_is_shared() {
    let _trace = trace();
    let h = Harness::with_config(&wide_recursion(200), |config| {
        config.max_stack_slots(20_000);
    });

    let first_overflow = (0..200)
        .find(|n| h.outcome("rec", &[Val::I32(*n)]).is_err())
        .unwrap();
    assert!(first_overflow > 50, "{first_overflow}");
    assert_eq!(
        h.outcome("rec", &[Val::I32(first_overflow)]),
        Err(Trap::StackOverflow)
    );
    assert!(h.outcome("rec", &[Val::I32(first_overflow - 1)]).is_ok());
}

#[test]
fn host_calls_back_into_the_guest() {
    let _trace = trace();
    let h = Harness::with_imports(
        r#"(module
            (import "env" "twice" (func $twice (param i32) (result i32)))
            (memory 1)
            (func (export "double") (param i32) (result i32)
                (drop (memory.grow (i32.const 1)))
                (i32.store (i32.const 65536) (local.get 0))
                (i32.mul (local.get 0) (i32.const 2)))
            (func (export "run") (param i32) (result i32)
                (i32.add (call $twice (local.get 0)) (i32.load (i32.const 65536)))))"#,
        |ns| {
            ns.func_wrap("env", "twice", |mut caller: Caller<'_>, x: i32| -> sandvm::Result<i32> {
                let res = caller.call("double", &[Val::I32(x)])?;
                match res.as_slice() {
                    [Val::I32(doubled)] => Ok(*doubled),
                    _ => Err(sandvm::Error::host("unexpected results")),
                }
            })
            .unwrap();
        },
    );

    // the callee grows memory, the caller observes the new page
    h.assert_return("run", &[Val::I32(21)], &[Val::I32(63)]);
}

#[test]
fn exit_is_not_a_trap() {
    let _trace = trace();
    let h = Harness::with_imports(
        r#"(module
            (import "env" "exit" (func $exit (param i32)))
            (func (export "run") (call $exit (i32.const 3)) (unreachable)))"#,
        |ns| {
            ns.func_wrap("env", "exit", |mut caller: Caller<'_>, code: u32| caller.exit(code))
                .unwrap();
        },
    );

    h.assert_exit("run", &[], 3);
}
