// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Numeric instruction semantics.
//!
//! Floats are handled as raw bits. Arithmetic results that are NaN are replaced by the
//! canonical quiet NaN, sign and reinterpret operations keep the payload.

use crate::trap::Trap;
use crate::translate::{ConvOp, FBinOp, FCmp, FUnOp, IBinOp, ICmp, IUnOp};
use crate::values::VMVal;

pub const F32_CANONICAL_NAN: u32 = 0x7fc0_0000;
pub const F64_CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

const F32_SIGN: u32 = 1 << 31;
const F64_SIGN: u64 = 1 << 63;

macro_rules! int_ops {
    ($bin:ident, $un:ident, $cmp:ident, $s:ty, $u:ty) => {
        pub fn $bin(op: IBinOp, a: $s, b: $s) -> Result<$s, Trap> {
            Ok(match op {
                IBinOp::Add => a.wrapping_add(b),
                IBinOp::Sub => a.wrapping_sub(b),
                IBinOp::Mul => a.wrapping_mul(b),
                IBinOp::DivS => {
                    if b == 0 {
                        return Err(Trap::IntegerDivisionByZero);
                    }
                    if a == <$s>::MIN && b == -1 {
                        return Err(Trap::IntegerOverflow);
                    }
                    a / b
                }
                IBinOp::DivU => {
                    if b == 0 {
                        return Err(Trap::IntegerDivisionByZero);
                    }
                    ((a as $u) / (b as $u)) as $s
                }
                IBinOp::RemS => {
                    if b == 0 {
                        return Err(Trap::IntegerDivisionByZero);
                    }
                    a.wrapping_rem(b)
                }
                IBinOp::RemU => {
                    if b == 0 {
                        return Err(Trap::IntegerDivisionByZero);
                    }
                    ((a as $u) % (b as $u)) as $s
                }
                IBinOp::And => a & b,
                IBinOp::Or => a | b,
                IBinOp::Xor => a ^ b,
                IBinOp::Shl => a.wrapping_shl(b as u32),
                IBinOp::ShrS => a.wrapping_shr(b as u32),
                IBinOp::ShrU => (a as $u).wrapping_shr(b as u32) as $s,
                IBinOp::Rotl => a.rotate_left((b as u32) % <$s>::BITS),
                IBinOp::Rotr => a.rotate_right((b as u32) % <$s>::BITS),
            })
        }

        pub fn $un(op: IUnOp, a: $s) -> $s {
            match op {
                IUnOp::Clz => a.leading_zeros() as $s,
                IUnOp::Ctz => a.trailing_zeros() as $s,
                IUnOp::Popcnt => a.count_ones() as $s,
                IUnOp::Extend8S => a as i8 as $s,
                IUnOp::Extend16S => a as i16 as $s,
                IUnOp::Extend32S => a as i32 as $s,
            }
        }

        pub fn $cmp(op: ICmp, a: $s, b: $s) -> bool {
            match op {
                ICmp::Eq => a == b,
                ICmp::Ne => a != b,
                ICmp::LtS => a < b,
                ICmp::LtU => (a as $u) < (b as $u),
                ICmp::GtS => a > b,
                ICmp::GtU => (a as $u) > (b as $u),
                ICmp::LeS => a <= b,
                ICmp::LeU => (a as $u) <= (b as $u),
                ICmp::GeS => a >= b,
                ICmp::GeU => (a as $u) >= (b as $u),
            }
        }
    };
}

int_ops!(i32_bin, i32_un, i32_cmp, i32, u32);
int_ops!(i64_bin, i64_un, i64_cmp, i64, u64);

macro_rules! float_ops {
    ($bin:ident, $un:ident, $cmp:ident, $canon:ident, $f:ty, $bits:ty, $sign:ident, $nan:ident) => {
        fn $canon(v: $f) -> $bits {
            if v.is_nan() { $nan } else { v.to_bits() }
        }

        pub fn $bin(op: FBinOp, a: $bits, b: $bits) -> $bits {
            let (x, y) = (<$f>::from_bits(a), <$f>::from_bits(b));
            match op {
                FBinOp::Add => $canon(x + y),
                FBinOp::Sub => $canon(x - y),
                FBinOp::Mul => $canon(x * y),
                FBinOp::Div => $canon(x / y),
                FBinOp::Min => {
                    if x.is_nan() || y.is_nan() {
                        $nan
                    } else if x == y {
                        // -0.0 and 0.0 compare equal, the minimum is negative if either is.
                        a | b
                    } else if x < y {
                        a
                    } else {
                        b
                    }
                }
                FBinOp::Max => {
                    if x.is_nan() || y.is_nan() {
                        $nan
                    } else if x == y {
                        a & b
                    } else if x > y {
                        a
                    } else {
                        b
                    }
                }
                FBinOp::Copysign => (a & !$sign) | (b & $sign),
            }
        }

        pub fn $un(op: FUnOp, a: $bits) -> $bits {
            let x = <$f>::from_bits(a);
            match op {
                FUnOp::Abs => a & !$sign,
                FUnOp::Neg => a ^ $sign,
                FUnOp::Ceil => $canon(x.ceil()),
                FUnOp::Floor => $canon(x.floor()),
                FUnOp::Trunc => $canon(x.trunc()),
                FUnOp::Nearest => $canon(x.round_ties_even()),
                FUnOp::Sqrt => $canon(x.sqrt()),
            }
        }

        pub fn $cmp(op: FCmp, a: $bits, b: $bits) -> bool {
            let (x, y) = (<$f>::from_bits(a), <$f>::from_bits(b));
            match op {
                FCmp::Eq => x == y,
                FCmp::Ne => x != y,
                FCmp::Lt => x < y,
                FCmp::Gt => x > y,
                FCmp::Le => x <= y,
                FCmp::Ge => x >= y,
            }
        }
    };
}

float_ops!(
    f32_bin,
    f32_un,
    f32_cmp,
    canon_f32,
    f32,
    u32,
    F32_SIGN,
    F32_CANONICAL_NAN
);
float_ops!(
    f64_bin,
    f64_un,
    f64_cmp,
    canon_f64,
    f64,
    u64,
    F64_SIGN,
    F64_CANONICAL_NAN
);

/// Checks a trapping float-to-int truncation. `lower` and `upper` are exclusive bounds.
fn checked_trunc(x: f64, lower: f64, upper: f64) -> Result<f64, Trap> {
    if x.is_nan() {
        return Err(Trap::BadConversionToInteger);
    }
    if x <= lower || x >= upper {
        return Err(Trap::IntegerOverflow);
    }
    Ok(x.trunc())
}

const I32_LOWER: f64 = -2_147_483_649.0;
const I32_UPPER: f64 = 2_147_483_648.0;
const U32_UPPER: f64 = 4_294_967_296.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;
const U64_UPPER: f64 = 18_446_744_073_709_551_616.0;

fn trunc_i64(x: f64) -> Result<i64, Trap> {
    if x.is_nan() {
        return Err(Trap::BadConversionToInteger);
    }
    // -2^63 itself is representable, the lower bound is inclusive.
    if x < -I64_UPPER || x >= I64_UPPER {
        return Err(Trap::IntegerOverflow);
    }
    Ok(x as i64)
}

pub fn convert(op: ConvOp, v: VMVal) -> Result<VMVal, Trap> {
    let f32v = || f64::from(f32::from_bits(v.get_f32()));
    let f64v = || f64::from_bits(v.get_f64());
    let f32s = || f32::from_bits(v.get_f32());

    Ok(match op {
        ConvOp::I32WrapI64 => VMVal::i32(v.get_i64() as i32),
        ConvOp::I64ExtendI32S => VMVal::i64(i64::from(v.get_i32())),
        ConvOp::I64ExtendI32U => VMVal::u64(u64::from(v.get_u32())),

        ConvOp::I32TruncF32S => VMVal::i32(checked_trunc(f32v(), I32_LOWER, I32_UPPER)? as i32),
        ConvOp::I32TruncF64S => VMVal::i32(checked_trunc(f64v(), I32_LOWER, I32_UPPER)? as i32),
        ConvOp::I32TruncF32U => VMVal::u32(checked_trunc(f32v(), -1.0, U32_UPPER)? as u32),
        ConvOp::I32TruncF64U => VMVal::u32(checked_trunc(f64v(), -1.0, U32_UPPER)? as u32),
        ConvOp::I64TruncF32S => VMVal::i64(trunc_i64(f32v())?),
        ConvOp::I64TruncF64S => VMVal::i64(trunc_i64(f64v())?),
        ConvOp::I64TruncF32U => VMVal::u64(checked_trunc(f32v(), -1.0, U64_UPPER)? as u64),
        ConvOp::I64TruncF64U => VMVal::u64(checked_trunc(f64v(), -1.0, U64_UPPER)? as u64),

        // `as` saturates and maps NaN to zero.
        ConvOp::I32TruncSatF32S => VMVal::i32(f32s() as i32),
        ConvOp::I32TruncSatF32U => VMVal::u32(f32s() as u32),
        ConvOp::I32TruncSatF64S => VMVal::i32(f64v() as i32),
        ConvOp::I32TruncSatF64U => VMVal::u32(f64v() as u32),
        ConvOp::I64TruncSatF32S => VMVal::i64(f32s() as i64),
        ConvOp::I64TruncSatF32U => VMVal::u64(f32s() as u64),
        ConvOp::I64TruncSatF64S => VMVal::i64(f64v() as i64),
        ConvOp::I64TruncSatF64U => VMVal::u64(f64v() as u64),

        ConvOp::F32ConvertI32S => VMVal::f32((v.get_i32() as f32).to_bits()),
        ConvOp::F32ConvertI32U => VMVal::f32((v.get_u32() as f32).to_bits()),
        ConvOp::F32ConvertI64S => VMVal::f32((v.get_i64() as f32).to_bits()),
        ConvOp::F32ConvertI64U => VMVal::f32((v.get_u64() as f32).to_bits()),
        ConvOp::F64ConvertI32S => VMVal::f64(f64::from(v.get_i32()).to_bits()),
        ConvOp::F64ConvertI32U => VMVal::f64(f64::from(v.get_u32()).to_bits()),
        ConvOp::F64ConvertI64S => VMVal::f64((v.get_i64() as f64).to_bits()),
        ConvOp::F64ConvertI64U => VMVal::f64((v.get_u64() as f64).to_bits()),

        ConvOp::F32DemoteF64 => VMVal::f32(canon_f32(f64v() as f32)),
        ConvOp::F64PromoteF32 => VMVal::f64(canon_f64(f32v())),

        ConvOp::I32ReinterpretF32 | ConvOp::F32ReinterpretI32 => VMVal::u32(v.get_u32()),
        ConvOp::I64ReinterpretF64 | ConvOp::F64ReinterpretI64 => VMVal::u64(v.get_u64()),
    })
}
