// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// A runtime-detected guest fault.
///
/// A trap aborts the current call chain but leaves the instance intact, it may be called again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Trap {
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,
    /// An out-of-bounds memory access.
    MemoryOutOfBounds,
    /// Out-of-bounds access to a table.
    TableOutOfBounds,
    /// Indirect call to a null table entry.
    IndirectCallToNull,
    /// Signature mismatch on indirect call.
    BadSignature,
    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,
    /// An integer division by zero.
    IntegerDivisionByZero,
    /// Failed float-to-int conversion.
    BadConversionToInteger,
    /// The call stack was exhausted.
    StackOverflow,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::UnreachableCodeReached => f.write_str("unreachable code executed"),
            Trap::MemoryOutOfBounds => f.write_str("out of bounds memory access"),
            Trap::TableOutOfBounds => f.write_str("out of bounds table access"),
            Trap::IndirectCallToNull => f.write_str("accessed uninitialized table element"),
            Trap::BadSignature => f.write_str("indirect call signature mismatch"),
            Trap::IntegerOverflow => f.write_str("integer overflow"),
            Trap::IntegerDivisionByZero => f.write_str("integer divide by zero"),
            Trap::BadConversionToInteger => f.write_str("invalid conversion to integer"),
            Trap::StackOverflow => f.write_str("call stack exhausted"),
        }
    }
}

impl core::error::Error for Trap {}

impl From<Trap> for u8 {
    fn from(value: Trap) -> Self {
        match value {
            Trap::UnreachableCodeReached => 0,
            Trap::MemoryOutOfBounds => 1,
            Trap::TableOutOfBounds => 2,
            Trap::IndirectCallToNull => 3,
            Trap::BadSignature => 4,
            Trap::IntegerOverflow => 5,
            Trap::IntegerDivisionByZero => 6,
            Trap::BadConversionToInteger => 7,
            Trap::StackOverflow => 8,
        }
    }
}

impl TryFrom<u8> for Trap {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::UnreachableCodeReached),
            1 => Ok(Self::MemoryOutOfBounds),
            2 => Ok(Self::TableOutOfBounds),
            3 => Ok(Self::IndirectCallToNull),
            4 => Ok(Self::BadSignature),
            5 => Ok(Self::IntegerOverflow),
            6 => Ok(Self::IntegerDivisionByZero),
            7 => Ok(Self::BadConversionToInteger),
            8 => Ok(Self::StackOverflow),
            _ => Err(()),
        }
    }
}
