// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::trap::Trap;

/// Convenience macro for creating an `Error::Unsupported` variant.
#[macro_export]
macro_rules! wasm_unsupported {
    ($($arg:tt)*) => { $crate::Error::Unsupported(::alloc::format!($($arg)*)) }
}

/// The error type a host function reports its failure with.
pub type HostError = Box<dyn core::error::Error + Send + Sync>;

/// Error type for the crate
#[derive(Debug)]
pub enum Error {
    /// The input is not a well-formed WebAssembly binary.
    Decode {
        /// A string describing the decoding error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// The input is well-formed but failed validation.
    Validation {
        /// A string describing the violated rule.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// Instantiating a module failed, no instance was created.
    Instantiation(InstantiationError),
    /// A WebAssembly trap occurred.
    Trap(Trap),
    /// The guest requested termination with an exit code.
    Exit {
        /// The name of the exiting instance.
        module: String,
        /// The exit code the guest passed.
        code: u32,
    },
    /// A host-implemented function reported failure.
    HostFunction {
        /// The `module.field` name the function was imported under.
        func: String,
        /// The reported error.
        source: HostError,
    },
    /// The instance was closed or has exited and can no longer be called.
    Closed {
        /// The name of the closed instance.
        module: String,
        /// The exit code if the instance was closed by an exit request.
        exit_code: Option<u32>,
    },
    /// The WebAssembly code used an unsupported feature.
    Unsupported(String),
    /// Failed to compile a function.
    Cranelift {
        /// The name of the function that failed to compile.
        func_name: String,
        /// A human-readable description of the error.
        message: String,
    },
    /// Memory mapping failed
    MmapFailed,
    /// A value passed to or returned from an exported function had the wrong type.
    Type(String),
    /// The instance has no export with this name.
    UnknownExport(String),
    /// Closing one or more instances failed, every instance was still released.
    CloseFailed(Vec<Error>),
}

/// Reasons instantiating a module can fail.
#[derive(Debug)]
pub enum InstantiationError {
    /// A required import was not provided.
    MissingImport {
        /// The module name of the import.
        module: String,
        /// The field name of the import.
        field: String,
        /// The kind of the import.
        kind: &'static str,
    },
    /// An import was provided but its type does not match the declaration.
    IncompatibleImport {
        module: String,
        field: String,
        expected: String,
        actual: String,
    },
    /// An import of a kind this runtime cannot bind, such as an imported memory.
    UnsupportedImport {
        module: String,
        field: String,
        kind: &'static str,
    },
    /// The name is already defined.
    AlreadyDefined {
        /// The defined module name.
        module: String,
        /// The defined field name, empty if the module name itself is taken.
        field: String,
    },
    /// An active data or element segment does not fit its memory or table.
    SegmentOutOfBounds {
        /// Either "data" or "element".
        kind: &'static str,
        index: u32,
    },
    /// The start function failed.
    Start(Box<Error>),
}

impl Error {
    /// Wraps a reader error raised while decoding.
    pub(crate) fn decode(e: wasmparser::BinaryReaderError) -> Self {
        Self::Decode {
            message: e.message().into(),
            offset: e.offset(),
        }
    }

    /// Wraps a reader error raised by the validator.
    pub(crate) fn validation(e: wasmparser::BinaryReaderError) -> Self {
        Self::Validation {
            message: e.message().into(),
            offset: e.offset(),
        }
    }

    /// Creates a host function error, the name of the failing import is filled in by the caller.
    pub fn host(source: impl Into<HostError>) -> Self {
        Self::HostFunction {
            func: String::new(),
            source: source.into(),
        }
    }

    pub(crate) fn with_host_func_name(self, module: &str, field: &str) -> Self {
        match self {
            Self::HostFunction { func, source } if func.is_empty() => Self::HostFunction {
                func: alloc::format!("{module}.{field}"),
                source,
            },
            e => e,
        }
    }

    /// Returns the trap if this error is one.
    pub fn as_trap(&self) -> Option<Trap> {
        match self {
            Self::Trap(trap) => Some(*trap),
            _ => None,
        }
    }

    /// Returns the exit code if this error is an exit request.
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode { message, offset } => {
                write!(f, "malformed WASM input at {offset}: {message}")
            }
            Self::Validation { message, offset } => {
                write!(f, "invalid WASM input at {offset}: {message}")
            }
            Self::Instantiation(e) => write!(f, "instantiation failed: {e}"),
            Self::Trap(trap) => write!(f, "wasm trap: {trap}"),
            Self::Exit { module, code } => {
                write!(f, "module \"{module}\" closed with exit_code({code})")
            }
            Self::HostFunction { func, source } => {
                write!(f, "host function {func} failed: {source}")
            }
            Self::Closed {
                module,
                exit_code: Some(code),
            } => write!(f, "module \"{module}\" closed with exit_code({code})"),
            Self::Closed {
                module,
                exit_code: None,
            } => write!(f, "module \"{module}\" closed"),
            Self::Unsupported(feature) => write!(
                f,
                "Feature used by the WebAssembly code is not supported: {feature}"
            ),
            Self::Cranelift { func_name, message } => {
                write!(f, "failed to compile function {func_name}: {message}")
            }
            Self::MmapFailed => f.write_str("Memory mapping failed"),
            Self::Type(message) => write!(f, "type mismatch: {message}"),
            Self::UnknownExport(name) => write!(f, "unknown export {name}"),
            Self::CloseFailed(errors) => {
                write!(f, "failed to close {} instance(s)", errors.len())?;
                for e in errors {
                    write!(f, "\n  {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for InstantiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingImport {
                module,
                field,
                kind,
            } => write!(f, "Missing {kind} import {module}::{field}"),
            Self::IncompatibleImport {
                module,
                field,
                expected,
                actual,
            } => write!(
                f,
                "import {module}::{field} has type {actual} but {expected} was expected"
            ),
            Self::UnsupportedImport {
                module,
                field,
                kind,
            } => write!(f, "cannot import {kind} {module}::{field}"),
            Self::AlreadyDefined { module, field } if field.is_empty() => {
                write!(f, "Name {module} is already defined")
            }
            Self::AlreadyDefined { module, field } => {
                write!(f, "Name {module}::{field} is already defined")
            }
            Self::SegmentOutOfBounds { kind, index } => {
                write!(f, "{kind} segment {index} does not fit")
            }
            Self::Start(e) => write!(f, "start function failed: {e}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Trap(trap) => Some(trap),
            Self::HostFunction { source, .. } => Some(&**source),
            Self::Instantiation(InstantiationError::Start(e)) => Some(&**e),
            _ => None,
        }
    }
}

impl core::error::Error for InstantiationError {}

impl From<Trap> for Error {
    fn from(trap: Trap) -> Self {
        Self::Trap(trap)
    }
}

impl From<InstantiationError> for Error {
    fn from(e: InstantiationError) -> Self {
        Self::Instantiation(e)
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::decode(e)
    }
}

