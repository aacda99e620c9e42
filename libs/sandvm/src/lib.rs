// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A sandboxed WebAssembly runtime.
//!
//! Modules are decoded and validated once, compiled by one of two engines (a portable
//! interpreter or a cranelift-based compiler), and instantiated into [`Namespace`]s. Guests can
//! only reach the host through the functions an embedder defines.

extern crate alloc;

mod compiler;
mod config;
mod engine;
mod errors;
mod func;
mod indices;
mod instance;
mod interpreter;
mod memory;
mod module;
mod namespace;
mod runtime;
mod sys;
mod translate;
mod trap;
mod types;
mod values;

pub type Result<T> = core::result::Result<T, Error>;

pub use compiler::Compiler;
pub use config::{Config, ModuleConfig, Strategy};
pub use errors::{Error, HostError, InstantiationError};
pub use func::{
    Caller, Func, HostFunc, HostParams, HostResults, IntoFunc, StackPointerFunc, TypedFunc,
    WasmParams, WasmResults, WasmTy,
};
pub use indices::{EntityIndex, FuncIndex, GlobalIndex};
pub use instance::Instance;
pub use memory::LinearMemory;
pub use module::{CompiledModule, Export, Import, Module};
pub use namespace::Namespace;
pub use runtime::Runtime;
pub use sys::{
    DETERMINISTIC_EPOCH_SECS, MonotonicNanotime, Nanotime, RngReader, SysContext, SystemWalltime,
    Walltime,
};
pub use trap::Trap;
pub use types::{EntityType, FuncType, GlobalType, MemoryType, TableType, ValType};
pub use values::{VMVal, Val};

/// The size of a WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: usize = 65536;
/// The number of pages a 32-bit memory can have before it runs out of byte index space.
pub const WASM32_MAX_PAGES: u32 = 1 << 16;
/// Nested guest activations allowed unless configured otherwise.
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 10_000;
/// Value slots all activations of one call may occupy unless configured otherwise.
pub const DEFAULT_MAX_STACK_SLOTS: u32 = 1 << 22;
