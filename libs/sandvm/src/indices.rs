// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_entity::entity_impl;

macro_rules! indices {
    ($($(#[$attr:meta])* $name:ident;)*) => {
        $(
            $(#[$attr])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);
            entity_impl!($name);
        )*
    };
}

indices! {
    /// A type section entry, duplicates included.
    TypeIndex;
    /// A function in the module's function index space, imports first.
    FuncIndex;
    /// A function with a body in this module.
    DefinedFuncIndex;
    /// A global in the module's global index space, imports first.
    GlobalIndex;
    ElemIndex;
    DataIndex;
    /// A local of one function, parameters first.
    LocalIndex;
}

/// An index of an entity in the module's index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityIndex {
    Function(FuncIndex),
    Table,
    Memory,
    Global(GlobalIndex),
}
