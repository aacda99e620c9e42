// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;

use crate::config::Config;
use crate::engine::CompiledCode;
use crate::indices::{
    DataIndex, DefinedFuncIndex, ElemIndex, EntityIndex, FuncIndex, GlobalIndex, TypeIndex,
};
use crate::translate::{ConstExpr, ModuleTranslator, Op};
use crate::types::{EntityType, FuncType, GlobalType, MemoryType, TableType, ValType};

/// An import declaration.
#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub index: EntityIndex,
    pub ty: EntityType,
}

/// An export declaration.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub index: EntityIndex,
}

/// How an element or data segment is applied.
#[derive(Debug, Clone)]
pub enum SegmentMode {
    /// Copied into the table or memory during instantiation.
    Active { offset: ConstExpr },
    /// Only available to `table.init` and `memory.init`.
    Passive,
    /// Forward-declares function references, never applied.
    Declared,
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub mode: SegmentMode,
    pub items: Box<[Option<FuncIndex>]>,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub mode: SegmentMode,
    pub bytes: Box<[u8]>,
}

/// A decoded and validated function body.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    /// Declared locals, excluding the parameters.
    pub locals: Box<[ValType]>,
    pub ops: Box<[Op]>,
    /// The highest the operand stack gets anywhere in the body.
    pub max_height: u32,
}

impl FunctionBody {
    /// The value slots one activation is charged: parameters, locals and the deepest operand
    /// stack of the body.
    ///
    /// Both engines count activations in these units so they run out of stack at the same
    /// call, whatever their native frames look like.
    pub fn frame_slots(&self, ty: &FuncType) -> u32 {
        u32::try_from(ty.params().len() + self.locals.len())
            .unwrap_or(u32::MAX)
            .saturating_add(self.max_height)
    }
}

/// A decoded and validated WebAssembly module.
///
/// Every index stored in the module and its function bodies has been checked by the
/// validator, engines rely on that and do not re-check them.
#[derive(Debug, Default)]
pub struct Module {
    pub(crate) name: Option<String>,
    pub(crate) types: PrimaryMap<TypeIndex, FuncType>,
    /// For every type, the first type index with a structurally equal signature.
    pub(crate) canonical_types: PrimaryMap<TypeIndex, TypeIndex>,
    pub(crate) functions: PrimaryMap<FuncIndex, TypeIndex>,
    pub(crate) num_imported_funcs: u32,
    pub(crate) globals: PrimaryMap<GlobalIndex, GlobalType>,
    pub(crate) num_imported_globals: u32,
    /// Initializers of the defined globals, in order.
    pub(crate) global_initializers: Vec<ConstExpr>,
    pub(crate) memory: Option<MemoryType>,
    pub(crate) table: Option<TableType>,
    pub(crate) imports: Vec<Import>,
    pub(crate) exports: Vec<Export>,
    pub(crate) export_map: HashMap<String, EntityIndex>,
    pub(crate) start: Option<FuncIndex>,
    pub(crate) elements: PrimaryMap<ElemIndex, ElementSegment>,
    pub(crate) data: PrimaryMap<DataIndex, DataSegment>,
    pub(crate) bodies: PrimaryMap<DefinedFuncIndex, FunctionBody>,
    pub(crate) func_names: HashMap<FuncIndex, String>,
    pub(crate) custom_sections: Vec<(String, Box<[u8]>)>,
}

impl Module {
    /// Decodes and validates `bytes` with the features enabled in `config`.
    pub fn from_binary(config: &Config, bytes: &[u8]) -> crate::Result<Self> {
        ModuleTranslator::new(config).translate(bytes)
    }

    /// The name from the module's name section, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn imports(&self) -> impl ExactSizeIterator<Item = &Import> + '_ {
        self.imports.iter()
    }

    pub fn exports(&self) -> impl ExactSizeIterator<Item = &Export> + '_ {
        self.exports.iter()
    }

    pub fn export(&self, name: &str) -> Option<EntityIndex> {
        self.export_map.get(name).copied()
    }

    /// The custom sections, by name and payload, in the order they appear.
    ///
    /// They are kept verbatim, only the `name` section is interpreted.
    pub fn custom_sections(&self) -> impl Iterator<Item = (&str, &[u8])> + '_ {
        self.custom_sections
            .iter()
            .map(|(name, data)| (name.as_str(), &**data))
    }

    pub fn memory(&self) -> Option<MemoryType> {
        self.memory
    }

    pub fn num_functions(&self) -> u32 {
        u32::try_from(self.functions.len()).unwrap_or(u32::MAX)
    }

    pub fn func_type(&self, index: FuncIndex) -> &FuncType {
        &self.types[self.functions[index]]
    }

    pub(crate) fn func_type_index(&self, index: FuncIndex) -> TypeIndex {
        self.functions[index]
    }

    pub(crate) fn canonical_type(&self, index: TypeIndex) -> TypeIndex {
        self.canonical_types[index]
    }

    /// The canonical signature of a function, used to check indirect calls.
    pub(crate) fn func_canonical_type(&self, index: FuncIndex) -> TypeIndex {
        self.canonical_types[self.functions[index]]
    }

    pub fn is_imported_func(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.num_imported_funcs
    }

    pub fn defined_func_index(&self, index: FuncIndex) -> Option<DefinedFuncIndex> {
        index
            .as_u32()
            .checked_sub(self.num_imported_funcs)
            .map(DefinedFuncIndex::from_u32)
    }

    pub fn func_index(&self, index: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(self.num_imported_funcs + index.as_u32())
    }

    /// See [`FunctionBody::frame_slots`].
    pub(crate) fn frame_slots(&self, index: DefinedFuncIndex) -> u32 {
        self.bodies[index].frame_slots(self.func_type(self.func_index(index)))
    }

    pub fn is_imported_global(&self, index: GlobalIndex) -> bool {
        index.as_u32() < self.num_imported_globals
    }

    pub(crate) fn import_of_func(&self, index: FuncIndex) -> Option<&Import> {
        self.imports
            .iter()
            .find(|import| import.index == EntityIndex::Function(index))
    }

    /// A human readable name for `index`, from the name section if present.
    pub fn func_name(&self, index: FuncIndex) -> Cow<'_, str> {
        match self.func_names.get(&index) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(format!("func{}", index.as_u32())),
        }
    }
}

/// A validated module together with the engine-specific code for it.
///
/// Cheap to clone, every clone shares the module and its code.
#[derive(Clone)]
pub struct CompiledModule(Arc<CompiledModuleInner>);

struct CompiledModuleInner {
    module: Arc<Module>,
    code: Arc<dyn CompiledCode>,
    max_call_depth: u32,
    max_stack_slots: u32,
    memory_limit_pages: u32,
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.0.module.name)
            .field("engine", &self.0.code.engine_name())
            .finish_non_exhaustive()
    }
}

impl CompiledModule {
    pub(crate) fn new(config: &Config, module: Arc<Module>, code: Arc<dyn CompiledCode>) -> Self {
        Self(Arc::new(CompiledModuleInner {
            module,
            code,
            max_call_depth: config.max_call_depth,
            max_stack_slots: config.max_stack_slots,
            memory_limit_pages: config.memory_limit_pages,
        }))
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.0.module
    }

    pub(crate) fn code(&self) -> &Arc<dyn CompiledCode> {
        &self.0.code
    }

    /// The name of the engine that produced the code, `"interpreter"` or `"compiler"`.
    pub fn engine_name(&self) -> &'static str {
        self.0.code.engine_name()
    }

    pub(crate) fn max_call_depth(&self) -> u32 {
        self.0.max_call_depth
    }

    pub(crate) fn max_stack_slots(&self) -> u32 {
        self.0.max_stack_slots
    }

    pub(crate) fn memory_limit_pages(&self) -> u32 {
        self.0.memory_limit_pages
    }
}
