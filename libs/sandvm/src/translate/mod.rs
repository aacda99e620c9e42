// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Decoding and validation.
//!
//! [`ModuleTranslator`] drives a `wasmparser` validator over the binary and, section by
//! section, builds the [`Module`] both engines consume. Function bodies are validated one
//! operator at a time and stored as [`Op`] sequences, so no instruction reaches an engine
//! without having passed the validator.

mod const_expr;
mod ops;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::iter;
use core::mem;

use hashbrown::HashMap;
use wasmparser::{
    BinaryReader, DataKind, DataSectionReader, ElementItems, ElementKind, ElementSectionReader,
    ExportSectionReader, ExternalKind, FuncValidatorAllocations, FunctionBody as WasmFunctionBody,
    FunctionSectionReader, GlobalSectionReader, ImportSectionReader, MemorySectionReader, Name,
    NameSectionReader, Parser, Payload, TableInit, TableSectionReader, TypeRef,
    TypeSectionReader, Validator,
};

pub use const_expr::ConstExpr;
pub use ops::{
    BlockType, ConvOp, FBinOp, FCmp, FUnOp, IBinOp, ICmp, IUnOp, LoadKind, Op, StoreKind,
};

use crate::config::Config;
use crate::errors::Error;
use crate::indices::{EntityIndex, FuncIndex, GlobalIndex, TypeIndex};
use crate::module::{
    DataSegment, ElementSegment, Export, FunctionBody, Import, Module, SegmentMode,
};
use crate::types::{EntityType, FuncType, GlobalType, MemoryType, TableType, ValType};
use crate::wasm_unsupported;

/// The largest table this runtime allocates, in elements.
pub const TABLE_MAX: u32 = 1 << 20;

pub struct ModuleTranslator {
    validator: Validator,
    memory_limit_pages: u32,
    allocs: FuncValidatorAllocations,
    result: Module,
}

impl ModuleTranslator {
    pub fn new(config: &Config) -> Self {
        Self {
            validator: Validator::new_with_features(config.features()),
            memory_limit_pages: config.memory_limit_pages,
            allocs: FuncValidatorAllocations::default(),
            result: Module::default(),
        }
    }

    pub fn translate(mut self, data: &[u8]) -> crate::Result<Module> {
        let mut parser = Parser::default();
        parser.set_features(*self.validator.features());

        for payload in parser.parse_all(data) {
            self.translate_payload(payload.map_err(Error::decode)?)?;
        }

        tracing::debug!(
            name = ?self.result.name,
            functions = self.result.functions.len(),
            imports = self.result.imports.len(),
            "translated module"
        );

        Ok(self.result)
    }

    fn translate_payload(&mut self, payload: Payload<'_>) -> crate::Result<()> {
        match payload {
            Payload::Version {
                num,
                encoding,
                range,
            } => {
                self.validator
                    .version(num, encoding, &range)
                    .map_err(Error::validation)?;
            }
            Payload::TypeSection(types) => {
                self.validator
                    .type_section(&types)
                    .map_err(Error::validation)?;
                self.translate_type_section(types)?;
            }
            Payload::ImportSection(imports) => {
                self.validator
                    .import_section(&imports)
                    .map_err(Error::validation)?;
                self.translate_import_section(imports)?;
            }
            Payload::FunctionSection(functions) => {
                self.validator
                    .function_section(&functions)
                    .map_err(Error::validation)?;
                self.translate_function_section(functions)?;
            }
            Payload::TableSection(tables) => {
                self.validator
                    .table_section(&tables)
                    .map_err(Error::validation)?;
                self.translate_table_section(tables)?;
            }
            Payload::MemorySection(memories) => {
                self.validator
                    .memory_section(&memories)
                    .map_err(Error::validation)?;
                self.translate_memory_section(memories)?;
            }
            Payload::TagSection(tags) => {
                self.validator
                    .tag_section(&tags)
                    .map_err(Error::validation)?;
                return Err(wasm_unsupported!("exception handling"));
            }
            Payload::GlobalSection(globals) => {
                self.validator
                    .global_section(&globals)
                    .map_err(Error::validation)?;
                self.translate_global_section(globals)?;
            }
            Payload::ExportSection(exports) => {
                self.validator
                    .export_section(&exports)
                    .map_err(Error::validation)?;
                self.translate_export_section(exports)?;
            }
            Payload::StartSection { func, range } => {
                self.validator
                    .start_section(func, &range)
                    .map_err(Error::validation)?;
                self.result.start = Some(FuncIndex::from_u32(func));
            }
            Payload::ElementSection(elements) => {
                self.validator
                    .element_section(&elements)
                    .map_err(Error::validation)?;
                self.translate_element_section(elements)?;
            }
            Payload::DataCountSection { count, range } => {
                self.validator
                    .data_count_section(count, &range)
                    .map_err(Error::validation)?;
            }
            Payload::DataSection(data) => {
                self.validator
                    .data_section(&data)
                    .map_err(Error::validation)?;
                self.translate_data_section(data)?;
            }
            Payload::CodeSectionStart { count, range, .. } => {
                self.validator
                    .code_section_start(count, &range)
                    .map_err(Error::validation)?;
                self.result.bodies.reserve_exact(count as usize);
            }
            Payload::CodeSectionEntry(body) => {
                self.translate_function_body(&body)?;
            }
            Payload::CustomSection(section) => {
                if section.name() == "name" {
                    let reader = NameSectionReader::new(BinaryReader::new(
                        section.data(),
                        section.data_offset(),
                    ));
                    // A malformed name section is not fatal, the names are only cosmetic.
                    if let Err(e) = self.translate_name_section(reader) {
                        tracing::warn!("ignoring malformed name section: {e}");
                    }
                } else {
                    tracing::trace!("skipping custom section {}", section.name());
                }
                self.result
                    .custom_sections
                    .push((section.name().to_string(), section.data().into()));
            }
            Payload::End(offset) => {
                self.validator.end(offset).map_err(Error::validation)?;
            }
            // component sections only follow a component header, which the validator rejects
            p => {
                let id = p.as_section().map(|(id, _)| id);
                return Err(wasm_unsupported!("unsupported section {id:?}"));
            }
        }
        Ok(())
    }

    fn translate_type_section(&mut self, types: TypeSectionReader<'_>) -> crate::Result<()> {
        self.result.types.reserve(types.count() as usize);

        let mut seen: HashMap<FuncType, TypeIndex> = HashMap::new();
        for ty in types.into_iter_err_on_gc_types() {
            let ty = FuncType::from_wasmparser(&ty?)?;
            let index = self.result.types.next_key();
            let canonical = *seen.entry(ty.clone()).or_insert(index);
            self.result.types.push(ty);
            self.result.canonical_types.push(canonical);
        }

        Ok(())
    }

    fn translate_import_section(&mut self, imports: ImportSectionReader<'_>) -> crate::Result<()> {
        self.result.imports.reserve_exact(imports.count() as usize);

        for import in imports {
            let import = import?;

            let (index, ty) = match import.ty {
                TypeRef::Func(index) => {
                    self.result.num_imported_funcs += 1;
                    let ty = TypeIndex::from_u32(index);
                    let func = self.result.functions.push(ty);
                    (
                        EntityIndex::Function(func),
                        EntityType::Function(self.result.types[ty].clone()),
                    )
                }
                TypeRef::Table(ty) => {
                    let ty = TableType::from_wasmparser(ty)?;
                    self.result.table = Some(ty);
                    (EntityIndex::Table, EntityType::Table(ty))
                }
                TypeRef::Memory(ty) => {
                    let ty = MemoryType::from_wasmparser(ty)?;
                    self.result.memory = Some(ty);
                    (EntityIndex::Memory, EntityType::Memory(ty))
                }
                TypeRef::Global(ty) => {
                    self.result.num_imported_globals += 1;
                    let ty = GlobalType::from_wasmparser(ty)?;
                    let global = self.result.globals.push(ty);
                    (EntityIndex::Global(global), EntityType::Global(ty))
                }
                // doesn't get past validation
                TypeRef::Tag(_) => return Err(wasm_unsupported!("exception handling")),
            };

            self.result.imports.push(Import {
                module: import.module.to_string(),
                field: import.name.to_string(),
                index,
                ty,
            });
        }

        Ok(())
    }

    fn translate_function_section(
        &mut self,
        functions: FunctionSectionReader<'_>,
    ) -> crate::Result<()> {
        self.result
            .functions
            .reserve_exact(functions.count() as usize);

        for index in functions {
            self.result.functions.push(TypeIndex::from_u32(index?));
        }

        Ok(())
    }

    fn translate_table_section(&mut self, tables: TableSectionReader<'_>) -> crate::Result<()> {
        for table in tables.into_iter_with_offsets() {
            let (offset, table) = table?;
            if !matches!(table.init, TableInit::RefNull) {
                return Err(wasm_unsupported!("table initializer expressions"));
            }
            let ty = TableType::from_wasmparser(table.ty)?;
            if ty.minimum > TABLE_MAX {
                return Err(Error::Validation {
                    message: alloc::format!("table size must be at most {TABLE_MAX} elements"),
                    offset,
                });
            }
            self.result.table = Some(ty);
        }

        Ok(())
    }

    fn translate_memory_section(&mut self, memories: MemorySectionReader<'_>) -> crate::Result<()> {
        for memory in memories.into_iter_with_offsets() {
            let (offset, memory) = memory?;
            let ty = MemoryType::from_wasmparser(memory)?;
            if ty.minimum > self.memory_limit_pages {
                return Err(Error::Validation {
                    message: alloc::format!(
                        "memory size must be at most {} pages",
                        self.memory_limit_pages
                    ),
                    offset,
                });
            }
            self.result.memory = Some(ty);
        }

        Ok(())
    }

    fn translate_global_section(&mut self, globals: GlobalSectionReader<'_>) -> crate::Result<()> {
        self.result.globals.reserve_exact(globals.count() as usize);
        self.result
            .global_initializers
            .reserve_exact(globals.count() as usize);

        for global in globals {
            let global = global?;
            self.result
                .globals
                .push(GlobalType::from_wasmparser(global.ty)?);
            self.result
                .global_initializers
                .push(ConstExpr::from_wasmparser(&global.init_expr)?);
        }

        Ok(())
    }

    fn translate_export_section(&mut self, exports: ExportSectionReader<'_>) -> crate::Result<()> {
        for export in exports {
            let export = export?;
            let index = match export.kind {
                ExternalKind::Func => EntityIndex::Function(FuncIndex::from_u32(export.index)),
                ExternalKind::Table => EntityIndex::Table,
                ExternalKind::Memory => EntityIndex::Memory,
                ExternalKind::Global => EntityIndex::Global(GlobalIndex::from_u32(export.index)),
                ExternalKind::Tag => return Err(wasm_unsupported!("exception handling")),
            };

            if let EntityIndex::Function(func) = index {
                self.result
                    .func_names
                    .entry(func)
                    .or_insert_with(|| export.name.to_string());
            }
            self.result
                .export_map
                .insert(export.name.to_string(), index);
            self.result.exports.push(Export {
                name: export.name.to_string(),
                index,
            });
        }

        Ok(())
    }

    fn translate_element_section(
        &mut self,
        elements: ElementSectionReader<'_>,
    ) -> crate::Result<()> {
        for element in elements {
            let element = element?;

            let items = match element.items {
                ElementItems::Functions(funcs) => funcs
                    .into_iter()
                    .map(|func| Ok(Some(FuncIndex::from_u32(func?))))
                    .collect::<crate::Result<Box<[_]>>>()?,
                ElementItems::Expressions(_, exprs) => exprs
                    .into_iter()
                    .map(|expr| ConstExpr::from_wasmparser(&expr?)?.as_func_ref())
                    .collect::<crate::Result<Box<[_]>>>()?,
            };

            let mode = match element.kind {
                ElementKind::Active {
                    table_index,
                    offset_expr,
                } => {
                    if table_index.unwrap_or(0) != 0 {
                        return Err(wasm_unsupported!("multiple tables"));
                    }
                    SegmentMode::Active {
                        offset: ConstExpr::from_wasmparser(&offset_expr)?,
                    }
                }
                ElementKind::Passive => SegmentMode::Passive,
                ElementKind::Declared => SegmentMode::Declared,
            };

            self.result.elements.push(ElementSegment { mode, items });
        }

        Ok(())
    }

    fn translate_data_section(&mut self, section: DataSectionReader<'_>) -> crate::Result<()> {
        for entry in section {
            let entry = entry?;

            let mode = match entry.kind {
                DataKind::Active {
                    memory_index,
                    offset_expr,
                } => {
                    if memory_index != 0 {
                        return Err(wasm_unsupported!("multiple memories"));
                    }
                    SegmentMode::Active {
                        offset: ConstExpr::from_wasmparser(&offset_expr)?,
                    }
                }
                DataKind::Passive => SegmentMode::Passive,
            };

            self.result.data.push(DataSegment {
                mode,
                bytes: entry.data.into(),
            });
        }

        Ok(())
    }

    /// Validates one function body and lowers it into [`Op`]s.
    fn translate_function_body(&mut self, body: &WasmFunctionBody<'_>) -> crate::Result<()> {
        let mut validator = self
            .validator
            .code_section_entry(body)
            .map_err(Error::validation)?
            .into_validator(mem::take(&mut self.allocs));

        let mut reader = body.get_binary_reader();

        let mut locals = Vec::new();
        for _ in 0..reader.read_var_u32()? {
            let pos = reader.original_position();
            let count = reader.read_var_u32()?;
            let ty = reader.read::<wasmparser::ValType>()?;
            validator
                .define_locals(pos, count, ty)
                .map_err(Error::validation)?;
            locals.extend(iter::repeat_n(ValType::from_wasmparser(ty)?, count as usize));
        }

        let mut ops = Vec::new();
        let mut max_height = 0;
        while !reader.eof() {
            let pos = reader.original_position();
            let op = reader.read_operator()?;
            validator.op(pos, &op).map_err(Error::validation)?;
            max_height = max_height.max(validator.operand_stack_height());
            ops.push(Op::from_wasmparser(&op, pos)?);
        }
        validator
            .finish(reader.original_position())
            .map_err(Error::validation)?;
        self.allocs = validator.into_allocations();

        self.result.bodies.push(FunctionBody {
            locals: locals.into_boxed_slice(),
            ops: ops.into_boxed_slice(),
            max_height,
        });

        Ok(())
    }

    fn translate_name_section(&mut self, reader: NameSectionReader<'_>) -> crate::Result<()> {
        for subsection in reader {
            match subsection? {
                Name::Module { name, .. } => {
                    self.result.name = Some(name.to_string());
                }
                Name::Function(names) => {
                    for name in names {
                        let name = name?;
                        // Skip this naming if it's naming a function that
                        // doesn't actually exist.
                        if (name.index as usize) < self.result.functions.len() {
                            self.result
                                .func_names
                                .insert(FuncIndex::from_u32(name.index), String::from(name.name));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(wat: &str) -> crate::Result<Module> {
        let bytes = wat::parse_str(wat).unwrap();
        Module::from_binary(&Config::default(), &bytes)
    }

    #[test]
    fn rejects_unknown_sections() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.extend_from_slice(&[0x20, 0x00]);
        let err = Module::from_binary(&Config::default(), &bytes).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{err:?}");
    }

    #[test]
    fn rejects_components() {
        let bytes = b"\0asm\x0d\0\x01\0";
        assert!(Module::from_binary(&Config::default(), bytes).is_err());
    }

    #[test]
    fn decodes_sections() {
        let module = translate(
            r#"
            (module $demo
                (import "env" "log" (func $log (param i32)))
                (memory 1 4)
                (table 2 funcref)
                (global $g (mut i32) (i32.const 7))
                (func $double (export "double") (param i32) (result i32)
                    local.get 0
                    i32.const 2
                    i32.mul)
                (elem (i32.const 0) $double $log)
                (data (i32.const 16) "hi"))
            "#,
        )
        .unwrap();

        assert_eq!(module.name(), Some("demo"));
        assert_eq!(module.num_imported_funcs, 1);
        assert_eq!(module.num_functions(), 2);
        assert_eq!(
            module.memory(),
            Some(MemoryType {
                minimum: 1,
                maximum: Some(4)
            })
        );
        assert_eq!(module.elements.len(), 1);
        assert_eq!(module.data.len(), 1);
        assert_eq!(
            module.export("double"),
            Some(EntityIndex::Function(FuncIndex::from_u32(1)))
        );
        assert_eq!(module.func_name(FuncIndex::from_u32(1)), "double");
        let body = &module.bodies[crate::indices::DefinedFuncIndex::from_u32(0)];
        assert_eq!(
            &*body.ops,
            &[
                Op::LocalGet(crate::indices::LocalIndex::from_u32(0)),
                Op::Const(ValType::I32, 2),
                Op::I32Bin(IBinOp::Mul),
                Op::End
            ]
        );
    }

    #[test]
    fn structurally_equal_types_share_a_canonical_index() {
        let module = translate(
            r#"
            (module
                (type $a (func (param i32) (result i32)))
                (type $b (func))
                (type $c (func (param i32) (result i32))))
            "#,
        )
        .unwrap();
        assert_eq!(
            module.canonical_type(TypeIndex::from_u32(2)),
            TypeIndex::from_u32(0)
        );
        assert_eq!(
            module.canonical_type(TypeIndex::from_u32(1)),
            TypeIndex::from_u32(1)
        );
    }

    #[test]
    fn rejects_malformed_binaries() {
        let err = Module::from_binary(&Config::default(), b"\0asn\x01\0\0\0").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }), "{err}");
    }

    #[test]
    fn rejects_ill_typed_bodies() {
        let err = translate(
            r#"(module (func (result i32) i64.const 1))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
    }

    #[test]
    fn rejects_disabled_features() {
        let mut config = Config::default();
        config.wasm_features(Config::default_features() - wasmparser::WasmFeatures::SIGN_EXTENSION);
        let bytes = wat::parse_str(
            r#"(module (func (param i32) (result i32) local.get 0 i32.extend8_s))"#,
        )
        .unwrap();
        let err = Module::from_binary(&config, &bytes).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
    }

    #[test]
    fn simd_validates_but_is_unsupported() {
        let wat = r#"(module (func (drop (v128.const i64x2 0 0))))"#;
        let bytes = wat::parse_str(wat).unwrap();

        let err = Module::from_binary(&Config::default(), &bytes).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");

        let mut config = Config::default();
        config.wasm_simd(true);
        let err = Module::from_binary(&config, &bytes).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{err}");
    }

    #[test]
    fn memory_limit_is_enforced_at_validation() {
        let mut config = Config::default();
        config.memory_limit_pages(2);
        let bytes = wat::parse_str(r#"(module (memory 3))"#).unwrap();
        let err = Module::from_binary(&config, &bytes).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");

        let bytes = wat::parse_str(r#"(module (memory 2))"#).unwrap();
        assert!(Module::from_binary(&config, &bytes).is_ok());
    }

    #[test]
    fn custom_sections_are_kept() {
        let mut bytes = wat::parse_str(r#"(module)"#).unwrap();
        // id 0, payload size 9, name length 7
        bytes.extend_from_slice(&[0, 9, 7]);
        bytes.extend_from_slice(b"buildid");
        bytes.push(0x2a);
        let module = Module::from_binary(&Config::default(), &bytes).unwrap();
        let sections: Vec<_> = module.custom_sections().collect();
        assert_eq!(sections, [("buildid", &[0x2a_u8][..])]);
    }
}
