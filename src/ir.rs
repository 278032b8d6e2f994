//! Parsed module artifacts.
//!
//! One pass over the binary collects exactly what linkage and layout need:
//! the import list in declaration order, exports, element segments, globals
//! with i32-const initialisers, data segments, and the `name` custom section
//! used to attribute element entries to exported functions. No code bodies
//! are decoded here; those belong to the backend compiler.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use wasmparser::{
    DataKind, ElementItems, ElementKind, ExternalKind, Name, NameSectionReader, Operator, Parser,
    Payload, TypeRef,
};

use crate::backend::ExternKind as EngineExternKind;

/// An import request, in module declaration order.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub module: String,
    pub name: String,
    pub kind: EngineExternKind,
    /// Declared mutability for global imports.
    pub global_mutable: bool,
}

#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub name: String,
    pub kind: EngineExternKind,
    pub index: u32,
}

/// A constant initialiser offset: either a literal or a `global.get` of an
/// imported global (the shape emitted for position-independent modules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOffset {
    Const(i32),
    Global(u32),
}

#[derive(Debug, Clone)]
pub struct ElemSegment {
    pub offset: InitOffset,
    pub func_indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: InitOffset,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GlobalRecord {
    pub mutable: bool,
    /// Present when the initialiser is a plain `i32.const`.
    pub i32_init: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryDecl {
    pub min_pages: u64,
    pub max_pages: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TableDecl {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// Everything the engine retains about a parsed module.
#[derive(Debug, Default)]
pub struct ModuleIr {
    pub imports: Vec<ImportRecord>,
    pub exports: Vec<ExportRecord>,
    pub globals: Vec<GlobalRecord>,
    pub elem_segments: Vec<ElemSegment>,
    pub data_segments: Vec<DataSegment>,
    /// Function names from the `name` section, over the full index space.
    pub function_names: HashMap<u32, String>,
    pub memory: Option<MemoryDecl>,
    pub table: Option<TableDecl>,
    pub num_imported_funcs: u32,
    pub num_imported_globals: u32,
    type_param_counts: Vec<usize>,
    func_type_indices: Vec<u32>,
    export_lookup: HashMap<String, (EngineExternKind, u32)>,
}

impl ModuleIr {
    /// Parse a binary module.
    pub fn parse(bytes: &[u8]) -> Result<ModuleIr> {
        let mut ir = ModuleIr::default();

        for payload in Parser::new(0).parse_all(bytes) {
            match payload.context("malformed module binary")? {
                Payload::TypeSection(types) => {
                    for ty in types.into_iter_err_on_gc_types() {
                        let ty = ty.context("unsupported type section entry")?;
                        ir.type_param_counts.push(ty.params().len());
                    }
                }

                Payload::ImportSection(imports) => {
                    for import in imports {
                        let import = import?;
                        let (kind, global_mutable) = match import.ty {
                            TypeRef::Func(type_idx) => {
                                ir.func_type_indices.push(type_idx);
                                ir.num_imported_funcs += 1;
                                (EngineExternKind::Func, false)
                            }
                            TypeRef::Global(g) => {
                                ir.num_imported_globals += 1;
                                (EngineExternKind::Global, g.mutable)
                            }
                            TypeRef::Table(_) => (EngineExternKind::Table, false),
                            TypeRef::Memory(_) => (EngineExternKind::Memory, false),
                            TypeRef::Tag(_) => {
                                bail!("unsupported tag import {}.{}", import.module, import.name)
                            }
                        };
                        ir.imports.push(ImportRecord {
                            module: import.module.to_string(),
                            name: import.name.to_string(),
                            kind,
                            global_mutable,
                        });
                    }
                }

                Payload::FunctionSection(funcs) => {
                    for type_idx in funcs {
                        ir.func_type_indices.push(type_idx?);
                    }
                }

                Payload::TableSection(tables) => {
                    for table in tables {
                        let table = table?;
                        if ir.table.is_none() {
                            ir.table = Some(TableDecl {
                                initial: table.ty.initial,
                                maximum: table.ty.maximum,
                            });
                        }
                    }
                }

                Payload::MemorySection(memories) => {
                    for memory in memories {
                        let memory = memory?;
                        if ir.memory.is_none() {
                            ir.memory = Some(MemoryDecl {
                                min_pages: memory.initial,
                                max_pages: memory.maximum,
                            });
                        }
                    }
                }

                Payload::GlobalSection(globals) => {
                    for global in globals {
                        let global = global?;
                        let mut reader = global.init_expr.get_binary_reader();
                        let i32_init = match reader.read_operator()? {
                            Operator::I32Const { value } => Some(value),
                            _ => None,
                        };
                        ir.globals.push(GlobalRecord {
                            mutable: global.ty.mutable,
                            i32_init,
                        });
                    }
                }

                Payload::ExportSection(exports) => {
                    for export in exports {
                        let export = export?;
                        let kind = match export.kind {
                            ExternalKind::Func => EngineExternKind::Func,
                            ExternalKind::Global => EngineExternKind::Global,
                            ExternalKind::Table => EngineExternKind::Table,
                            ExternalKind::Memory => EngineExternKind::Memory,
                            ExternalKind::Tag => continue,
                        };
                        ir.export_lookup
                            .insert(export.name.to_string(), (kind, export.index));
                        ir.exports.push(ExportRecord {
                            name: export.name.to_string(),
                            kind,
                            index: export.index,
                        });
                    }
                }

                Payload::ElementSection(elements) => {
                    for element in elements {
                        let element = element?;
                        let offset = match &element.kind {
                            ElementKind::Active { offset_expr, .. } => {
                                parse_init_offset(offset_expr)?
                            }
                            // Passive and declared segments play no part in
                            // the GOT.
                            _ => continue,
                        };
                        let mut func_indices = Vec::new();
                        match element.items {
                            ElementItems::Functions(funcs) => {
                                for func in funcs {
                                    func_indices.push(func?);
                                }
                            }
                            ElementItems::Expressions(_, exprs) => {
                                for expr in exprs {
                                    let expr = expr?;
                                    let mut reader = expr.get_binary_reader();
                                    match reader.read_operator()? {
                                        Operator::RefFunc { function_index } => {
                                            func_indices.push(function_index)
                                        }
                                        Operator::RefNull { .. } => continue,
                                        other => bail!(
                                            "unsupported element expression {:?}",
                                            other
                                        ),
                                    }
                                }
                            }
                        }
                        ir.elem_segments.push(ElemSegment {
                            offset,
                            func_indices,
                        });
                    }
                }

                Payload::DataSection(data) => {
                    for entry in data {
                        let entry = entry?;
                        match entry.kind {
                            DataKind::Active { offset_expr, .. } => {
                                ir.data_segments.push(DataSegment {
                                    offset: parse_init_offset(&offset_expr)?,
                                    bytes: entry.data.to_vec(),
                                });
                            }
                            DataKind::Passive => continue,
                        }
                    }
                }

                Payload::CustomSection(section) if section.name() == "name" => {
                    let reader = NameSectionReader::new(section.data(), section.data_offset());
                    if let Err(err) = ir.parse_name_section(reader) {
                        log::warn!("failed to parse name section: {:?}", err);
                    }
                }

                _ => {}
            }
        }

        Ok(ir)
    }

    fn parse_name_section(&mut self, reader: NameSectionReader<'_>) -> Result<()> {
        for subsection in reader {
            if let Name::Function(map) = subsection? {
                for naming in map {
                    let naming = naming?;
                    self.function_names
                        .insert(naming.index, naming.name.to_string());
                }
            }
        }
        Ok(())
    }

    /// Total bytes of active data segments; the size of the module's
    /// initialised data image.
    pub fn data_size(&self) -> u32 {
        self.data_segments
            .iter()
            .map(|seg| seg.bytes.len() as u32)
            .sum()
    }

    /// Total table elements declared across active element segments.
    pub fn table_elems(&self) -> u64 {
        self.elem_segments
            .iter()
            .map(|seg| seg.func_indices.len() as u64)
            .sum()
    }

    pub fn export(&self, name: &str) -> Option<(EngineExternKind, u32)> {
        self.export_lookup.get(name).copied()
    }

    pub fn is_exported(&self, name: &str) -> bool {
        self.export_lookup.contains_key(name)
    }

    /// Number of parameters of the function at `func_index` (full index
    /// space, imports first).
    pub fn func_param_count(&self, func_index: u32) -> Option<usize> {
        let type_idx = *self.func_type_indices.get(func_index as usize)?;
        self.type_param_counts.get(type_idx as usize).copied()
    }

    /// The defined (non-imported) global backing an export index, if any.
    pub fn defined_global(&self, global_index: u32) -> Option<&GlobalRecord> {
        let defined = global_index.checked_sub(self.num_imported_globals)?;
        self.globals.get(defined as usize)
    }
}

fn parse_init_offset(expr: &wasmparser::ConstExpr<'_>) -> Result<InitOffset> {
    let mut reader = expr.get_binary_reader();
    match reader.read_operator()? {
        Operator::I32Const { value } => Ok(InitOffset::Const(value)),
        Operator::GlobalGet { global_index } => Ok(InitOffset::Global(global_index)),
        other => bail!("unsupported init expression {:?}", other),
    }
}
