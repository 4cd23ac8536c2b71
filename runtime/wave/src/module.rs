//! # Module Loader
//!
//! Parses the binary module format into typed tables in one pass, then
//! canonicalizes function types and binds imports to host builtins.

use crate::builtins::HostFunction;
use crate::decode::Reader;
use crate::expr;
use crate::{FunctionSignature, SectionId, WasmType, WasmValue, WaveError, WASM_PAGE_SIZE};

/// Table slot without a function.
pub const NULL_ELEMENT: u32 = u32::MAX;

/// Most declared locals a single function may have.
pub const MAX_LOCALS: u32 = 1 << 20;

const MAGIC: [u8; 4] = *b"\0asm";
const VERSION: u32 = 1;

/// External kinds in import and export entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Function,
    Table,
    Memory,
    Global,
}

impl ExternalKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Function),
            1 => Some(Self::Table),
            2 => Some(Self::Memory),
            3 => Some(Self::Global),
            _ => None,
        }
    }
}

/// A function imported from the host.
#[derive(Debug, Clone)]
pub struct FunctionImport {
    pub module: String,
    pub name: String,
    pub host: HostFunction,
}

/// A defined function's locals and code.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    /// Run-length encoded local declarations.
    pub locals: Vec<(u32, WasmType)>,
    /// Instruction bytes, ending with `end`.
    pub code: Vec<u8>,
}

impl FunctionBody {
    /// Total declared locals, if within [`MAX_LOCALS`].
    pub fn declared_locals(&self) -> Option<u32> {
        self.locals
            .iter()
            .try_fold(0u32, |total, (count, _)| total.checked_add(*count))
            .filter(|total| *total <= MAX_LOCALS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Global {
    pub ty: WasmType,
    pub mutable: bool,
    pub init: WasmValue,
}

/// Linear memory limits, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    pub index: u32,
}

/// A parsed module.
#[derive(Debug, Default)]
pub struct Module {
    /// Declared signatures, in type-section order.
    pub types: Vec<FunctionSignature>,
    /// Each type index's lowest structurally equal index.
    pub canonical: Vec<u32>,
    /// Canonical type index per function; imports come first.
    pub functions: Vec<u32>,
    pub imports: Vec<FunctionImport>,
    pub bodies: Vec<FunctionBody>,
    pub globals: Vec<Global>,
    /// The indirect table; unfilled slots hold [`NULL_ELEMENT`].
    pub table: Vec<u32>,
    pub has_table: bool,
    pub memory: Option<MemoryType>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    /// Initial contents of linear memory.
    pub memory_image: Vec<u8>,
}

fn format_err(message: impl Into<String>) -> WaveError {
    WaveError::Format(message.into())
}

fn unsupported(message: impl Into<String>) -> WaveError {
    WaveError::Unsupported(message.into())
}

impl Module {
    /// Parse a binary module.
    pub fn parse(bytes: &[u8]) -> Result<Self, WaveError> {
        let mut reader = Reader::new(bytes);
        let magic = reader.read_bytes(4)?;
        if magic != MAGIC {
            return Err(format_err("bad magic number"));
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(format_err(format!("unsupported version {}", version)));
        }

        let mut module = Module::default();
        while !reader.is_empty() {
            let offset = reader.offset();
            let id = reader.read_u8()?;
            let len = reader.read_var_u32()? as usize;
            let mut payload = reader.sub_reader(len)?;

            let section = SectionId::from_u8(id).ok_or_else(|| {
                format_err(format!("unknown section id {} at offset {}", id, offset))
            })?;
            log::trace!("section {:?} at offset {}, {} bytes", section, offset, len);
            module.load_section(section, &mut payload)?;

            if !payload.is_empty() {
                return Err(format_err(format!(
                    "{:?} section at offset {} has {} trailing bytes",
                    section,
                    offset,
                    payload.remaining()
                )));
            }
        }

        if module.bodies.len() + module.imports.len() != module.functions.len() {
            return Err(format_err(format!(
                "{} function declarations but {} bodies",
                module.functions.len() - module.imports.len(),
                module.bodies.len()
            )));
        }
        module.canonicalize();
        module.check_imports()?;

        if let Some(start) = module.start {
            let signature = module
                .signature(start)
                .ok_or_else(|| format_err(format!("start function {} not found", start)))?;
            if !signature.params.is_empty() || signature.result.is_some() {
                return Err(format_err("start function must take and return nothing"));
            }
        }

        log::debug!(
            "loaded module: {} types, {} imports, {} functions, {} globals, table {}, memory {:?}, {} exports",
            module.types.len(),
            module.imports.len(),
            module.bodies.len(),
            module.globals.len(),
            module.table.len(),
            module.memory,
            module.exports.len()
        );
        Ok(module)
    }

    fn load_section(&mut self, section: SectionId, r: &mut Reader<'_>) -> Result<(), WaveError> {
        match section {
            SectionId::Custom => {
                r.read_name()?;
                r.read_rest();
            }
            SectionId::Type => self.load_types(r)?,
            SectionId::Import => self.load_imports(r)?,
            SectionId::Function => self.load_functions(r)?,
            SectionId::Table => self.load_table(r)?,
            SectionId::Memory => self.load_memory(r)?,
            SectionId::Global => self.load_globals(r)?,
            SectionId::Export => self.load_exports(r)?,
            SectionId::Start => self.start = Some(r.read_var_u32()?),
            SectionId::Element => self.load_elements(r)?,
            SectionId::Code => self.load_code(r)?,
            SectionId::Data => self.load_data(r)?,
        }
        Ok(())
    }

    fn load_types(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let form = r.read_u8()?;
            if form != 0x60 {
                return Err(format_err(format!("invalid function type form 0x{:02x}", form)));
            }
            let param_count = r.read_var_u32()?;
            let mut params = Vec::with_capacity(param_count.min(1024) as usize);
            for _ in 0..param_count {
                params.push(r.read_value_type()?);
            }
            let result = match r.read_var_u32()? {
                0 => None,
                1 => Some(r.read_value_type()?),
                n => return Err(unsupported(format!("{} results in a function type", n))),
            };
            self.types.push(FunctionSignature { params, result });
        }
        Ok(())
    }

    fn read_type_index(&self, r: &mut Reader<'_>) -> Result<u32, WaveError> {
        let index = r.read_var_u32()?;
        if index as usize >= self.types.len() {
            return Err(format_err(format!("type index {} out of range", index)));
        }
        Ok(index)
    }

    fn load_imports(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let module = r.read_name()?.to_string();
            let name = r.read_name()?.to_string();
            let kind_byte = r.read_u8()?;
            let kind = ExternalKind::from_byte(kind_byte)
                .ok_or_else(|| format_err(format!("invalid import kind {}", kind_byte)))?;

            match kind {
                ExternalKind::Function => {
                    if module != "env" {
                        return Err(unsupported(format!(
                            "function import {}.{} from a module other than env",
                            module, name
                        )));
                    }
                    if !self.bodies.is_empty() || self.functions.len() > self.imports.len() {
                        return Err(format_err("import section after function section"));
                    }
                    let type_index = self.read_type_index(r)?;
                    let host = HostFunction::from_name(&module, &name).ok_or_else(|| {
                        format_err(format!("unknown host function {}.{}", module, name))
                    })?;
                    self.functions.push(type_index);
                    self.imports.push(FunctionImport { module, name, host });
                }
                ExternalKind::Global => {
                    let ty = r.read_value_type()?;
                    let mutable = r.read_u8()? != 0;
                    if mutable {
                        return Err(unsupported(format!("mutable global import {}.{}", module, name)));
                    }
                    // No host provides globals; imported values read as zero.
                    self.globals.push(Global {
                        ty,
                        mutable,
                        init: WasmValue::from_bits(ty, 0),
                    });
                }
                ExternalKind::Table | ExternalKind::Memory => {
                    return Err(unsupported(format!(
                        "{:?} import {}.{}",
                        kind, module, name
                    )));
                }
            }
        }
        Ok(())
    }

    fn load_functions(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let type_index = self.read_type_index(r)?;
            self.functions.push(type_index);
        }
        Ok(())
    }

    fn read_limits(r: &mut Reader<'_>) -> Result<(u32, Option<u32>), WaveError> {
        let flags = r.read_u8()?;
        let initial = r.read_var_u32()?;
        let maximum = if flags & 1 != 0 {
            Some(r.read_var_u32()?)
        } else {
            None
        };
        Ok((initial, maximum))
    }

    fn load_table(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            if self.has_table {
                return Err(unsupported("more than one table"));
            }
            let element_type = r.read_u8()?;
            if element_type != 0x70 {
                return Err(format_err(format!(
                    "invalid table element type 0x{:02x}",
                    element_type
                )));
            }
            let (initial, maximum) = Self::read_limits(r)?;
            let size = maximum.unwrap_or(initial);
            if size > 10_000_000 {
                return Err(WaveError::Resource(format!("table of {} elements", size)));
            }
            self.table = vec![NULL_ELEMENT; size as usize];
            self.has_table = true;
        }
        Ok(())
    }

    fn load_memory(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            if self.memory.is_some() {
                return Err(unsupported("more than one memory"));
            }
            let (initial, maximum) = Self::read_limits(r)?;
            if initial > 65536 || maximum.map_or(false, |max| max > 65536 || max < initial) {
                return Err(format_err(format!(
                    "invalid memory limits {}..{:?}",
                    initial, maximum
                )));
            }
            self.memory = Some(MemoryType { initial, maximum });
        }
        Ok(())
    }

    fn load_globals(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let ty = r.read_value_type()?;
            let mutable = match r.read_u8()? {
                0 => false,
                1 => true,
                other => return Err(format_err(format!("invalid mutability flag {}", other))),
            };
            let init = expr::evaluate(r)?;
            if init.value_type() != ty {
                return Err(format_err(format!(
                    "global of type {} initialized with {}",
                    ty, init
                )));
            }
            self.globals.push(Global { ty, mutable, init });
        }
        Ok(())
    }

    fn load_exports(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let name = r.read_name()?.to_string();
            let kind_byte = r.read_u8()?;
            let kind = ExternalKind::from_byte(kind_byte)
                .ok_or_else(|| format_err(format!("invalid export kind {}", kind_byte)))?;
            let index = r.read_var_u32()?;

            if kind == ExternalKind::Memory && name == "memory" {
                let memory = match (index, self.memory) {
                    (0, Some(memory)) => memory,
                    _ => return Err(format_err(format!("invalid memory export {}", index))),
                };
                let size = u64::from(memory.initial) * WASM_PAGE_SIZE;
                let size = usize::try_from(size)
                    .map_err(|_| WaveError::Resource("memory image too large".into()))?;
                if self.memory_image.len() < size {
                    self.memory_image.resize(size, 0);
                }
            }
            self.exports.push(Export { name, kind, index });
        }
        Ok(())
    }

    fn load_elements(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let table_index = r.read_var_u32()?;
            if table_index != 0 {
                return Err(unsupported(format!("element segment for table {}", table_index)));
            }
            let offset = expr::evaluate_offset(r)?;
            let length = r.read_var_u32()?;
            let table_len = self.table.len();
            for i in 0..length {
                let function = r.read_var_u32()?;
                let slot = offset
                    .checked_add(i)
                    .and_then(|slot| self.table.get_mut(slot as usize))
                    .ok_or_else(|| {
                        format_err(format!(
                            "element {} at offset {} outside table of {}",
                            i, offset, table_len
                        ))
                    })?;
                *slot = function;
            }
        }
        Ok(())
    }

    fn load_code(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        let declared = self.functions.len() - self.imports.len();
        if count as usize != declared {
            return Err(format_err(format!(
                "code section has {} bodies for {} declared functions",
                count, declared
            )));
        }
        for _ in 0..count {
            let size = r.read_var_u32()? as usize;
            let mut body = r.sub_reader(size)?;

            let group_count = body.read_var_u32()?;
            let mut locals = Vec::with_capacity(group_count.min(1024) as usize);
            for _ in 0..group_count {
                let n = body.read_var_u32()?;
                let ty = body.read_value_type()?;
                locals.push((n, ty));
            }
            let code = body.read_rest().to_vec();
            if code.last() != Some(&0x0B) {
                return Err(format_err(format!(
                    "function body {} does not end with end",
                    self.bodies.len()
                )));
            }
            self.bodies.push(FunctionBody { locals, code });
        }
        Ok(())
    }

    fn load_data(&mut self, r: &mut Reader<'_>) -> Result<(), WaveError> {
        let count = r.read_var_u32()?;
        for _ in 0..count {
            let memory_index = r.read_var_u32()?;
            if memory_index != 0 {
                return Err(unsupported(format!("data segment for memory {}", memory_index)));
            }
            let offset = expr::evaluate_offset(r)? as usize;
            let len = r.read_var_u32()? as usize;
            let bytes = r.read_bytes(len)?;

            let end = offset + len;
            if end as u64 > 65536 * WASM_PAGE_SIZE {
                return Err(format_err(format!("data segment ends at {:#x}", end)));
            }
            if self.memory_image.len() < end {
                self.memory_image.resize(end, 0);
            }
            self.memory_image[offset..end].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Replace every function's type index with the lowest equal one.
    fn canonicalize(&mut self) {
        self.canonical = (0..self.types.len())
            .map(|i| {
                let first = self.types[..i]
                    .iter()
                    .position(|other| *other == self.types[i])
                    .unwrap_or(i);
                first as u32
            })
            .collect();
        for ty in &mut self.functions {
            *ty = self.canonical[*ty as usize];
        }
    }

    fn check_imports(&self) -> Result<(), WaveError> {
        for (index, import) in self.imports.iter().enumerate() {
            let declared = &self.types[self.functions[index] as usize];
            let expected = import.host.signature();
            if *declared != expected {
                return Err(WaveError::Link(format!(
                    "import {}.{} declared as {} but the host provides {}",
                    import.module, import.name, declared, expected
                )));
            }
        }
        Ok(())
    }

    /// Imports plus defined functions.
    pub fn function_count(&self) -> u32 {
        self.functions.len() as u32
    }

    pub fn is_import(&self, index: u32) -> bool {
        (index as usize) < self.imports.len()
    }

    /// Canonical type index of function `index`.
    pub fn type_index(&self, index: u32) -> Option<u32> {
        self.functions.get(index as usize).copied()
    }

    /// Canonical index of declared type `type_index`.
    pub fn canonical_type(&self, type_index: u32) -> Option<u32> {
        self.canonical.get(type_index as usize).copied()
    }

    pub fn signature(&self, index: u32) -> Option<&FunctionSignature> {
        self.type_index(index)
            .and_then(|ty| self.types.get(ty as usize))
    }

    /// Body of defined function `index`.
    pub fn body(&self, index: u32) -> Option<&FunctionBody> {
        (index as usize)
            .checked_sub(self.imports.len())
            .and_then(|i| self.bodies.get(i))
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|export| export.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[u8] = b"\0asm\x01\0\0\0";

    fn with_sections(sections: &[(u8, &[u8])]) -> Vec<u8> {
        let mut bytes = HEADER.to_vec();
        for (id, payload) in sections {
            bytes.push(*id);
            bytes.push(payload.len() as u8);
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn test_empty_module() {
        let module = Module::parse(HEADER).unwrap();
        assert_eq!(module.function_count(), 0);
        assert!(module.start.is_none());
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(Module::parse(b"\0asn\x01\0\0\0"), Err(WaveError::Format(_))));
        assert!(matches!(Module::parse(b"\0asm\x02\0\0\0"), Err(WaveError::Format(_))));
        assert!(matches!(Module::parse(b"\0as"), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_truncated_section_is_fatal() {
        let mut bytes = with_sections(&[(1, &[0x01, 0x60, 0x00, 0x00])]);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_unknown_section_and_trailing_bytes() {
        let bytes = with_sections(&[(12, &[0x00])]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));

        let bytes = with_sections(&[(1, &[0x00, 0x00])]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_custom_section_is_skipped() {
        let bytes = with_sections(&[(0, &[0x04, b'n', b'a', b'm', b'e', 0xAA, 0xBB])]);
        assert!(Module::parse(&bytes).is_ok());
    }

    #[test]
    fn test_types_are_canonicalized() {
        // Types: 0 = (i32) -> i32, 1 = () -> (), 2 = (i32) -> i32.
        let types: &[u8] = &[
            0x03, 0x60, 0x01, 0x7F, 0x01, 0x7F, 0x60, 0x00, 0x00, 0x60, 0x01, 0x7F, 0x01, 0x7F,
        ];
        let functions: &[u8] = &[0x02, 0x02, 0x01];
        let code: &[u8] = &[0x02, 0x04, 0x00, 0x20, 0x00, 0x0B, 0x02, 0x00, 0x0B];
        let module = Module::parse(&with_sections(&[(1, types), (3, functions), (10, code)])).unwrap();

        assert_eq!(module.canonical, vec![0, 1, 0]);
        assert_eq!(module.functions, vec![0, 1]);
        assert_eq!(module.canonical_type(2), Some(0));
        assert_eq!(module.signature(0).unwrap().result, Some(WasmType::I32));
    }

    #[test]
    fn test_body_count_must_match() {
        let types: &[u8] = &[0x01, 0x60, 0x00, 0x00];
        let functions: &[u8] = &[0x02, 0x00, 0x00];
        let code: &[u8] = &[0x01, 0x02, 0x00, 0x0B];
        let bytes = with_sections(&[(1, types), (3, functions), (10, code)]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_body_must_end_with_end() {
        let types: &[u8] = &[0x01, 0x60, 0x00, 0x00];
        let functions: &[u8] = &[0x01, 0x00];
        let code: &[u8] = &[0x01, 0x02, 0x00, 0x01];
        let bytes = with_sections(&[(1, types), (3, functions), (10, code)]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_imports_resolve_to_builtins() {
        let types: &[u8] = &[0x01, 0x60, 0x01, 0x7F, 0x01, 0x7F];
        let mut import = vec![0x01, 0x03, b'e', b'n', b'v', 0x0D];
        import.extend_from_slice(b"wasm_close_fd");
        import.extend_from_slice(&[0x00, 0x00]);
        let module = Module::parse(&with_sections(&[(1, types), (2, &import)])).unwrap();
        assert_eq!(module.imports[0].host, HostFunction::CloseFd);
        assert!(module.is_import(0));
        assert!(module.body(0).is_none());
    }

    #[test]
    fn test_import_errors() {
        let types: &[u8] = &[0x01, 0x60, 0x01, 0x7F, 0x01, 0x7F];

        let mut unknown = vec![0x01, 0x03, b'e', b'n', b'v', 0x04];
        unknown.extend_from_slice(b"nope");
        unknown.extend_from_slice(&[0x00, 0x00]);
        let bytes = with_sections(&[(1, types), (2, &unknown)]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));

        let mut foreign = vec![0x01, 0x04, b'w', b'a', b's', b'i', 0x0D];
        foreign.extend_from_slice(b"wasm_close_fd");
        foreign.extend_from_slice(&[0x00, 0x00]);
        let bytes = with_sections(&[(1, types), (2, &foreign)]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Unsupported(_))));

        // wasm_write_fd declared as (i32) -> i32.
        let mut mismatched = vec![0x01, 0x03, b'e', b'n', b'v', 0x0D];
        mismatched.extend_from_slice(b"wasm_write_fd");
        mismatched.extend_from_slice(&[0x00, 0x00]);
        let bytes = with_sections(&[(1, types), (2, &mismatched)]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Link(_))));
    }

    #[test]
    fn test_global_import_reads_zero() {
        let import: &[u8] = &[0x01, 0x03, b'e', b'n', b'v', 0x01, b'g', 0x03, 0x7E, 0x00];
        let module = Module::parse(&with_sections(&[(2, import)])).unwrap();
        assert_eq!(module.globals[0].init, WasmValue::I64(0));

        let mutable: &[u8] = &[0x01, 0x03, b'e', b'n', b'v', 0x01, b'g', 0x03, 0x7E, 0x01];
        assert!(matches!(
            Module::parse(&with_sections(&[(2, mutable)])),
            Err(WaveError::Unsupported(_))
        ));
    }

    #[test]
    fn test_table_sized_by_maximum_and_elements_checked() {
        let types: &[u8] = &[0x01, 0x60, 0x00, 0x00];
        let functions: &[u8] = &[0x01, 0x00];
        let table: &[u8] = &[0x01, 0x70, 0x01, 0x01, 0x04];
        let elements: &[u8] = &[0x01, 0x00, 0x41, 0x02, 0x0B, 0x02, 0x00, 0x00];
        let code: &[u8] = &[0x01, 0x02, 0x00, 0x0B];
        let module = Module::parse(&with_sections(&[
            (1, types),
            (3, functions),
            (4, table),
            (9, elements),
            (10, code),
        ]))
        .unwrap();
        assert_eq!(module.table, vec![NULL_ELEMENT, NULL_ELEMENT, 0, 0]);

        let elements: &[u8] = &[0x01, 0x00, 0x41, 0x03, 0x0B, 0x02, 0x00, 0x00];
        let bytes = with_sections(&[
            (1, types),
            (3, functions),
            (4, table),
            (9, elements),
            (10, code),
        ]);
        assert!(matches!(Module::parse(&bytes), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_second_table_or_memory_is_unsupported() {
        let tables: &[u8] = &[0x02, 0x70, 0x00, 0x01, 0x70, 0x00, 0x01];
        assert!(matches!(
            Module::parse(&with_sections(&[(4, tables)])),
            Err(WaveError::Unsupported(_))
        ));
        let memories: &[u8] = &[0x02, 0x00, 0x01, 0x00, 0x01];
        assert!(matches!(
            Module::parse(&with_sections(&[(5, memories)])),
            Err(WaveError::Unsupported(_))
        ));
    }

    #[test]
    fn test_memory_export_and_data_build_the_image() {
        let memory: &[u8] = &[0x01, 0x01, 0x01, 0x02];
        let export: &[u8] = &[0x01, 0x06, b'm', b'e', b'm', b'o', b'r', b'y', 0x02, 0x00];
        let data: &[u8] = &[0x01, 0x00, 0x41, 0x08, 0x0B, 0x03, b'a', b'b', b'c'];
        let module =
            Module::parse(&with_sections(&[(5, memory), (7, export), (11, data)])).unwrap();

        assert_eq!(
            module.memory,
            Some(MemoryType {
                initial: 1,
                maximum: Some(2)
            })
        );
        assert_eq!(module.memory_image.len(), WASM_PAGE_SIZE as usize);
        assert_eq!(&module.memory_image[8..11], b"abc");
        assert_eq!(module.export("memory").unwrap().kind, ExternalKind::Memory);
    }

    #[test]
    fn test_data_grows_image_without_export() {
        let data: &[u8] = &[0x01, 0x00, 0x41, 0x04, 0x0B, 0x02, 0x01, 0x02];
        let module = Module::parse(&with_sections(&[(11, data)])).unwrap();
        assert_eq!(module.memory_image, vec![0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_globals_and_start() {
        let types: &[u8] = &[0x01, 0x60, 0x00, 0x00];
        let functions: &[u8] = &[0x01, 0x00];
        let globals: &[u8] = &[0x02, 0x7F, 0x00, 0x41, 0x2A, 0x0B, 0x7E, 0x01, 0x42, 0x01, 0x0B];
        let start: &[u8] = &[0x00];
        let code: &[u8] = &[0x01, 0x02, 0x00, 0x0B];
        let module = Module::parse(&with_sections(&[
            (1, types),
            (3, functions),
            (6, globals),
            (8, start),
            (10, code),
        ]))
        .unwrap();

        assert_eq!(
            module.globals[0],
            Global {
                ty: WasmType::I32,
                mutable: false,
                init: WasmValue::I32(42)
            }
        );
        assert!(module.globals[1].mutable);
        assert_eq!(module.start, Some(0));
    }

    #[test]
    fn test_declared_locals_are_bounded() {
        let body = FunctionBody {
            locals: vec![(3, WasmType::I32), (4, WasmType::F64)],
            code: vec![0x0B],
        };
        assert_eq!(body.declared_locals(), Some(7));

        let body = FunctionBody {
            locals: vec![(u32::MAX, WasmType::I32), (1, WasmType::I32)],
            code: vec![0x0B],
        };
        assert_eq!(body.declared_locals(), None);
    }
}
