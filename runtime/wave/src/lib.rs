//! # WAVE-JIT: WebAssembly Engine
//!
//! A small standalone WebAssembly runtime that compiles each function straight
//! to x86_64 machine code the first time it is needed.
//!
//! ## Pipeline
//!
//! ```text
//! bytes ──▶ Module::parse ──▶ Instance::new ──▶ Instance::invoke
//!              │                   │                  │
//!              │                   │                  ├─ JitCompiler::compile (lazy)
//!              │                   │                  └─ entry adapter ──▶ generated code
//!              │                   └─ arena + runtime stubs, start function
//!              └─ sections, canonical types, host imports
//! ```
//!
//! Generated code keeps the top of the WASM value stack in `rax`, spills the
//! rest to a scratch operand region and addresses locals through a frame
//! register. Calls back into the host (indirect dispatch, host imports,
//! memory growth) go through small stubs that live in the same arena as the
//! code, so every reference fits a 32-bit displacement.
//!
//! ## Example
//!
//! ```ignore
//! let instance = Instance::new(&wasm_bytes, WaveConfig::default())?;
//! let sum = instance.invoke("add", &[WasmValue::I32(3), WasmValue::I32(4)])?;
//! assert_eq!(sum, Some(WasmValue::I32(7)));
//! ```

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("wave_jit generates x86_64 code and needs a unix page allocator");

pub mod bridge;
pub mod builtins;
pub mod decode;
pub mod expr;
pub mod instance;
pub mod jit;
pub mod memory;
pub mod module;
pub mod platform;

use core::fmt;

use thiserror::Error;

pub use decode::DecodeError;
pub use instance::Instance;
pub use module::Module;

/// Size of a linear-memory page.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// WASM section types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

impl SectionId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Custom),
            1 => Some(Self::Type),
            2 => Some(Self::Import),
            3 => Some(Self::Function),
            4 => Some(Self::Table),
            5 => Some(Self::Memory),
            6 => Some(Self::Global),
            7 => Some(Self::Export),
            8 => Some(Self::Start),
            9 => Some(Self::Element),
            10 => Some(Self::Code),
            11 => Some(Self::Data),
            _ => None,
        }
    }
}

/// WASM value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmType {
    I32,
    I64,
    F32,
    F64,
}

impl WasmType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x7F => Some(Self::I32),
            0x7E => Some(Self::I64),
            0x7D => Some(Self::F32),
            0x7C => Some(Self::F64),
            _ => None,
        }
    }

    /// True for the 64-bit types.
    pub fn is_wide(&self) -> bool {
        matches!(self, Self::I64 | Self::F64)
    }
}

impl fmt::Display for WasmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// WASM runtime values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl WasmValue {
    pub fn value_type(&self) -> WasmType {
        match self {
            Self::I32(_) => WasmType::I32,
            Self::I64(_) => WasmType::I64,
            Self::F32(_) => WasmType::F32,
            Self::F64(_) => WasmType::F64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// The 64-bit slot representation used by generated code. 32-bit values
    /// are zero-extended.
    pub fn to_bits(&self) -> u64 {
        match self {
            Self::I32(v) => u64::from(*v as u32),
            Self::I64(v) => *v as u64,
            Self::F32(v) => u64::from(v.to_bits()),
            Self::F64(v) => v.to_bits(),
        }
    }

    /// Reinterpret a 64-bit slot as a value of `ty`.
    pub fn from_bits(ty: WasmType, bits: u64) -> Self {
        match ty {
            WasmType::I32 => Self::I32(bits as u32 as i32),
            WasmType::I64 => Self::I64(bits as i64),
            WasmType::F32 => Self::F32(f32::from_bits(bits as u32)),
            WasmType::F64 => Self::F64(f64::from_bits(bits)),
        }
    }
}

impl fmt::Display for WasmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{}:i32", v),
            Self::I64(v) => write!(f, "{}:i64", v),
            Self::F32(v) => write!(f, "{}:f32", v),
            Self::F64(v) => write!(f, "{}:f64", v),
        }
    }
}

/// Function signature: ordered parameters and at most one result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    pub params: Vec<WasmType>,
    pub result: Option<WasmType>,
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")?;
        if let Some(result) = self.result {
            write!(f, " -> {}", result)?;
        }
        Ok(())
    }
}

/// Abnormal termination of a single invocation.
///
/// The discriminant is the code generated code hands to the trap stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum Trap {
    #[error("unreachable instruction executed")]
    Unreachable = 1,
    #[error("integer divide by zero")]
    IntegerDivideByZero = 2,
    #[error("integer overflow")]
    IntegerOverflow = 3,
    #[error("out of bounds memory access")]
    MemoryOutOfBounds = 4,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch = 5,
    #[error("undefined table element")]
    UndefinedElement = 6,
    #[error("call stack exhausted")]
    CallStackExhausted = 7,
}

impl Trap {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Unreachable),
            2 => Some(Self::IntegerDivideByZero),
            3 => Some(Self::IntegerOverflow),
            4 => Some(Self::MemoryOutOfBounds),
            5 => Some(Self::IndirectCallTypeMismatch),
            6 => Some(Self::UndefinedElement),
            7 => Some(Self::CallStackExhausted),
            _ => None,
        }
    }
}

/// WAVE errors.
#[derive(Debug, Error)]
pub enum WaveError {
    /// Malformed or truncated module, unknown section or opcode, unresolved import.
    #[error("malformed module: {0}")]
    Format(String),
    /// Construct outside the supported MVP subset.
    #[error("unsupported feature: {0}")]
    Unsupported(String),
    /// Arena, scratch region or address space exhausted.
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// The invocation trapped.
    #[error("trap: {0}")]
    Trap(Trap),
    /// Generated code left the scratch stacks in an unexpected state.
    #[error("execution state corrupted: {0}")]
    Corruption(String),
    /// Export lookup or argument mismatch.
    #[error("link error: {0}")]
    Link(String),
}

impl From<DecodeError> for WaveError {
    fn from(err: DecodeError) -> Self {
        Self::Format(err.to_string())
    }
}

impl From<Trap> for WaveError {
    fn from(trap: Trap) -> Self {
        Self::Trap(trap)
    }
}

/// WAVE runtime configuration.
#[derive(Debug, Clone)]
pub struct WaveConfig {
    /// Bytes reserved for the executable arena (tables, stubs, globals, code).
    pub arena_size: usize,
    /// Capacity of the operand scratch region, in 64-bit slots.
    pub operand_slots: usize,
    /// Capacity of the locals scratch region, in 64-bit slots.
    pub locals_slots: usize,
    /// Host stack bytes generated code may consume before trapping.
    pub native_stack_budget: usize,
    /// Upper bound on linear memory, in pages, when the module declares none.
    pub memory_ceiling_pages: u32,
}

impl WaveConfig {
    /// The arena must stay addressable with rel32 displacements.
    pub const MAX_ARENA_SIZE: usize = 2 << 30;

    /// Host stack every function keeps free below its deepest block record,
    /// for a callee's call record and the Rust frames of a runtime callback.
    pub const HOST_FRAME_RESERVE: usize = 64 * 1024;

    /// Smallest usable native stack budget.
    pub const MIN_NATIVE_STACK_BUDGET: usize = 4 * Self::HOST_FRAME_RESERVE;

    /// Reject settings the code generator cannot honour.
    pub fn validate(&self) -> Result<(), WaveError> {
        if self.arena_size < 1 << 20 || self.arena_size > Self::MAX_ARENA_SIZE {
            return Err(WaveError::Resource(format!(
                "arena size {} outside 1 MiB..=2 GiB",
                self.arena_size
            )));
        }
        if self.operand_slots < 1024 || self.locals_slots < 1024 {
            return Err(WaveError::Resource(
                "scratch regions need at least 1024 slots".into(),
            ));
        }
        if self.native_stack_budget < Self::MIN_NATIVE_STACK_BUDGET
            || self.native_stack_budget > 1 << 30
        {
            return Err(WaveError::Resource(format!(
                "native stack budget {} outside {}..=1 GiB",
                self.native_stack_budget,
                Self::MIN_NATIVE_STACK_BUDGET
            )));
        }
        if self.memory_ceiling_pages == 0 || self.memory_ceiling_pages > 65536 {
            return Err(WaveError::Resource(format!(
                "memory ceiling of {} pages outside 1..=65536",
                self.memory_ceiling_pages
            )));
        }
        Ok(())
    }
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            arena_size: 64 * 1024 * 1024, // 64 MB
            operand_slots: 409_600,
            locals_slots: 409_600,
            native_stack_budget: 512 * 1024,
            memory_ceiling_pages: 65536, // 4 GB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_bits_round_trip_per_type() {
        assert_eq!(WasmValue::I32(-1).to_bits(), 0xFFFF_FFFF);
        assert_eq!(
            WasmValue::from_bits(WasmType::I32, 0xDEAD_0000_0000_0007),
            WasmValue::I32(7)
        );
        assert_eq!(WasmValue::F32(1.5).to_bits(), u64::from(1.5f32.to_bits()));
        assert_eq!(
            WasmValue::from_bits(WasmType::F64, 2.25f64.to_bits()),
            WasmValue::F64(2.25)
        );
    }

    #[test]
    fn test_trap_codes() {
        for code in 1..=7 {
            let trap = Trap::from_code(code).expect("valid trap code");
            assert_eq!(trap.code(), code);
        }
        assert_eq!(Trap::from_code(0), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(WaveConfig::default().validate().is_ok());

        let config = WaveConfig {
            arena_size: 3 << 30,
            ..WaveConfig::default()
        };
        assert!(matches!(config.validate(), Err(WaveError::Resource(_))));

        let config = WaveConfig {
            memory_ceiling_pages: 70_000,
            ..WaveConfig::default()
        };
        assert!(config.validate().is_err());

        let config = WaveConfig {
            native_stack_budget: WaveConfig::HOST_FRAME_RESERVE,
            ..WaveConfig::default()
        };
        assert!(matches!(config.validate(), Err(WaveError::Resource(_))));
    }

    #[test]
    fn test_signature_display() {
        let sig = FunctionSignature {
            params: vec![WasmType::I32, WasmType::F64],
            result: Some(WasmType::I64),
        };
        assert_eq!(sig.to_string(), "(i32, f64) -> i64");
    }
}
