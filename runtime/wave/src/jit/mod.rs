//! # JIT Compiler for WAVE
//!
//! Lazily compiles WebAssembly functions to x86_64 machine code.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WASM Bytecode                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Single-Pass Translation                    │
//! │  (Cached top of stack, block records, patched branches)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Code Generation                           │
//! │  (x86_64 encoder, labels, RIP-relative fixups)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Executable Arena                           │
//! │  (Function table, helper slots, globals, W^X code region)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Compiling a function also compiles everything it calls directly.
//! Indirect call targets are compiled the first time they are dispatched.

pub mod control;
pub mod memory;
pub mod stubs;
pub mod translate;
pub mod x86_64;

use std::io;

use thiserror::Error;

use crate::decode::DecodeError;
use crate::module::Module;
use crate::{WaveConfig, WaveError};

use memory::{CodePtr, ExecutableArena, HelperSlot};
use stubs::Stubs;

/// JIT compilation error.
#[derive(Debug, Error)]
pub enum JitError {
    /// The arena has no room left.
    #[error("executable arena exhausted ({requested} bytes needed, {available} available)")]
    ArenaExhausted { requested: usize, available: usize },
    /// A displacement does not fit its encoding.
    #[error("displacement {0} does not fit its encoding")]
    DisplacementOverflow(i64),
    /// Invalid WASM bytecode.
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
    /// Unsupported instruction.
    #[error("unknown opcode 0x{0:02x}")]
    UnsupportedInstruction(u8),
    /// Block type outside the single-result MVP set.
    #[error("unsupported block type 0x{0:02x}")]
    UnsupportedBlockType(u8),
    /// Function not found.
    #[error("function {0} not found")]
    FunctionNotFound(u32),
    /// Code generation failed.
    #[error("code generation failed: {0}")]
    CodeGen(String),
    /// Page allocator failure.
    #[error("page allocator: {0}")]
    Memory(#[from] io::Error),
    /// Truncated or malformed function body.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<JitError> for WaveError {
    fn from(err: JitError) -> Self {
        match err {
            JitError::ArenaExhausted { .. }
            | JitError::DisplacementOverflow(_)
            | JitError::CodeGen(_)
            | JitError::Memory(_) => WaveError::Resource(err.to_string()),
            JitError::InvalidBytecode(_)
            | JitError::UnsupportedInstruction(_)
            | JitError::FunctionNotFound(_)
            | JitError::Decode(_) => WaveError::Format(err.to_string()),
            JitError::UnsupportedBlockType(_) => WaveError::Unsupported(err.to_string()),
        }
    }
}

/// Addresses of the `extern "C"` callbacks the runtime stubs call into.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCallbacks {
    /// `fn(ecb, slot: u32, expected_type: u32) -> IndirectTarget`
    pub resolve_indirect: usize,
    /// `fn(ecb, delta: u32) -> u32`
    pub grow_memory: usize,
    /// `fn(ecb, function: u32, args: *const u64, memory: *mut u8) -> u64`
    pub host_call: usize,
}

/// Statistics about JIT compilation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitStats {
    /// Total functions compiled.
    pub functions_compiled: u32,
    /// Total code size in bytes, stubs included.
    pub total_code_size: usize,
}

/// JIT compiler owning one executable arena.
pub struct JitCompiler {
    arena: ExecutableArena,
    stubs: Stubs,
    functions_compiled: u32,
}

impl JitCompiler {
    /// Create the arena for `module`, install the runtime stubs, route
    /// imports to the host-call stub and seed global storage.
    pub fn new(
        module: &Module,
        config: &WaveConfig,
        callbacks: RuntimeCallbacks,
    ) -> Result<Self, JitError> {
        let mut arena = ExecutableArena::new(
            config.arena_size,
            module.function_count() as usize,
            module.globals.len(),
        )?;
        let stubs = stubs::install(&mut arena, &callbacks, config.native_stack_budget)?;

        let host_call = arena.helper(HelperSlot::HostCall);
        for index in 0..module.imports.len() as u32 {
            arena.set_function_entry(index, host_call)?;
        }
        for (index, global) in module.globals.iter().enumerate() {
            arena.set_global(index as u32, global.init.to_bits());
        }

        Ok(Self {
            arena,
            stubs,
            functions_compiled: 0,
        })
    }

    /// Compile function `index` and everything it calls directly.
    ///
    /// Returns the entry point. A function that is already resident is
    /// returned as is. Either the whole call closure becomes resident or,
    /// on error, none of it does.
    pub fn compile(&mut self, module: &Module, index: u32) -> Result<*const u8, JitError> {
        let entry = self.arena.function_entry(index)?;
        if !entry.is_null() {
            return Ok(entry);
        }

        let mark = self.arena.code_mark();
        let mut installed = Vec::new();
        if let Err(err) = self.compile_closure(module, index, &mut installed) {
            // Callers installed this round may still point at a callee that
            // never made it.
            for function in &installed {
                let _ = self.arena.set_function_entry(*function, core::ptr::null());
            }
            self.arena.rewind(mark);
            log::warn!(
                "compiling function {} failed, {} installed functions withdrawn: {}",
                index,
                installed.len(),
                err
            );
            return Err(err);
        }

        self.functions_compiled += installed.len() as u32;
        self.arena.function_entry(index)
    }

    fn compile_closure(
        &mut self,
        module: &Module,
        index: u32,
        installed: &mut Vec<u32>,
    ) -> Result<(), JitError> {
        let mut worklist = vec![index];
        while let Some(next) = worklist.pop() {
            if !self.arena.function_entry(next)?.is_null() {
                continue;
            }
            let translation = translate::translate(module, &self.arena, next)?;
            let entry = self.arena.install(translation.origin, &translation.code)?;
            self.arena.set_function_entry(next, entry)?;
            installed.push(next);
            log::debug!(
                "compiled function {} at {:p} ({} bytes)",
                next,
                entry,
                translation.code.len()
            );
            worklist.extend(translation.callees);
        }
        Ok(())
    }

    /// Entry point of `index` if it is resident.
    pub fn compiled_entry(&self, index: u32) -> Option<*const u8> {
        self.arena
            .function_entry(index)
            .ok()
            .filter(|entry| !entry.is_null())
    }

    /// The System V entry adapter.
    pub fn adapter(&self) -> CodePtr {
        self.stubs.adapter
    }

    pub fn arena(&self) -> &ExecutableArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ExecutableArena {
        &mut self.arena
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> JitStats {
        JitStats {
            functions_compiled: self.functions_compiled,
            total_code_size: self.arena.code_size(),
        }
    }
}
