//! # Execution Bridge
//!
//! The control block generated code reaches through `r15`, the callbacks the
//! runtime stubs call into, and [`Runtime`], which owns everything one
//! instance needs to run a call.
//!
//! ## Call Flow
//!
//! ```text
//! Runtime::call
//!   ├─ JitCompiler::compile      (arena read-write)
//!   ├─ arena → read-execute
//!   ├─ entry adapter ──▶ generated code ──▶ resolve_indirect / grow_memory / host_call
//!   ├─ arena → read-write
//!   └─ check scratch pointers, decode result or trap code
//! ```

use core::mem::offset_of;
use std::sync::Arc;

use crate::jit::{JitCompiler, JitStats, RuntimeCallbacks};
use crate::memory::LinearMemory;
use crate::module::{Module, NULL_ELEMENT};
use crate::platform;
use crate::{Trap, WasmValue, WaveConfig, WaveError};

/// Sentinel returned by callbacks that failed, and the trap code for a
/// failure that is not a WASM trap. The real error waits in the runtime.
pub const HOST_ERROR: u32 = u32::MAX;

/// Per-call record shared with generated code.
///
/// Generated code uses the offsets in [`ecb`]; the fields it touches stay
/// within an 8-bit displacement.
#[repr(C)]
#[derive(Debug)]
pub struct ExecutionControlBlock {
    /// Function the adapter calls.
    pub entry: u64,
    /// Operand stack pointer, written back by the adapter on return.
    pub operand_stack: u64,
    pub operand_limit: u64,
    /// Locals frame pointer, written back by the adapter on return.
    pub locals_stack: u64,
    pub locals_limit: u64,
    /// Lowest host `rsp` generated code may reach.
    pub native_limit: u64,
    /// Usable bottom of the calling thread's stack, or 0 if unknown. The
    /// adapter never sets `native_limit` below it.
    pub stack_floor: u64,
    /// Host `rsp` inside the adapter, restored when a trap unwinds.
    pub host_rsp: u64,
    pub memory_base: u64,
    /// Committed linear-memory bytes.
    pub heap_bytes: u64,
    pub result: u64,
    pub trap_code: u32,
    pub table: *const u32,
    pub table_len: u64,
    /// Canonical type index per function.
    pub function_types: *const u32,
    pub function_count: u64,
    pub function_table: *const u64,
    pub runtime: *mut Runtime,
}

/// Field offsets for `[r15 + disp]` operands.
pub mod ecb {
    use super::{offset_of, ExecutionControlBlock as Ecb};

    pub const ENTRY: i32 = offset_of!(Ecb, entry) as i32;
    pub const OPERAND_STACK: i32 = offset_of!(Ecb, operand_stack) as i32;
    pub const OPERAND_LIMIT: i32 = offset_of!(Ecb, operand_limit) as i32;
    pub const LOCALS_STACK: i32 = offset_of!(Ecb, locals_stack) as i32;
    pub const LOCALS_LIMIT: i32 = offset_of!(Ecb, locals_limit) as i32;
    pub const NATIVE_LIMIT: i32 = offset_of!(Ecb, native_limit) as i32;
    pub const STACK_FLOOR: i32 = offset_of!(Ecb, stack_floor) as i32;
    pub const HOST_RSP: i32 = offset_of!(Ecb, host_rsp) as i32;
    pub const MEMORY_BASE: i32 = offset_of!(Ecb, memory_base) as i32;
    pub const HEAP_BYTES: i32 = offset_of!(Ecb, heap_bytes) as i32;
    pub const RESULT: i32 = offset_of!(Ecb, result) as i32;
    pub const TRAP_CODE: i32 = offset_of!(Ecb, trap_code) as i32;
}

/// Returned in `rax:rdx` by [`resolve_indirect`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectTarget {
    /// Entry point, or 0 with the trap code set in the control block.
    pub entry: u64,
    pub function: u64,
}

impl IndirectTarget {
    fn trap(ecb: &mut ExecutionControlBlock, code: u32) -> Self {
        ecb.trap_code = code;
        Self {
            entry: 0,
            function: 0,
        }
    }
}

/// Look up table slot `slot`, check its type against `expected` and make
/// sure the target is compiled.
///
/// # Safety
///
/// `ecb` must be the control block of the running call.
pub unsafe extern "C" fn resolve_indirect(
    ecb: *mut ExecutionControlBlock,
    slot: u32,
    expected: u32,
) -> IndirectTarget {
    let ecb = &mut *ecb;
    log::trace!("call_indirect slot {} expecting type {}", slot, expected);

    if u64::from(slot) >= ecb.table_len {
        return IndirectTarget::trap(ecb, Trap::UndefinedElement.code());
    }
    let function = *ecb.table.add(slot as usize);
    if function == NULL_ELEMENT || u64::from(function) >= ecb.function_count {
        return IndirectTarget::trap(ecb, Trap::UndefinedElement.code());
    }
    if *ecb.function_types.add(function as usize) != expected {
        return IndirectTarget::trap(ecb, Trap::IndirectCallTypeMismatch.code());
    }

    let mut entry = *ecb.function_table.add(function as usize);
    if entry == 0 {
        let runtime = &mut *ecb.runtime;
        match runtime.compile_while_running(function) {
            Ok(address) => entry = address as u64,
            Err(err) => {
                runtime.pending = Some(err);
                return IndirectTarget::trap(ecb, HOST_ERROR);
            }
        }
    }
    IndirectTarget {
        entry,
        function: u64::from(function),
    }
}

/// Grow linear memory by `delta` pages; the previous size or [`HOST_ERROR`].
///
/// # Safety
///
/// `ecb` must be the control block of the running call.
pub unsafe extern "C" fn grow_memory(ecb: *mut ExecutionControlBlock, delta: u32) -> u32 {
    let ecb = &mut *ecb;
    let runtime = &mut *ecb.runtime;
    match runtime.memory.grow(delta) {
        Some(old) => {
            ecb.heap_bytes = runtime.memory.byte_len();
            old
        }
        None => HOST_ERROR,
    }
}

/// Run host import `index` on the argument slots at `args`.
///
/// # Safety
///
/// `ecb` must be the control block of the running call, and `args` must hold
/// the import's parameters.
pub unsafe extern "C" fn host_call(
    ecb: *mut ExecutionControlBlock,
    index: u32,
    args: *const u64,
    memory: *mut u8,
) -> u64 {
    let ecb = &mut *ecb;
    let runtime = &mut *ecb.runtime;
    let Some(import) = runtime.module.imports.get(index as usize) else {
        runtime.pending = Some(WaveError::Corruption(format!(
            "host call to non-import {}",
            index
        )));
        ecb.trap_code = HOST_ERROR;
        return 0;
    };
    log::trace!("host call {}.{}", import.module, import.name);

    let signature = import.host.signature();
    let args = core::slice::from_raw_parts(args, signature.params.len());
    let memory: &[u8] = if memory.is_null() {
        &[]
    } else {
        core::slice::from_raw_parts(memory, ecb.heap_bytes as usize)
    };
    let raw = import.host.call(args, memory);
    match signature.result {
        Some(ty) if !ty.is_wide() => u64::from(raw as u32),
        _ => raw,
    }
}

/// Addresses of the callbacks above, for the stub generator.
pub fn callbacks() -> RuntimeCallbacks {
    RuntimeCallbacks {
        resolve_indirect: resolve_indirect as usize,
        grow_memory: grow_memory as usize,
        host_call: host_call as usize,
    }
}

/// Compiler, memory and scratch regions of one instance.
pub struct Runtime {
    module: Arc<Module>,
    jit: JitCompiler,
    memory: LinearMemory,
    operands: Vec<u64>,
    locals: Vec<u64>,
    /// Error behind a [`HOST_ERROR`] trap code.
    pending: Option<WaveError>,
}

// SAFETY: the raw pointers inside the compiler point into its own arena,
// which moves with it.
unsafe impl Send for Runtime {}

impl Runtime {
    pub fn new(module: Arc<Module>, config: &WaveConfig) -> Result<Self, WaveError> {
        config.validate()?;
        let jit = JitCompiler::new(&module, config, callbacks())?;

        let (initial, limit) = match module.memory {
            Some(memory) => (
                memory.initial,
                memory
                    .maximum
                    .unwrap_or(config.memory_ceiling_pages)
                    .min(config.memory_ceiling_pages),
            ),
            None => (0, 0),
        };
        let memory = LinearMemory::new(&module.memory_image, initial, limit)?;

        Ok(Self {
            module,
            jit,
            memory,
            operands: vec![0; config.operand_slots],
            locals: vec![0; config.locals_slots],
            pending: None,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn stats(&self) -> JitStats {
        self.jit.stats()
    }

    /// Current bits of global `index`.
    pub fn global_bits(&self, index: u32) -> Option<u64> {
        let global = self.module.globals.get(index as usize)?;
        if global.mutable {
            self.jit.arena().global(index)
        } else {
            Some(global.init.to_bits())
        }
    }

    /// Compile `index` from inside a running call.
    fn compile_while_running(&mut self, index: u32) -> Result<*const u8, WaveError> {
        log::warn!("compiling indirect call target {} lazily", index);
        self.jit.arena_mut().make_writable()?;
        let compiled = self.jit.compile(&self.module, index);
        let restored = self.jit.arena_mut().make_executable();
        let entry = compiled?;
        restored?;
        Ok(entry)
    }

    /// Run function `index` with `args`, which must match its signature.
    pub fn call(
        &mut self,
        index: u32,
        args: &[WasmValue],
    ) -> Result<Option<WasmValue>, WaveError> {
        let result_type = self
            .module
            .signature(index)
            .ok_or_else(|| WaveError::Link(format!("function {} not found", index)))?
            .result;
        if args.len() > self.locals.len() {
            return Err(WaveError::Resource(format!("{} arguments", args.len())));
        }
        let entry = self.jit.compile(&self.module, index)?;

        for (slot, arg) in self.locals.iter_mut().zip(args) {
            *slot = arg.to_bits();
        }
        let operands = self.operands.as_mut_ptr() as u64;
        let locals = self.locals.as_mut_ptr() as u64;
        let table = &self.module.table;
        let function_types = &self.module.functions;

        let mut block = ExecutionControlBlock {
            entry: entry as u64,
            operand_stack: operands,
            operand_limit: operands + self.operands.len() as u64 * 8,
            locals_stack: locals,
            locals_limit: locals + self.locals.len() as u64 * 8,
            native_limit: 0,
            stack_floor: platform::stack_floor().unwrap_or(0) as u64,
            host_rsp: 0,
            memory_base: self.memory.base() as u64,
            heap_bytes: self.memory.byte_len(),
            result: 0,
            trap_code: 0,
            table: table.as_ptr(),
            table_len: table.len() as u64,
            function_types: function_types.as_ptr(),
            function_count: function_types.len() as u64,
            function_table: self.jit.arena().function_table(),
            runtime: core::ptr::null_mut(),
        };
        let adapter = self.jit.adapter();

        self.jit.arena_mut().make_executable()?;
        let runtime: *mut Runtime = self;
        block.runtime = runtime;
        // SAFETY: the adapter follows the System V ABI and takes the control
        // block; `self` is only reached through `block.runtime` until it returns.
        let code = unsafe { adapter.call_with(&mut block as *mut ExecutionControlBlock) };
        self.jit.arena_mut().make_writable()?;

        match code {
            0 => {}
            HOST_ERROR => {
                return Err(self.pending.take().unwrap_or_else(|| {
                    WaveError::Corruption("callback failed without an error".into())
                }))
            }
            code => {
                let trap = Trap::from_code(code).ok_or_else(|| {
                    WaveError::Corruption(format!("unknown trap code {}", code))
                })?;
                log::debug!("function {} trapped: {}", index, trap);
                return Err(WaveError::Trap(trap));
            }
        }

        // The adapter spills one slot before calling in.
        if block.operand_stack != operands + 8 || block.locals_stack != locals {
            return Err(WaveError::Corruption(format!(
                "scratch pointers returned at operand +{:#x}, locals +{:#x}",
                block.operand_stack.wrapping_sub(operands),
                block.locals_stack.wrapping_sub(locals)
            )));
        }
        Ok(result_type.map(|ty| WasmValue::from_bits(ty, block.result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_distinct_and_aligned() {
        let offsets = [
            ecb::ENTRY,
            ecb::OPERAND_STACK,
            ecb::OPERAND_LIMIT,
            ecb::LOCALS_STACK,
            ecb::LOCALS_LIMIT,
            ecb::NATIVE_LIMIT,
            ecb::STACK_FLOOR,
            ecb::HOST_RSP,
            ecb::MEMORY_BASE,
            ecb::HEAP_BYTES,
            ecb::RESULT,
            ecb::TRAP_CODE,
        ];
        for (i, a) in offsets.iter().enumerate() {
            assert_eq!(a % 4, 0);
            for b in &offsets[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(offsets.iter().all(|offset| *offset < 128));
    }

    #[test]
    fn test_runtime_seeds_memory_from_image() {
        // (memory (export "memory") 1 3) (data (i32.const 2) "hi")
        let bytes = [
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, //
            0x05, 0x04, 0x01, 0x01, 0x01, 0x03, //
            0x07, 0x0A, 0x01, 0x06, b'm', b'e', b'm', b'o', b'r', b'y', 0x02, 0x00, //
            0x0B, 0x08, 0x01, 0x00, 0x41, 0x02, 0x0B, 0x02, b'h', b'i',
        ];
        let module = Arc::new(Module::parse(&bytes).unwrap());
        let runtime = Runtime::new(module, &WaveConfig::default()).unwrap();
        assert_eq!(runtime.memory().pages(), 1);
        assert_eq!(runtime.memory().limit(), 3);
        assert_eq!(&runtime.memory().as_slice()[2..4], b"hi");
    }
}
