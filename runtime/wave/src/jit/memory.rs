//! # Executable Memory Management
//!
//! One [`ExecutableArena`] per instance. Its layout is fixed when it is
//! created:
//!
//! ```text
//! ┌──────────────────────┐ base
//! │ function pointers    │ 8 bytes per function, null until compiled
//! │ helper slots         │ 8 bytes per HelperSlot
//! ├──────────────────────┤ page
//! │ mutable globals      │ 8 bytes per global
//! ├──────────────────────┤ page
//! │ code                 │ grows monotonically, 16-byte aligned
//! └──────────────────────┘ base + arena_size
//! ```
//!
//! Tables and globals stay read-write for the arena's lifetime. The code
//! region toggles between read-write (compiling) and read-execute (running).

use core::sync::atomic::{fence, Ordering};

use crate::platform::{page_align, page_size, PageBlock, Protection};

use super::JitError;

// =============================================================================
// Helper Slots
// =============================================================================

/// Runtime helpers reached from generated code through `[rip + slot]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HelperSlot {
    CallIndirect = 0,
    BranchTable = 1,
    U64ToF32 = 2,
    U64ToF64 = 3,
    F32ToU64 = 4,
    F64ToU64 = 5,
    GrowMemory = 6,
    HostCall = 7,
    Trap = 8,
}

impl HelperSlot {
    pub const COUNT: usize = 9;
}

// =============================================================================
// Executable Arena
// =============================================================================

/// Contiguous region holding everything generated code addresses RIP-relative.
#[derive(Debug)]
pub struct ExecutableArena {
    block: PageBlock,
    function_count: usize,
    global_count: usize,
    helpers_offset: usize,
    globals_offset: usize,
    code_offset: usize,
    /// End of installed code.
    cursor: usize,
    /// End of the committed part of the code region.
    committed: usize,
    executable: bool,
}

impl ExecutableArena {
    /// Code alignment.
    pub const CODE_ALIGN: usize = 16;

    /// Reserve an arena of `size` bytes for `function_count` functions and
    /// `global_count` globals.
    pub fn new(size: usize, function_count: usize, global_count: usize) -> Result<Self, JitError> {
        let helpers_offset = function_count * 8;
        let globals_offset = page_align(helpers_offset + HelperSlot::COUNT * 8);
        let code_offset = page_align(globals_offset + global_count * 8);
        if code_offset + page_size() > size {
            return Err(JitError::ArenaExhausted {
                requested: code_offset + page_size(),
                available: size,
            });
        }

        let block = PageBlock::reserve(None, size)?;
        block.protect(0, code_offset, Protection::READ_WRITE)?;
        log::debug!(
            "arena at {:p}: {} functions, {} globals, code at +{:#x}, {} bytes",
            block.base(),
            function_count,
            global_count,
            code_offset,
            block.size()
        );

        Ok(Self {
            block,
            function_count,
            global_count,
            helpers_offset,
            globals_offset,
            code_offset,
            cursor: code_offset,
            committed: code_offset,
            executable: false,
        })
    }

    fn address(&self, offset: usize) -> u64 {
        self.block.base() as u64 + offset as u64
    }

    fn read_u64(&self, offset: usize) -> u64 {
        // SAFETY: callers pass offsets inside the always read-write table pages.
        unsafe { self.block.base().add(offset).cast::<u64>().read() }
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        // SAFETY: as in `read_u64`; the tables are 8-byte aligned.
        unsafe { self.block.base().add(offset).cast::<u64>().write(value) }
    }

    pub fn function_count(&self) -> usize {
        self.function_count
    }

    /// Start of the function-pointer table.
    pub fn function_table(&self) -> *const u64 {
        self.block.base().cast::<u64>()
    }

    /// Address of function `index`'s pointer slot.
    pub fn function_slot_address(&self, index: u32) -> u64 {
        debug_assert!((index as usize) < self.function_count);
        self.address(index as usize * 8)
    }

    /// Entry point of function `index`, or null when it has not been compiled.
    pub fn function_entry(&self, index: u32) -> Result<*const u8, JitError> {
        if index as usize >= self.function_count {
            return Err(JitError::FunctionNotFound(index));
        }
        Ok(self.read_u64(index as usize * 8) as *const u8)
    }

    pub fn set_function_entry(&mut self, index: u32, entry: *const u8) -> Result<(), JitError> {
        if index as usize >= self.function_count {
            return Err(JitError::FunctionNotFound(index));
        }
        self.write_u64(index as usize * 8, entry as u64);
        Ok(())
    }

    pub fn helper_address(&self, slot: HelperSlot) -> u64 {
        self.address(self.helpers_offset + slot as usize * 8)
    }

    /// Current target of a helper slot.
    pub fn helper(&self, slot: HelperSlot) -> *const u8 {
        self.read_u64(self.helpers_offset + slot as usize * 8) as *const u8
    }

    pub fn set_helper(&mut self, slot: HelperSlot, target: *const u8) {
        self.write_u64(self.helpers_offset + slot as usize * 8, target as u64);
    }

    /// Address of mutable global `index`'s storage.
    pub fn global_address(&self, index: u32) -> u64 {
        debug_assert!((index as usize) < self.global_count);
        self.address(self.globals_offset + index as usize * 8)
    }

    pub fn global(&self, index: u32) -> Option<u64> {
        ((index as usize) < self.global_count)
            .then(|| self.read_u64(self.globals_offset + index as usize * 8))
    }

    pub fn set_global(&mut self, index: u32, bits: u64) {
        if (index as usize) < self.global_count {
            self.write_u64(self.globals_offset + index as usize * 8, bits);
        }
    }

    /// Address the next installed code block will start at.
    pub fn next_code_address(&self) -> u64 {
        self.address(align_code(self.cursor))
    }

    /// Bytes of code installed so far.
    pub fn code_size(&self) -> usize {
        self.cursor - self.code_offset
    }

    /// Position to [`rewind`](Self::rewind) to if a compile fails.
    pub fn code_mark(&self) -> usize {
        self.cursor
    }

    /// Forget code installed after `mark`. No function entry may point
    /// past it.
    pub fn rewind(&mut self, mark: usize) {
        if (self.code_offset..=self.cursor).contains(&mark) {
            self.cursor = mark;
        }
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `code`, assembled for `origin`, into the code region.
    pub fn install(&mut self, origin: u64, code: &[u8]) -> Result<*const u8, JitError> {
        if self.executable {
            return Err(JitError::CodeGen(
                "code region is not writable".into(),
            ));
        }
        let start = align_code(self.cursor);
        if self.address(start) != origin {
            return Err(JitError::CodeGen(format!(
                "code assembled for {:#x} but next slot is {:#x}",
                origin,
                self.address(start)
            )));
        }
        let end = start + code.len();
        if end > self.block.size() {
            return Err(JitError::ArenaExhausted {
                requested: end,
                available: self.block.size(),
            });
        }

        if end > self.committed {
            let commit_end = page_align(end).min(self.block.size());
            self.block.protect(
                self.committed,
                commit_end - self.committed,
                Protection::READ_WRITE,
            )?;
            self.committed = commit_end;
        }

        // SAFETY: [start, end) is committed read-write and owned by the arena.
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), self.block.base().add(start), code.len());
        }
        self.cursor = end;
        Ok(self.address(start) as *const u8)
    }

    /// Switch the code region to read-execute.
    pub fn make_executable(&mut self) -> Result<(), JitError> {
        // x86_64 keeps the instruction cache coherent; a fence orders the writes.
        fence(Ordering::SeqCst);
        self.protect_code(Protection::READ_EXECUTE)?;
        self.executable = true;
        Ok(())
    }

    /// Switch the code region back to read-write.
    pub fn make_writable(&mut self) -> Result<(), JitError> {
        self.protect_code(Protection::READ_WRITE)?;
        self.executable = false;
        Ok(())
    }

    fn protect_code(&self, protection: Protection) -> Result<(), JitError> {
        let len = self.committed - self.code_offset;
        self.block.protect(self.code_offset, len, protection)?;
        Ok(())
    }
}

fn align_code(offset: usize) -> usize {
    (offset + ExecutableArena::CODE_ALIGN - 1) & !(ExecutableArena::CODE_ALIGN - 1)
}

// =============================================================================
// Code Pointer
// =============================================================================

/// Pointer to the generated entry adapter.
#[derive(Debug, Clone, Copy)]
pub struct CodePtr(*const u8);

impl CodePtr {
    /// Create a new code pointer.
    ///
    /// # Safety
    ///
    /// The pointer must point to valid code following the System V ABI.
    pub unsafe fn new(ptr: *const u8) -> Self {
        Self(ptr)
    }

    /// Get the raw pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.0
    }

    /// Call as `extern "C" fn(*mut T) -> u32`.
    ///
    /// # Safety
    ///
    /// The code must be executable and expect exactly this signature.
    pub unsafe fn call_with<T>(&self, arg: *mut T) -> u32 {
        let func: extern "C" fn(*mut T) -> u32 = core::mem::transmute(self.0);
        func(arg)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_slots() {
        let mut arena = ExecutableArena::new(1 << 20, 3, 2).unwrap();
        assert_eq!(arena.function_entry(2).unwrap(), core::ptr::null());
        assert!(arena.function_entry(3).is_err());

        arena.set_function_entry(1, 0x1234 as *const u8).unwrap();
        assert_eq!(arena.function_entry(1).unwrap() as u64, 0x1234);

        arena.set_global(1, 42);
        assert_eq!(arena.global(1), Some(42));
        assert_eq!(arena.global(2), None);

        let table = arena.function_table() as u64;
        assert_eq!(arena.function_slot_address(2), table + 16);
        assert_eq!(arena.helper_address(HelperSlot::CallIndirect), table + 24);
        assert_eq!(arena.global_address(0) % page_size() as u64, 0);
        assert_eq!(arena.next_code_address() % page_size() as u64, 0);
    }

    #[test]
    fn test_install_aligns_and_grows_monotonically() {
        let mut arena = ExecutableArena::new(1 << 20, 1, 0).unwrap();
        let first_origin = arena.next_code_address();
        let first = arena.install(first_origin, &[0xC3; 3]).unwrap();
        assert_eq!(first as u64, first_origin);

        let second_origin = arena.next_code_address();
        assert_eq!(second_origin, first_origin + 16);
        arena.install(second_origin, &[0x90; 5000]).unwrap();
        assert_eq!(arena.code_size(), 16 + 5000);

        // A block assembled for the wrong address is refused.
        assert!(arena.install(first_origin, &[0xC3]).is_err());
    }

    #[test]
    fn test_rewind_reuses_code_space() {
        let mut arena = ExecutableArena::new(1 << 20, 1, 0).unwrap();
        let mark = arena.code_mark();
        let origin = arena.next_code_address();
        arena.install(origin, &[0xC3; 40]).unwrap();

        arena.rewind(mark);
        assert_eq!(arena.code_size(), 0);
        assert_eq!(arena.next_code_address(), origin);

        // Marks outside the installed code are ignored.
        arena.rewind(usize::MAX);
        assert_eq!(arena.next_code_address(), origin);
    }

    #[test]
    fn test_protection_toggle() {
        let mut arena = ExecutableArena::new(1 << 20, 1, 0).unwrap();
        let origin = arena.next_code_address();
        arena.install(origin, &[0xC3]).unwrap();

        arena.make_executable().unwrap();
        assert!(arena.is_executable());
        assert!(arena.install(arena.next_code_address(), &[0xC3]).is_err());

        arena.make_writable().unwrap();
        assert!(!arena.is_executable());
        assert!(arena.install(arena.next_code_address(), &[0xC3]).is_ok());
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = ExecutableArena::new(1 << 20, 1, 0).unwrap();
        let origin = arena.next_code_address();
        let err = arena.install(origin, &vec![0x90; 1 << 20]).unwrap_err();
        assert!(matches!(err, JitError::ArenaExhausted { .. }));
    }

    #[test]
    fn test_tables_must_fit() {
        assert!(matches!(
            ExecutableArena::new(1 << 16, 100_000, 0),
            Err(JitError::ArenaExhausted { .. })
        ));
    }
}
