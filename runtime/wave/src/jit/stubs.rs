//! # Runtime Stubs
//!
//! Hand-assembled helpers installed at the start of every arena's code
//! region: the entry adapter that switches from the System V convention to
//! the private one, the trap exit, the `br_table` dispatcher, the unsigned
//! conversion helpers and the trampolines into the Rust callbacks.
//!
//! Private convention: `rax` top of stack, `rdi` operand stack pointer,
//! `rbx` locals frame, `rsi` linear memory, `r15` control block.

use crate::bridge::ecb;

use super::memory::{CodePtr, ExecutableArena, HelperSlot};
use super::x86_64::x86_64_regs::*;
use super::x86_64::{
    Alu, BitTest, Cond, Label, Mem, PhysReg, Precision, Shift, Size, SseOp, X86_64Emitter, XMM0,
    XMM1,
};
use super::{JitError, RuntimeCallbacks};

/// Callee-saved registers the adapter preserves, in push order.
const SAVED: [PhysReg; 6] = [RBP, RBX, R12, R13, R14, R15];

/// Entry points produced by [`install`].
#[derive(Debug, Clone, Copy)]
pub struct Stubs {
    /// `extern "C" fn(*mut ExecutionControlBlock) -> u32`, returning the trap code.
    pub adapter: CodePtr,
}

/// Assemble every stub into `arena` and fill the helper slots.
pub fn install(
    arena: &mut ExecutableArena,
    callbacks: &RuntimeCallbacks,
    native_stack_budget: usize,
) -> Result<Stubs, JitError> {
    let origin = arena.next_code_address();
    let mut asm = X86_64Emitter::new(origin);

    let budget = i32::try_from(native_stack_budget)
        .map_err(|_| JitError::DisplacementOverflow(native_stack_budget as i64))?;

    let exit = asm.create_label();
    let adapter = asm.position();
    emit_adapter(&mut asm, exit, budget);

    let trap = asm.position();
    emit_trap(&mut asm, exit);

    let trap_label = asm.create_label();
    let call_indirect = asm.position();
    emit_call_indirect(&mut asm, callbacks.resolve_indirect, trap_label);
    let grow_memory = asm.position();
    emit_grow_memory(&mut asm, callbacks.grow_memory);
    let host_call = asm.position();
    emit_host_call(&mut asm, callbacks.host_call, trap_label);
    let branch_table = asm.position();
    emit_branch_table(&mut asm);
    let u64_to_f32 = asm.position();
    emit_u64_to_float(&mut asm, Precision::Single);
    let u64_to_f64 = asm.position();
    emit_u64_to_float(&mut asm, Precision::Double);
    let f32_to_u64 = asm.position();
    emit_float_to_u64(&mut asm, Precision::Single);
    let f64_to_u64 = asm.position();
    emit_float_to_u64(&mut asm, Precision::Double);

    // Shared trap path for the trampolines: the code is already in ecx.
    asm.bind_label(trap_label);
    asm.jmp_to(trap)?;

    let code = asm.finish()?;
    let base = arena.install(origin, &code)? as usize;
    let at = |offset: u32| (base + offset as usize) as *const u8;

    arena.set_helper(HelperSlot::Trap, at(trap));
    arena.set_helper(HelperSlot::CallIndirect, at(call_indirect));
    arena.set_helper(HelperSlot::GrowMemory, at(grow_memory));
    arena.set_helper(HelperSlot::HostCall, at(host_call));
    arena.set_helper(HelperSlot::BranchTable, at(branch_table));
    arena.set_helper(HelperSlot::U64ToF32, at(u64_to_f32));
    arena.set_helper(HelperSlot::U64ToF64, at(u64_to_f64));
    arena.set_helper(HelperSlot::F32ToU64, at(f32_to_u64));
    arena.set_helper(HelperSlot::F64ToU64, at(f64_to_u64));
    log::debug!("runtime stubs installed at {:#x} ({} bytes)", base, code.len());

    // SAFETY: the adapter was just installed and follows the System V ABI.
    let adapter = unsafe { CodePtr::new(at(adapter)) };
    Ok(Stubs { adapter })
}

/// Spill `rax` onto the operand stack.
pub(crate) fn emit_push(asm: &mut X86_64Emitter) {
    asm.mov_mr(Size::S64, Mem::Base(RDI, 0), RAX);
    asm.alu_ri(Alu::Add, Size::S64, RDI, 8);
}

/// Reload `rax` from the operand stack. Leaves flags untouched.
pub(crate) fn emit_pop(asm: &mut X86_64Emitter) {
    asm.mov_rm(Size::S64, RAX, Mem::Base(RDI, -8));
    asm.lea(RDI, Mem::Base(RDI, -8));
}

fn emit_adapter(asm: &mut X86_64Emitter, exit: Label, budget: i32) {
    for reg in SAVED {
        asm.push(reg);
    }
    // Six pushes leave rsp 8 bytes off 16-byte alignment.
    asm.alu_ri(Alu::Sub, Size::S64, RSP, 8);

    asm.mov_rr(Size::S64, R15, RDI);
    asm.mov_mr(Size::S64, Mem::Base(R15, ecb::HOST_RSP), RSP);
    asm.lea(RAX, Mem::Base(RSP, -budget));
    // A thread stack smaller than the budget lowers the limit to its floor.
    asm.mov_rm(Size::S64, RCX, Mem::Base(R15, ecb::STACK_FLOOR));
    asm.alu_rr(Alu::Cmp, Size::S64, RAX, RCX);
    asm.cmov(Cond::B, Size::S64, RAX, RCX);
    asm.mov_mr(Size::S64, Mem::Base(R15, ecb::NATIVE_LIMIT), RAX);

    asm.mov_rm(Size::S64, RDI, Mem::Base(R15, ecb::OPERAND_STACK));
    asm.mov_rm(Size::S64, RBX, Mem::Base(R15, ecb::LOCALS_STACK));
    asm.mov_rm(Size::S64, RSI, Mem::Base(R15, ecb::MEMORY_BASE));
    asm.alu_rr(Alu::Xor, Size::S32, RAX, RAX);

    // Same shape as a call site in generated code.
    emit_push(asm);
    asm.push(RDI);
    asm.call_m(Mem::Base(R15, ecb::ENTRY));
    asm.pop(RDI);

    asm.mov_mr(Size::S64, Mem::Base(R15, ecb::RESULT), RAX);
    asm.mov_mr(Size::S64, Mem::Base(R15, ecb::OPERAND_STACK), RDI);
    asm.mov_mr(Size::S64, Mem::Base(R15, ecb::LOCALS_STACK), RBX);
    asm.alu_rr(Alu::Xor, Size::S32, RAX, RAX);

    asm.bind_label(exit);
    asm.alu_ri(Alu::Add, Size::S64, RSP, 8);
    for reg in SAVED.iter().rev() {
        asm.pop(*reg);
    }
    asm.ret();
}

/// Entered by `jmp` with the trap code in `ecx`, from any native depth.
fn emit_trap(asm: &mut X86_64Emitter, exit: Label) {
    asm.mov_mr(Size::S32, Mem::Base(R15, ecb::TRAP_CODE), RCX);
    asm.mov_rm(Size::S64, RSP, Mem::Base(R15, ecb::HOST_RSP));
    asm.mov_rr(Size::S32, RAX, RCX);
    asm.jmp(exit);
}

/// Align the host stack and keep the private registers the callee may clobber.
fn enter_host_frame(asm: &mut X86_64Emitter) {
    asm.push(RBP);
    asm.mov_rr(Size::S64, RBP, RSP);
    asm.alu_ri(Alu::And, Size::S64, RSP, -16);
    asm.push(RDI);
    asm.push(RSI);
}

fn call_host(asm: &mut X86_64Emitter, target: usize) {
    asm.mov_ri64(RAX, target as u64);
    asm.call_r(RAX);
}

fn leave_host_frame(asm: &mut X86_64Emitter) {
    asm.pop(RSI);
    asm.pop(RDI);
    asm.mov_rr(Size::S64, RSP, RBP);
    asm.pop(RBP);
}

/// `call`ed with the table slot in `rcx` and the expected type in `eax`.
/// Tail-jumps to the resolved entry with the function index in `rcx`.
fn emit_call_indirect(asm: &mut X86_64Emitter, resolve: usize, trap: Label) {
    enter_host_frame(asm);
    asm.mov_rr(Size::S32, RDX, RAX);
    asm.mov_rr(Size::S32, RSI, RCX);
    asm.mov_rr(Size::S64, RDI, R15);
    call_host(asm, resolve);
    leave_host_frame(asm);

    let found = asm.create_label();
    asm.test_rr(Size::S64, RAX, RAX);
    asm.jcc_short(Cond::NE, found);
    asm.mov_rm(Size::S32, RCX, Mem::Base(R15, ecb::TRAP_CODE));
    asm.jmp(trap);
    asm.bind_label(found);
    asm.mov_rr(Size::S64, RCX, RDX);
    asm.jmp_r(RAX);
}

/// `call`ed with the page delta in `eax`; returns the old size or `u32::MAX`.
fn emit_grow_memory(asm: &mut X86_64Emitter, grow: usize) {
    enter_host_frame(asm);
    asm.mov_rr(Size::S32, RSI, RAX);
    asm.mov_rr(Size::S64, RDI, R15);
    call_host(asm, grow);
    leave_host_frame(asm);
    asm.mov_rr(Size::S32, RAX, RAX);
    asm.ret();
}

/// `call`ed with the import index in `ecx` and arguments at `[rbx]`.
fn emit_host_call(asm: &mut X86_64Emitter, host_call: usize, trap: Label) {
    enter_host_frame(asm);
    asm.mov_rr(Size::S32, RAX, RCX);
    asm.mov_rr(Size::S64, RCX, RSI);
    asm.mov_rr(Size::S32, RSI, RAX);
    asm.mov_rr(Size::S64, RDX, RBX);
    asm.mov_rr(Size::S64, RDI, R15);
    call_host(asm, host_call);
    leave_host_frame(asm);

    let done = asm.create_label();
    asm.mov_rm(Size::S32, RCX, Mem::Base(R15, ecb::TRAP_CODE));
    asm.test_rr(Size::S32, RCX, RCX);
    asm.jcc_short(Cond::E, done);
    asm.jmp(trap);
    asm.bind_label(done);
    asm.ret();
}

/// `jmp`ed with the inline table in `rcx` and the selector in `rax`.
///
/// Table layout: `u32 count, u32 keeps_value, (u64 depth, u64 target)` for
/// the default and then each entry.
fn emit_branch_table(asm: &mut X86_64Emitter) {
    asm.mov_rr(Size::S32, RDX, RAX);
    emit_pop(asm);

    let chosen = asm.create_label();
    asm.lea(R9, Mem::Base(RCX, 8));
    asm.alu_rm(Alu::Cmp, Size::S32, RDX, Mem::Base(RCX, 0));
    asm.jcc_short(Cond::AE, chosen);
    asm.shift_ri(Shift::Shl, Size::S64, RDX, 4);
    asm.lea(
        R9,
        Mem::Indexed {
            base: RCX,
            index: RDX,
            scale: 1,
            disp: 24,
        },
    );
    asm.bind_label(chosen);

    asm.mov_rm(Size::S64, R8, Mem::Base(R9, 0));
    asm.mov_rm(Size::S32, R10, Mem::Base(RCX, 4));
    asm.mov_rm(Size::S64, R11, Mem::Base(R9, 8));
    asm.lea(
        RSP,
        Mem::Indexed {
            base: RSP,
            index: R8,
            scale: 8,
            disp: 0,
        },
    );
    asm.pop(RDI);

    let keep = asm.create_label();
    asm.test_rr(Size::S32, R10, R10);
    asm.jcc_short(Cond::NE, keep);
    emit_pop(asm);
    asm.bind_label(keep);
    asm.jmp_r(R11);
}

/// Unsigned 64-bit integer in `rax` to float bits in `rax`.
fn emit_u64_to_float(asm: &mut X86_64Emitter, precision: Precision) {
    let big = asm.create_label();
    let done = asm.create_label();

    asm.test_rr(Size::S64, RAX, RAX);
    asm.jcc_short(Cond::S, big);
    asm.cvt_int_to_float(precision, Size::S64, XMM0, RAX);
    asm.jmp_short(done);

    // Halve with the low bit folded in so rounding stays correct, then double.
    asm.bind_label(big);
    asm.mov_rr(Size::S64, RCX, RAX);
    asm.shift_ri(Shift::Shr, Size::S64, RCX, 1);
    asm.alu_ri(Alu::And, Size::S32, RAX, 1);
    asm.alu_rr(Alu::Or, Size::S64, RCX, RAX);
    asm.cvt_int_to_float(precision, Size::S64, XMM0, RCX);
    asm.sse(SseOp::Add, precision, XMM0, XMM0);

    asm.bind_label(done);
    match precision {
        Precision::Single => asm.mov_rx(Size::S32, RAX, XMM0),
        Precision::Double => asm.mov_rx(Size::S64, RAX, XMM0),
    }
    asm.ret();
}

/// Float bits in `rax` to an unsigned 64-bit integer in `rax`.
fn emit_float_to_u64(asm: &mut X86_64Emitter, precision: Precision) {
    let big = asm.create_label();

    match precision {
        Precision::Single => {
            asm.mov_xr(Size::S32, XMM0, RAX);
            asm.mov_ri32(RCX, 0x5F00_0000); // 2^63
            asm.mov_xr(Size::S32, XMM1, RCX);
        }
        Precision::Double => {
            asm.mov_xr(Size::S64, XMM0, RAX);
            asm.mov_ri64(RCX, 0x43E0_0000_0000_0000); // 2^63
            asm.mov_xr(Size::S64, XMM1, RCX);
        }
    }
    asm.comis(precision, XMM0, XMM1);
    asm.jcc_short(Cond::AE, big);
    asm.cvt_float_to_int(precision, Size::S64, RAX, XMM0);
    asm.ret();

    asm.bind_label(big);
    asm.sse(SseOp::Sub, precision, XMM0, XMM1);
    asm.cvt_float_to_int(precision, Size::S64, RAX, XMM0);
    asm.bit_test(BitTest::Btc, Size::S64, RAX, 63);
    asm.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never(_: usize) {}

    #[test]
    fn test_install_fills_every_helper_slot() {
        let mut arena = ExecutableArena::new(1 << 20, 1, 0).unwrap();
        let callbacks = RuntimeCallbacks {
            resolve_indirect: never as usize,
            grow_memory: never as usize,
            host_call: never as usize,
        };
        let stubs = install(&mut arena, &callbacks, 512 * 1024).unwrap();
        assert!(!stubs.adapter.as_ptr().is_null());
        assert!(arena.code_size() > 0);

        let table = arena.function_table() as u64;
        for slot in 0..HelperSlot::COUNT {
            let address = table + 8 + slot as u64 * 8;
            let value = unsafe { *(address as *const u64) };
            assert_ne!(value, 0, "helper slot {} left empty", slot);
        }
    }
}
