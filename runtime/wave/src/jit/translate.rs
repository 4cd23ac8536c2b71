//! # Single-Pass Translator
//!
//! Walks one function body and emits native code for it directly, with no
//! intermediate representation. The WASM value stack is modelled as a cached
//! top in `rax` plus a memory stack addressed by `rdi`; locals live in 8-byte
//! slots at `rbx`.
//!
//! Every block entry spills the top and pushes `rdi` on the native stack, so
//! any branch can restore the operand stack depth of its target by popping
//! block records, whatever the current depth is.

use crate::bridge::ecb;
use crate::decode::Reader;
use crate::module::Module;
use crate::{Trap, WasmType, WaveConfig};

use super::control::{BlockKind, BranchTarget, ControlFrame, ControlStack, PatchSite};
use super::memory::{ExecutableArena, HelperSlot};
use super::stubs::{emit_pop, emit_push};
use super::x86_64::x86_64_regs::*;
use super::x86_64::{
    Alu, BitTest, Cond, Mem, PhysReg, Precision, RoundMode, Shift, Size, SseLogic, SseOp,
    Unary, X86_64Emitter, XMM0, XMM1,
};
use super::JitError;

/// Declared locals up to this count are cleared with individual stores.
const INLINE_ZEROING_LIMIT: u32 = 8;

/// Output of translating one function.
#[derive(Debug)]
pub struct Translation {
    /// Address the code was assembled for.
    pub origin: u64,
    pub code: Vec<u8>,
    /// Directly called, non-imported functions.
    pub callees: Vec<u32>,
}

/// Translate function `index`, assembling for the arena's next code address.
pub fn translate(
    module: &Module,
    arena: &ExecutableArena,
    index: u32,
) -> Result<Translation, JitError> {
    let body = module
        .body(index)
        .ok_or(JitError::FunctionNotFound(index))?;
    let signature = module
        .signature(index)
        .ok_or(JitError::FunctionNotFound(index))?;

    let param_count = signature.params.len() as u32;
    let declared = body.declared_locals().ok_or_else(|| {
        JitError::InvalidBytecode(format!("function {} declares too many locals", index))
    })?;
    let local_count = param_count
        .checked_add(declared)
        .ok_or_else(|| JitError::InvalidBytecode("local count overflow".into()))?;
    let frame_bytes = slot_displacement(local_count)?;

    let origin = arena.next_code_address();
    let translator = Translator {
        module,
        arena,
        asm: X86_64Emitter::new(origin),
        control: ControlStack::new(),
        reader: Reader::new(&body.code),
        index,
        result: signature.result,
        param_count,
        local_count,
        frame_bytes,
        spill_sites: 0,
        max_depth: 1,
        max_call_params: 0,
        callees: Vec::new(),
    };
    translator.run(origin)
}

/// Byte offset of 8-byte slot `slot`, if it fits a 32-bit displacement.
fn slot_displacement(slot: u32) -> Result<i32, JitError> {
    i32::try_from(u64::from(slot) * 8)
        .map_err(|_| JitError::DisplacementOverflow(i64::from(slot) * 8))
}

fn size_of(wide: bool) -> Size {
    if wide {
        Size::S64
    } else {
        Size::S32
    }
}

/// Integer comparison condition by position in the `eq`..`ge_u` run.
const INT_COMPARES: [Cond; 10] = [
    Cond::E,
    Cond::NE,
    Cond::L,
    Cond::B,
    Cond::G,
    Cond::A,
    Cond::LE,
    Cond::BE,
    Cond::GE,
    Cond::AE,
];

/// Memory access shapes.
#[derive(Debug, Clone, Copy)]
enum Load {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
}

impl Load {
    fn width(self) -> i32 {
        match self {
            Load::U8 | Load::S8 => 1,
            Load::U16 | Load::S16 => 2,
            Load::U32 | Load::S32 => 4,
            Load::U64 => 8,
        }
    }
}

struct Translator<'a> {
    module: &'a Module,
    arena: &'a ExecutableArena,
    asm: X86_64Emitter,
    control: ControlStack,
    reader: Reader<'a>,
    index: u32,
    result: Option<WasmType>,
    param_count: u32,
    local_count: u32,
    frame_bytes: i32,
    /// Operand stack pushes emitted, bounding the activation's stack use.
    spill_sites: u32,
    /// Most block records live at once, the function's own included.
    max_depth: u32,
    max_call_params: u32,
    callees: Vec<u32>,
}

impl<'a> Translator<'a> {
    fn run(mut self, origin: u64) -> Result<Translation, JitError> {
        let (native_site, locals_site, operand_site) = self.prologue()?;

        while !self.control.is_empty() {
            let offset = self.reader.offset();
            let opcode = self.reader.read_u8()?;
            log::trace!(
                "fn {} +{:#x}: opcode {:#04x} at native +{:#x}",
                self.index,
                offset,
                opcode,
                self.asm.position()
            );
            self.translate_opcode(opcode)?;
            self.max_depth = self.max_depth.max(self.control.len() as u32);
        }

        if !self.reader.is_empty() {
            return Err(JitError::InvalidBytecode(format!(
                "{} bytes after the end of function {}",
                self.reader.remaining(),
                self.index
            )));
        }

        let locals_reach = self
            .local_count
            .checked_add(self.max_call_params)
            .ok_or_else(|| JitError::InvalidBytecode("frame too large".into()))?;
        let locals_reach = slot_displacement(locals_reach)?;
        let operand_reach = slot_displacement(self.spill_sites.saturating_add(2))?;
        // Block records, then a call site's saved rdi and return address.
        let native_reach = slot_displacement(self.max_depth.saturating_add(2))?
            .checked_add(WaveConfig::HOST_FRAME_RESERVE as i32)
            .ok_or_else(|| JitError::InvalidBytecode("blocks nested too deeply".into()))?;
        let buf = self.asm.buffer();
        buf.patch_u32(native_site, native_reach.wrapping_neg() as u32);
        buf.patch_u32(locals_site, locals_reach as u32);
        buf.patch_u32(operand_site, operand_reach as u32);

        let code = self.asm.finish()?;
        Ok(Translation {
            origin,
            code,
            callees: self.callees,
        })
    }

    // =========================================================================
    // Operand stack and blocks
    // =========================================================================

    fn push(&mut self) {
        emit_push(&mut self.asm);
        self.spill_sites += 1;
    }

    fn pop(&mut self) {
        emit_pop(&mut self.asm);
    }

    fn enter_block(&mut self) {
        self.push();
        self.asm.push(RDI);
    }

    fn leave_block(&mut self, keep_value: bool) {
        self.asm.pop(RDI);
        if !keep_value {
            self.pop();
        }
    }

    /// `[rdi - 8]`, the value below the top.
    fn second() -> Mem {
        Mem::Base(RDI, -8)
    }

    fn drop_second(&mut self) {
        self.asm.alu_ri(Alu::Sub, Size::S64, RDI, 8);
    }

    fn helper(&self, slot: HelperSlot) -> Mem {
        Mem::Rip(self.arena.helper_address(slot))
    }

    fn emit_trap(&mut self, trap: Trap) {
        self.asm.mov_ri32(RCX, trap.code());
        let slot = self.helper(HelperSlot::Trap);
        self.asm.jmp_m(slot);
    }

    /// Trap when `cond` holds.
    fn trap_if(&mut self, cond: Cond, trap: Trap) {
        let skip = self.asm.create_label();
        self.asm.jcc_short(cond.invert(), skip);
        self.emit_trap(trap);
        self.asm.bind_label(skip);
    }

    fn local_slot(&self, index: u32) -> Result<Mem, JitError> {
        if index >= self.local_count {
            return Err(JitError::InvalidBytecode(format!(
                "local {} out of range in function {}",
                index, self.index
            )));
        }
        Ok(Mem::Base(RBX, slot_displacement(index)?))
    }

    // =========================================================================
    // Prologue
    // =========================================================================

    /// Returns the native, locals and operand limit displacement sites.
    ///
    /// Each check is made against the deepest point the function can reach,
    /// which is only known once the body has been translated.
    fn prologue(&mut self) -> Result<(u32, u32, u32), JitError> {
        self.asm.mov_rr(Size::S64, RDX, RSP);
        let native_site = self.asm.lea_patchable(RDX, RDX);
        self.asm
            .alu_rm(Alu::Cmp, Size::S64, RDX, Mem::Base(R15, ecb::NATIVE_LIMIT));
        self.trap_if(Cond::B, Trap::CallStackExhausted);

        let locals_site = self.asm.lea_patchable(RDX, RBX);
        self.asm
            .alu_rm(Alu::Cmp, Size::S64, RDX, Mem::Base(R15, ecb::LOCALS_LIMIT));
        self.trap_if(Cond::A, Trap::CallStackExhausted);

        let operand_site = self.asm.lea_patchable(RDX, RDI);
        self.asm
            .alu_rm(Alu::Cmp, Size::S64, RDX, Mem::Base(R15, ecb::OPERAND_LIMIT));
        self.trap_if(Cond::A, Trap::CallStackExhausted);

        let declared = self.local_count - self.param_count;
        if declared <= INLINE_ZEROING_LIMIT {
            for slot in self.param_count..self.local_count {
                let mem = Mem::Base(RBX, slot_displacement(slot)?);
                self.asm.mov_mi(Size::S64, mem, 0);
            }
        } else {
            let first = slot_displacement(self.param_count)?;
            self.asm.mov_rr(Size::S64, RDX, RDI);
            self.asm.lea(RDI, Mem::Base(RBX, first));
            self.asm.mov_ri32(RCX, declared);
            self.asm.alu_rr(Alu::Xor, Size::S32, RAX, RAX);
            self.asm.rep_stosq();
            self.asm.mov_rr(Size::S64, RDI, RDX);
        }

        let position = self.asm.position();
        self.control
            .push(ControlFrame::new(BlockKind::Function, self.result, position));
        self.enter_block();
        Ok((native_site, locals_site, operand_site))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn translate_opcode(&mut self, opcode: u8) -> Result<(), JitError> {
        match opcode {
            0x00 => self.emit_trap(Trap::Unreachable),
            0x01 => {}
            0x02 => self.begin_block(BlockKind::Block)?,
            0x03 => self.begin_block(BlockKind::Loop)?,
            0x04 => self.begin_if()?,
            0x05 => self.begin_else()?,
            0x0B => self.end_block()?,
            0x0C => {
                let depth = self.reader.read_var_u32()?;
                self.branch(depth)?;
            }
            0x0D => {
                let depth = self.reader.read_var_u32()?;
                self.branch_if(depth)?;
            }
            0x0E => self.branch_table()?,
            0x0F => self.emit_return(),
            0x10 => {
                let callee = self.reader.read_var_u32()?;
                self.call(callee)?;
            }
            0x11 => {
                let type_index = self.reader.read_var_u32()?;
                self.reader.read_u8()?; // reserved
                self.call_indirect(type_index)?;
            }

            0x1A => self.pop(),
            0x1B => self.select(),

            0x20 => {
                let mem = self.read_local()?;
                self.push();
                self.asm.mov_rm(Size::S64, RAX, mem);
            }
            0x21 => {
                let mem = self.read_local()?;
                self.asm.mov_mr(Size::S64, mem, RAX);
                self.pop();
            }
            0x22 => {
                let mem = self.read_local()?;
                self.asm.mov_mr(Size::S64, mem, RAX);
            }
            0x23 => self.get_global()?,
            0x24 => self.set_global()?,

            0x28 => self.load(Load::U32, Size::S32)?,
            0x29 => self.load(Load::U64, Size::S64)?,
            0x2A => self.load(Load::U32, Size::S32)?,
            0x2B => self.load(Load::U64, Size::S64)?,
            0x2C => self.load(Load::S8, Size::S32)?,
            0x2D => self.load(Load::U8, Size::S32)?,
            0x2E => self.load(Load::S16, Size::S32)?,
            0x2F => self.load(Load::U16, Size::S32)?,
            0x30 => self.load(Load::S8, Size::S64)?,
            0x31 => self.load(Load::U8, Size::S64)?,
            0x32 => self.load(Load::S16, Size::S64)?,
            0x33 => self.load(Load::U16, Size::S64)?,
            0x34 => self.load(Load::S32, Size::S64)?,
            0x35 => self.load(Load::U32, Size::S64)?,

            0x36 | 0x38 | 0x3E => self.store(4)?,
            0x37 | 0x39 => self.store(8)?,
            0x3A | 0x3C => self.store(1)?,
            0x3B | 0x3D => self.store(2)?,

            0x3F => {
                self.reader.read_u8()?; // reserved
                self.push();
                self.asm.alu_rr(Alu::Xor, Size::S32, RAX, RAX);
                let slot = self.helper(HelperSlot::GrowMemory);
                self.asm.call_m(slot);
            }
            0x40 => {
                self.reader.read_u8()?; // reserved
                let slot = self.helper(HelperSlot::GrowMemory);
                self.asm.call_m(slot);
            }

            0x41 => {
                let value = self.reader.read_var_i32()?;
                self.constant(u64::from(value as u32));
            }
            0x42 => {
                let value = self.reader.read_var_i64()?;
                self.constant(value as u64);
            }
            0x43 => {
                let bits = self.reader.read_u32()?;
                self.constant(u64::from(bits));
            }
            0x44 => {
                let bits = self.reader.read_u64()?;
                self.constant(bits);
            }

            0x45 => self.eqz(Size::S32),
            0x46..=0x4F => self.int_compare(Size::S32, INT_COMPARES[(opcode - 0x46) as usize]),
            0x50 => self.eqz(Size::S64),
            0x51..=0x5A => self.int_compare(Size::S64, INT_COMPARES[(opcode - 0x51) as usize]),
            0x5B..=0x60 => self.float_compare(Precision::Single, opcode - 0x5B),
            0x61..=0x66 => self.float_compare(Precision::Double, opcode - 0x61),

            0x67..=0x78 => self.int_op(Size::S32, opcode - 0x67),
            0x79..=0x8A => self.int_op(Size::S64, opcode - 0x79),
            0x8B..=0x98 => self.float_op(Precision::Single, opcode - 0x8B),
            0x99..=0xA6 => self.float_op(Precision::Double, opcode - 0x99),

            0xA7..=0xBF => self.convert(opcode),

            other => return Err(JitError::UnsupportedInstruction(other)),
        }
        Ok(())
    }

    fn read_local(&mut self) -> Result<Mem, JitError> {
        let index = self.reader.read_var_u32()?;
        self.local_slot(index)
    }

    fn read_block_type(&mut self) -> Result<Option<WasmType>, JitError> {
        let byte = self.reader.read_u8()?;
        if byte == 0x40 {
            return Ok(None);
        }
        WasmType::from_byte(byte)
            .map(Some)
            .ok_or(JitError::UnsupportedBlockType(byte))
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn begin_block(&mut self, kind: BlockKind) -> Result<(), JitError> {
        let result = self.read_block_type()?;
        let position = self.asm.position();
        self.enter_block();
        self.control.push(ControlFrame::new(kind, result, position));
        Ok(())
    }

    fn begin_if(&mut self) -> Result<(), JitError> {
        let result = self.read_block_type()?;
        self.asm.test_rr(Size::S32, RAX, RAX);
        self.pop();
        let else_site = self.asm.jcc_site(Cond::E);
        let position = self.asm.position();
        self.enter_block();

        let mut frame = ControlFrame::new(BlockKind::If, result, position);
        frame.else_site = Some(else_site);
        self.control.push(frame);
        Ok(())
    }

    fn begin_else(&mut self) -> Result<(), JitError> {
        let (keep, else_site) = {
            let frame = self.control.innermost_mut()?;
            match (frame.kind, frame.else_site.take()) {
                (BlockKind::If, Some(site)) => (frame.carries_value(), site),
                _ => return Err(JitError::InvalidBytecode("else without if".into())),
            }
        };

        self.leave_block(keep);
        let to_end = self.asm.jmp_site();
        self.control.innermost_mut()?.add_site(PatchSite::Rel32(to_end));

        let here = self.asm.position();
        self.asm.buffer().patch_rel32(else_site, here)?;
        self.enter_block();
        Ok(())
    }

    fn end_block(&mut self) -> Result<(), JitError> {
        let frame = self.control.pop()?;
        // Falling out of any block, loops included, leaves its result.
        self.leave_block(frame.result.is_some());
        let kind = frame.kind;
        let here = self.asm.position();
        frame.resolve(self.asm.buffer(), here)?;
        if kind == BlockKind::Function {
            self.asm.ret();
        }
        Ok(())
    }

    /// Drop `depth` block records, leave the target block and jump to it.
    fn branch(&mut self, depth: u32) -> Result<(), JitError> {
        let (keep, resolved) = {
            let frame = self.control.label_mut(depth)?;
            let resolved = match frame.target {
                BranchTarget::Resolved(position) => Some(position),
                BranchTarget::Pending(_) => None,
            };
            (frame.carries_value(), resolved)
        };

        if depth > 0 {
            self.asm
                .alu_ri(Alu::Add, Size::S64, RSP, slot_displacement(depth)?);
        }
        self.leave_block(keep);
        match resolved {
            Some(position) => self.asm.jmp_to(position)?,
            None => {
                let site = self.asm.jmp_site();
                self.control.label_mut(depth)?.add_site(PatchSite::Rel32(site));
            }
        }
        Ok(())
    }

    fn branch_if(&mut self, depth: u32) -> Result<(), JitError> {
        let skip = self.asm.create_label();
        self.asm.test_rr(Size::S32, RAX, RAX);
        self.pop();
        self.asm.jcc(Cond::E, skip);
        self.branch(depth)?;
        self.asm.bind_label(skip);
        Ok(())
    }

    fn branch_table(&mut self) -> Result<(), JitError> {
        let count = self.reader.read_var_u32()?;
        let mut depths = Vec::with_capacity(count.min(4096) as usize + 1);
        for _ in 0..count {
            depths.push(self.reader.read_var_u32()?);
        }
        let default = self.reader.read_var_u32()?;
        let keep = self.control.label_mut(default)?.carries_value();

        let table = self.asm.create_label();
        self.asm.lea_label(RCX, table);
        let slot = self.helper(HelperSlot::BranchTable);
        self.asm.jmp_m(slot);

        self.asm.bind_label(table);
        self.asm.buffer().emit_u32(count);
        self.asm.buffer().emit_u32(u32::from(keep));
        for depth in core::iter::once(default).chain(depths) {
            let resolved = match self.control.label_mut(depth)?.target {
                BranchTarget::Resolved(position) => Some(position),
                BranchTarget::Pending(_) => None,
            };
            let buf = self.asm.buffer();
            buf.emit_u64(u64::from(depth));
            let site = buf.position();
            match resolved {
                Some(position) => {
                    let address = buf.address_of(position);
                    buf.emit_u64(address);
                }
                None => {
                    buf.emit_u64(0);
                    self.control.label_mut(depth)?.add_site(PatchSite::Abs64(site));
                }
            }
        }
        Ok(())
    }

    fn emit_return(&mut self) {
        let records = self.control.len() as i32 * 8;
        self.asm.alu_ri(Alu::Add, Size::S64, RSP, records);
        self.asm.ret();
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Move the top `params` values into the callee frame at `rbx`.
    fn pass_arguments(&mut self, params: u32) -> Result<(), JitError> {
        for slot in (0..params).rev() {
            let mem = Mem::Base(RBX, slot_displacement(slot)?);
            self.asm.mov_mr(Size::S64, mem, RAX);
            self.pop();
        }
        self.max_call_params = self.max_call_params.max(params);
        Ok(())
    }

    fn finish_call(&mut self, result: Option<WasmType>) {
        self.asm.pop(RDI);
        if self.frame_bytes != 0 {
            self.asm.alu_ri(Alu::Sub, Size::S64, RBX, self.frame_bytes);
        }
        if result.is_none() {
            self.pop();
        }
    }

    fn call(&mut self, callee: u32) -> Result<(), JitError> {
        let signature = self
            .module
            .signature(callee)
            .ok_or(JitError::FunctionNotFound(callee))?;
        let params = signature.params.len() as u32;
        let result = signature.result;
        let is_import = self.module.is_import(callee);

        if self.frame_bytes != 0 {
            self.asm.alu_ri(Alu::Add, Size::S64, RBX, self.frame_bytes);
        }
        self.pass_arguments(params)?;
        self.push();
        self.asm.push(RDI);
        if is_import {
            self.asm.mov_ri32(RCX, callee);
        }
        let slot = Mem::Rip(self.arena.function_slot_address(callee));
        self.asm.call_m(slot);
        self.finish_call(result);

        if !is_import && !self.callees.contains(&callee) {
            self.callees.push(callee);
        }
        Ok(())
    }

    fn call_indirect(&mut self, type_index: u32) -> Result<(), JitError> {
        let canonical = self.module.canonical_type(type_index).ok_or_else(|| {
            JitError::InvalidBytecode(format!("call_indirect type {} out of range", type_index))
        })?;
        let signature = &self.module.types[canonical as usize];
        let params = signature.params.len() as u32;
        let result = signature.result;

        if self.frame_bytes != 0 {
            self.asm.alu_ri(Alu::Add, Size::S64, RBX, self.frame_bytes);
        }
        self.asm.mov_rr(Size::S64, RCX, RAX);
        self.pop();
        self.pass_arguments(params)?;
        self.push();
        self.asm.push(RDI);
        self.asm.mov_ri32(RAX, canonical);
        let slot = self.helper(HelperSlot::CallIndirect);
        self.asm.call_m(slot);
        self.finish_call(result);
        Ok(())
    }

    // =========================================================================
    // Parametric and variables
    // =========================================================================

    fn select(&mut self) {
        self.asm.mov_rm(Size::S64, RCX, Mem::Base(RDI, -16));
        self.asm.mov_rm(Size::S64, RDX, Mem::Base(RDI, -8));
        self.asm.alu_ri(Alu::Sub, Size::S64, RDI, 16);
        self.asm.test_rr(Size::S32, RAX, RAX);
        self.asm.mov_rr(Size::S64, RAX, RDX);
        self.asm.cmov(Cond::NE, Size::S64, RAX, RCX);
    }

    fn constant(&mut self, bits: u64) {
        self.push();
        self.asm.load_const(RAX, bits);
    }

    fn get_global(&mut self) -> Result<(), JitError> {
        let index = self.reader.read_var_u32()?;
        let global = self.module.globals.get(index as usize).ok_or_else(|| {
            JitError::InvalidBytecode(format!("global {} out of range", index))
        })?;
        if global.mutable {
            let slot = Mem::Rip(self.arena.global_address(index));
            self.push();
            self.asm.mov_rm(Size::S64, RAX, slot);
        } else {
            self.constant(global.init.to_bits());
        }
        Ok(())
    }

    fn set_global(&mut self) -> Result<(), JitError> {
        let index = self.reader.read_var_u32()?;
        let global = self.module.globals.get(index as usize).ok_or_else(|| {
            JitError::InvalidBytecode(format!("global {} out of range", index))
        })?;
        if !global.mutable {
            return Err(JitError::InvalidBytecode(format!(
                "set_global on immutable global {}",
                index
            )));
        }
        let slot = Mem::Rip(self.arena.global_address(index));
        self.asm.mov_mr(Size::S64, slot, RAX);
        self.pop();
        Ok(())
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn read_memarg(&mut self) -> Result<u32, JitError> {
        let _align = self.reader.read_var_u32()?;
        Ok(self.reader.read_var_u32()?)
    }

    /// Trap unless `[address, address + width)` lies inside the heap.
    fn bounds_check(&mut self, address: PhysReg, width: i32) {
        self.asm.lea(RDX, Mem::Base(address, width));
        self.asm
            .alu_rm(Alu::Cmp, Size::S64, RDX, Mem::Base(R15, ecb::HEAP_BYTES));
        self.trap_if(Cond::A, Trap::MemoryOutOfBounds);
    }

    fn load(&mut self, kind: Load, size: Size) -> Result<(), JitError> {
        let offset = self.read_memarg()?;
        if offset != 0 {
            self.asm.alu_ri(Alu::Add, Size::S32, RAX, offset as i32);
        } else {
            self.asm.mov_rr(Size::S32, RAX, RAX);
        }
        self.bounds_check(RAX, kind.width());

        let mem = Mem::Indexed {
            base: RSI,
            index: RAX,
            scale: 1,
            disp: 0,
        };
        match kind {
            Load::U8 => self.asm.movzx_m8(RAX, mem),
            Load::S8 => self.asm.movsx_m8(size, RAX, mem),
            Load::U16 => self.asm.movzx_m16(RAX, mem),
            Load::S16 => self.asm.movsx_m16(size, RAX, mem),
            Load::U32 => self.asm.mov_rm(Size::S32, RAX, mem),
            Load::S32 => self.asm.movsxd_m32(RAX, mem),
            Load::U64 => self.asm.mov_rm(Size::S64, RAX, mem),
        }
        Ok(())
    }

    fn store(&mut self, width: i32) -> Result<(), JitError> {
        let offset = self.read_memarg()?;
        self.asm.mov_rm(Size::S32, RCX, Self::second());
        self.drop_second();
        if offset != 0 {
            self.asm.alu_ri(Alu::Add, Size::S32, RCX, offset as i32);
        }
        self.bounds_check(RCX, width);

        let mem = Mem::Indexed {
            base: RSI,
            index: RCX,
            scale: 1,
            disp: 0,
        };
        match width {
            1 => self.asm.mov_m8r(mem, RAX),
            2 => self.asm.mov_m16r(mem, RAX),
            4 => self.asm.mov_mr(Size::S32, mem, RAX),
            _ => self.asm.mov_mr(Size::S64, mem, RAX),
        }
        self.pop();
        Ok(())
    }

    // =========================================================================
    // Comparisons
    // =========================================================================

    fn eqz(&mut self, size: Size) {
        self.asm.test_rr(size, RAX, RAX);
        self.asm.setcc(Cond::E, RAX);
        self.asm.movzx_r8(RAX, RAX);
    }

    fn int_compare(&mut self, size: Size, cond: Cond) {
        self.asm.mov_rm(Size::S64, RCX, Self::second());
        self.drop_second();
        self.asm.alu_rr(Alu::Cmp, size, RCX, RAX);
        self.asm.setcc(cond, RAX);
        self.asm.movzx_r8(RAX, RAX);
    }

    /// `eq, ne, lt, gt, le, ge` with the left operand below the top.
    fn float_compare(&mut self, precision: Precision, op: u8) {
        let wide = precision == Precision::Double;
        self.asm.mov_xm(precision, XMM0, Self::second());
        self.drop_second();
        self.asm.mov_xr(size_of(wide), XMM1, RAX);

        // cmpss predicates: 0 eq, 1 lt, 2 le, 4 neq (true when unordered).
        let (mask, predicate) = match op {
            0 => (XMM0, 0),
            1 => (XMM0, 4),
            2 => (XMM0, 1),
            3 => (XMM1, 1),
            4 => (XMM0, 2),
            _ => (XMM1, 2),
        };
        if mask == XMM0 {
            self.asm.cmp_scalar(precision, XMM0, XMM1, predicate);
        } else {
            self.asm.cmp_scalar(precision, XMM1, XMM0, predicate);
        }
        self.asm.mov_rx(Size::S32, RAX, mask);
        self.asm.alu_ri(Alu::And, Size::S32, RAX, 1);
    }

    // =========================================================================
    // Integer arithmetic
    // =========================================================================

    /// `clz` .. `rotr`, numbered from `clz`.
    fn int_op(&mut self, size: Size, op: u8) {
        match op {
            0 => self.count_leading_zeros(size),
            1 => {
                let bits = if size == Size::S64 { 64 } else { 32 };
                self.asm.mov_ri32(RCX, bits);
                self.asm.bsf(size, RAX, RAX);
                self.asm.cmov(Cond::E, size, RAX, RCX);
            }
            2 => self.asm.popcnt(size, RAX, RAX),
            3 => self.commutative(Alu::Add, size),
            4 => {
                self.operands_to_rax_rcx();
                self.asm.alu_rr(Alu::Sub, size, RAX, RCX);
            }
            5 => {
                self.asm.imul_rm(size, RAX, Self::second());
                self.drop_second();
            }
            6 => self.divide(size, true, false),
            7 => self.divide(size, false, false),
            8 => self.divide(size, true, true),
            9 => self.divide(size, false, true),
            10 => self.commutative(Alu::And, size),
            11 => self.commutative(Alu::Or, size),
            12 => self.commutative(Alu::Xor, size),
            13 => self.shift(Shift::Shl, size),
            14 => self.shift(Shift::Sar, size),
            15 => self.shift(Shift::Shr, size),
            16 => self.shift(Shift::Rol, size),
            _ => self.shift(Shift::Ror, size),
        }
    }

    fn count_leading_zeros(&mut self, size: Size) {
        // bsr leaves the destination undefined for zero; the cmov picks a
        // value that the final xor maps to the bit width.
        let (fallback, top) = if size == Size::S64 { (127, 63) } else { (63, 31) };
        self.asm.mov_ri32(RCX, fallback);
        self.asm.bsr(size, RAX, RAX);
        self.asm.cmov(Cond::E, size, RAX, RCX);
        self.asm.alu_ri(Alu::Xor, Size::S32, RAX, top);
    }

    fn commutative(&mut self, op: Alu, size: Size) {
        self.asm.alu_rm(op, size, RAX, Self::second());
        self.drop_second();
    }

    /// Left operand to `rax`, right operand to `rcx`.
    fn operands_to_rax_rcx(&mut self) {
        self.asm.mov_rr(Size::S64, RCX, RAX);
        self.asm.mov_rm(Size::S64, RAX, Self::second());
        self.drop_second();
    }

    fn shift(&mut self, op: Shift, size: Size) {
        self.operands_to_rax_rcx();
        self.asm.shift_cl(op, size, RAX);
    }

    fn divide(&mut self, size: Size, signed: bool, remainder: bool) {
        self.asm.test_rr(size, RAX, RAX);
        self.trap_if(Cond::E, Trap::IntegerDivideByZero);

        if signed && !remainder {
            let ok = self.asm.create_label();
            self.asm.alu_ri(Alu::Cmp, size, RAX, -1);
            self.asm.jcc_short(Cond::NE, ok);
            match size {
                Size::S32 => self.asm.alu_mi(Alu::Cmp, Size::S32, Self::second(), i32::MIN),
                Size::S64 => {
                    self.asm.mov_ri64(RDX, i64::MIN as u64);
                    self.asm.alu_rm(Alu::Cmp, Size::S64, RDX, Self::second());
                }
            }
            self.trap_if(Cond::E, Trap::IntegerOverflow);
            self.asm.bind_label(ok);
        }
        if signed && remainder {
            // |divisor| gives the same remainder and avoids the MIN / -1 fault.
            self.asm.sign_extend_rax(size);
            self.asm.alu_rr(Alu::Xor, size, RAX, RDX);
            self.asm.alu_rr(Alu::Sub, size, RAX, RDX);
        }

        self.operands_to_rax_rcx();
        if signed {
            self.asm.sign_extend_rax(size);
            self.asm.unary(Unary::Idiv, size, RCX);
        } else {
            self.asm.alu_rr(Alu::Xor, Size::S32, RDX, RDX);
            self.asm.unary(Unary::Div, size, RCX);
        }
        if remainder {
            self.asm.mov_rr(size, RAX, RDX);
        }
    }

    // =========================================================================
    // Float arithmetic
    // =========================================================================

    fn unary_to_xmm0(&mut self, precision: Precision) {
        self.asm
            .mov_xr(size_of(precision == Precision::Double), XMM0, RAX);
    }

    fn xmm0_to_rax(&mut self, precision: Precision) {
        self.asm
            .mov_rx(size_of(precision == Precision::Double), RAX, XMM0);
    }

    /// `abs` .. `copysign`, numbered from `abs`.
    fn float_op(&mut self, precision: Precision, op: u8) {
        let wide = precision == Precision::Double;
        match op {
            0 => {
                if wide {
                    self.asm.bit_test(BitTest::Btr, Size::S64, RAX, 63);
                } else {
                    self.asm.alu_ri(Alu::And, Size::S32, RAX, 0x7FFF_FFFF);
                }
            }
            1 => {
                if wide {
                    self.asm.bit_test(BitTest::Btc, Size::S64, RAX, 63);
                } else {
                    self.asm.alu_ri(Alu::Xor, Size::S32, RAX, i32::MIN);
                }
            }
            2..=5 => {
                let mode = match op {
                    2 => RoundMode::Ceil,
                    3 => RoundMode::Floor,
                    4 => RoundMode::Trunc,
                    _ => RoundMode::Nearest,
                };
                self.unary_to_xmm0(precision);
                self.asm.round(precision, XMM0, XMM0, mode);
                self.xmm0_to_rax(precision);
            }
            6 => {
                self.unary_to_xmm0(precision);
                self.asm.sse(SseOp::Sqrt, precision, XMM0, XMM0);
                self.xmm0_to_rax(precision);
            }
            7 => self.float_binary(precision, SseOp::Add),
            8 => self.float_binary(precision, SseOp::Sub),
            9 => self.float_binary(precision, SseOp::Mul),
            10 => self.float_binary(precision, SseOp::Div),
            11 => self.float_min_max(precision, SseOp::Min),
            12 => self.float_min_max(precision, SseOp::Max),
            _ => self.copysign(wide),
        }
    }

    fn float_operands(&mut self, precision: Precision) {
        let wide = precision == Precision::Double;
        self.asm.mov_xm(precision, XMM0, Self::second());
        self.drop_second();
        self.asm.mov_xr(size_of(wide), XMM1, RAX);
    }

    fn float_binary(&mut self, precision: Precision, op: SseOp) {
        self.float_operands(precision);
        self.asm.sse(op, precision, XMM0, XMM1);
        self.xmm0_to_rax(precision);
    }

    /// minss/maxss return the second operand for NaNs and equal zeros, so
    /// both cases are handled before falling back to the instruction.
    fn float_min_max(&mut self, precision: Precision, op: SseOp) {
        self.float_operands(precision);
        let nan = self.asm.create_label();
        let ordinary = self.asm.create_label();
        let done = self.asm.create_label();

        self.asm.ucomis(precision, XMM0, XMM1);
        self.asm.jcc_short(Cond::P, nan);
        self.asm.jcc_short(Cond::NE, ordinary);
        // Equal: merge sign bits so min(-0, +0) = -0 and max(-0, +0) = +0.
        let logic = if op == SseOp::Min {
            SseLogic::Or
        } else {
            SseLogic::And
        };
        self.asm.sse_logic(logic, precision, XMM0, XMM1);
        self.asm.jmp_short(done);

        self.asm.bind_label(ordinary);
        self.asm.sse(op, precision, XMM0, XMM1);
        self.asm.jmp_short(done);

        self.asm.bind_label(nan);
        self.asm.sse(SseOp::Add, precision, XMM0, XMM1);

        self.asm.bind_label(done);
        self.xmm0_to_rax(precision);
    }

    fn copysign(&mut self, wide: bool) {
        if wide {
            self.asm.mov_rm(Size::S64, RCX, Self::second());
            self.asm.mov_ri64(RDX, 0x7FFF_FFFF_FFFF_FFFF);
            self.asm.alu_rr(Alu::And, Size::S64, RCX, RDX);
            self.asm.unary(Unary::Not, Size::S64, RDX);
            self.asm.alu_rr(Alu::And, Size::S64, RAX, RDX);
            self.asm.alu_rr(Alu::Or, Size::S64, RAX, RCX);
        } else {
            self.asm.mov_rm(Size::S32, RCX, Self::second());
            self.asm.alu_ri(Alu::And, Size::S32, RCX, 0x7FFF_FFFF);
            self.asm.alu_ri(Alu::And, Size::S32, RAX, i32::MIN);
            self.asm.alu_rr(Alu::Or, Size::S32, RAX, RCX);
        }
        self.drop_second();
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// Truncate the float in `rax` with `cvtt*2si` into `size`.
    fn truncate(&mut self, from: Precision, size: Size) {
        self.unary_to_xmm0(from);
        self.asm.cvt_float_to_int(from, size, RAX, XMM0);
    }

    /// Convert the integer in `rax` (read as `size`) to a float.
    fn int_to_float(&mut self, to: Precision, size: Size) {
        self.asm.cvt_int_to_float(to, size, XMM0, RAX);
        self.xmm0_to_rax(to);
    }

    fn call_helper(&mut self, slot: HelperSlot) {
        let mem = self.helper(slot);
        self.asm.call_m(mem);
    }

    fn convert(&mut self, opcode: u8) {
        let single = Precision::Single;
        let double = Precision::Double;
        match opcode {
            0xA7 | 0xAD => self.asm.mov_rr(Size::S32, RAX, RAX),
            0xA8 => self.truncate(single, Size::S32),
            0xA9 => {
                self.truncate(single, Size::S64);
                self.asm.mov_rr(Size::S32, RAX, RAX);
            }
            0xAA => self.truncate(double, Size::S32),
            0xAB => {
                self.truncate(double, Size::S64);
                self.asm.mov_rr(Size::S32, RAX, RAX);
            }
            0xAC => self.asm.movsxd_rr(RAX, RAX),
            0xAE => self.truncate(single, Size::S64),
            0xAF => self.call_helper(HelperSlot::F32ToU64),
            0xB0 => self.truncate(double, Size::S64),
            0xB1 => self.call_helper(HelperSlot::F64ToU64),
            0xB2 => self.int_to_float(single, Size::S32),
            // Zero-extended u32 fits a signed 64-bit conversion.
            0xB3 | 0xB4 => self.int_to_float(single, Size::S64),
            0xB5 => self.call_helper(HelperSlot::U64ToF32),
            0xB6 => {
                self.asm.mov_xr(Size::S64, XMM0, RAX);
                self.asm.sse(SseOp::Convert, double, XMM0, XMM0);
                self.asm.mov_rx(Size::S32, RAX, XMM0);
            }
            0xB7 => self.int_to_float(double, Size::S32),
            0xB8 | 0xB9 => self.int_to_float(double, Size::S64),
            0xBA => self.call_helper(HelperSlot::U64ToF64),
            0xBB => {
                self.asm.mov_xr(Size::S32, XMM0, RAX);
                self.asm.sse(SseOp::Convert, single, XMM0, XMM0);
                self.asm.mov_rx(Size::S64, RAX, XMM0);
            }
            // Reinterpretations: the slot already holds the bits.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WaveConfig;

    fn module_with_body(params: &[u8], result: Option<u8>, locals: &[u8], code: &[u8]) -> Module {
        // One type, one function, one body.
        let mut ty = vec![0x01, 0x60, params.len() as u8];
        ty.extend_from_slice(params);
        match result {
            Some(r) => ty.extend_from_slice(&[0x01, r]),
            None => ty.push(0x00),
        }
        let mut body = locals.to_vec();
        body.extend_from_slice(code);
        let mut func_body = vec![body.len() as u8];
        func_body.extend_from_slice(&body);

        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.push(0x01);
        bytes.push(ty.len() as u8);
        bytes.extend_from_slice(&ty);
        bytes.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);
        bytes.push(0x0A);
        bytes.push(func_body.len() as u8 + 1);
        bytes.push(0x01);
        bytes.extend_from_slice(&func_body);
        Module::parse(&bytes).unwrap()
    }

    fn arena_for(module: &Module) -> ExecutableArena {
        ExecutableArena::new(
            WaveConfig::default().arena_size,
            module.function_count() as usize,
            module.globals.len(),
        )
        .unwrap()
    }

    #[test]
    fn test_translates_add() {
        let module = module_with_body(
            &[0x7F, 0x7F],
            Some(0x7F),
            &[0x00],
            &[0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B],
        );
        let arena = arena_for(&module);
        let out = translate(&module, &arena, 0).unwrap();
        assert_eq!(out.origin, arena.next_code_address());
        assert_eq!(*out.code.last().unwrap(), 0xC3);
        assert!(out.callees.is_empty());
    }

    #[test]
    fn test_records_direct_callees_once() {
        // (func (call 0) (call 0))
        let module = module_with_body(&[], None, &[0x00], &[0x10, 0x00, 0x10, 0x00, 0x0B]);
        let arena = arena_for(&module);
        let out = translate(&module, &arena, 0).unwrap();
        assert_eq!(out.callees, vec![0]);
    }

    #[test]
    fn test_rejects_unknown_opcode() {
        let module = module_with_body(&[], None, &[0x00], &[0xFC, 0x0B]);
        let arena = arena_for(&module);
        assert!(matches!(
            translate(&module, &arena, 0),
            Err(JitError::UnsupportedInstruction(0xFC))
        ));
    }

    #[test]
    fn test_rejects_multi_value_block_type() {
        let module = module_with_body(&[], None, &[0x00], &[0x02, 0x00, 0x0B, 0x0B]);
        let arena = arena_for(&module);
        assert!(matches!(
            translate(&module, &arena, 0),
            Err(JitError::UnsupportedBlockType(0x00))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_local_and_branch() {
        let module = module_with_body(&[], None, &[0x00], &[0x20, 0x03, 0x1A, 0x0B]);
        let arena = arena_for(&module);
        assert!(matches!(
            translate(&module, &arena, 0),
            Err(JitError::InvalidBytecode(_))
        ));

        let module = module_with_body(&[], None, &[0x00], &[0x0C, 0x01, 0x0B]);
        let arena = arena_for(&module);
        assert!(matches!(
            translate(&module, &arena, 0),
            Err(JitError::InvalidBytecode(_))
        ));
    }

    #[test]
    fn test_rejects_code_after_final_end() {
        let module = module_with_body(&[], None, &[0x00], &[0x0B, 0x01, 0x0B]);
        let arena = arena_for(&module);
        assert!(matches!(
            translate(&module, &arena, 0),
            Err(JitError::InvalidBytecode(_))
        ));
    }

    /// Displacement of the prologue's `lea rdx, [rdx + disp32]`.
    fn native_reach(code: &[u8]) -> i32 {
        let at = code
            .windows(3)
            .position(|w| w == [0x48, 0x8D, 0x92])
            .expect("native stack check");
        i32::from_le_bytes(code[at + 3..at + 7].try_into().unwrap())
    }

    #[test]
    fn test_native_check_covers_nested_blocks() {
        let reserve = WaveConfig::HOST_FRAME_RESERVE as i32;

        let module = module_with_body(&[], None, &[0x00], &[0x0B]);
        let arena = arena_for(&module);
        let flat = translate(&module, &arena, 0).unwrap();
        assert_eq!(native_reach(&flat.code), -(3 * 8 + reserve));

        // (block (loop (block)))
        let module = module_with_body(
            &[],
            None,
            &[0x00],
            &[0x02, 0x40, 0x03, 0x40, 0x02, 0x40, 0x0B, 0x0B, 0x0B, 0x0B],
        );
        let arena = arena_for(&module);
        let nested = translate(&module, &arena, 0).unwrap();
        assert_eq!(native_reach(&nested.code), -(6 * 8 + reserve));
    }

    #[test]
    fn test_many_locals_use_string_zeroing() {
        // 20 i64 locals.
        let module = module_with_body(&[], None, &[0x01, 0x14, 0x7E], &[0x0B]);
        let arena = arena_for(&module);
        let out = translate(&module, &arena, 0).unwrap();
        assert!(out.code.windows(3).any(|w| w == [0xF3, 0x48, 0xAB]));
    }
}
