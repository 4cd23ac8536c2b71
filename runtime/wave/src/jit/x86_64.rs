//! # x86_64 Code Emission
//!
//! Byte-level encoder for the instruction subset used by the translator and
//! the runtime stubs. Code is assembled into a [`CodeBuffer`] whose final
//! address (its origin) is known before the first byte is emitted, so
//! RIP-relative references to arena slots are resolved while assembling and
//! checked against the rel32 range in [`CodeBuffer::finish`].

use super::JitError;

// =============================================================================
// x86_64 Encoding Constants
// =============================================================================

/// REX prefix bits.
mod rex {
    pub const BASE: u8 = 0x40;
    pub const W: u8 = 0x08; // 64-bit operand
    pub const R: u8 = 0x04; // ModRM reg extension
    pub const X: u8 = 0x02; // SIB index extension
    pub const B: u8 = 0x01; // ModRM r/m or SIB base extension
}

/// ModR/M byte modes.
mod modrm {
    pub const INDIRECT: u8 = 0x00;
    pub const DISP8: u8 = 0x40;
    pub const DISP32: u8 = 0x80;
    pub const DIRECT: u8 = 0xC0;
}

/// General purpose register, by hardware number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysReg(pub u8);

/// x86_64 general purpose registers.
pub mod x86_64_regs {
    use super::PhysReg;

    pub const RAX: PhysReg = PhysReg(0);
    pub const RCX: PhysReg = PhysReg(1);
    pub const RDX: PhysReg = PhysReg(2);
    pub const RBX: PhysReg = PhysReg(3);
    pub const RSP: PhysReg = PhysReg(4);
    pub const RBP: PhysReg = PhysReg(5);
    pub const RSI: PhysReg = PhysReg(6);
    pub const RDI: PhysReg = PhysReg(7);
    pub const R8: PhysReg = PhysReg(8);
    pub const R9: PhysReg = PhysReg(9);
    pub const R10: PhysReg = PhysReg(10);
    pub const R11: PhysReg = PhysReg(11);
    pub const R12: PhysReg = PhysReg(12);
    pub const R13: PhysReg = PhysReg(13);
    pub const R14: PhysReg = PhysReg(14);
    pub const R15: PhysReg = PhysReg(15);
}

/// SSE register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xmm(pub u8);

pub const XMM0: Xmm = Xmm(0);
pub const XMM1: Xmm = Xmm(1);

/// Operand size of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    S32,
    S64,
}

impl Size {
    fn is_64(self) -> bool {
        self == Size::S64
    }
}

/// Scalar floating point precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    /// Mandatory prefix of the scalar (`ss`/`sd`) form.
    fn scalar_prefix(self) -> u8 {
        match self {
            Precision::Single => 0xF3,
            Precision::Double => 0xF2,
        }
    }

    /// Mandatory prefix of the packed (`ps`/`pd`) and compare forms.
    fn packed_prefix(self) -> Option<u8> {
        match self {
            Precision::Single => None,
            Precision::Double => Some(0x66),
        }
    }
}

/// Memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// `[base + disp]`
    Base(PhysReg, i32),
    /// `[base + index * scale + disp]`
    Indexed {
        base: PhysReg,
        index: PhysReg,
        scale: u8,
        disp: i32,
    },
    /// `[rip + (target - next_instruction)]`, by absolute target address.
    Rip(u64),
}

/// Condition codes, numbered as in the `Jcc`/`SETcc`/`CMOVcc` encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    NO = 0x1,
    B = 0x2,
    AE = 0x3,
    E = 0x4,
    NE = 0x5,
    BE = 0x6,
    A = 0x7,
    S = 0x8,
    NS = 0x9,
    P = 0xA,
    NP = 0xB,
    L = 0xC,
    GE = 0xD,
    LE = 0xE,
    G = 0xF,
}

impl Cond {
    const ALL: [Cond; 16] = [
        Cond::O,
        Cond::NO,
        Cond::B,
        Cond::AE,
        Cond::E,
        Cond::NE,
        Cond::BE,
        Cond::A,
        Cond::S,
        Cond::NS,
        Cond::P,
        Cond::NP,
        Cond::L,
        Cond::GE,
        Cond::LE,
        Cond::G,
    ];

    /// The opposite condition.
    pub fn invert(self) -> Cond {
        Self::ALL[(self as usize) ^ 1]
    }
}

/// Two-operand integer ALU group (`/digit` in the immediate forms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift and rotate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Unary group 3 (`F7 /digit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Unary {
    Not = 2,
    Neg = 3,
    Mul = 4,
    Div = 6,
    Idiv = 7,
}

/// Bit test group 8 (`0F BA /digit ib`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitTest {
    Btr = 6,
    Btc = 7,
}

/// Scalar SSE arithmetic (second opcode byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseOp {
    Sqrt = 0x51,
    Add = 0x58,
    Mul = 0x59,
    /// `cvtss2sd` / `cvtsd2ss`, converting from the given precision.
    Convert = 0x5A,
    Sub = 0x5C,
    Min = 0x5D,
    Div = 0x5E,
    Max = 0x5F,
}

/// Packed bitwise SSE logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseLogic {
    And = 0x54,
    Or = 0x56,
    Xor = 0x57,
}

/// SSE4.1 rounding modes, with the precision exception suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundMode {
    Nearest = 0x8,
    Floor = 0x9,
    Ceil = 0xA,
    Trunc = 0xB,
}

/// `r/m` operand.
#[derive(Debug, Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(Mem),
}

/// Trailing immediate.
#[derive(Debug, Clone, Copy)]
enum Imm {
    None,
    I8(i8),
    I32(i32),
}

fn fits_i8(value: i32) -> bool {
    (-128..=127).contains(&value)
}

/// Signed distance from `from` to `to`, if it fits rel32.
pub fn rel32(from: u64, to: u64) -> Result<i32, JitError> {
    let delta = to.wrapping_sub(from) as i64;
    i32::try_from(delta).map_err(|_| JitError::DisplacementOverflow(delta))
}

// =============================================================================
// Code Buffer
// =============================================================================

/// A label inside one [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Relocation entry.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Offset in code buffer.
    pub offset: u32,
    /// Target label.
    pub label: Label,
    /// Relocation kind.
    pub kind: RelocKind,
}

/// Relocation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// PC-relative 8-bit.
    Rel8,
    /// PC-relative 32-bit.
    Rel32,
    /// Absolute 64-bit.
    Abs64,
}

/// A RIP-relative displacement waiting for its final check.
#[derive(Debug, Clone, Copy)]
struct RipFixup {
    /// Offset of the disp32 field.
    offset: u32,
    /// Offset of the next instruction.
    next: u32,
    /// Absolute target.
    target: u64,
}

/// Code buffer for emitting machine code destined for a known address.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Address the first byte will live at.
    origin: u64,
    /// Pending relocations.
    relocations: Vec<Relocation>,
    /// Label positions.
    labels: Vec<Option<u32>>,
    rip_fixups: Vec<RipFixup>,
}

impl CodeBuffer {
    /// Create a new code buffer that will be placed at `origin`.
    pub fn new(origin: u64) -> Self {
        Self {
            code: Vec::with_capacity(4096),
            origin,
            relocations: Vec::new(),
            labels: Vec::new(),
            rip_fixups: Vec::new(),
        }
    }

    /// Final address of the first byte.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Current position in the buffer.
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    /// Final address of a buffer position.
    pub fn address_of(&self, position: u32) -> u64 {
        self.origin + u64::from(position)
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value.
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value.
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Overwrite a previously emitted 32-bit field.
    pub fn patch_u32(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a previously emitted 64-bit field.
    pub fn patch_u64(&mut self, at: u32, value: u64) {
        let at = at as usize;
        self.code[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Point the rel32 field at `at` (the last field of its instruction) to `target`.
    pub fn patch_rel32(&mut self, at: u32, target: u32) -> Result<(), JitError> {
        let rel = rel32(u64::from(at) + 4, u64::from(target))?;
        self.patch_u32(at, rel as u32);
        Ok(())
    }

    /// Store the final address of `target` into the 64-bit field at `at`.
    pub fn patch_abs64(&mut self, at: u32, target: u32) {
        let address = self.address_of(target);
        self.patch_u64(at, address);
    }

    /// Create a new label.
    pub fn create_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(None);
        Label(id)
    }

    /// Bind a label to the current position.
    pub fn bind_label(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.position());
    }

    /// Emit a relocation.
    pub fn emit_relocation(&mut self, label: Label, kind: RelocKind) {
        self.relocations.push(Relocation {
            offset: self.position(),
            label,
            kind,
        });

        // Emit placeholder
        match kind {
            RelocKind::Rel8 => self.emit_u8(0),
            RelocKind::Rel32 => self.emit_u32(0),
            RelocKind::Abs64 => self.emit_u64(0),
        }
    }

    /// Resolve all relocations.
    fn resolve_relocations(&mut self) -> Result<(), JitError> {
        let relocations = std::mem::take(&mut self.relocations);
        for reloc in &relocations {
            let target = self.labels[reloc.label.0 as usize].ok_or_else(|| {
                JitError::CodeGen(format!("label {} was never bound", reloc.label.0))
            })?;
            let offset = reloc.offset as usize;
            match reloc.kind {
                RelocKind::Rel8 => {
                    let rel = i64::from(target) - (offset as i64 + 1);
                    let rel = i8::try_from(rel).map_err(|_| JitError::DisplacementOverflow(rel))?;
                    self.code[offset] = rel as u8;
                }
                RelocKind::Rel32 => self.patch_rel32(reloc.offset, target)?,
                RelocKind::Abs64 => self.patch_abs64(reloc.offset, target),
            }
        }
        Ok(())
    }

    fn resolve_rip_fixups(&mut self) -> Result<(), JitError> {
        let fixups = std::mem::take(&mut self.rip_fixups);
        for fixup in &fixups {
            let rel = rel32(self.address_of(fixup.next), fixup.target)?;
            self.patch_u32(fixup.offset, rel as u32);
        }
        Ok(())
    }

    /// Finish and return the generated code.
    pub fn finish(mut self) -> Result<Vec<u8>, JitError> {
        self.resolve_relocations()?;
        self.resolve_rip_fixups()?;
        Ok(self.code)
    }
}

// =============================================================================
// x86_64 Instruction Encoding
// =============================================================================

/// x86_64 code emitter.
pub struct X86_64Emitter {
    buf: CodeBuffer,
}

impl X86_64Emitter {
    /// Create a new emitter for code that will be placed at `origin`.
    pub fn new(origin: u64) -> Self {
        Self {
            buf: CodeBuffer::new(origin),
        }
    }

    /// Underlying buffer, for data and patching.
    pub fn buffer(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    /// Current position in the buffer.
    pub fn position(&self) -> u32 {
        self.buf.position()
    }

    /// Emit one instruction: `[prefix] [REX] opcode ModRM [SIB] [disp] [imm]`.
    fn encode(&mut self, prefix: Option<u8>, wide: bool, opcode: &[u8], reg: u8, rm: Rm, imm: Imm) {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }

        let mut rex_byte = 0u8;
        if wide {
            rex_byte |= rex::W;
        }
        if reg & 8 != 0 {
            rex_byte |= rex::R;
        }
        match rm {
            Rm::Reg(r) => {
                if r & 8 != 0 {
                    rex_byte |= rex::B;
                }
            }
            Rm::Mem(Mem::Base(base, _)) => {
                if base.0 & 8 != 0 {
                    rex_byte |= rex::B;
                }
            }
            Rm::Mem(Mem::Indexed { base, index, .. }) => {
                if base.0 & 8 != 0 {
                    rex_byte |= rex::B;
                }
                if index.0 & 8 != 0 {
                    rex_byte |= rex::X;
                }
            }
            Rm::Mem(Mem::Rip(_)) => {}
        }
        if rex_byte != 0 {
            self.buf.emit_u8(rex::BASE | rex_byte);
        }

        self.buf.emit_bytes(opcode);

        let reg_bits = (reg & 7) << 3;
        let mut rip_target = None;
        match rm {
            Rm::Reg(r) => self.buf.emit_u8(modrm::DIRECT | reg_bits | (r & 7)),
            Rm::Mem(Mem::Base(base, disp)) => {
                let b = base.0 & 7;
                let mode = Self::disp_mode(b, disp);
                if b == 4 {
                    // rsp/r12 as base needs a SIB byte.
                    self.buf.emit_u8(mode | reg_bits | 4);
                    self.buf.emit_u8(0x24);
                } else {
                    self.buf.emit_u8(mode | reg_bits | b);
                }
                self.emit_disp(mode, disp);
            }
            Rm::Mem(Mem::Indexed {
                base,
                index,
                scale,
                disp,
            }) => {
                debug_assert!(index.0 != 4, "rsp cannot be an index register");
                debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
                let b = base.0 & 7;
                let mode = Self::disp_mode(b, disp);
                let ss = scale.trailing_zeros() as u8;
                self.buf.emit_u8(mode | reg_bits | 4);
                self.buf.emit_u8((ss << 6) | ((index.0 & 7) << 3) | b);
                self.emit_disp(mode, disp);
            }
            Rm::Mem(Mem::Rip(target)) => {
                self.buf.emit_u8(modrm::INDIRECT | reg_bits | 5);
                rip_target = Some((self.buf.position(), target));
                self.buf.emit_u32(0);
            }
        }

        match imm {
            Imm::None => {}
            Imm::I8(v) => self.buf.emit_u8(v as u8),
            Imm::I32(v) => self.buf.emit_u32(v as u32),
        }

        if let Some((offset, target)) = rip_target {
            let next = self.buf.position();
            self.buf.rip_fixups.push(RipFixup {
                offset,
                next,
                target,
            });
        }
    }

    /// ModRM mode for `[base + disp]`; rbp/r13 always carry a displacement.
    fn disp_mode(base_low: u8, disp: i32) -> u8 {
        if disp == 0 && base_low != 5 {
            modrm::INDIRECT
        } else if fits_i8(disp) {
            modrm::DISP8
        } else {
            modrm::DISP32
        }
    }

    fn emit_disp(&mut self, mode: u8, disp: i32) {
        match mode {
            modrm::DISP8 => self.buf.emit_u8(disp as u8),
            modrm::DISP32 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    // =========================================================================
    // Instruction Emitters
    // =========================================================================

    /// PUSH reg
    pub fn push(&mut self, reg: PhysReg) {
        if reg.0 >= 8 {
            self.buf.emit_u8(rex::BASE | rex::B);
        }
        self.buf.emit_u8(0x50 + (reg.0 & 7));
    }

    /// POP reg
    pub fn pop(&mut self, reg: PhysReg) {
        if reg.0 >= 8 {
            self.buf.emit_u8(rex::BASE | rex::B);
        }
        self.buf.emit_u8(0x58 + (reg.0 & 7));
    }

    /// MOV reg, reg
    pub fn mov_rr(&mut self, size: Size, dst: PhysReg, src: PhysReg) {
        self.encode(None, size.is_64(), &[0x89], src.0, Rm::Reg(dst.0), Imm::None);
    }

    /// MOV reg, [mem]
    pub fn mov_rm(&mut self, size: Size, dst: PhysReg, mem: Mem) {
        self.encode(None, size.is_64(), &[0x8B], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// MOV [mem], reg
    pub fn mov_mr(&mut self, size: Size, mem: Mem, src: PhysReg) {
        self.encode(None, size.is_64(), &[0x89], src.0, Rm::Mem(mem), Imm::None);
    }

    /// MOV word [mem], reg16
    pub fn mov_m16r(&mut self, mem: Mem, src: PhysReg) {
        self.encode(Some(0x66), false, &[0x89], src.0, Rm::Mem(mem), Imm::None);
    }

    /// MOV byte [mem], reg8 (al, cl, dl or bl)
    pub fn mov_m8r(&mut self, mem: Mem, src: PhysReg) {
        debug_assert!(src.0 < 4, "byte store needs a legacy low-byte register");
        self.encode(None, false, &[0x88], src.0, Rm::Mem(mem), Imm::None);
    }

    /// MOV [mem], imm32 (sign-extended for 64-bit stores)
    pub fn mov_mi(&mut self, size: Size, mem: Mem, imm: i32) {
        self.encode(None, size.is_64(), &[0xC7], 0, Rm::Mem(mem), Imm::I32(imm));
    }

    /// MOV reg32, imm32 (zero-extends into the full register)
    pub fn mov_ri32(&mut self, dst: PhysReg, imm: u32) {
        if dst.0 >= 8 {
            self.buf.emit_u8(rex::BASE | rex::B);
        }
        self.buf.emit_u8(0xB8 + (dst.0 & 7));
        self.buf.emit_u32(imm);
    }

    /// MOV reg, imm64
    pub fn mov_ri64(&mut self, dst: PhysReg, imm: u64) {
        let mut rex_byte = rex::BASE | rex::W;
        if dst.0 >= 8 {
            rex_byte |= rex::B;
        }
        self.buf.emit_u8(rex_byte);
        self.buf.emit_u8(0xB8 + (dst.0 & 7));
        self.buf.emit_u64(imm);
    }

    /// Load a 64-bit constant with the shortest encoding. Clobbers flags for zero.
    pub fn load_const(&mut self, dst: PhysReg, value: u64) {
        if value == 0 {
            self.alu_rr(Alu::Xor, Size::S32, dst, dst);
        } else if value <= u64::from(u32::MAX) {
            self.mov_ri32(dst, value as u32);
        } else if let Ok(imm) = i32::try_from(value as i64) {
            self.encode(None, true, &[0xC7], 0, Rm::Reg(dst.0), Imm::I32(imm));
        } else {
            self.mov_ri64(dst, value);
        }
    }

    /// MOVZX reg32, byte [mem]
    pub fn movzx_m8(&mut self, dst: PhysReg, mem: Mem) {
        self.encode(None, false, &[0x0F, 0xB6], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// MOVZX reg32, word [mem]
    pub fn movzx_m16(&mut self, dst: PhysReg, mem: Mem) {
        self.encode(None, false, &[0x0F, 0xB7], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// MOVZX reg32, reg8 (al, cl, dl or bl)
    pub fn movzx_r8(&mut self, dst: PhysReg, src: PhysReg) {
        self.encode(None, false, &[0x0F, 0xB6], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// MOVSX reg, byte [mem]
    pub fn movsx_m8(&mut self, size: Size, dst: PhysReg, mem: Mem) {
        self.encode(None, size.is_64(), &[0x0F, 0xBE], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// MOVSX reg, word [mem]
    pub fn movsx_m16(&mut self, size: Size, dst: PhysReg, mem: Mem) {
        self.encode(None, size.is_64(), &[0x0F, 0xBF], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// MOVSXD reg64, dword [mem]
    pub fn movsxd_m32(&mut self, dst: PhysReg, mem: Mem) {
        self.encode(None, true, &[0x63], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// MOVSXD reg64, reg32
    pub fn movsxd_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.encode(None, true, &[0x63], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// LEA reg64, [mem]
    pub fn lea(&mut self, dst: PhysReg, mem: Mem) {
        self.encode(None, true, &[0x8D], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// LEA reg64, [rip + label]
    pub fn lea_label(&mut self, dst: PhysReg, label: Label) {
        let mut rex_byte = rex::BASE | rex::W;
        if dst.0 >= 8 {
            rex_byte |= rex::R;
        }
        self.buf.emit_u8(rex_byte);
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(modrm::INDIRECT | ((dst.0 & 7) << 3) | 5);
        self.buf.emit_relocation(label, RelocKind::Rel32);
    }

    /// LEA reg64, [base + disp32] with a placeholder displacement.
    ///
    /// Returns the offset of the displacement for later patching.
    pub fn lea_patchable(&mut self, dst: PhysReg, base: PhysReg) -> u32 {
        debug_assert!(base.0 & 7 != 4, "patchable lea does not support a SIB base");
        let mut rex_byte = rex::BASE | rex::W;
        if dst.0 >= 8 {
            rex_byte |= rex::R;
        }
        if base.0 >= 8 {
            rex_byte |= rex::B;
        }
        self.buf.emit_u8(rex_byte);
        self.buf.emit_u8(0x8D);
        self.buf
            .emit_u8(modrm::DISP32 | ((dst.0 & 7) << 3) | (base.0 & 7));
        let site = self.buf.position();
        self.buf.emit_u32(0);
        site
    }

    /// ALU reg, reg
    pub fn alu_rr(&mut self, op: Alu, size: Size, dst: PhysReg, src: PhysReg) {
        let opcode = ((op as u8) << 3) | 0x01;
        self.encode(None, size.is_64(), &[opcode], src.0, Rm::Reg(dst.0), Imm::None);
    }

    /// ALU reg, [mem]
    pub fn alu_rm(&mut self, op: Alu, size: Size, dst: PhysReg, mem: Mem) {
        let opcode = ((op as u8) << 3) | 0x03;
        self.encode(None, size.is_64(), &[opcode], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// ALU reg, imm32
    pub fn alu_ri(&mut self, op: Alu, size: Size, dst: PhysReg, imm: i32) {
        self.alu_imm(op, size, Rm::Reg(dst.0), imm);
    }

    /// ALU [mem], imm32
    pub fn alu_mi(&mut self, op: Alu, size: Size, mem: Mem, imm: i32) {
        self.alu_imm(op, size, Rm::Mem(mem), imm);
    }

    fn alu_imm(&mut self, op: Alu, size: Size, rm: Rm, imm: i32) {
        if fits_i8(imm) {
            self.encode(None, size.is_64(), &[0x83], op as u8, rm, Imm::I8(imm as i8));
        } else {
            self.encode(None, size.is_64(), &[0x81], op as u8, rm, Imm::I32(imm));
        }
    }

    /// TEST reg, reg
    pub fn test_rr(&mut self, size: Size, a: PhysReg, b: PhysReg) {
        self.encode(None, size.is_64(), &[0x85], b.0, Rm::Reg(a.0), Imm::None);
    }

    /// Shift or rotate reg by cl.
    pub fn shift_cl(&mut self, op: Shift, size: Size, dst: PhysReg) {
        self.encode(None, size.is_64(), &[0xD3], op as u8, Rm::Reg(dst.0), Imm::None);
    }

    /// Shift or rotate reg by an immediate.
    pub fn shift_ri(&mut self, op: Shift, size: Size, dst: PhysReg, imm: u8) {
        self.encode(None, size.is_64(), &[0xC1], op as u8, Rm::Reg(dst.0), Imm::I8(imm as i8));
    }

    /// NOT/NEG/MUL/DIV/IDIV reg
    pub fn unary(&mut self, op: Unary, size: Size, reg: PhysReg) {
        self.encode(None, size.is_64(), &[0xF7], op as u8, Rm::Reg(reg.0), Imm::None);
    }

    /// IMUL reg, [mem]
    pub fn imul_rm(&mut self, size: Size, dst: PhysReg, mem: Mem) {
        self.encode(None, size.is_64(), &[0x0F, 0xAF], dst.0, Rm::Mem(mem), Imm::None);
    }

    /// CDQ / CQO: sign-extend rax into rdx.
    pub fn sign_extend_rax(&mut self, size: Size) {
        if size.is_64() {
            self.buf.emit_u8(rex::BASE | rex::W);
        }
        self.buf.emit_u8(0x99);
    }

    /// SETcc reg8 (al, cl, dl or bl)
    pub fn setcc(&mut self, cond: Cond, dst: PhysReg) {
        self.encode(None, false, &[0x0F, 0x90 + cond as u8], 0, Rm::Reg(dst.0), Imm::None);
    }

    /// CMOVcc reg, reg
    pub fn cmov(&mut self, cond: Cond, size: Size, dst: PhysReg, src: PhysReg) {
        self.encode(None, size.is_64(), &[0x0F, 0x40 + cond as u8], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// BSR reg, reg
    pub fn bsr(&mut self, size: Size, dst: PhysReg, src: PhysReg) {
        self.encode(None, size.is_64(), &[0x0F, 0xBD], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// BSF reg, reg
    pub fn bsf(&mut self, size: Size, dst: PhysReg, src: PhysReg) {
        self.encode(None, size.is_64(), &[0x0F, 0xBC], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// POPCNT reg, reg
    pub fn popcnt(&mut self, size: Size, dst: PhysReg, src: PhysReg) {
        self.encode(Some(0xF3), size.is_64(), &[0x0F, 0xB8], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// BTR/BTC reg, imm8
    pub fn bit_test(&mut self, op: BitTest, size: Size, dst: PhysReg, bit: u8) {
        self.encode(None, size.is_64(), &[0x0F, 0xBA], op as u8, Rm::Reg(dst.0), Imm::I8(bit as i8));
    }

    /// REP STOSQ
    pub fn rep_stosq(&mut self) {
        self.buf.emit_bytes(&[0xF3, rex::BASE | rex::W, 0xAB]);
    }

    // =========================================================================
    // Control Transfer
    // =========================================================================

    /// JMP rel32 to a label.
    pub fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_relocation(label, RelocKind::Rel32);
    }

    /// JMP rel8 to a label.
    pub fn jmp_short(&mut self, label: Label) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_relocation(label, RelocKind::Rel8);
    }

    /// Jcc rel32 to a label.
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_relocation(label, RelocKind::Rel32);
    }

    /// Jcc rel8 to a label.
    pub fn jcc_short(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_relocation(label, RelocKind::Rel8);
    }

    /// JMP rel32 with a zero displacement; returns the displacement offset.
    pub fn jmp_site(&mut self) -> u32 {
        self.buf.emit_u8(0xE9);
        let site = self.buf.position();
        self.buf.emit_u32(0);
        site
    }

    /// Jcc rel32 with a zero displacement; returns the displacement offset.
    pub fn jcc_site(&mut self, cond: Cond) -> u32 {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let site = self.buf.position();
        self.buf.emit_u32(0);
        site
    }

    /// JMP rel32 to an already emitted position.
    pub fn jmp_to(&mut self, target: u32) -> Result<(), JitError> {
        let site = self.jmp_site();
        self.buf.patch_rel32(site, target)
    }

    /// JMP [mem]
    pub fn jmp_m(&mut self, mem: Mem) {
        self.encode(None, false, &[0xFF], 4, Rm::Mem(mem), Imm::None);
    }

    /// JMP reg
    pub fn jmp_r(&mut self, reg: PhysReg) {
        self.encode(None, false, &[0xFF], 4, Rm::Reg(reg.0), Imm::None);
    }

    /// CALL [mem]
    pub fn call_m(&mut self, mem: Mem) {
        self.encode(None, false, &[0xFF], 2, Rm::Mem(mem), Imm::None);
    }

    /// CALL reg (indirect)
    pub fn call_r(&mut self, reg: PhysReg) {
        self.encode(None, false, &[0xFF], 2, Rm::Reg(reg.0), Imm::None);
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// UD2 (undefined instruction)
    pub fn ud2(&mut self) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x0B);
    }

    // =========================================================================
    // SSE
    // =========================================================================

    /// MOVD/MOVQ xmm, reg
    pub fn mov_xr(&mut self, size: Size, dst: Xmm, src: PhysReg) {
        self.encode(Some(0x66), size.is_64(), &[0x0F, 0x6E], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// MOVD/MOVQ reg, xmm
    pub fn mov_rx(&mut self, size: Size, dst: PhysReg, src: Xmm) {
        self.encode(Some(0x66), size.is_64(), &[0x0F, 0x7E], src.0, Rm::Reg(dst.0), Imm::None);
    }

    /// MOVD xmm, dword [mem] / MOVQ xmm, qword [mem]
    pub fn mov_xm(&mut self, precision: Precision, dst: Xmm, mem: Mem) {
        match precision {
            Precision::Single => {
                self.encode(Some(0x66), false, &[0x0F, 0x6E], dst.0, Rm::Mem(mem), Imm::None)
            }
            Precision::Double => {
                self.encode(Some(0xF3), false, &[0x0F, 0x7E], dst.0, Rm::Mem(mem), Imm::None)
            }
        }
    }

    /// Scalar arithmetic: `op{ss,sd} dst, src`.
    pub fn sse(&mut self, op: SseOp, precision: Precision, dst: Xmm, src: Xmm) {
        self.encode(
            Some(precision.scalar_prefix()),
            false,
            &[0x0F, op as u8],
            dst.0,
            Rm::Reg(src.0),
            Imm::None,
        );
    }

    /// Scalar compare into a mask: `cmp{ss,sd} dst, src, predicate`.
    pub fn cmp_scalar(&mut self, precision: Precision, dst: Xmm, src: Xmm, predicate: u8) {
        self.encode(
            Some(precision.scalar_prefix()),
            false,
            &[0x0F, 0xC2],
            dst.0,
            Rm::Reg(src.0),
            Imm::I8(predicate as i8),
        );
    }

    /// `ucomis{s,d} a, b`
    pub fn ucomis(&mut self, precision: Precision, a: Xmm, b: Xmm) {
        self.encode(precision.packed_prefix(), false, &[0x0F, 0x2E], a.0, Rm::Reg(b.0), Imm::None);
    }

    /// `comis{s,d} a, b`
    pub fn comis(&mut self, precision: Precision, a: Xmm, b: Xmm) {
        self.encode(precision.packed_prefix(), false, &[0x0F, 0x2F], a.0, Rm::Reg(b.0), Imm::None);
    }

    /// Packed bitwise logic: `{and,or,xor}{ps,pd} dst, src`.
    pub fn sse_logic(&mut self, op: SseLogic, precision: Precision, dst: Xmm, src: Xmm) {
        self.encode(precision.packed_prefix(), false, &[0x0F, op as u8], dst.0, Rm::Reg(src.0), Imm::None);
    }

    /// SSE4.1 `round{ss,sd} dst, src, mode`
    pub fn round(&mut self, precision: Precision, dst: Xmm, src: Xmm, mode: RoundMode) {
        let opcode = match precision {
            Precision::Single => 0x0A,
            Precision::Double => 0x0B,
        };
        self.encode(
            Some(0x66),
            false,
            &[0x0F, 0x3A, opcode],
            dst.0,
            Rm::Reg(src.0),
            Imm::I8(mode as i8),
        );
    }

    /// `cvtsi2{ss,sd} dst, src` from a signed 32- or 64-bit integer.
    pub fn cvt_int_to_float(&mut self, precision: Precision, size: Size, dst: Xmm, src: PhysReg) {
        self.encode(
            Some(precision.scalar_prefix()),
            size.is_64(),
            &[0x0F, 0x2A],
            dst.0,
            Rm::Reg(src.0),
            Imm::None,
        );
    }

    /// `cvtt{ss,sd}2si dst, src` into a signed 32- or 64-bit integer.
    pub fn cvt_float_to_int(&mut self, precision: Precision, size: Size, dst: PhysReg, src: Xmm) {
        self.encode(
            Some(precision.scalar_prefix()),
            size.is_64(),
            &[0x0F, 0x2C],
            dst.0,
            Rm::Reg(src.0),
            Imm::None,
        );
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Create a label.
    pub fn create_label(&mut self) -> Label {
        self.buf.create_label()
    }

    /// Bind a label.
    pub fn bind_label(&mut self, label: Label) {
        self.buf.bind_label(label);
    }

    /// Finish and return generated code.
    pub fn finish(self) -> Result<Vec<u8>, JitError> {
        self.buf.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::x86_64_regs::*;
    use super::*;

    fn assemble(f: impl FnOnce(&mut X86_64Emitter)) -> Vec<u8> {
        let mut asm = X86_64Emitter::new(0x1000);
        f(&mut asm);
        asm.finish().unwrap()
    }

    #[test]
    fn test_operand_stack_push_pop() {
        let push = assemble(|a| {
            a.mov_mr(Size::S64, Mem::Base(RDI, 0), RAX);
            a.alu_ri(Alu::Add, Size::S64, RDI, 8);
        });
        assert_eq!(push, [0x48, 0x89, 0x07, 0x48, 0x83, 0xC7, 0x08]);

        let pop = assemble(|a| {
            a.mov_rm(Size::S64, RAX, Mem::Base(RDI, -8));
            a.lea(RDI, Mem::Base(RDI, -8));
        });
        assert_eq!(pop, [0x48, 0x8B, 0x47, 0xF8, 0x48, 0x8D, 0x7F, 0xF8]);
    }

    #[test]
    fn test_extended_registers_and_sib() {
        assert_eq!(
            assemble(|a| a.mov_rm(Size::S64, RAX, Mem::Base(R15, 0x40))),
            [0x49, 0x8B, 0x47, 0x40]
        );
        assert_eq!(
            assemble(|a| a.mov_rm(Size::S64, RDX, Mem::Base(RSP, 8))),
            [0x48, 0x8B, 0x54, 0x24, 0x08]
        );
        assert_eq!(
            assemble(|a| a.mov_rm(Size::S64, RAX, Mem::Base(RBP, 0))),
            [0x48, 0x8B, 0x45, 0x00]
        );
        assert_eq!(
            assemble(|a| a.movzx_m8(
                RAX,
                Mem::Indexed { base: RSI, index: RAX, scale: 1, disp: 0 }
            )),
            [0x0F, 0xB6, 0x04, 0x06]
        );
        assert_eq!(
            assemble(|a| a.lea(
                RSP,
                Mem::Indexed { base: RSP, index: R8, scale: 8, disp: 0 }
            )),
            [0x4A, 0x8D, 0x24, 0xC4]
        );
        assert_eq!(assemble(|a| a.push(R15)), [0x41, 0x57]);
    }

    #[test]
    fn test_alu_and_immediates() {
        assert_eq!(
            assemble(|a| a.alu_rm(Alu::Add, Size::S32, RAX, Mem::Base(RDI, -8))),
            [0x03, 0x47, 0xF8]
        );
        assert_eq!(
            assemble(|a| a.alu_ri(Alu::Xor, Size::S32, RAX, i32::MIN)),
            [0x81, 0xF0, 0x00, 0x00, 0x00, 0x80]
        );
        assert_eq!(
            assemble(|a| a.alu_rr(Alu::Cmp, Size::S64, RCX, RAX)),
            [0x48, 0x39, 0xC1]
        );
        assert_eq!(assemble(|a| a.load_const(RAX, 0)), [0x31, 0xC0]);
        assert_eq!(
            assemble(|a| a.load_const(RAX, u64::MAX)),
            [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            assemble(|a| a.load_const(RAX, 7)),
            [0xB8, 0x07, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sse_encodings() {
        assert_eq!(
            assemble(|a| a.mov_xr(Size::S64, XMM1, RAX)),
            [0x66, 0x48, 0x0F, 0x6E, 0xC8]
        );
        assert_eq!(
            assemble(|a| a.mov_rx(Size::S32, RAX, XMM0)),
            [0x66, 0x0F, 0x7E, 0xC0]
        );
        assert_eq!(
            assemble(|a| a.sse(SseOp::Add, Precision::Double, XMM0, XMM1)),
            [0xF2, 0x0F, 0x58, 0xC1]
        );
        assert_eq!(
            assemble(|a| a.cvt_float_to_int(Precision::Single, Size::S64, RAX, XMM0)),
            [0xF3, 0x48, 0x0F, 0x2C, 0xC0]
        );
        assert_eq!(
            assemble(|a| a.round(Precision::Single, XMM0, XMM0, RoundMode::Floor)),
            [0x66, 0x0F, 0x3A, 0x0A, 0xC0, 0x09]
        );
    }

    #[test]
    fn test_rip_relative_uses_end_of_instruction() {
        // call [rip + x] at 0x1000 is 6 bytes long; target slot at 0x2000.
        let code = assemble(|a| a.call_m(Mem::Rip(0x2000)));
        assert_eq!(&code[..2], &[0xFF, 0x15]);
        assert_eq!(i32::from_le_bytes([code[2], code[3], code[4], code[5]]), 0x2000 - 0x1006);

        // The immediate counts towards the instruction length.
        let code = assemble(|a| a.mov_mi(Size::S64, Mem::Rip(0x1000), 1));
        assert_eq!(code.len(), 11);
        assert_eq!(i32::from_le_bytes([code[3], code[4], code[5], code[6]]), -11);
    }

    #[test]
    fn test_rip_out_of_range_is_an_error() {
        let mut asm = X86_64Emitter::new(0x1000);
        asm.call_m(Mem::Rip(0x1_0000_1000));
        assert!(matches!(asm.finish(), Err(JitError::DisplacementOverflow(_))));
    }

    #[test]
    fn test_labels_and_short_jumps() {
        let code = assemble(|a| {
            let skip = a.create_label();
            a.jcc_short(Cond::NE, skip);
            a.ud2();
            a.bind_label(skip);
            a.ret();
        });
        assert_eq!(code, [0x75, 0x02, 0x0F, 0x0B, 0xC3]);

        let code = assemble(|a| {
            let top = a.create_label();
            a.bind_label(top);
            a.jmp(top);
        });
        assert_eq!(code, [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = X86_64Emitter::new(0);
        let label = asm.create_label();
        asm.jmp(label);
        assert!(asm.finish().is_err());
    }

    #[test]
    fn test_condition_inversion() {
        assert_eq!(Cond::E.invert(), Cond::NE);
        assert_eq!(Cond::A.invert(), Cond::BE);
        assert_eq!(Cond::GE.invert(), Cond::L);
    }
}
