//! x86-64 instruction encoding.
//!
//! Only the instructions slow-path stubs, dispatch thunks and the minimal
//! fast-tier emitter need. Branches are always emitted in their rel32 form so
//! they can be linked after the final code address is known.

use super::registers::Reg;

/// Size of `jmp rel32`
pub const JMP_REL32_SIZE: usize = 5;

/// Size of `jcc rel32`
pub const JCC_REL32_SIZE: usize = 6;

/// Opcode of `jmp rel32`
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// A patchable jump occupies one aligned machine word
pub const PATCHABLE_JUMP_SIZE: usize = 8;

/// Padding that completes a patchable jump to 8 bytes (`nop dword [rax]`)
pub const NOP3_BYTES: [u8; 3] = [0x0F, 0x1F, 0x00];

/// Condition codes for `jcc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveOrEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowOrEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NotSign = 0x9,
    Less = 0xC,
    GreaterOrEqual = 0xD,
    LessOrEqual = 0xE,
    Greater = 0xF,
}

impl Condition {
    /// Decode from the low nibble of a `0F 8x` opcode
    pub fn from_code(code: u8) -> Option<Condition> {
        Some(match code {
            0x0 => Condition::Overflow,
            0x1 => Condition::NoOverflow,
            0x2 => Condition::Below,
            0x3 => Condition::AboveOrEqual,
            0x4 => Condition::Equal,
            0x5 => Condition::NotEqual,
            0x6 => Condition::BelowOrEqual,
            0x7 => Condition::Above,
            0x8 => Condition::Sign,
            0x9 => Condition::NotSign,
            0xC => Condition::Less,
            0xD => Condition::GreaterOrEqual,
            0xE => Condition::LessOrEqual,
            0xF => Condition::Greater,
            _ => return None,
        })
    }

    /// Mnemonic suffix
    pub fn suffix(self) -> &'static str {
        match self {
            Condition::Overflow => "o",
            Condition::NoOverflow => "no",
            Condition::Below => "b",
            Condition::AboveOrEqual => "ae",
            Condition::Equal => "e",
            Condition::NotEqual => "ne",
            Condition::BelowOrEqual => "be",
            Condition::Above => "a",
            Condition::Sign => "s",
            Condition::NotSign => "ns",
            Condition::Less => "l",
            Condition::GreaterOrEqual => "ge",
            Condition::LessOrEqual => "le",
            Condition::Greater => "g",
        }
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

#[inline]
const fn rex(w: bool, r: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | (b as u8)
}

#[inline]
const fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// rel32 displacement from the end of a branch to `to`, if it fits
#[inline]
pub fn rel32(branch_end: usize, to: usize) -> Option<i32> {
    let delta = (to as i64).wrapping_sub(branch_end as i64);
    i32::try_from(delta).ok()
}

/// `push reg`
pub fn push(code: &mut Vec<u8>, reg: Reg) {
    if reg.is_extended() {
        code.push(rex(false, false, true));
    }
    code.push(0x50 + reg.low_bits());
}

/// `pop reg`
pub fn pop(code: &mut Vec<u8>, reg: Reg) {
    if reg.is_extended() {
        code.push(rex(false, false, true));
    }
    code.push(0x58 + reg.low_bits());
}

/// `mov reg, imm64`
pub fn mov_ri64(code: &mut Vec<u8>, reg: Reg, imm: u64) {
    code.push(rex(true, false, reg.is_extended()));
    code.push(0xB8 + reg.low_bits());
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `mov reg32, imm32` (zero-extends into the full register)
pub fn mov_ri32(code: &mut Vec<u8>, reg: Reg, imm: u32) {
    if reg.is_extended() {
        code.push(rex(false, false, true));
    }
    code.push(0xB8 + reg.low_bits());
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `mov dst, src` (64-bit)
pub fn mov_rr(code: &mut Vec<u8>, dst: Reg, src: Reg) {
    code.push(rex(true, src.is_extended(), dst.is_extended()));
    code.push(0x89);
    code.push(modrm(0b11, src.low_bits(), dst.low_bits()));
}

/// `mov qword [rsp + disp32], src`
pub fn store_to_stack(code: &mut Vec<u8>, disp: i32, src: Reg) {
    code.push(rex(true, src.is_extended(), false));
    code.push(0x89);
    code.push(modrm(0b10, src.low_bits(), 0b100));
    code.push(0x24); // SIB: base = rsp, no index
    code.extend_from_slice(&disp.to_le_bytes());
}

/// `sub rsp, imm8`
pub fn sub_rsp_imm8(code: &mut Vec<u8>, imm: i8) {
    code.extend_from_slice(&[0x48, 0x83, 0xEC, imm as u8]);
}

/// `add rsp, imm8`
pub fn add_rsp_imm8(code: &mut Vec<u8>, imm: i8) {
    code.extend_from_slice(&[0x48, 0x83, 0xC4, imm as u8]);
}

/// `test a, b` (64-bit)
pub fn test_rr(code: &mut Vec<u8>, a: Reg, b: Reg) {
    code.push(rex(true, b.is_extended(), a.is_extended()));
    code.push(0x85);
    code.push(modrm(0b11, b.low_bits(), a.low_bits()));
}

/// `cmp qword [base], imm8`
///
/// `base` must not need a SIB byte or displacement (rsp, rbp, r12, r13).
pub fn cmp_mem_imm8(code: &mut Vec<u8>, base: Reg, imm: i8) {
    assert!(
        !matches!(base.low_bits(), 0b100 | 0b101),
        "cmp_mem_imm8 base {} needs SIB/displacement encoding",
        base
    );
    code.push(rex(true, false, base.is_extended()));
    code.push(0x83);
    code.push(modrm(0b00, 7, base.low_bits()));
    code.push(imm as u8);
}

/// `call reg`
pub fn call_r(code: &mut Vec<u8>, reg: Reg) {
    if reg.is_extended() {
        code.push(rex(false, false, true));
    }
    code.push(0xFF);
    code.push(modrm(0b11, 2, reg.low_bits()));
}

/// `jmp reg`
pub fn jmp_r(code: &mut Vec<u8>, reg: Reg) {
    if reg.is_extended() {
        code.push(rex(false, false, true));
    }
    code.push(0xFF);
    code.push(modrm(0b11, 4, reg.low_bits()));
}

/// `jmp rel32` with a zero displacement; returns the offset of the rel32 field
pub fn jmp_rel32(code: &mut Vec<u8>) -> usize {
    code.push(JMP_REL32_OPCODE);
    let field = code.len();
    code.extend_from_slice(&[0; 4]);
    field
}

/// `jcc rel32` with a zero displacement; returns the offset of the rel32 field
pub fn jcc_rel32(code: &mut Vec<u8>, cond: Condition) -> usize {
    code.push(0x0F);
    code.push(0x80 | cond as u8);
    let field = code.len();
    code.extend_from_slice(&[0; 4]);
    field
}

/// `ret`
pub fn ret(code: &mut Vec<u8>) {
    code.push(0xC3);
}

/// `nop`
pub fn nop(code: &mut Vec<u8>) {
    code.push(0x90);
}

/// `int3`
pub fn int3(code: &mut Vec<u8>) {
    code.push(0xCC);
}

/// Write a rel32 field so the branch ending at `field + 4` reaches `to`.
///
/// `field_addr` and `to` must be in the same address space (both buffer
/// offsets, or both absolute addresses).
pub fn patch_rel32(code: &mut [u8], field: usize, field_addr: usize, to: usize) -> Option<()> {
    let rel = rel32(field_addr + 4, to)?;
    code[field..field + 4].copy_from_slice(&rel.to_le_bytes());
    Some(())
}

/// The 8-byte word of a patchable jump located at `at` that branches to `to`
pub fn encode_patchable_jump(at: usize, to: usize) -> Option<[u8; PATCHABLE_JUMP_SIZE]> {
    let rel = rel32(at + JMP_REL32_SIZE, to)?.to_le_bytes();
    Some([
        JMP_REL32_OPCODE,
        rel[0],
        rel[1],
        rel[2],
        rel[3],
        NOP3_BYTES[0],
        NOP3_BYTES[1],
        NOP3_BYTES[2],
    ])
}

/// Whether `word` is a patchable jump
pub fn is_patchable_jump(word: &[u8; PATCHABLE_JUMP_SIZE]) -> bool {
    word[0] == JMP_REL32_OPCODE && word[5..] == NOP3_BYTES
}

/// Destination of the rel32 branch (`jmp` or `jcc`) starting at `bytes[0]`,
/// where `bytes[0]` lives at address `at`.
pub fn branch_target(bytes: &[u8], at: usize) -> Option<usize> {
    let (field, len) = match bytes {
        [JMP_REL32_OPCODE, ..] if bytes.len() >= JMP_REL32_SIZE => (1, JMP_REL32_SIZE),
        [0x0F, op, ..] if op & 0xF0 == 0x80 && bytes.len() >= JCC_REL32_SIZE => (2, JCC_REL32_SIZE),
        _ => return None,
    };
    let rel = i32::from_le_bytes([
        bytes[field],
        bytes[field + 1],
        bytes[field + 2],
        bytes[field + 3],
    ]);
    Some((at + len).wrapping_add(rel as isize as usize))
}

/// Destination of the rel32 branch at an absolute code address.
///
/// # Safety
/// `at` must point to at least [`JCC_REL32_SIZE`] readable bytes.
pub unsafe fn read_branch_target(at: *const u8) -> Option<usize> {
    let bytes = unsafe { std::slice::from_raw_parts(at, JCC_REL32_SIZE) };
    branch_target(bytes, at as usize)
}
