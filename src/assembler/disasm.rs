//! Disassembler for the instruction subset the encoder emits.
//!
//! Used for `Compilation::disassembly()`, stub logging and tests. Bytes that
//! are not recognised are printed as `.byte` and decoding resumes at the next
//! byte.

use std::fmt::Write;

use super::encoder::{branch_target, Condition};
use super::registers::Reg;

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Encoded length in bytes
    pub len: usize,
    /// Intel-syntax text
    pub text: String,
}

/// Disassemble `bytes`, which start at address `base`.
///
/// One line per instruction: address, raw bytes, mnemonic.
pub fn disassemble(bytes: &[u8], base: usize) -> String {
    let mut out = String::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let insn = decode(&bytes[offset..], base + offset);
        let raw: Vec<String> = bytes[offset..offset + insn.len]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let _ = writeln!(out, "{:#014x}: {:<30} {}", base + offset, raw.join(" "), insn.text);
        offset += insn.len;
    }
    out
}

/// Decode the instruction at the start of `bytes`, located at address `at`
pub fn decode(bytes: &[u8], at: usize) -> Instruction {
    decode_known(bytes, at).unwrap_or_else(|| Instruction {
        len: 1,
        text: format!(".byte {:#04x}", bytes[0]),
    })
}

fn insn(len: usize, text: String) -> Option<Instruction> {
    Some(Instruction { len, text })
}

fn reg(code: u8) -> Reg {
    // Codes are always masked to four bits by the callers
    Reg::ALL[(code & 0xF) as usize]
}

fn read_i32(bytes: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn decode_known(bytes: &[u8], at: usize) -> Option<Instruction> {
    let (rex, rest) = match bytes.first()? {
        b @ 0x40..=0x4F => (*b, &bytes[1..]),
        _ => (0, bytes),
    };
    let prefix = usize::from(rex != 0);
    let w = rex & 0x8 != 0;
    let r = (rex & 0x4) << 1;
    let b = (rex & 0x1) << 3;

    let opcode = *rest.first()?;
    match opcode {
        0x50..=0x57 => insn(prefix + 1, format!("push {}", reg(b | (opcode - 0x50)))),
        0x58..=0x5F => insn(prefix + 1, format!("pop {}", reg(b | (opcode - 0x58)))),
        0xB8..=0xBF => {
            let dst = reg(b | (opcode - 0xB8));
            if w {
                let imm = u64::from_le_bytes(rest.get(1..9)?.try_into().ok()?);
                insn(prefix + 9, format!("mov {}, {:#x}", dst, imm))
            } else {
                let imm = u32::from_le_bytes(rest.get(1..5)?.try_into().ok()?);
                insn(prefix + 5, format!("mov {}, {:#x}", dst.name32(), imm))
            }
        }
        0x89 | 0x85 if w => {
            let modrm = *rest.get(1)?;
            let src = reg(r | ((modrm >> 3) & 7));
            let mnemonic = if opcode == 0x89 { "mov" } else { "test" };
            match modrm >> 6 {
                0b11 => insn(prefix + 2, format!("{} {}, {}", mnemonic, reg(b | (modrm & 7)), src)),
                0b10 if modrm & 7 == 0b100 && rest.get(2) == Some(&0x24) => {
                    let disp = read_i32(rest, 3)?;
                    insn(prefix + 7, format!("{} qword [rsp + {:#x}], {}", mnemonic, disp, src))
                }
                _ => None,
            }
        }
        0x83 if w => {
            let modrm = *rest.get(1)?;
            let imm = *rest.get(2)? as i8;
            let mnemonic = match (modrm >> 3) & 7 {
                0 => "add",
                5 => "sub",
                7 => "cmp",
                _ => return None,
            };
            match modrm >> 6 {
                0b11 => insn(prefix + 3, format!("{} {}, {}", mnemonic, reg(b | (modrm & 7)), imm)),
                0b00 if !matches!(modrm & 7, 0b100 | 0b101) => insn(
                    prefix + 3,
                    format!("{} qword [{}], {}", mnemonic, reg(b | (modrm & 7)), imm),
                ),
                _ => None,
            }
        }
        0xFF => {
            let modrm = *rest.get(1)?;
            if modrm >> 6 != 0b11 {
                return None;
            }
            let target = reg(b | (modrm & 7));
            match (modrm >> 3) & 7 {
                2 => insn(prefix + 2, format!("call {}", target)),
                4 => insn(prefix + 2, format!("jmp {}", target)),
                _ => None,
            }
        }
        0xE9 if rex == 0 => {
            let dest = branch_target(bytes, at)?;
            insn(5, format!("jmp {:#x}", dest))
        }
        0x0F if rex == 0 => match *rest.get(1)? {
            op @ 0x80..=0x8F => {
                let cond = Condition::from_code(op & 0xF)?;
                let dest = branch_target(bytes, at)?;
                insn(6, format!("j{} {:#x}", cond.suffix(), dest))
            }
            0x1F if rest.get(2) == Some(&0x00) => insn(3, "nop dword [rax]".to_string()),
            _ => None,
        },
        0xC3 if rex == 0 => insn(1, "ret".to_string()),
        0x90 if rex == 0 => insn(1, "nop".to_string()),
        0xCC if rex == 0 => insn(1, "int3".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::encoder;
    use super::*;

    #[test]
    fn test_decode_thunk_sequence() {
        let mut code = Vec::new();
        encoder::sub_rsp_imm8(&mut code, 8);
        encoder::push(&mut code, Reg::R10);
        encoder::mov_ri64(&mut code, Reg::Rdi, 0x1234);
        encoder::mov_ri32(&mut code, Reg::Rsi, 3);
        encoder::call_r(&mut code, Reg::Rax);
        encoder::store_to_stack(&mut code, 8, Reg::Rax);
        encoder::pop(&mut code, Reg::R10);
        encoder::ret(&mut code);

        let mut mnemonics = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let insn = decode(&code[offset..], 0x1000 + offset);
            offset += insn.len;
            mnemonics.push(insn.text);
        }
        assert_eq!(offset, code.len());
        assert_eq!(
            mnemonics,
            vec![
                "sub rsp, 8",
                "push r10",
                "mov rdi, 0x1234",
                "mov esi, 0x3",
                "call rax",
                "mov qword [rsp + 0x8], rax",
                "pop r10",
                "ret",
            ]
        );
        assert_eq!(disassemble(&code, 0x1000).lines().count(), 8);
    }

    #[test]
    fn test_decode_branches_show_destination() {
        let mut code = Vec::new();
        let field = encoder::jcc_rel32(&mut code, Condition::NotEqual);
        encoder::patch_rel32(&mut code, field, 0x2000 + field, 0x2100).unwrap();
        let insn = decode(&code, 0x2000);
        assert_eq!(insn.len, 6);
        assert_eq!(insn.text, "jne 0x2100");

        let word = encoder::encode_patchable_jump(0x3000, 0x3040).unwrap();
        let text = disassemble(&word, 0x3000);
        assert!(text.contains("jmp 0x3040"));
        assert!(text.contains("nop dword [rax]"));
    }

    #[test]
    fn test_unknown_bytes() {
        let insn = decode(&[0x0F, 0x0B], 0);
        assert_eq!(insn.len, 1);
        assert_eq!(insn.text, ".byte 0x0f");
    }

    #[test]
    fn test_compare_memory() {
        let mut code = Vec::new();
        encoder::cmp_mem_imm8(&mut code, Reg::R11, 0);
        assert_eq!(decode(&code, 0).text, "cmp qword [r11], 0");
    }
}
