//! x86-64 code emission.
//!
//! ```text
//! MacroAssembler ──(labels, jumps, jump lists)──► LinkBuffer ──► CodeRef
//!                                                    │
//!                                     ExecutablePool allocation + write
//! ```
//!
//! The encoder covers only what stubs, dispatch thunks and the minimal
//! fast-tier emitter need. All branches use rel32 displacements; the single
//! executable pool keeps every destination in range.

mod disasm;
mod encoder;
mod link_buffer;
mod macro_assembler;
mod registers;

pub use disasm::{decode, disassemble, Instruction};
pub use encoder::{
    branch_target, encode_patchable_jump, is_patchable_jump, read_branch_target, Condition,
    JCC_REL32_SIZE, JMP_REL32_SIZE, PATCHABLE_JUMP_SIZE,
};
pub use link_buffer::LinkBuffer;
pub use macro_assembler::{Jump, JumpList, Label, MacroAssembler};
pub use registers::{Reg, RegisterSet, ARGUMENT_REGISTERS, RETURN_REGISTER, SCRATCH_REGISTER};
