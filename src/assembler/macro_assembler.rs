//! Macro assembler: an instruction buffer with labels and deferred jump links.
//!
//! Jumps are recorded with a zero displacement and linked later, either to a
//! [`Label`] in the same buffer or to an absolute code address. Both kinds of
//! link are resolved by [`LinkBuffer`](super::LinkBuffer) once the final
//! address of the buffer is known.

use smallvec::SmallVec;

use super::encoder::{self, Condition, NOP3_BYTES, PATCHABLE_JUMP_SIZE};
use super::registers::Reg;
use crate::code::{CodePtr, OperationTag, PtrTag};

/// A position in the buffer, possibly not bound yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(super) usize);

/// A rel32 branch whose destination is filled in at link time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    /// Offset of the first byte of the instruction
    pub(super) start: usize,
    /// Offset of the rel32 field
    pub(super) field: usize,
}

impl Jump {
    /// Link this jump to the current end of the buffer
    pub fn link(self, masm: &mut MacroAssembler) {
        let here = masm.label();
        masm.local_links.push((self, here));
    }

    /// Link this jump to `label`
    pub fn link_to(self, masm: &mut MacroAssembler, label: Label) {
        masm.local_links.push((self, label));
    }

    /// Link this jump to an absolute code address outside the buffer
    pub fn link_thunk<T: PtrTag>(self, masm: &mut MacroAssembler, target: CodePtr<T>) {
        masm.absolute_links.push((self, target.addr()));
    }

    /// Offset of the instruction in its buffer
    pub fn offset(&self) -> usize {
        self.start
    }
}

/// A list of jumps that share a destination
#[derive(Debug, Clone, Default)]
pub struct JumpList {
    jumps: SmallVec<[Jump; 2]>,
}

impl JumpList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a jump
    pub fn append(&mut self, jump: Jump) {
        self.jumps.push(jump);
    }

    /// Link every jump to the current end of the buffer
    pub fn link(&self, masm: &mut MacroAssembler) {
        let here = masm.label();
        self.link_to(masm, here);
    }

    /// Link every jump to `label`
    pub fn link_to(&self, masm: &mut MacroAssembler, label: Label) {
        for jump in &self.jumps {
            jump.link_to(masm, label);
        }
    }

    /// Link every jump to an absolute code address
    pub fn link_thunk<T: PtrTag>(&self, masm: &mut MacroAssembler, target: CodePtr<T>) {
        for jump in &self.jumps {
            jump.link_thunk(masm, target);
        }
    }

    /// Number of jumps
    pub fn len(&self) -> usize {
        self.jumps.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.jumps.is_empty()
    }

    /// The recorded jumps
    pub fn jumps(&self) -> &[Jump] {
        &self.jumps
    }
}

/// x86-64 instruction buffer
#[derive(Debug, Default)]
pub struct MacroAssembler {
    pub(super) code: Vec<u8>,
    /// Bound offset of each label, `None` until bound
    pub(super) labels: Vec<Option<usize>>,
    pub(super) local_links: Vec<(Jump, Label)>,
    pub(super) absolute_links: Vec<(Jump, usize)>,
}

impl MacroAssembler {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Current size of the buffer
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emitted bytes so far
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    // -------------------------------------------------------------------------
    // Labels
    // -------------------------------------------------------------------------

    /// A label bound to the current position
    pub fn label(&mut self) -> Label {
        self.labels.push(Some(self.code.len()));
        Label(self.labels.len() - 1)
    }

    /// A label to be bound later with [`bind`](Self::bind)
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label {:?} bound twice", label);
        *slot = Some(self.code.len());
    }

    /// Offset a label is bound to
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    pub fn push(&mut self, reg: Reg) {
        encoder::push(&mut self.code, reg);
    }

    pub fn pop(&mut self, reg: Reg) {
        encoder::pop(&mut self.code, reg);
    }

    pub fn mov_imm64(&mut self, dst: Reg, imm: u64) {
        encoder::mov_ri64(&mut self.code, dst, imm);
    }

    pub fn mov_imm32(&mut self, dst: Reg, imm: u32) {
        encoder::mov_ri32(&mut self.code, dst, imm);
    }

    /// `mov dst, src`; elided when both are the same register
    pub fn mov(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            encoder::mov_rr(&mut self.code, dst, src);
        }
    }

    /// Store `src` to `[rsp + disp]`
    pub fn store_to_stack(&mut self, disp: i32, src: Reg) {
        encoder::store_to_stack(&mut self.code, disp, src);
    }

    /// Grow the stack by `bytes`
    pub fn sub_rsp(&mut self, bytes: i8) {
        encoder::sub_rsp_imm8(&mut self.code, bytes);
    }

    /// Shrink the stack by `bytes`
    pub fn add_rsp(&mut self, bytes: i8) {
        encoder::add_rsp_imm8(&mut self.code, bytes);
    }

    pub fn test(&mut self, a: Reg, b: Reg) {
        encoder::test_rr(&mut self.code, a, b);
    }

    /// `cmp qword [base], imm`
    pub fn cmp_mem_imm8(&mut self, base: Reg, imm: i8) {
        encoder::cmp_mem_imm8(&mut self.code, base, imm);
    }

    pub fn call(&mut self, target: Reg) {
        encoder::call_r(&mut self.code, target);
    }

    /// Call a host operation through `rax`
    pub fn call_operation(&mut self, operation: CodePtr<OperationTag>) {
        self.mov_imm64(Reg::Rax, operation.addr() as u64);
        self.call(Reg::Rax);
    }

    pub fn jump_to_register(&mut self, target: Reg) {
        encoder::jmp_r(&mut self.code, target);
    }

    /// Unconditional `jmp rel32`
    pub fn jump(&mut self) -> Jump {
        let start = self.code.len();
        let field = encoder::jmp_rel32(&mut self.code);
        Jump { start, field }
    }

    /// Conditional `jcc rel32`
    pub fn branch(&mut self, cond: Condition) -> Jump {
        let start = self.code.len();
        let field = encoder::jcc_rel32(&mut self.code, cond);
        Jump { start, field }
    }

    /// A `jmp rel32` that can later be rewritten atomically.
    ///
    /// Aligned to 8 bytes and padded to a full word.
    pub fn patchable_jump(&mut self) -> Jump {
        self.align(PATCHABLE_JUMP_SIZE);
        let jump = self.jump();
        self.code.extend_from_slice(&NOP3_BYTES);
        jump
    }

    pub fn ret(&mut self) {
        encoder::ret(&mut self.code);
    }

    pub fn nop(&mut self) {
        encoder::nop(&mut self.code);
    }

    pub fn breakpoint(&mut self) {
        encoder::int3(&mut self.code);
    }

    /// Pad with `nop` until the offset is a multiple of `alignment`
    pub fn align(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.nop();
        }
    }
}
