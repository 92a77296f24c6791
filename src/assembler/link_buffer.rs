//! Finalization of an assembled buffer into executable memory.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, error};

use super::encoder;
use super::macro_assembler::{Jump, Label, MacroAssembler};
use crate::code::{CodePtr, CodeRef, JumpTag, LabelTag, PtrTag};
use crate::error::{JitError, JitResult};
use crate::memory::{flush_instruction_cache, ExecutableMemoryHandle, ExecutablePool};

/// A buffer placed at its final address with every jump resolved.
///
/// Creating the link buffer allocates the memory; [`finalize_code`]
/// copies the code in, makes it executable and hands out the owning
/// [`CodeRef`].
///
/// [`finalize_code`]: LinkBuffer::finalize_code
pub struct LinkBuffer {
    memory: ExecutableMemoryHandle,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    entry: CodePtr<LabelTag>,
}

impl LinkBuffer {
    /// Allocate memory for `masm` from `pool` and resolve its links
    pub fn new(masm: MacroAssembler, pool: &Arc<ExecutablePool>) -> JitResult<Self> {
        let MacroAssembler {
            mut code,
            labels,
            local_links,
            absolute_links,
        } = masm;

        let memory = pool.allocate(code.len())?;
        // SAFETY: allocations are offsets into a non-null mapping
        let entry = CodePtr::new(unsafe { NonNull::new_unchecked(memory.start()) });
        let base = entry.addr();

        for (jump, label) in local_links {
            let Some(target) = labels[label.0] else {
                error!(target: "tieredjit::memory", ?label, "Jump linked to an unbound label");
                panic!("jump at offset {} linked to unbound label {:?}", jump.start, label);
            };
            // Both ends are inside one buffer, far smaller than the rel32 range
            encoder::patch_rel32(&mut code, jump.field, jump.field, target).ok_or(
                JitError::BranchOutOfRange {
                    from: base + jump.start,
                    to: base + target,
                },
            )?;
        }

        for (jump, target) in absolute_links {
            encoder::patch_rel32(&mut code, jump.field, base + jump.field, target).ok_or(
                JitError::BranchOutOfRange {
                    from: base + jump.start,
                    to: target,
                },
            )?;
        }

        Ok(LinkBuffer {
            memory,
            code,
            labels,
            entry,
        })
    }

    /// Final address of a bound label
    pub fn location_of_label(&self, label: Label) -> CodePtr<LabelTag> {
        match self.labels.get(label.0).copied().flatten() {
            Some(offset) => self.entry.offset(offset),
            None => panic!("location_of_label: {:?} is not bound", label),
        }
    }

    /// Final address of a jump instruction
    pub fn location_of_jump(&self, jump: Jump) -> CodePtr<JumpTag> {
        self.entry.offset(jump.start).retagged()
    }

    /// Entry point of the buffer
    pub fn entry(&self) -> CodePtr<LabelTag> {
        self.entry
    }

    /// Size of the code
    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Copy the code into place, make it executable and take ownership of it
    pub fn finalize_code<T: PtrTag>(self, description: &str) -> JitResult<CodeRef<T>> {
        let LinkBuffer {
            mut memory,
            code,
            entry,
            ..
        } = self;

        memory.write(&code)?;
        flush_instruction_cache(entry.as_ptr(), code.len());

        debug!(
            target: "tieredjit::memory",
            description,
            entry = ?entry,
            size = code.len(),
            "Finalized code"
        );

        Ok(CodeRef::new(memory, entry.retagged(), code.len()))
    }
}
