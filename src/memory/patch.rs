//! Rewriting branches in finalized code.
//!
//! A patchable jump is an 8-byte aligned `jmp rel32` padded with a 3-byte
//! nop, so the whole instruction is one naturally aligned machine word. The
//! re-patcher replaces that word with a single release-ordered atomic store:
//! a thread fetching the instruction concurrently sees either the old or the
//! new destination, never a mix of both.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use tracing::{debug, error};

use super::ExecutablePool;
use crate::assembler::{encode_patchable_jump, is_patchable_jump, PATCHABLE_JUMP_SIZE};
use crate::code::{CodePtr, JumpTag, PtrTag};
use crate::error::{JitError, JitResult};

/// Point the patchable jump at `jump` to `target`.
///
/// Panics if `jump` is not a patchable jump inside `pool`; rewriting
/// anything else would corrupt finalized code.
pub fn repatch_jump<T: PtrTag>(
    pool: &ExecutablePool,
    jump: CodePtr<JumpTag>,
    target: CodePtr<T>,
) -> JitResult<()> {
    let at = jump.addr();
    if at % PATCHABLE_JUMP_SIZE != 0 || !pool.contains(at, PATCHABLE_JUMP_SIZE) {
        error!(target: "tieredjit::memory", jump = ?jump, "Patch target is not an aligned pool address");
        panic!("repatch_jump: {:?} is not an aligned address inside the executable pool", jump);
    }

    // SAFETY: `at` is 8-byte aligned and inside the live pool mapping
    let word = unsafe { &*(at as *const AtomicU64) };
    let current = word.load(Ordering::Acquire).to_le_bytes();
    if !is_patchable_jump(&current) {
        error!(target: "tieredjit::memory", jump = ?jump, bytes = ?current, "Patch target is not a patchable jump");
        panic!("repatch_jump: {:?} does not hold a patchable jump", jump);
    }

    let replacement = encode_patchable_jump(at, target.addr()).ok_or(JitError::BranchOutOfRange {
        from: at,
        to: target.addr(),
    })?;

    // The destination code must be visible to instruction fetch before any
    // thread can branch to it.
    flush_instruction_cache(target.as_ptr(), 0);

    // SAFETY: the word lies in finalized code of this pool
    unsafe {
        pool.with_writable_code(at, PATCHABLE_JUMP_SIZE, || {
            word.store(u64::from_le_bytes(replacement), Ordering::Release);
        })?;
    }
    flush_instruction_cache(jump.as_ptr(), PATCHABLE_JUMP_SIZE);

    debug!(target: "tieredjit::memory", jump = ?jump, target = ?target, "Repatched jump");
    Ok(())
}

/// Make writes to `start..start+len` visible to instruction fetch on every core
pub fn flush_instruction_cache(start: *const u8, len: usize) {
    imp::flush(start, len);
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub(super) fn flush(start: *const u8, len: usize) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        // SAFETY: flushing an address range has no memory-safety requirements
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), start.cast(), len);
        }
    }
}

#[cfg(all(target_arch = "aarch64", not(windows)))]
mod imp {
    use std::arch::asm;

    pub(super) fn flush(start: *const u8, len: usize) {
        let ctr: u64;
        // SAFETY: CTR_EL0 is readable from EL0 on every supported kernel
        unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
        let dline = 4usize << ((ctr >> 16) & 0xF);
        let iline = 4usize << (ctr & 0xF);

        let begin = start as usize;
        let end = begin + len.max(1);

        let mut addr = begin & !(dline - 1);
        while addr < end {
            // SAFETY: cache maintenance by VA on mapped memory
            unsafe { asm!("dc cvau, {}", in(reg) addr, options(nostack)) };
            addr += dline;
        }
        unsafe { asm!("dsb ish", options(nostack)) };

        let mut addr = begin & !(iline - 1);
        while addr < end {
            unsafe { asm!("ic ivau, {}", in(reg) addr, options(nostack)) };
            addr += iline;
        }
        unsafe { asm!("dsb ish", "isb", options(nostack)) };
    }
}

#[cfg(not(any(windows, target_arch = "aarch64")))]
mod imp {
    // x86-64 keeps instruction fetch coherent with data writes; ordering the
    // store is enough.
    pub(super) fn flush(_start: *const u8, _len: usize) {
        super::fence(super::Ordering::SeqCst);
    }
}
