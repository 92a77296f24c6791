//! Generator for the common slow path: a call into a runtime operation.
//!
//! The stub preserves the site's live registers around the call, moves its
//! arguments into the SysV argument registers, optionally checks the
//! runtime's pending-exception flag, and leaves the result in the requested
//! register:
//!
//! ```text
//! push <live caller-saved>        ; minus the result register
//! [sub rsp, 8]                    ; keep rsp 16-byte aligned
//! push <register args>; pop ...   ; parallel move through the stack
//! mov <arg>, imm                  ; immediates last
//! mov rax, operation; call rax
//! [mov r11, flag; cmp qword [r11], 0; jne exception]
//! mov <result>, rax
//! [add rsp, 8]; pop <live>; jmp continuation
//! exception:
//! [add rsp, 8]; pop <live>; jmp handler
//! ```
//!
//! Stubs are entered with rsp 16-byte aligned.

use std::sync::atomic::AtomicU64;

use smallvec::SmallVec;

use super::descriptor::{GenerationParams, Generator};
use crate::assembler::{
    Condition, MacroAssembler, Reg, RegisterSet, ARGUMENT_REGISTERS, RETURN_REGISTER,
    SCRATCH_REGISTER,
};
use crate::code::{CodePtr, OperationTag};

/// One argument of a lazy call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argument {
    /// Value of a register at the call site
    Reg(Reg),
    /// A constant
    Imm(u64),
    /// The call site's index
    CallSiteIndex,
}

/// Build a generator that calls `operation` with `args` and stores its
/// return value in `result`.
///
/// When the site has an exception handler and `exception_flag` is given,
/// a non-zero flag after the call branches to the handler.
///
/// Panics if more than six arguments are passed.
pub fn lazy_call_generator(
    operation: CodePtr<OperationTag>,
    args: impl IntoIterator<Item = Argument>,
    result: Option<Reg>,
    exception_flag: Option<&'static AtomicU64>,
) -> Generator {
    let args: SmallVec<[Argument; 6]> = args.into_iter().collect();
    assert!(
        args.len() <= ARGUMENT_REGISTERS.len(),
        "lazy call takes at most {} arguments, got {}",
        ARGUMENT_REGISTERS.len(),
        args.len()
    );
    let flag_addr = exception_flag.map(|flag| flag as *const AtomicU64 as u64);

    Box::new(move |masm: &mut MacroAssembler, params: &mut GenerationParams<'_>| {
        let mut saved = params.site().live_registers().to_preserve_across_call();
        if let Some(result) = result {
            saved.remove(result);
        }
        let needs_padding = saved.len() % 2 == 1;

        save(masm, saved, needs_padding);

        // Register sources go through the stack so no move clobbers
        // another argument's source.
        let sources: SmallVec<[(usize, Reg); 6]> = args
            .iter()
            .enumerate()
            .filter_map(|(i, arg)| match arg {
                Argument::Reg(reg) => Some((i, *reg)),
                _ => None,
            })
            .collect();
        for &(_, reg) in &sources {
            masm.push(reg);
        }
        for &(i, _) in sources.iter().rev() {
            masm.pop(ARGUMENT_REGISTERS[i]);
        }
        let call_site_index = params.site().call_site_index();
        for (i, arg) in args.iter().enumerate() {
            match arg {
                Argument::Imm(value) => masm.mov_imm64(ARGUMENT_REGISTERS[i], *value),
                Argument::CallSiteIndex => masm.mov_imm32(ARGUMENT_REGISTERS[i], call_site_index.0),
                Argument::Reg(_) => {}
            }
        }

        masm.call_operation(operation);

        let exception = match (flag_addr, params.has_exception_jumps()) {
            (Some(addr), true) => {
                masm.mov_imm64(SCRATCH_REGISTER, addr);
                masm.cmp_mem_imm8(SCRATCH_REGISTER, 0);
                Some(masm.branch(Condition::NotEqual))
            }
            _ => None,
        };

        if let Some(result) = result {
            masm.mov(result, RETURN_REGISTER);
        }
        restore(masm, saved, needs_padding);
        params.add_done_jump(masm.jump());

        if let Some(branch) = exception {
            branch.link(masm);
            restore(masm, saved, needs_padding);
            params.add_exception_jump(masm.jump());
        }
    })
}

fn save(masm: &mut MacroAssembler, saved: RegisterSet, padding: bool) {
    for reg in saved.iter() {
        masm.push(reg);
    }
    if padding {
        masm.sub_rsp(8);
    }
}

fn restore(masm: &mut MacroAssembler, saved: RegisterSet, padding: bool) {
    if padding {
        masm.add_rsp(8);
    }
    for reg in saved.iter().rev() {
        masm.pop(reg);
    }
}
