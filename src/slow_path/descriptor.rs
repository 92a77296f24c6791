//! Per-call-site lazy slow path descriptor.

use std::fmt;

use tracing::{debug, error, trace, warn};

use crate::assembler::{Jump, JumpList, LinkBuffer, MacroAssembler, RegisterSet};
use crate::code::{
    CodePtr, CodeRef, ExceptionHandlerTag, JumpTag, LabelTag, StubRoutineTag,
};
use crate::config::FinalizeFailurePolicy;
use crate::error::{JitError, JitResult};
use crate::memory::repatch_jump;
use crate::unit::CompiledUnit;

/// Identifies a call for stack walking and exception tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteIndex(pub u32);

impl fmt::Display for CallSiteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single-use code generator for a slow path.
///
/// Emits the stub body into the assembler and records where control leaves
/// it in the [`GenerationParams`] jump lists.
pub type Generator = Box<dyn FnOnce(&mut MacroAssembler, &mut GenerationParams<'_>) + Send>;

/// Facts about a call site gathered while emitting the fast tier
#[derive(Debug, Clone)]
pub struct SlowPathSite {
    patch_target: CodePtr<JumpTag>,
    continuation_target: CodePtr<LabelTag>,
    exception_target: Option<CodePtr<ExceptionHandlerTag>>,
    live_registers: RegisterSet,
    call_site_index: CallSiteIndex,
}

impl SlowPathSite {
    /// The patchable jump that currently leads to the dispatch thunk
    pub fn patch_target(&self) -> CodePtr<JumpTag> {
        self.patch_target
    }

    /// Where the fast path resumes after the slow path
    pub fn continuation_target(&self) -> CodePtr<LabelTag> {
        self.continuation_target
    }

    /// Handler for exceptions thrown by the slow path, if the site can throw
    pub fn exception_target(&self) -> Option<CodePtr<ExceptionHandlerTag>> {
        self.exception_target
    }

    /// Registers live across the slow path
    pub fn live_registers(&self) -> RegisterSet {
        self.live_registers
    }

    pub fn call_site_index(&self) -> CallSiteIndex {
        self.call_site_index
    }
}

/// What a [`Generator`] sees while emitting a stub.
///
/// The [`LazySlowPath`] being generated is mutably borrowed for the whole
/// generation, so instead of a reference back to it the params carry
/// [`site`](Self::site): a shared view of the descriptor's call-site facts
/// (patch location, continuation, exception target, live registers and
/// call-site index).
pub struct GenerationParams<'a> {
    /// Jumps that resume at the continuation target
    pub done_jumps: JumpList,
    exception_jumps: Option<JumpList>,
    site: &'a SlowPathSite,
}

impl<'a> GenerationParams<'a> {
    fn new(site: &'a SlowPathSite) -> Self {
        GenerationParams {
            done_jumps: JumpList::new(),
            exception_jumps: site.exception_target.map(|_| JumpList::new()),
            site,
        }
    }

    /// The descriptor view of the slow path being generated.
    ///
    /// Same data [`LazySlowPath`] exposes through its accessors.
    pub fn site(&self) -> &SlowPathSite {
        self.site
    }

    /// Whether exception jumps may be recorded
    pub fn has_exception_jumps(&self) -> bool {
        self.exception_jumps.is_some()
    }

    /// The exception jump list, present only when the site has a handler
    pub fn exception_jumps(&mut self) -> Option<&mut JumpList> {
        self.exception_jumps.as_mut()
    }

    /// Record a jump to the continuation
    pub fn add_done_jump(&mut self, jump: Jump) {
        self.done_jumps.append(jump);
    }

    /// Record a jump to the exception handler.
    ///
    /// Panics if the site has no exception target.
    pub fn add_exception_jump(&mut self, jump: Jump) {
        match self.exception_jumps.as_mut() {
            Some(jumps) => jumps.append(jump),
            None => {
                error!(
                    target: "tieredjit::slow_path",
                    call_site = %self.site.call_site_index,
                    "Exception jump recorded for a site without an exception target"
                );
                panic!(
                    "exception jump recorded for call site {} which has no exception target",
                    self.site.call_site_index
                );
            }
        }
    }
}

/// A finalized slow-path stub, owned by its descriptor
pub struct StubRoutine {
    code: CodeRef<StubRoutineTag>,
}

impl StubRoutine {
    pub fn entry(&self) -> CodePtr<StubRoutineTag> {
        self.code.code()
    }

    pub fn size(&self) -> usize {
        self.code.size()
    }

    pub fn code_ref(&self) -> &CodeRef<StubRoutineTag> {
        &self.code
    }

    pub fn disassembly(&self) -> String {
        self.code.disassembly()
    }
}

impl fmt::Debug for StubRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRoutine")
            .field("entry", &self.entry())
            .field("size", &self.size())
            .finish()
    }
}

enum State {
    Pending(Generator),
    Generated(StubRoutine),
    /// The generator was consumed without producing a stub
    Abandoned,
}

/// A rarely taken path of a compiled unit, generated on first execution.
///
/// Until then the patch target jumps to a dispatch thunk that calls back
/// into the runtime. [`generate`](Self::generate) emits the stub, links it
/// to the continuation and exception targets, and rewrites the patch target
/// to jump straight to the stub.
pub struct LazySlowPath {
    site: SlowPathSite,
    state: State,
}

impl LazySlowPath {
    /// Record the facts of a call site. `exception_target` is present only
    /// when the site lies in a region that can throw.
    pub fn initialize(
        patch_target: CodePtr<JumpTag>,
        continuation_target: CodePtr<LabelTag>,
        exception_target: Option<CodePtr<ExceptionHandlerTag>>,
        live_registers: RegisterSet,
        call_site_index: CallSiteIndex,
        generator: Generator,
    ) -> Self {
        LazySlowPath {
            site: SlowPathSite {
                patch_target,
                continuation_target,
                exception_target,
                live_registers,
                call_site_index,
            },
            state: State::Pending(generator),
        }
    }

    pub fn site(&self) -> &SlowPathSite {
        &self.site
    }

    pub fn patch_target(&self) -> CodePtr<JumpTag> {
        self.site.patch_target
    }

    pub fn continuation_target(&self) -> CodePtr<LabelTag> {
        self.site.continuation_target
    }

    pub fn exception_target(&self) -> Option<CodePtr<ExceptionHandlerTag>> {
        self.site.exception_target
    }

    pub fn live_registers(&self) -> RegisterSet {
        self.site.live_registers
    }

    pub fn call_site_index(&self) -> CallSiteIndex {
        self.site.call_site_index
    }

    /// The generated stub, if any
    pub fn stub(&self) -> Option<&StubRoutine> {
        match &self.state {
            State::Generated(stub) => Some(stub),
            _ => None,
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.state, State::Generated(_))
    }

    /// Generate the stub and patch the call site to jump to it.
    ///
    /// Must be called at most once, under the containing unit's compilation
    /// lock. A second call, or a call after the generator was lost, panics.
    /// Finalization failures panic under [`FinalizeFailurePolicy::Abort`] and
    /// are returned under [`FinalizeFailurePolicy::Deoptimize`].
    pub fn generate(&mut self, unit: &CompiledUnit) -> JitResult<CodePtr<StubRoutineTag>> {
        let generator = match std::mem::replace(&mut self.state, State::Abandoned) {
            State::Pending(generator) => generator,
            State::Generated(stub) => {
                let entry = stub.entry();
                self.state = State::Generated(stub);
                error!(
                    target: "tieredjit::slow_path",
                    call_site = %self.site.call_site_index,
                    stub = ?entry,
                    "Slow path generated twice"
                );
                panic!(
                    "lazy slow path for call site {} was already generated at {:?}",
                    self.site.call_site_index, entry
                );
            }
            State::Abandoned => {
                error!(
                    target: "tieredjit::slow_path",
                    call_site = %self.site.call_site_index,
                    "Slow path has no generator"
                );
                panic!(
                    "lazy slow path for call site {} has no generator",
                    self.site.call_site_index
                );
            }
        };

        let mut masm = MacroAssembler::new();
        let mut params = GenerationParams::new(&self.site);
        generator(&mut masm, &mut params);

        let GenerationParams {
            done_jumps,
            exception_jumps,
            ..
        } = params;
        done_jumps.link_thunk(&mut masm, self.site.continuation_target);
        if let (Some(jumps), Some(target)) = (exception_jumps, self.site.exception_target) {
            jumps.link_thunk(&mut masm, target);
        }

        let code = match LinkBuffer::new(masm, unit.pool())
            .and_then(|buffer| buffer.finalize_code::<StubRoutineTag>("lazy slow path"))
        {
            Ok(code) => code,
            Err(err) => return Err(self.finalization_failed(unit, err)),
        };

        let stub = StubRoutine { code };
        let entry = stub.entry();
        debug!(
            target: "tieredjit::slow_path",
            unit = %unit.key(),
            call_site = %self.site.call_site_index,
            stub = ?entry,
            size = stub.size(),
            "Generated slow path"
        );
        if unit.log_disassembly() {
            trace!(target: "tieredjit::slow_path", "\n{}", stub.disassembly());
        }
        self.state = State::Generated(stub);

        if let Err(err) = repatch_jump(unit.pool(), self.site.patch_target, entry) {
            return Err(self.finalization_failed(unit, err));
        }
        Ok(entry)
    }

    fn finalization_failed(&self, unit: &CompiledUnit, err: JitError) -> JitError {
        match unit.finalize_failure_policy() {
            FinalizeFailurePolicy::Abort => {
                error!(
                    target: "tieredjit::slow_path",
                    unit = %unit.key(),
                    call_site = %self.site.call_site_index,
                    error = %err,
                    "Slow path finalization failed"
                );
                panic!(
                    "failed to finalize slow path for call site {}: {}",
                    self.site.call_site_index, err
                );
            }
            FinalizeFailurePolicy::Deoptimize => {
                warn!(
                    target: "tieredjit::slow_path",
                    unit = %unit.key(),
                    call_site = %self.site.call_site_index,
                    error = %err,
                    "Slow path finalization failed, deoptimizing"
                );
                err
            }
        }
    }
}

impl fmt::Debug for LazySlowPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Generated(_) => "generated",
            State::Abandoned => "abandoned",
        };
        f.debug_struct("LazySlowPath")
            .field("site", &self.site)
            .field("state", &state)
            .field("stub", &self.stub())
            .finish()
    }
}
