//! Compiled units: fast-tier code that owns its lazy slow paths.
//!
//! [`UnitBuilder`] wraps the fast-tier emitter. For every slow path it is
//! given a patchable jump; at finalization it appends one dispatch thunk per
//! slow path and links the jump to it. The thunk preserves the site's live
//! caller-saved registers, calls [`operation_compile_lazy_slow_path`], and
//! returns into the stub address the operation hands back:
//!
//! ```text
//! sub rsp, 8                 ; slot for the stub address
//! push <live caller-saved>
//! [sub rsp, 8]               ; 16-byte alignment for the call
//! mov rdi, <unit anchor>
//! mov esi, <slow path index>
//! mov rax, operation; call rax
//! [add rsp, 8]
//! mov [rsp + 8n], rax
//! pop <live caller-saved>
//! ret                        ; into the stub
//! ```
//!
//! Generated code must keep rsp 16-byte aligned at every patchable jump
//! (function bodies start with `push rbp`). Thunks clobber flags.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::assembler::{
    is_patchable_jump, Jump, Label, LinkBuffer, MacroAssembler, Reg, RegisterSet,
    PATCHABLE_JUMP_SIZE,
};
use crate::code::{CodePtr, ExceptionHandlerTag, JitCompilationTag, LabelTag, StubRoutineTag};
use crate::compilation::{
    CodeCache, Compilation, CompilationKey, OpaqueByproducts, Tier, UnitId, Worklist,
};
use crate::config::FinalizeFailurePolicy;
use crate::error::{JitError, JitResult};
use crate::memory::ExecutablePool;
use crate::runtime::{JitRuntime, JitStats};
use crate::slow_path::{CallSiteIndex, Generator, LazySlowPath, StubRoutine};

// =============================================================================
// Builder
// =============================================================================

struct SlowPathRequest {
    patch_jump: Jump,
    continuation: Label,
    exception: Option<Label>,
    live_registers: RegisterSet,
    call_site_index: CallSiteIndex,
    generator: Generator,
}

/// Emits the fast tier of a unit and registers its lazy slow paths
pub struct UnitBuilder {
    masm: MacroAssembler,
    source: UnitId,
    tier: Tier,
    requests: Vec<SlowPathRequest>,
    byproducts: OpaqueByproducts,
    deoptimization_exit: Option<Label>,
}

impl UnitBuilder {
    pub fn new(source: UnitId, tier: Tier) -> Self {
        UnitBuilder {
            masm: MacroAssembler::new(),
            source,
            tier,
            requests: Vec::new(),
            byproducts: OpaqueByproducts::new(),
            deoptimization_exit: None,
        }
    }

    /// Assembler for the fast-tier code. The unit entry is offset 0.
    pub fn masm(&mut self) -> &mut MacroAssembler {
        &mut self.masm
    }

    pub fn byproducts_mut(&mut self) -> &mut OpaqueByproducts {
        &mut self.byproducts
    }

    /// Code to resume at when a slow path cannot be generated and the unit
    /// is deoptimized instead. Without one, such a failure aborts.
    pub fn set_deoptimization_exit(&mut self, label: Label) {
        self.deoptimization_exit = Some(label);
    }

    /// Register a lazy slow path reached through `patch_jump`, which must
    /// come from [`MacroAssembler::patchable_jump`]. Returns its index.
    pub fn add_lazy_slow_path(
        &mut self,
        patch_jump: Jump,
        continuation: Label,
        exception: Option<Label>,
        live_registers: RegisterSet,
        call_site_index: CallSiteIndex,
        generator: Generator,
    ) -> usize {
        let at = patch_jump.offset();
        let is_patchable = at % PATCHABLE_JUMP_SIZE == 0
            && self
                .masm
                .code()
                .get(at..at + PATCHABLE_JUMP_SIZE)
                .and_then(|bytes| <&[u8; PATCHABLE_JUMP_SIZE]>::try_from(bytes).ok())
                .is_some_and(is_patchable_jump);
        assert!(is_patchable, "slow path at offset {} is not a patchable jump", at);

        self.requests.push(SlowPathRequest {
            patch_jump,
            continuation,
            exception,
            live_registers,
            call_site_index,
            generator,
        });
        self.requests.len() - 1
    }

    /// Emit the dispatch thunks, finalize the code and build the unit
    pub fn finalize(self, runtime: &JitRuntime) -> JitResult<Arc<CompiledUnit>> {
        let UnitBuilder {
            mut masm,
            source,
            tier,
            requests,
            byproducts,
            deoptimization_exit,
        } = self;

        let anchor = Box::new(UnitAnchor {
            unit: OnceLock::new(),
        });
        let anchor_addr = &*anchor as *const UnitAnchor as u64;

        for (index, request) in requests.iter().enumerate() {
            let thunk = masm.label();
            request.patch_jump.link_to(&mut masm, thunk);
            emit_dispatch_thunk(&mut masm, anchor_addr, index as u32, request.live_registers);
        }

        let buffer = LinkBuffer::new(masm, runtime.pool())?;
        let sites: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let patch_target = buffer.location_of_jump(request.patch_jump);
                let continuation = buffer.location_of_label(request.continuation);
                let exception = request
                    .exception
                    .map(|label| buffer.location_of_label(label).retagged::<ExceptionHandlerTag>());
                (patch_target, continuation, exception, request)
            })
            .collect();
        let deoptimization_exit = deoptimization_exit.map(|label| buffer.location_of_label(label));
        let code = buffer.finalize_code::<JitCompilationTag>("compiled unit")?;

        let slow_paths: Vec<LazySlowPath> = sites
            .into_iter()
            .map(|(patch_target, continuation, exception, request)| {
                LazySlowPath::initialize(
                    patch_target,
                    continuation,
                    exception,
                    request.live_registers,
                    request.call_site_index,
                    request.generator,
                )
            })
            .collect();
        let entries = slow_paths.iter().map(|_| AtomicUsize::new(0)).collect();

        let config = runtime.config();
        let unit = Arc::new(CompiledUnit {
            key: CompilationKey::new(source, tier),
            source,
            compilation: Compilation::new(code, byproducts),
            slow_paths: Mutex::new(slow_paths),
            entries,
            invalidated: AtomicBool::new(false),
            deoptimization_exit,
            pool: Arc::clone(runtime.pool()),
            policy: config.on_finalize_failure,
            log_disassembly: config.log_disassembly,
            cache: Arc::downgrade(runtime.cache()),
            worklist: Arc::downgrade(runtime.worklist_handle()),
            stats: Arc::clone(runtime.stats_handle()),
            anchor,
        });
        // A fresh unit has no other references, so the anchor is unset
        let _ = unit.anchor.unit.set(Arc::downgrade(&unit));

        debug!(
            target: "tieredjit::unit",
            key = %unit.key,
            entry = ?unit.entry_point(),
            size = unit.compilation.code_ref().size(),
            slow_paths = unit.entries.len(),
            "Finalized compiled unit"
        );
        Ok(unit)
    }
}

fn emit_dispatch_thunk(masm: &mut MacroAssembler, anchor: u64, index: u32, live: RegisterSet) {
    let saved = live.to_preserve_across_call();
    // rsp is aligned at the patch site; the slot plus an even number of
    // pushes leaves it 8 off
    let padding = saved.len() % 2 == 0;

    masm.sub_rsp(8);
    for reg in saved.iter() {
        masm.push(reg);
    }
    if padding {
        masm.sub_rsp(8);
    }

    masm.mov_imm64(Reg::Rdi, anchor);
    masm.mov_imm32(Reg::Rsi, index);
    masm.mov_imm64(Reg::Rax, operation_compile_lazy_slow_path as usize as u64);
    masm.call(Reg::Rax);

    if padding {
        masm.add_rsp(8);
    }
    masm.store_to_stack(8 * saved.len() as i32, Reg::Rax);
    for reg in saved.iter().rev() {
        masm.pop(reg);
    }
    masm.ret();
}

// =============================================================================
// Compiled unit
// =============================================================================

/// Stable address through which dispatch thunks find their unit
pub struct UnitAnchor {
    unit: OnceLock<Weak<CompiledUnit>>,
}

/// Fast-tier code for one (unit, tier) together with its lazy slow paths.
///
/// The unit owns its code, its descriptors and every generated stub;
/// dropping it returns all of that memory to the pool.
pub struct CompiledUnit {
    key: CompilationKey,
    source: UnitId,
    compilation: Compilation,
    /// Compilation lock; guards descriptor generation
    slow_paths: Mutex<Vec<LazySlowPath>>,
    /// Stub entry per slow path, 0 until generated
    entries: Box<[AtomicUsize]>,
    invalidated: AtomicBool,
    deoptimization_exit: Option<CodePtr<LabelTag>>,
    pool: Arc<ExecutablePool>,
    policy: FinalizeFailurePolicy,
    log_disassembly: bool,
    cache: Weak<CodeCache>,
    worklist: Weak<Worklist>,
    stats: Arc<JitStats>,
    anchor: Box<UnitAnchor>,
}

impl CompiledUnit {
    pub fn key(&self) -> CompilationKey {
        self.key
    }

    pub fn source(&self) -> UnitId {
        self.source
    }

    pub fn tier(&self) -> Option<Tier> {
        self.key.tier()
    }

    pub fn compilation(&self) -> &Compilation {
        &self.compilation
    }

    /// Entry point of the fast-tier code
    pub fn entry_point(&self) -> CodePtr<JitCompilationTag> {
        self.compilation.code()
    }

    pub fn pool(&self) -> &Arc<ExecutablePool> {
        &self.pool
    }

    pub fn finalize_failure_policy(&self) -> FinalizeFailurePolicy {
        self.policy
    }

    pub fn log_disassembly(&self) -> bool {
        self.log_disassembly
    }

    pub fn deoptimization_exit(&self) -> Option<CodePtr<LabelTag>> {
        self.deoptimization_exit
    }

    pub fn slow_path_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether slow path `index` has a published stub
    pub fn is_slow_path_generated(&self, index: usize) -> bool {
        self.entries
            .get(index)
            .is_some_and(|entry| entry.load(Ordering::Acquire) != 0)
    }

    /// Inspect a descriptor under the compilation lock
    pub fn with_slow_path<R>(&self, index: usize, f: impl FnOnce(&LazySlowPath) -> R) -> Option<R> {
        self.slow_paths.lock().get(index).map(f)
    }

    #[cfg(test)]
    pub(crate) fn lock_slow_paths(&self) -> parking_lot::MutexGuard<'_, Vec<LazySlowPath>> {
        self.slow_paths.lock()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Generate slow path `index` if needed and return its stub entry.
    ///
    /// Lock-free once the stub is published. Otherwise takes the compilation
    /// lock and re-checks before generating, so concurrent callers generate
    /// at most once and all receive the same entry.
    pub fn resolve_slow_path(&self, index: usize) -> JitResult<CodePtr<StubRoutineTag>> {
        if self.is_invalidated() {
            return Err(JitError::UnitInvalidated(self.source));
        }
        let Some(entry) = self.entries.get(index) else {
            return Err(JitError::InvalidSlowPathIndex {
                index,
                count: self.entries.len(),
            });
        };
        if let Some(stub) = CodePtr::from_addr(entry.load(Ordering::Acquire)) {
            trace!(target: "tieredjit::slow_path", unit = %self.key, index, "Slow path already published");
            return Ok(stub);
        }

        let result = {
            let mut slow_paths = self.slow_paths.lock();
            if self.is_invalidated() {
                return Err(JitError::UnitInvalidated(self.source));
            }
            let descriptor = &mut slow_paths[index];
            if let Some(stub) = descriptor.stub() {
                trace!(target: "tieredjit::slow_path", unit = %self.key, index, "Slow path generated by another thread");
                return Ok(stub.entry());
            }

            descriptor.generate(self).map(|stub| {
                let size = descriptor.stub().map_or(0, StubRoutine::size);
                entry.store(stub.addr(), Ordering::Release);
                self.stats.record_generation(size);
                stub
            })
        };

        if result.is_err() {
            self.invalidate();
        }
        result
    }

    /// Mark the unit unusable and drop it from the code cache.
    ///
    /// If this unit was the cached one for its key, its worklist plan is
    /// retired as well so the tier can be requested again.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(target: "tieredjit::unit", unit = %self.key, "Invalidating compiled unit");
        self.stats.record_deoptimization();
        let evicted = self
            .cache
            .upgrade()
            .is_some_and(|cache| cache.evict(&self.key, self));
        if evicted {
            if let Some(worklist) = self.worklist.upgrade() {
                worklist.retire(self.key);
            }
        }
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("key", &self.key)
            .field("entry", &self.entry_point())
            .field("slow_paths", &self.entries.len())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

/// Called by dispatch thunks: generate slow path `index` of the unit behind
/// `anchor` and return the address to continue at.
///
/// Returns the stub entry, or the unit's deoptimization exit if generation
/// failed under the deoptimize policy. Aborts the process if neither is
/// available, since the calling machine code cannot observe an error.
///
/// # Safety
/// `anchor` must be the anchor of a live [`CompiledUnit`].
pub unsafe extern "C" fn operation_compile_lazy_slow_path(anchor: *const UnitAnchor, index: u64) -> usize {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: thunks embed the anchor of the unit whose code is running
        let anchor = unsafe { &*anchor };
        let Some(unit) = anchor.unit.get().and_then(Weak::upgrade) else {
            error!(target: "tieredjit::unit", index, "Dispatch thunk reached a dropped unit");
            return None;
        };

        match unit.resolve_slow_path(index as usize) {
            Ok(stub) => Some(stub.addr()),
            Err(err) => match unit.deoptimization_exit() {
                Some(exit) => {
                    warn!(target: "tieredjit::unit", unit = %unit.key(), index, error = %err, "Taking deoptimization exit");
                    Some(exit.addr())
                }
                None => {
                    error!(target: "tieredjit::unit", unit = %unit.key(), index, error = %err, "Slow path unavailable and no deoptimization exit");
                    None
                }
            },
        }
    }));

    match outcome {
        Ok(Some(addr)) => addr,
        _ => std::process::abort(),
    }
}
