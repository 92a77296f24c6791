//! tieredjit - Lazy slow paths and self-patching code for a tiered JIT
//!
//! This library provides the part of a multi-tier JIT that generates rarely
//! taken code on first use and rewrites live branches to reach it, together
//! with the compilation identity and caching types around it.
//!
//! # Architecture
//!
//! 1. **Code emission** (`assembler`)
//!    - x86-64 macro assembler with labels, jumps and jump lists
//!    - `LinkBuffer` resolves links and finalizes code into executable memory
//!    - Disassembler for the emitted instruction subset
//!
//! 2. **Executable memory** (`memory`)
//!    - One contiguous pool per runtime, so rel32 branches always reach
//!    - W^X or RWX page protection
//!    - Atomic 8-byte re-patching of branches in running code
//!
//! 3. **Compilations** (`compilation`)
//!    - `CompilationKey`: (unit, tier) identity with explicit empty/deleted states
//!    - `Compilation`: move-only finalized code plus byproducts
//!    - `CompilationTable`, `Worklist`, `CodeCache`
//!
//! 4. **Lazy slow paths** (`slow_path`, `unit`)
//!    - `LazySlowPath`: per-call-site descriptor, generated at most once
//!    - `CompiledUnit`: owns fast code, descriptors and stubs; the per-unit
//!      compilation lock serializes generation
//!    - Dispatch thunks call back into the runtime on first arrival
//!
//! # Example
//!
//! ```rust,no_run
//! use tieredjit::*;
//!
//! let runtime = JitRuntime::new(JitConfig::default()).unwrap();
//! let source = 0u8;
//! let mut builder = UnitBuilder::new(UnitId::of(&source), Tier::Ftl);
//!
//! // Fast path: jump to the (not yet generated) slow path, resume at `done`
//! builder.masm().push(Reg::Rbp);
//! let jump = builder.masm().patchable_jump();
//! let done = builder.masm().label();
//! builder.masm().pop(Reg::Rbp);
//! builder.masm().ret();
//!
//! builder.add_lazy_slow_path(
//!     jump,
//!     done,
//!     None,
//!     RegisterSet::empty(),
//!     CallSiteIndex(0),
//!     Box::new(|masm: &mut MacroAssembler, params: &mut GenerationParams<'_>| {
//!         masm.mov_imm64(Reg::Rax, 42);
//!         params.add_done_jump(masm.jump());
//!     }),
//! );
//!
//! let unit = builder.finalize(&runtime).unwrap();
//! runtime.install(unit.clone());
//!
//! // Generate eagerly instead of waiting for the first call
//! let stub = unit.resolve_slow_path(0).unwrap();
//! println!("stub at {stub}");
//! ```

pub mod assembler;
pub mod code;
pub mod compilation;
pub mod config;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod slow_path;
pub mod unit;

pub use assembler::{
    disassemble, Condition, Jump, JumpList, Label, LinkBuffer, MacroAssembler, Reg, RegisterSet,
};
pub use code::{
    CodePtr, CodeRef, ExceptionHandlerTag, JitCompilationTag, JumpTag, LabelTag, OperationTag,
    PtrTag, StubRoutineTag,
};
pub use compilation::{
    CodeCache, Compilation, CompilationKey, CompilationState, CompilationTable, OpaqueByproducts,
    Tier, UnitId, Worklist,
};
pub use config::{FinalizeFailurePolicy, JitConfig, ProtectionPolicy};
pub use error::{JitError, JitResult};
pub use memory::{repatch_jump, ExecutableMemoryHandle, ExecutablePool, ALLOCATION_GRANULE};
pub use runtime::{JitRuntime, JitStats, StatsSnapshot};
pub use slow_path::{
    lazy_call_generator, Argument, CallSiteIndex, GenerationParams, Generator, LazySlowPath,
    SlowPathSite, StubRoutine,
};
pub use unit::{operation_compile_lazy_slow_path, CompiledUnit, UnitAnchor, UnitBuilder};
