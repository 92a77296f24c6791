//! Shared helpers for integration tests
#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tieredjit::{
    CallSiteIndex, CompiledUnit, Generator, GenerationParams, JitConfig, JitRuntime,
    MacroAssembler, Reg, RegisterSet, Tier, UnitBuilder, UnitId,
};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Runtime with a pool small enough to map quickly
pub fn test_runtime() -> JitRuntime {
    test_runtime_with(JitConfig::default())
}

pub fn test_runtime_with(config: JitConfig) -> JitRuntime {
    init_test_logging();
    JitRuntime::new(config.with_pool_size(256 * 1024)).expect("runtime")
}

static NEXT_UNIT: AtomicUsize = AtomicUsize::new(1);

/// A unit identity no other test uses
pub fn fresh_unit_id() -> UnitId {
    let n = NEXT_UNIT.fetch_add(1, Ordering::Relaxed);
    UnitId::from_raw(NonZeroUsize::new(n * 64).expect("non-zero"))
}

/// Generator whose stub loads `value` into rax and resumes
pub fn return_value_generator(value: u64) -> Generator {
    Box::new(move |masm: &mut MacroAssembler, params: &mut GenerationParams<'_>| {
        masm.mov_imm64(Reg::Rax, value);
        params.add_done_jump(masm.jump());
    })
}

/// `push rbp; <slow path>; pop rbp; ret` as an `extern "C" fn() -> u64`
pub fn single_slow_path_unit(
    runtime: &JitRuntime,
    tier: Tier,
    generator: Generator,
) -> Arc<CompiledUnit> {
    let mut builder = UnitBuilder::new(fresh_unit_id(), tier);
    let masm = builder.masm();
    masm.push(Reg::Rbp);
    let jump = masm.patchable_jump();
    let done = masm.label();
    masm.pop(Reg::Rbp);
    masm.ret();

    builder.add_lazy_slow_path(
        jump,
        done,
        None,
        RegisterSet::empty(),
        CallSiteIndex(0),
        generator,
    );
    builder.finalize(runtime).expect("finalize unit")
}

/// Unit with `count` independent slow paths, one after another
pub fn multi_slow_path_unit(runtime: &JitRuntime, count: usize) -> Arc<CompiledUnit> {
    let mut builder = UnitBuilder::new(fresh_unit_id(), Tier::Dfg);
    builder.masm().push(Reg::Rbp);
    for index in 0..count {
        let jump = builder.masm().patchable_jump();
        let done = builder.masm().label();
        builder.add_lazy_slow_path(
            jump,
            done,
            None,
            RegisterSet::empty(),
            CallSiteIndex(index as u32),
            return_value_generator(index as u64),
        );
    }
    builder.masm().pop(Reg::Rbp);
    builder.masm().ret();
    builder.finalize(runtime).expect("finalize unit")
}
