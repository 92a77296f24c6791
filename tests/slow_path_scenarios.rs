//! End-to-end slow path scenarios: units built through the public API,
//! resolved eagerly or by running the generated code.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use tieredjit::{
    disassemble, CompilationKey, GenerationParams, JitConfig, JitError, MacroAssembler, Reg, Tier,
};

#[test]
fn test_sites_generate_independently() {
    let runtime = test_runtime();
    let unit = multi_slow_path_unit(&runtime, 3);
    assert_eq!(unit.slow_path_count(), 3);

    unit.resolve_slow_path(1).unwrap();

    assert!(!unit.is_slow_path_generated(0));
    assert!(unit.is_slow_path_generated(1));
    assert!(!unit.is_slow_path_generated(2));
    assert_eq!(runtime.stats().slow_paths_generated, 1);
}

#[test]
fn test_stub_disassembly() {
    let runtime = test_runtime();
    let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(0x2a));
    unit.resolve_slow_path(0).unwrap();

    let text = unit
        .with_slow_path(0, |slow_path| slow_path.stub().map(|stub| stub.disassembly()))
        .flatten()
        .unwrap();
    assert!(text.contains("mov rax, 0x2a"));
    assert!(text.contains("jmp "));
}

#[test]
fn test_unit_disassembly_shows_dispatch_thunk() {
    let runtime = test_runtime();
    let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(1));
    let text = unit.compilation().disassembly();

    assert!(text.contains("push rbp"));
    assert!(text.contains("mov esi, 0x0"));
    assert!(text.contains("call rax"));
    assert!(text.contains("mov qword [rsp + 0x0], rax"));
}

#[test]
fn test_concurrent_resolution_across_sites() {
    let runtime = test_runtime();
    let unit = multi_slow_path_unit(&runtime, 4);
    let barrier = Barrier::new(8);

    let stubs: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let unit = &unit;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    (i % 4, unit.resolve_slow_path(i % 4).unwrap())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (index, stub) in &stubs {
        let mut same_site = stubs.iter().filter(|(other, _)| other == index);
        assert!(same_site.all(|(_, other)| other == stub));
    }
    assert_eq!(runtime.stats().slow_paths_generated, 4);
    assert_eq!(runtime.stats().patches_applied, 4);
}

#[test]
fn test_generator_runs_once_under_contention() {
    let runtime = test_runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let unit = single_slow_path_unit(
        &runtime,
        Tier::Baseline,
        Box::new(move |masm: &mut MacroAssembler, params: &mut GenerationParams<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            params.add_done_jump(masm.jump());
        }),
    );

    let barrier = Barrier::new(6);
    thread::scope(|s| {
        for _ in 0..6 {
            s.spawn(|| {
                barrier.wait();
                unit.resolve_slow_path(0).unwrap();
            });
        }
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_installed_unit_lookup_counts_hits() {
    let runtime = test_runtime();
    let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(7));
    let key = unit.key();

    assert!(runtime.lookup(key).is_none());
    runtime.install(Arc::clone(&unit));
    let found = runtime.lookup(key).unwrap();
    assert!(Arc::ptr_eq(&found, &unit));

    let stats = runtime.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

#[test]
fn test_invalidated_unit_refuses_generation() {
    let runtime = test_runtime();
    let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(7));
    runtime.install(Arc::clone(&unit));

    unit.invalidate();
    assert!(runtime.lookup(unit.key()).is_none());
    assert_eq!(
        unit.resolve_slow_path(0).unwrap_err(),
        JitError::UnitInvalidated(unit.source())
    );
    assert!(!unit.is_slow_path_generated(0));
    assert_eq!(runtime.stats().deoptimizations, 1);
}

#[test]
fn test_stale_unit_does_not_evict_replacement() {
    let runtime = test_runtime();
    let old = single_slow_path_unit(&runtime, Tier::Dfg, return_value_generator(1));
    let key = old.key();
    runtime.install(Arc::clone(&old));

    // Recompile the same (unit, tier) and replace the cached code
    let mut builder = tieredjit::UnitBuilder::new(old.source(), Tier::Dfg);
    builder.masm().ret();
    let replacement = builder.finalize(&runtime).unwrap();
    assert_eq!(replacement.key(), key);
    let replaced = runtime.install(Arc::clone(&replacement)).unwrap();
    assert!(Arc::ptr_eq(&replaced, &old));

    old.invalidate();
    let cached = runtime.lookup(key).unwrap();
    assert!(Arc::ptr_eq(&cached, &replacement));
    assert_eq!(
        runtime.worklist().compilation_state(key),
        tieredjit::CompilationState::Compiled
    );
}

#[test]
fn test_many_stubs_share_pages() {
    init_test_logging();
    let runtime = tieredjit::JitRuntime::new(JitConfig::default().with_pool_size(64 * 1024)).unwrap();
    let unit = multi_slow_path_unit(&runtime, 200);
    for index in 0..200 {
        unit.resolve_slow_path(index).unwrap();
    }

    assert_eq!(runtime.stats().slow_paths_generated, 200);
    assert!(runtime.pool().bytes_in_use() < 64 * 1024);
    assert!(runtime.pool().bytes_in_use() < 200 * runtime.pool().page_size());
}

#[test]
fn test_disassembly_logging_does_not_change_code() {
    let runtime = test_runtime_with(JitConfig {
        log_disassembly: true,
        ..JitConfig::default()
    });
    let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(3));
    assert!(unit.log_disassembly());
    let stub = unit.resolve_slow_path(0).unwrap();

    let bytes = unit
        .with_slow_path(0, |slow_path| slow_path.stub().map(|s| s.code_ref().bytes().to_vec()))
        .flatten()
        .unwrap();
    assert!(disassemble(&bytes, stub.addr()).contains("mov rax, 0x3"));
}

#[test]
fn test_unit_key_matches_source_and_tier() {
    let runtime = test_runtime();
    let unit = single_slow_path_unit(&runtime, Tier::FtlForOsrEntry, return_value_generator(0));
    assert_eq!(unit.key(), CompilationKey::new(unit.source(), Tier::FtlForOsrEntry));
    assert_eq!(unit.tier(), Some(Tier::FtlForOsrEntry));
}

// =============================================================================
// Executing generated code
// =============================================================================

#[cfg(all(target_arch = "x86_64", unix))]
mod execution {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use tieredjit::{
        lazy_call_generator, Argument, CallSiteIndex, CodePtr, CompiledUnit, JitRuntime,
        OperationTag, ProtectionPolicy, RegisterSet, UnitBuilder,
    };

    type Entry = extern "C" fn() -> u64;

    fn entry_of(unit: &CompiledUnit) -> Entry {
        // SAFETY: units in this module are built as `extern "C" fn() -> u64`
        unsafe { std::mem::transmute::<*const u8, Entry>(unit.entry_point().as_ptr()) }
    }

    #[test]
    fn test_first_call_generates_and_later_calls_branch_directly() {
        let runtime = test_runtime();
        let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(42));
        let entry = entry_of(&unit);

        assert_eq!(entry(), 42);
        assert!(unit.is_slow_path_generated(0));
        assert_eq!(entry(), 42);
        assert_eq!(runtime.stats().slow_paths_generated, 1);
    }

    #[test]
    fn test_read_write_execute_pool() {
        let runtime = test_runtime_with(
            JitConfig::default().with_protection(tieredjit::ProtectionPolicy::ReadWriteExecute),
        );
        let unit = single_slow_path_unit(&runtime, Tier::Ftl, return_value_generator(9));
        let entry = entry_of(&unit);
        assert_eq!(entry(), 9);
        assert_eq!(entry(), 9);
    }

    extern "C" fn add_operation(a: u64, b: u64) -> u64 {
        a + b
    }

    extern "C" fn call_site_operation(index: u64) -> u64 {
        index
    }

    /// `push rbp; mov rcx, 0x1234; mov rdi, 40; <slow path>; mov rax, <reg>; pop rbp; ret`
    fn lazy_call_unit(runtime: &JitRuntime, returned: Reg) -> Arc<CompiledUnit> {
        let operation: CodePtr<OperationTag> =
            CodePtr::from_fn_addr(add_operation as *const ()).unwrap();
        let mut builder = UnitBuilder::new(fresh_unit_id(), Tier::Dfg);
        let masm = builder.masm();
        masm.push(Reg::Rbp);
        masm.mov_imm64(Reg::Rcx, 0x1234);
        masm.mov_imm64(Reg::Rdi, 40);
        let jump = masm.patchable_jump();
        let done = masm.label();
        masm.mov(Reg::Rax, returned);
        masm.pop(Reg::Rbp);
        masm.ret();

        builder.add_lazy_slow_path(
            jump,
            done,
            None,
            RegisterSet::from_regs(&[Reg::Rcx, Reg::Rdi]),
            CallSiteIndex(5),
            lazy_call_generator(
                operation,
                [Argument::Reg(Reg::Rdi), Argument::Imm(2)],
                Some(Reg::Rdx),
                None,
            ),
        );
        builder.finalize(runtime).unwrap()
    }

    #[test]
    fn test_lazy_call_result_lands_in_register() {
        let runtime = test_runtime();
        let unit = lazy_call_unit(&runtime, Reg::Rdx);
        let entry = entry_of(&unit);
        assert_eq!(entry(), 42);
        assert_eq!(entry(), 42);
    }

    #[test]
    fn test_live_registers_survive_thunk_and_stub() {
        let runtime = test_runtime();
        let unit = lazy_call_unit(&runtime, Reg::Rcx);
        let entry = entry_of(&unit);
        assert_eq!(entry(), 0x1234);
        assert_eq!(entry(), 0x1234);
    }

    #[test]
    fn test_call_site_index_argument() {
        let runtime = test_runtime();
        let operation: CodePtr<OperationTag> =
            CodePtr::from_fn_addr(call_site_operation as *const ()).unwrap();
        let mut builder = UnitBuilder::new(fresh_unit_id(), Tier::Baseline);
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
            CallSiteIndex(17),
            lazy_call_generator(operation, [Argument::CallSiteIndex], Some(Reg::Rax), None),
        );
        let unit = builder.finalize(&runtime).unwrap();

        assert_eq!(entry_of(&unit)(), 17);
    }

    #[test]
    fn test_failed_generation_takes_deoptimization_exit() {
        let page = test_runtime().pool().page_size();
        let runtime = JitRuntime::new(
            JitConfig::default()
                .with_pool_size(4 * page)
                .deoptimize_on_failure(),
        )
        .unwrap();

        let mut builder = UnitBuilder::new(fresh_unit_id(), Tier::Ftl);
        let masm = builder.masm();
        masm.push(Reg::Rbp);
        let jump = masm.patchable_jump();
        let done = masm.label();
        masm.pop(Reg::Rbp);
        masm.ret();
        let exit = masm.label();
        masm.mov_imm64(Reg::Rax, 99);
        masm.pop(Reg::Rbp);
        masm.ret();
        builder.set_deoptimization_exit(exit);
        builder.add_lazy_slow_path(
            jump,
            done,
            None,
            RegisterSet::empty(),
            CallSiteIndex(0),
            return_value_generator(1),
        );
        let unit = builder.finalize(&runtime).unwrap();
        runtime.install(Arc::clone(&unit));

        let _hog = runtime
            .pool()
            .allocate(runtime.pool().bytes_available())
            .unwrap();

        let entry = entry_of(&unit);
        assert_eq!(entry(), 99);
        assert!(unit.is_invalidated());
        assert!(runtime.lookup(unit.key()).is_none());
        // Still unpatched, so the next call deoptimizes again
        assert_eq!(entry(), 99);
        assert_eq!(runtime.stats().deoptimizations, 1);
    }

    const POLICIES: [ProtectionPolicy; 2] =
        [ProtectionPolicy::WriteXorExecute, ProtectionPolicy::ReadWriteExecute];

    /// Site 0 on the executed path returns 42; sites 1..=`dead` sit after the
    /// `ret`, on the same pages, and are only ever resolved eagerly.
    fn hot_path_with_dead_sites(runtime: &JitRuntime, dead: usize) -> Arc<CompiledUnit> {
        let mut builder = UnitBuilder::new(fresh_unit_id(), Tier::Ftl);
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
            return_value_generator(42),
        );

        for index in 1..=dead {
            let masm = builder.masm();
            let jump = masm.patchable_jump();
            let done = masm.label();
            masm.breakpoint();
            builder.add_lazy_slow_path(
                jump,
                done,
                None,
                RegisterSet::empty(),
                CallSiteIndex(index as u32),
                return_value_generator(index as u64),
            );
        }
        builder.finalize(runtime).unwrap()
    }

    #[test]
    fn test_code_keeps_running_while_its_page_is_patched() {
        const DEAD_SITES: usize = 48;

        for policy in POLICIES {
            let runtime = test_runtime_with(JitConfig::default().with_protection(policy));
            let unit = hot_path_with_dead_sites(&runtime, DEAD_SITES);
            let entry = entry_of(&unit);
            assert_eq!(entry(), 42);

            let stop = AtomicBool::new(false);
            let calls = AtomicUsize::new(0);
            thread::scope(|s| {
                let runners: Vec<_> = (0..3)
                    .map(|_| {
                        s.spawn(|| {
                            while !stop.load(Ordering::Acquire) {
                                assert_eq!(entry(), 42);
                                calls.fetch_add(1, Ordering::Relaxed);
                            }
                        })
                    })
                    .collect();

                while calls.load(Ordering::Relaxed) == 0 {
                    thread::yield_now();
                }
                for index in 1..=DEAD_SITES {
                    unit.resolve_slow_path(index).unwrap();
                }
                stop.store(true, Ordering::Release);

                for runner in runners {
                    runner.join().unwrap();
                }
            });

            assert!(calls.load(Ordering::Relaxed) > 0);
            assert_eq!(runtime.stats().slow_paths_generated, DEAD_SITES as u64 + 1);
            assert_eq!(entry(), 42);
        }
    }

    #[test]
    fn test_concurrent_first_calls_patch_once_per_site() {
        const SITES: usize = 8;
        const THREADS: usize = 6;

        for policy in POLICIES {
            let runtime = test_runtime_with(JitConfig::default().with_protection(policy));
            let unit = multi_slow_path_unit(&runtime, SITES);
            let entry = entry_of(&unit);
            let barrier = Barrier::new(THREADS);

            thread::scope(|s| {
                let callers: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            (0..50).map(|_| entry()).collect::<Vec<_>>()
                        })
                    })
                    .collect();
                for caller in callers {
                    let results = caller.join().unwrap();
                    assert!(results.iter().all(|&r| r == SITES as u64 - 1));
                }
            });

            assert!((0..SITES).all(|index| unit.is_slow_path_generated(index)));
            assert_eq!(runtime.stats().slow_paths_generated, SITES as u64);
            assert!(!unit.is_invalidated());
        }
    }
}
