//! Per-context JIT runtime: shared pool, caches and statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::compilation::{CodeCache, CompilationKey, UnitId, Worklist};
use crate::config::JitConfig;
use crate::error::JitResult;
use crate::memory::ExecutablePool;
use crate::unit::CompiledUnit;

/// Counters updated by the slow-path machinery
#[derive(Debug, Default)]
pub struct JitStats {
    slow_paths_generated: AtomicU64,
    patches_applied: AtomicU64,
    stub_bytes: AtomicU64,
    deoptimizations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl JitStats {
    /// A stub was generated and its call site patched
    pub(crate) fn record_generation(&self, stub_bytes: usize) {
        self.slow_paths_generated.fetch_add(1, Ordering::Relaxed);
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
        self.stub_bytes.fetch_add(stub_bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_deoptimization(&self) {
        self.deoptimizations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.cache_hits } else { &self.cache_misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            slow_paths_generated: self.slow_paths_generated.load(Ordering::Relaxed),
            patches_applied: self.patches_applied.load(Ordering::Relaxed),
            stub_bytes: self.stub_bytes.load(Ordering::Relaxed),
            deoptimizations: self.deoptimizations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`JitStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub slow_paths_generated: u64,
    pub patches_applied: u64,
    pub stub_bytes: u64,
    pub deoptimizations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Everything one execution context needs to run lazily patched code
pub struct JitRuntime {
    config: JitConfig,
    pool: Arc<ExecutablePool>,
    cache: Arc<CodeCache>,
    worklist: Arc<Worklist>,
    stats: Arc<JitStats>,
}

impl JitRuntime {
    /// Map the executable pool and set up empty caches
    pub fn new(config: JitConfig) -> JitResult<Self> {
        let pool = ExecutablePool::new(&config)?;
        debug!(
            target: "tieredjit::unit",
            pool_size = pool.size(),
            protection = ?config.protection,
            on_finalize_failure = ?config.on_finalize_failure,
            "Created JIT runtime"
        );
        Ok(JitRuntime {
            config,
            pool,
            cache: Arc::new(CodeCache::new()),
            worklist: Arc::new(Worklist::new()),
            stats: Arc::new(JitStats::default()),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ExecutablePool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn worklist(&self) -> &Worklist {
        &self.worklist
    }

    pub(crate) fn worklist_handle(&self) -> &Arc<Worklist> {
        &self.worklist
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &Arc<JitStats> {
        &self.stats
    }

    /// Cached unit for `key`, counting the hit or miss
    pub fn lookup(&self, key: CompilationKey) -> Option<Arc<CompiledUnit>> {
        let found = self.cache.get(&key);
        self.stats.record_lookup(found.is_some());
        found
    }

    /// Publish a finished unit: cache it and complete its worklist plan
    pub fn install(&self, unit: Arc<CompiledUnit>) -> Option<Arc<CompiledUnit>> {
        let key = unit.key();
        let replaced = self.cache.insert(key, unit);
        self.worklist.complete(key);
        replaced
    }

    /// Drop every cached tier and plan for `source`
    pub fn invalidate_unit(&self, source: UnitId) -> usize {
        let removed = self.cache.invalidate_unit(source);
        self.worklist.retire_unit(source);
        if removed > 0 {
            warn!(target: "tieredjit::cache", unit = %source, removed, "Invalidated compiled unit");
        }
        removed
    }
}

impl std::fmt::Debug for JitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRuntime")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = JitStats::default();
        stats.record_generation(32);
        stats.record_generation(16);
        stats.record_lookup(true);
        stats.record_lookup(false);
        stats.record_lookup(false);
        stats.record_deoptimization();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                slow_paths_generated: 2,
                patches_applied: 2,
                stub_bytes: 48,
                deoptimizations: 1,
                cache_hits: 1,
                cache_misses: 2,
            }
        );
    }

    #[test]
    fn test_runtime_rejects_invalid_config() {
        let err = JitRuntime::new(JitConfig::default().with_pool_size(16)).unwrap_err();
        assert!(matches!(err, crate::error::JitError::InvalidConfig(_)));
    }
}
