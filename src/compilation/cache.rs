//! Concurrent cache of finished compilations.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::key::{CompilationKey, Tier, UnitId};
use crate::code::{CodePtr, JitCompilationTag};
use crate::unit::CompiledUnit;

/// Map from (unit, tier) to the compiled unit holding that code.
///
/// Lookups never return a guard into the map, so callers may evict while
/// holding a unit.
#[derive(Default)]
pub struct CodeCache {
    units: DashMap<CompilationKey, Arc<CompiledUnit>>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `unit` under `key`, returning the unit it replaces.
    ///
    /// Panics on sentinel keys.
    pub fn insert(&self, key: CompilationKey, unit: Arc<CompiledUnit>) -> Option<Arc<CompiledUnit>> {
        assert!(key.is_valid(), "cannot cache under sentinel key {}", key);
        debug!(target: "tieredjit::cache", %key, entry = ?unit.entry_point(), "Cached compilation");
        self.units.insert(key, unit)
    }

    pub fn get(&self, key: &CompilationKey) -> Option<Arc<CompiledUnit>> {
        let found = self.units.get(key).map(|entry| Arc::clone(entry.value()));
        trace!(target: "tieredjit::cache", %key, hit = found.is_some(), "Cache lookup");
        found
    }

    /// Entry point of the cached code for `key`
    pub fn entry_point(&self, key: &CompilationKey) -> Option<CodePtr<JitCompilationTag>> {
        self.units.get(key).map(|entry| entry.value().entry_point())
    }

    pub fn contains(&self, key: &CompilationKey) -> bool {
        self.units.contains_key(key)
    }

    pub fn remove(&self, key: &CompilationKey) -> Option<Arc<CompiledUnit>> {
        self.units.remove(key).map(|(_, unit)| unit)
    }

    /// Remove `key` only if it still maps to `unit`
    pub fn evict(&self, key: &CompilationKey, unit: &CompiledUnit) -> bool {
        let removed = self
            .units
            .remove_if(key, |_, cached| std::ptr::eq(Arc::as_ptr(cached), unit))
            .is_some();
        if removed {
            debug!(target: "tieredjit::cache", %key, "Evicted compilation");
        }
        removed
    }

    /// Remove every tier cached for `unit`. Returns how many were removed.
    pub fn invalidate_unit(&self, unit: UnitId) -> usize {
        let before = self.units.len();
        self.units.retain(|key, _| key.unit() != Some(unit));
        let removed = before.saturating_sub(self.units.len());
        debug!(target: "tieredjit::cache", %unit, removed, "Invalidated unit");
        removed
    }

    /// Most optimizing tier cached for `unit`
    pub fn best_tier(&self, unit: UnitId) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .rev()
            .find(|&tier| self.units.contains_key(&CompilationKey::new(unit, tier)))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("len", &self.units.len())
            .finish()
    }
}
