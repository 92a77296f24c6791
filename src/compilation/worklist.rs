//! In-flight compilation plans.
//!
//! Tracks which (unit, tier) compilations have been requested and which have
//! finished, so a tiering decision never enqueues the same plan twice and a
//! thread that needs the result can block until it lands.

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::key::{CompilationKey, UnitId};
use super::table::CompilationTable;

/// Progress of one compilation plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationState {
    /// Never requested, or retired
    NotKnown,
    /// Enqueued and not finished
    Compiling,
    /// Finished; the result is in the code cache
    Compiled,
}

#[derive(Debug, Clone, Copy)]
struct PlanState {
    state: CompilationState,
    /// Enqueue attempts, including the one that created the plan
    requests: u32,
}

/// Table of compilation plans guarded by one lock
#[derive(Debug, Default)]
pub struct Worklist {
    plans: Mutex<CompilationTable<PlanState>>,
    /// Signalled whenever a plan completes or is retired
    changed: Condvar,
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a compilation. Returns false if the plan already exists.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `Empty` or `Deleted`.
    pub fn enqueue(&self, key: CompilationKey) -> bool {
        assert!(key.is_valid(), "cannot track sentinel key {}", key);
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get_mut(&key) {
            plan.requests += 1;
            return false;
        }
        plans.insert(
            key,
            PlanState {
                state: CompilationState::Compiling,
                requests: 1,
            },
        );
        debug!(target: "tieredjit::worklist", %key, "Enqueued compilation");
        true
    }

    pub fn compilation_state(&self, key: CompilationKey) -> CompilationState {
        self.plans
            .lock()
            .get(&key)
            .map_or(CompilationState::NotKnown, |plan| plan.state)
    }

    /// Number of times `key` was requested
    pub fn request_count(&self, key: CompilationKey) -> u32 {
        self.plans.lock().get(&key).map_or(0, |plan| plan.requests)
    }

    /// Mark a plan finished and wake waiters
    ///
    /// # Panics
    ///
    /// Panics if `key` is `Empty` or `Deleted`.
    pub fn complete(&self, key: CompilationKey) {
        assert!(key.is_valid(), "cannot track sentinel key {}", key);
        let mut plans = self.plans.lock();
        match plans.get_mut(&key) {
            Some(plan) => plan.state = CompilationState::Compiled,
            None => {
                plans.insert(
                    key,
                    PlanState {
                        state: CompilationState::Compiled,
                        requests: 0,
                    },
                );
            }
        }
        debug!(target: "tieredjit::worklist", %key, "Compilation complete");
        self.changed.notify_all();
    }

    /// Block while `key` is compiling; returns the state it settled in
    pub fn wait_until_compiled(&self, key: CompilationKey) -> CompilationState {
        let mut plans = self.plans.lock();
        loop {
            let state = plans
                .get(&key)
                .map_or(CompilationState::NotKnown, |plan| plan.state);
            if state != CompilationState::Compiling {
                return state;
            }
            self.changed.wait(&mut plans);
        }
    }

    /// Drop the plan for `key` so it can be requested again.
    /// Returns whether a plan existed.
    pub fn retire(&self, key: CompilationKey) -> bool {
        let retired = self.plans.lock().remove(&key).is_some();
        if retired {
            debug!(target: "tieredjit::worklist", %key, "Retired plan");
            self.changed.notify_all();
        }
        retired
    }

    /// Drop every plan for `unit`, leaving tombstones. Returns how many.
    pub fn retire_unit(&self, unit: UnitId) -> usize {
        let mut plans = self.plans.lock();
        let before = plans.len();
        plans.retain(|key, _| key.unit() != Some(unit));
        let retired = before - plans.len();
        if retired > 0 {
            debug!(target: "tieredjit::worklist", %unit, retired, "Retired plans");
            self.changed.notify_all();
        }
        retired
    }

    /// Plans currently tracked
    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
