//! Compilation identity, results and bookkeeping.
//!
//! - [`CompilationKey`]: (unit, tier) identity with `Empty`/`Deleted` slot states
//! - [`Compilation`]: move-only finalized code plus byproducts
//! - [`CompilationTable`]: open-addressing table keyed by compilation keys
//! - [`Worklist`]: plans that are in flight or done
//! - [`CodeCache`]: concurrent map from keys to compiled units

mod cache;
#[allow(clippy::module_inception)]
mod compilation;
mod key;
mod table;
mod worklist;

pub use cache::CodeCache;
pub use compilation::{Compilation, OpaqueByproducts};
pub use key::{CompilationKey, Tier, UnitId};
pub use table::CompilationTable;
pub use worklist::{CompilationState, Worklist};
