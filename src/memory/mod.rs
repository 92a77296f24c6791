//! Executable memory and live-code patching.
//!
//! - [`ExecutablePool`]: one contiguous mapping that all JIT code is carved from
//! - [`ExecutableMemoryHandle`]: RAII owner of a granule-rounded run of the pool
//! - [`repatch_jump`]: atomic rewrite of a patchable branch in finalized code

mod executable;
mod patch;
pub(crate) mod platform;

pub use executable::{ExecutableMemoryHandle, ExecutablePool, ALLOCATION_GRANULE};
pub use patch::{flush_instruction_cache, repatch_jump};
