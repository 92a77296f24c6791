//! JIT error types.
//!
//! This module defines [`JitError`] and [`JitResult`] for the recoverable
//! failures of the slow-path machinery. Broken compiler invariants (double
//! generation, exception jumps without a target) are not represented here:
//! they are fatal and panic at the point of detection.

use std::fmt;

use crate::compilation::UnitId;

// =============================================================================
// JitResult and JitError
// =============================================================================

/// Error types for code emission, finalization and patching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// The executable pool has no free run large enough for the request
    ExecutableMemoryExhausted { requested: usize, available: usize },

    /// The executable pool could not be mapped
    PoolCreation(String),

    /// Changing page protection failed
    MemoryProtection { operation: &'static str, reason: String },

    /// A rel32 branch cannot reach its destination
    BranchOutOfRange { from: usize, to: usize },

    /// The containing unit was invalidated after a failed generation
    UnitInvalidated(UnitId),

    /// A slow-path index does not name a descriptor of the unit
    InvalidSlowPathIndex { index: usize, count: usize },

    /// Configuration could not be read
    ConfigIo(String),

    /// Configuration is syntactically or semantically invalid
    InvalidConfig(String),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::ExecutableMemoryExhausted {
                requested,
                available,
            } => write!(
                f,
                "Out of executable memory: requested {} bytes, {} available",
                requested, available
            ),
            JitError::PoolCreation(msg) => write!(f, "Failed to map executable pool: {}", msg),
            JitError::MemoryProtection { operation, reason } => {
                write!(f, "Memory protection change failed ({}): {}", operation, reason)
            }
            JitError::BranchOutOfRange { from, to } => {
                write!(f, "Branch at {:#x} cannot reach {:#x}", from, to)
            }
            JitError::UnitInvalidated(unit) => write!(f, "Compiled unit {} was invalidated", unit),
            JitError::InvalidSlowPathIndex { index, count } => write!(
                f,
                "Slow path index {} out of range (unit has {})",
                index, count
            ),
            JitError::ConfigIo(msg) => write!(f, "Failed to read configuration: {}", msg),
            JitError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for JitError {}

/// Result type for JIT operations
pub type JitResult<T> = Result<T, JitError>;
