//! Identity of a compilation job.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

/// Opaque identity of a compiled source unit (its address).
///
/// Keys refer to units by identity only and never own them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(NonZeroUsize);

impl UnitId {
    /// Identity of the value behind `unit`
    pub fn of<T>(unit: &T) -> Self {
        let addr = unit as *const T as usize;
        // SAFETY: references are never null
        UnitId(unsafe { NonZeroUsize::new_unchecked(addr) })
    }

    /// Identity from a raw address
    pub fn from_raw(addr: NonZeroUsize) -> Self {
        UnitId(addr)
    }

    /// Raw address
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Compilation strategy, ordered from least to most optimizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tier {
    /// Template baseline JIT
    Baseline = 0,

    /// Data-flow-graph optimizing JIT
    Dfg = 1,

    /// DFG code not yet linked to a specific global object
    UnlinkedDfg = 2,

    /// Fully optimizing tier
    Ftl = 3,

    /// Optimizing tier compiled for entry from a hot loop
    FtlForOsrEntry = 4,
}

impl Tier {
    /// Every tier, least optimizing first
    pub const ALL: [Tier; 5] = [
        Tier::Baseline,
        Tier::Dfg,
        Tier::UnlinkedDfg,
        Tier::Ftl,
        Tier::FtlForOsrEntry,
    ];

    #[inline]
    pub fn is_dfg(&self) -> bool {
        matches!(self, Tier::Dfg | Tier::UnlinkedDfg)
    }

    #[inline]
    pub fn is_ftl(&self) -> bool {
        matches!(self, Tier::Ftl | Tier::FtlForOsrEntry)
    }

    #[inline]
    pub fn is_unlinked(&self) -> bool {
        matches!(self, Tier::UnlinkedDfg)
    }

    /// Any tier above baseline
    #[inline]
    pub fn is_optimizing(&self) -> bool {
        !matches!(self, Tier::Baseline)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tier::Baseline => "Baseline",
            Tier::Dfg => "DFG",
            Tier::UnlinkedDfg => "UnlinkedDFG",
            Tier::Ftl => "FTL",
            Tier::FtlForOsrEntry => "FTLForOSREntry",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one (unit, tier) compilation.
///
/// `Empty` is the default and `Deleted` marks a retired slot, so an
/// open-addressing table can keep its slot state in the key itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilationKey {
    #[default]
    Empty,
    Deleted,
    Valid { unit: UnitId, tier: Tier },
}

impl CompilationKey {
    #[inline]
    pub fn new(unit: UnitId, tier: Tier) -> Self {
        CompilationKey::Valid { unit, tier }
    }

    /// Whether this names a real compilation
    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self, CompilationKey::Valid { .. })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, CompilationKey::Empty)
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        matches!(self, CompilationKey::Deleted)
    }

    pub fn unit(&self) -> Option<UnitId> {
        match self {
            CompilationKey::Valid { unit, .. } => Some(*unit),
            _ => None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            CompilationKey::Valid { tier, .. } => Some(*tier),
            _ => None,
        }
    }

    /// Mix of the unit address and the tier
    #[inline]
    pub fn hash_value(&self) -> u64 {
        match self {
            CompilationKey::Empty => 0,
            CompilationKey::Deleted => 1,
            CompilationKey::Valid { unit, tier } => pair_hash(unit.addr() as u64, *tier as u64),
        }
    }
}

impl Hash for CompilationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

impl fmt::Display for CompilationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationKey::Empty => f.write_str("<empty>"),
            CompilationKey::Deleted => f.write_str("<deleted>"),
            CompilationKey::Valid { unit, tier } => write!(f, "({}, {})", unit, tier),
        }
    }
}

/// 64-bit finalizer over a combined pair
#[inline]
fn pair_hash(a: u64, b: u64) -> u64 {
    let mut h = a.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ b.wrapping_add(0x632B_E59B_D9B4_E019);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^ (h >> 33)
}
