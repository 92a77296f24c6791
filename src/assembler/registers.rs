//! x86-64 general purpose registers and register sets.

use std::fmt;

/// x86-64 general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// SysV integer argument registers, in order
pub const ARGUMENT_REGISTERS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Register holding integer return values
pub const RETURN_REGISTER: Reg = Reg::Rax;

/// Scratch register slow-path code may clobber after a call
pub const SCRATCH_REGISTER: Reg = Reg::R11;

impl Reg {
    /// All sixteen registers in encoding order
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Register number (0-15)
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Low three bits, as used in ModRM/opcode fields
    #[inline]
    pub const fn low_bits(self) -> u8 {
        self.code() & 0b111
    }

    /// Whether encoding needs REX.B / REX.R
    #[inline]
    pub const fn is_extended(self) -> bool {
        self.code() >= 8
    }

    /// Look a register up by number
    #[inline]
    pub fn from_code(code: u8) -> Option<Reg> {
        Reg::ALL.get(code as usize).copied()
    }

    /// Clobbered by a SysV call
    #[inline]
    pub const fn is_caller_saved(self) -> bool {
        matches!(
            self,
            Reg::Rax
                | Reg::Rcx
                | Reg::Rdx
                | Reg::Rsi
                | Reg::Rdi
                | Reg::R8
                | Reg::R9
                | Reg::R10
                | Reg::R11
        )
    }

    /// Assembly name
    pub const fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }

    /// 32-bit sub-register name
    pub const fn name32(self) -> &'static str {
        match self {
            Reg::Rax => "eax",
            Reg::Rcx => "ecx",
            Reg::Rdx => "edx",
            Reg::Rbx => "ebx",
            Reg::Rsp => "esp",
            Reg::Rbp => "ebp",
            Reg::Rsi => "esi",
            Reg::Rdi => "edi",
            Reg::R8 => "r8d",
            Reg::R9 => "r9d",
            Reg::R10 => "r10d",
            Reg::R11 => "r11d",
            Reg::R12 => "r12d",
            Reg::R13 => "r13d",
            Reg::R14 => "r14d",
            Reg::R15 => "r15d",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// RegisterSet
// =============================================================================

/// A set of general purpose registers, one bit per register
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegisterSet(u16);

impl RegisterSet {
    /// The empty set
    pub const fn empty() -> Self {
        RegisterSet(0)
    }

    /// Every register the SysV ABI lets a callee clobber
    pub fn caller_saved() -> Self {
        Reg::ALL.into_iter().filter(|r| r.is_caller_saved()).collect()
    }

    /// Build from a list of registers
    pub fn from_regs(regs: &[Reg]) -> Self {
        regs.iter().copied().collect()
    }

    /// Add a register
    #[inline]
    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg.code();
    }

    /// Remove a register
    #[inline]
    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.code());
    }

    /// Copy of the set without `reg`
    #[inline]
    pub fn without(mut self, reg: Reg) -> Self {
        self.remove(reg);
        self
    }

    /// Membership test
    #[inline]
    pub fn contains(&self, reg: Reg) -> bool {
        self.0 & (1 << reg.code()) != 0
    }

    /// Set intersection
    #[inline]
    pub fn intersection(&self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 & other.0)
    }

    /// Number of registers
    #[inline]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no register is set
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Registers in encoding order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Reg> {
        let bits = self.0;
        Reg::ALL
            .into_iter()
            .filter(move |r| bits & (1 << r.code()) != 0)
    }

    /// Subset a SysV call may clobber, i.e. what must be saved around a call
    pub fn to_preserve_across_call(&self) -> RegisterSet {
        self.intersection(RegisterSet::caller_saved())
    }

    /// Raw bit pattern
    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl FromIterator<Reg> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut set = RegisterSet::empty();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
