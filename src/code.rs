//! Tagged code pointers and owning code references.
//!
//! Every code address handled by the JIT carries a zero-sized tag naming what
//! kind of location it is (a compilation entry, a stub, a patchable jump, ...).
//! Tags cannot be mixed up by accident; changing one requires an explicit
//! [`CodePtr::retagged`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::assembler::disassemble;
use crate::memory::ExecutableMemoryHandle;

/// Marker for a kind of code location
pub trait PtrTag: 'static {
    /// Human-readable tag name used in debug output
    const NAME: &'static str;
}

macro_rules! ptr_tags {
    ($($(#[$doc:meta])* $name:ident => $label:literal,)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {}

            impl PtrTag for $name {
                const NAME: &'static str = $label;
            }
        )*
    };
}

ptr_tags! {
    /// Entry point of a finalized compilation
    JitCompilationTag => "JITCompilation",
    /// Entry point of a lazily generated slow-path stub
    StubRoutineTag => "JITStubRoutine",
    /// A patchable jump instruction inside finalized code
    JumpTag => "Jump",
    /// An ordinary label inside finalized code
    LabelTag => "Label",
    /// An exception handler entry
    ExceptionHandlerTag => "ExceptionHandler",
    /// A host function callable from JIT code
    OperationTag => "Operation",
}

/// Address of executable code, tagged with the kind of location it names
pub struct CodePtr<T: PtrTag> {
    addr: NonNull<u8>,
    _tag: PhantomData<T>,
}

// SAFETY: a code pointer is an address into read-only executable memory
unsafe impl<T: PtrTag> Send for CodePtr<T> {}
unsafe impl<T: PtrTag> Sync for CodePtr<T> {}

impl<T: PtrTag> CodePtr<T> {
    /// Wrap a non-null address
    #[inline]
    pub fn new(addr: NonNull<u8>) -> Self {
        CodePtr {
            addr,
            _tag: PhantomData,
        }
    }

    /// Wrap a raw address; `None` for null
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self::new)
    }

    /// Wrap the address of a host function
    #[inline]
    pub fn from_fn_addr(addr: *const ()) -> Option<Self> {
        Self::from_addr(addr as usize)
    }

    /// Raw pointer value
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.addr.as_ptr()
    }

    /// Address as an integer
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    /// Pointer `offset` bytes further on, same tag
    #[inline]
    pub fn offset(&self, offset: usize) -> Self {
        // SAFETY: the result is only used as an address, never dereferenced here
        CodePtr::new(unsafe { NonNull::new_unchecked(self.addr.as_ptr().wrapping_add(offset)) })
    }

    /// Reinterpret as a different kind of location
    #[inline]
    pub fn retagged<U: PtrTag>(self) -> CodePtr<U> {
        CodePtr::new(self.addr)
    }
}

impl<T: PtrTag> Clone for CodePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: PtrTag> Copy for CodePtr<T> {}

impl<T: PtrTag> PartialEq for CodePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T: PtrTag> Eq for CodePtr<T> {}

impl<T: PtrTag> Hash for CodePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl<T: PtrTag> fmt::Debug for CodePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}({})", self.addr.as_ptr(), T::NAME)
    }
}

impl<T: PtrTag> fmt::Display for CodePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.addr.as_ptr())
    }
}

// =============================================================================
// CodeRef
// =============================================================================

/// Unique owner of a block of finalized executable code.
///
/// Not `Clone`: the executable memory is released exactly once, when the
/// owning `CodeRef` is dropped.
pub struct CodeRef<T: PtrTag> {
    memory: ExecutableMemoryHandle,
    entry: CodePtr<T>,
    size: usize,
}

impl<T: PtrTag> CodeRef<T> {
    /// Take ownership of finalized memory whose code starts at `entry`
    pub(crate) fn new(memory: ExecutableMemoryHandle, entry: CodePtr<T>, size: usize) -> Self {
        debug_assert!(memory.pool().contains(entry.addr(), size));
        CodeRef {
            memory,
            entry,
            size,
        }
    }

    /// Entry point
    #[inline]
    pub fn code(&self) -> CodePtr<T> {
        self.entry
    }

    /// Size of the emitted code in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of the emitted code
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the memory stays mapped and readable while `self` owns it
        unsafe { std::slice::from_raw_parts(self.entry.as_ptr(), self.size) }
    }

    /// Whether `addr` falls inside this code
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.entry.addr() && addr < self.entry.addr() + self.size
    }

    /// Disassemble the code. Computed on every call.
    pub fn disassembly(&self) -> String {
        disassemble(self.bytes(), self.entry.addr())
    }

    /// Underlying executable memory
    pub fn memory(&self) -> &ExecutableMemoryHandle {
        &self.memory
    }
}

impl<T: PtrTag> fmt::Debug for CodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRef")
            .field("entry", &self.entry)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_ptr_equality_and_retag() {
        let a = CodePtr::<LabelTag>::from_addr(0x1000).unwrap();
        let b = CodePtr::<LabelTag>::from_addr(0x1000).unwrap();
        assert_eq!(a, b);

        let stub: CodePtr<StubRoutineTag> = a.retagged();
        assert_eq!(stub.addr(), 0x1000);
        assert_eq!(a.offset(8).addr(), 0x1008);
    }

    #[test]
    fn test_null_rejected() {
        assert!(CodePtr::<JumpTag>::from_addr(0).is_none());
    }

    #[test]
    fn test_debug_shows_tag() {
        let p = CodePtr::<StubRoutineTag>::from_addr(0x40).unwrap();
        assert_eq!(format!("{:?}", p), "0x40(JITStubRoutine)");
    }
}
