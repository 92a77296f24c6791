//! Finalized code plus its byproducts.

use std::any::Any;
use std::fmt;

use crate::code::{CodePtr, CodeRef, JitCompilationTag};

/// Secondary artifacts of a compilation (debug info, profiling tables, ...).
///
/// Opaque to the JIT core; they live exactly as long as their code.
#[derive(Default)]
pub struct OpaqueByproducts {
    items: Vec<Box<dyn Any + Send + Sync>>,
}

impl OpaqueByproducts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an artifact
    pub fn push<T: Any + Send + Sync>(&mut self, item: T) {
        self.items.push(Box::new(item));
    }

    /// First artifact of type `T`
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.items.iter().find_map(|item| item.downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Debug for OpaqueByproducts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueByproducts")
            .field("count", &self.items.len())
            .finish()
    }
}

/// Finalized, executable code together with its byproducts.
///
/// Move-only: the code memory has exactly one owner, and dropping the
/// `Compilation` releases code and byproducts together. The code address
/// never changes after construction.
#[derive(Debug)]
pub struct Compilation {
    code: CodeRef<JitCompilationTag>,
    byproducts: OpaqueByproducts,
}

impl Compilation {
    /// Take ownership of finalized code and its byproducts
    pub fn new(code: CodeRef<JitCompilationTag>, byproducts: OpaqueByproducts) -> Self {
        Compilation { code, byproducts }
    }

    /// Entry point of the code
    #[inline]
    pub fn code(&self) -> CodePtr<JitCompilationTag> {
        self.code.code()
    }

    /// Owning reference to the code
    pub fn code_ref(&self) -> &CodeRef<JitCompilationTag> {
        &self.code
    }

    pub fn byproducts(&self) -> &OpaqueByproducts {
        &self.byproducts
    }

    /// Disassembly of the code, computed on each call
    pub fn disassembly(&self) -> String {
        self.code.disassembly()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::assembler::{LinkBuffer, MacroAssembler, Reg};
    use crate::config::JitConfig;
    use crate::memory::{ExecutablePool, ALLOCATION_GRANULE};

    fn finalize(pool: &Arc<ExecutablePool>) -> CodeRef<JitCompilationTag> {
        let mut masm = MacroAssembler::new();
        masm.mov_imm64(Reg::Rax, 42);
        masm.ret();
        LinkBuffer::new(masm, pool)
            .unwrap()
            .finalize_code("answer")
            .unwrap()
    }

    fn pool() -> Arc<ExecutablePool> {
        ExecutablePool::new(&JitConfig::default().with_pool_size(64 * 1024)).unwrap()
    }

    #[test]
    fn test_code_matches_reference() {
        let pool = pool();
        let code = finalize(&pool);
        let entry = code.code();
        let compilation = Compilation::new(code, OpaqueByproducts::new());
        assert_eq!(compilation.code(), entry);
        assert_eq!(compilation.code_ref().code(), entry);
    }

    #[test]
    fn test_move_releases_once() {
        let pool = pool();
        let compilation = Compilation::new(finalize(&pool), OpaqueByproducts::new());
        let entry = compilation.code();
        assert_eq!(pool.bytes_in_use(), ALLOCATION_GRANULE);

        let moved = compilation;
        assert_eq!(moved.code(), entry);
        let boxed = Box::new(moved);
        assert_eq!(pool.bytes_in_use(), ALLOCATION_GRANULE);

        drop(boxed);
        assert_eq!(pool.bytes_in_use(), 0);
    }

    #[test]
    fn test_byproducts_lookup() {
        #[derive(Debug, PartialEq)]
        struct LineTable(Vec<u32>);

        let pool = pool();
        let mut byproducts = OpaqueByproducts::new();
        byproducts.push(LineTable(vec![1, 2, 3]));
        byproducts.push("profile");

        let compilation = Compilation::new(finalize(&pool), byproducts);
        assert_eq!(compilation.byproducts().len(), 2);
        assert_eq!(
            compilation.byproducts().get::<LineTable>(),
            Some(&LineTable(vec![1, 2, 3]))
        );
        assert_eq!(compilation.byproducts().get::<&'static str>(), Some(&"profile"));
        assert!(compilation.byproducts().get::<u64>().is_none());
    }

    #[test]
    fn test_disassembly_on_demand() {
        let pool = pool();
        let compilation = Compilation::new(finalize(&pool), OpaqueByproducts::new());
        let text = compilation.disassembly();
        assert!(text.contains("mov rax, 0x2a"));
        assert!(text.contains("ret"));
        assert_eq!(text, compilation.disassembly());
    }
}
