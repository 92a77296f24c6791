//! Executable memory pool.
//!
//! All JIT code for a runtime is carved out of one contiguous mapping. This
//! keeps every rel32 branch between a unit, its dispatch thunks and its
//! lazily generated stubs in range, and it gives the re-patcher a single
//! place to validate addresses and serialize protection changes.
//!
//! Allocations are carved at [`ALLOCATION_GRANULE`] granularity, so many
//! small stubs share a page. Under write-xor-execute the pool is mapped
//! read-execute and every write widens the covering pages to
//! read-write-execute for the duration of the write only. Pages never lose
//! execute permission, so other threads may keep running code on a page
//! while it is written.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::platform::{self, Protection};
use crate::config::{JitConfig, ProtectionPolicy};
use crate::error::{JitError, JitResult};

/// Allocation alignment and size granularity in bytes
pub const ALLOCATION_GRANULE: usize = 64;

/// A contiguous executable mapping with a first-fit allocator
pub struct ExecutablePool {
    /// Start of the mapping
    base: NonNull<u8>,
    /// Mapping size in bytes (page multiple)
    size: usize,
    /// System page size
    page_size: usize,
    /// Page protection strategy
    protection: ProtectionPolicy,
    /// Free runs: offset -> length
    free: Mutex<BTreeMap<usize, usize>>,
    /// Bytes currently handed out
    in_use: AtomicUsize,
    /// Serializes writes into finalized code
    patch_lock: Mutex<()>,
}

// SAFETY: the mapping is owned by the pool and all mutation of the free list
// and of finalized code goes through mutexes.
unsafe impl Send for ExecutablePool {}
unsafe impl Sync for ExecutablePool {}

impl ExecutablePool {
    /// Map a pool sized and protected according to `config`
    pub fn new(config: &JitConfig) -> JitResult<Arc<Self>> {
        config.validate()?;

        let page_size = platform::page_size();
        let size = align_up(config.pool_size, page_size);
        let initial = match config.protection {
            ProtectionPolicy::WriteXorExecute => Protection::ReadExecute,
            ProtectionPolicy::ReadWriteExecute => Protection::ReadWriteExecute,
        };

        // SAFETY: size is a non-zero page multiple
        let ptr = unsafe { platform::map(size, initial) }
            .map_err(|e| JitError::PoolCreation(e.to_string()))?;
        let base = NonNull::new(ptr)
            .ok_or_else(|| JitError::PoolCreation("mapping returned null".to_string()))?;

        let mut free = BTreeMap::new();
        free.insert(0, size);

        debug!(
            target: "tieredjit::memory",
            base = ?base,
            size,
            page_size,
            protection = ?config.protection,
            "Mapped executable pool"
        );

        Ok(Arc::new(ExecutablePool {
            base,
            size,
            page_size,
            protection: config.protection,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
            patch_lock: Mutex::new(()),
        }))
    }

    /// Allocate at least `len` bytes for code emission.
    ///
    /// The run is rounded to [`ALLOCATION_GRANULE`] and may share pages with
    /// other live allocations. Fill it with [`ExecutableMemoryHandle::write`].
    pub fn allocate(self: &Arc<Self>, len: usize) -> JitResult<ExecutableMemoryHandle> {
        let rounded = align_up(len.max(1), ALLOCATION_GRANULE);

        let offset = {
            let mut free = self.free.lock();
            let found = free
                .iter()
                .find(|(_, run)| **run >= rounded)
                .map(|(&offset, &run)| (offset, run));

            let Some((offset, run)) = found else {
                let available = free.values().sum();
                return Err(JitError::ExecutableMemoryExhausted {
                    requested: rounded,
                    available,
                });
            };

            free.remove(&offset);
            if run > rounded {
                free.insert(offset + rounded, run - rounded);
            }
            offset
        };

        self.in_use.fetch_add(rounded, Ordering::Relaxed);
        trace!(target: "tieredjit::memory", offset, len = rounded, "Allocated executable memory");

        Ok(ExecutableMemoryHandle {
            pool: Arc::clone(self),
            offset,
            len: rounded,
        })
    }

    /// Return a run to the free list, merging with its neighbours
    fn release(&self, offset: usize, len: usize) {
        let mut free = self.free.lock();
        let mut start = offset;
        let mut run = len;

        if let Some((&prev, &prev_len)) = free.range(..offset).next_back() {
            if prev + prev_len == offset {
                free.remove(&prev);
                start = prev;
                run += prev_len;
            }
        }
        if let Some(&next_len) = free.get(&(offset + len)) {
            free.remove(&(offset + len));
            run += next_len;
        }
        free.insert(start, run);
    }

    /// Run `write` with the pages covering `addr..addr+len` writable.
    ///
    /// Under write-xor-execute the pages are switched to read-write-execute,
    /// never to read-write, and back to read-execute afterwards. Code on
    /// those pages stays runnable by other threads throughout.
    ///
    /// Holds the pool-wide patch lock for the whole sequence so concurrent
    /// writes to the same page cannot drop its write permission under each
    /// other.
    ///
    /// # Safety
    /// `addr..addr+len` must lie inside memory owned by this pool, and no
    /// other thread may be writing the same bytes outside this lock.
    pub(crate) unsafe fn with_writable_code<R>(
        &self,
        addr: usize,
        len: usize,
        write: impl FnOnce() -> R,
    ) -> JitResult<R> {
        let _guard: MutexGuard<'_, ()> = self.patch_lock.lock();

        if self.protection == ProtectionPolicy::ReadWriteExecute {
            return Ok(write());
        }

        let page_start = align_down(addr, self.page_size);
        let page_end = align_up(addr + len, self.page_size);
        let page_ptr = page_start as *mut u8;
        let span = page_end - page_start;

        unsafe { platform::protect(page_ptr, span, Protection::ReadWriteExecute) }.map_err(|e| {
            JitError::MemoryProtection {
                operation: "unprotect for patching",
                reason: e.to_string(),
            }
        })?;

        let result = write();

        unsafe { platform::protect(page_ptr, span, Protection::ReadExecute) }.map_err(|e| {
            JitError::MemoryProtection {
                operation: "reprotect after patching",
                reason: e.to_string(),
            }
        })?;

        Ok(result)
    }

    /// Whether `addr..addr+len` lies inside the pool mapping
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr.saturating_add(len) <= start + self.size
    }

    /// Start of the mapping
    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Total size of the mapping
    pub fn size(&self) -> usize {
        self.size
    }

    /// System page size used for rounding
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes currently allocated
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Bytes currently free (possibly fragmented)
    pub fn bytes_available(&self) -> usize {
        self.free.lock().values().sum()
    }

    /// Page protection strategy
    pub fn protection(&self) -> ProtectionPolicy {
        self.protection
    }
}

impl Drop for ExecutablePool {
    fn drop(&mut self) {
        debug!(target: "tieredjit::memory", base = ?self.base, size = self.size, "Unmapping executable pool");
        // SAFETY: the pool owns the mapping and every handle holds an Arc to it
        unsafe { platform::unmap(self.base.as_ptr(), self.size) };
    }
}

impl fmt::Debug for ExecutablePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutablePool")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("in_use", &self.bytes_in_use())
            .field("protection", &self.protection)
            .finish()
    }
}

// =============================================================================
// Executable Memory Handle
// =============================================================================

/// Unique owner of a granule-rounded run of pool memory.
///
/// The memory returns to the pool when the handle is dropped.
pub struct ExecutableMemoryHandle {
    pool: Arc<ExecutablePool>,
    offset: usize,
    len: usize,
}

impl ExecutableMemoryHandle {
    /// Start of the allocation
    #[inline]
    pub fn start(&self) -> *mut u8 {
        // SAFETY: offset is inside the mapping for the lifetime of the handle
        unsafe { self.pool.base.as_ptr().add(self.offset) }
    }

    /// Allocated length (granule multiple)
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; allocations are at least one granule
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pool this memory came from
    pub fn pool(&self) -> &Arc<ExecutablePool> {
        &self.pool
    }

    /// Copy `code` to the start of the allocation and leave it executable
    pub(crate) fn write(&mut self, code: &[u8]) -> JitResult<()> {
        assert!(code.len() <= self.len, "code does not fit its allocation");
        let start = self.start();
        // SAFETY: the handle uniquely owns start..start+len inside the pool
        unsafe {
            self.pool.with_writable_code(start as usize, code.len(), || {
                std::ptr::copy_nonoverlapping(code.as_ptr(), start, code.len())
            })
        }
    }
}

impl Drop for ExecutableMemoryHandle {
    fn drop(&mut self) {
        trace!(target: "tieredjit::memory", offset = self.offset, len = self.len, "Released executable memory");
        self.pool.in_use.fetch_sub(self.len, Ordering::Relaxed);
        self.pool.release(self.offset, self.len);
    }
}

impl fmt::Debug for ExecutableMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableMemoryHandle")
            .field("start", &self.start())
            .field("len", &self.len)
            .finish()
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(pages: usize) -> Arc<ExecutablePool> {
        let page = platform::page_size();
        ExecutablePool::new(&JitConfig::default().with_pool_size(pages * page))
            .expect("pool maps")
    }

    #[test]
    fn test_allocation_is_granule_rounded() {
        let pool = small_pool(4);
        let handle = pool.allocate(10).expect("allocates");
        assert_eq!(handle.len(), ALLOCATION_GRANULE);
        assert_eq!(handle.start() as usize % ALLOCATION_GRANULE, 0);
        assert_eq!(pool.bytes_in_use(), ALLOCATION_GRANULE);
        assert!(pool.contains(handle.start() as usize, handle.len()));
    }

    #[test]
    fn test_small_allocations_share_a_page() {
        let pool = small_pool(2);
        let handles: Vec<_> = (0..pool.page_size() / ALLOCATION_GRANULE)
            .map(|_| pool.allocate(40).expect("fits in the first page"))
            .collect();
        let first_page = align_down(handles[0].start() as usize, pool.page_size());
        assert!(handles
            .iter()
            .all(|h| align_down(h.start() as usize, pool.page_size()) == first_page));
        assert_eq!(pool.bytes_in_use(), pool.page_size());
    }

    #[test]
    fn test_release_returns_memory() {
        let pool = small_pool(4);
        {
            let _a = pool.allocate(1).unwrap();
            let _b = pool.allocate(100).unwrap();
            assert_eq!(pool.bytes_in_use(), 3 * ALLOCATION_GRANULE);
        }
        assert_eq!(pool.bytes_in_use(), 0);
        assert_eq!(pool.bytes_available(), pool.size());
    }

    #[test]
    fn test_exhaustion_reports_error() {
        let pool = small_pool(2);
        let _a = pool.allocate(pool.page_size()).unwrap();
        let _b = pool.allocate(pool.page_size() - ALLOCATION_GRANULE).unwrap();
        let err = pool.allocate(2 * ALLOCATION_GRANULE).unwrap_err();
        assert_eq!(
            err,
            JitError::ExecutableMemoryExhausted {
                requested: 2 * ALLOCATION_GRANULE,
                available: ALLOCATION_GRANULE
            }
        );
    }

    #[test]
    fn test_free_runs_coalesce() {
        let pool = small_pool(3);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(1).unwrap();
        let c = pool.allocate(1).unwrap();
        drop(a);
        drop(c);
        drop(b);

        // Everything merged back into one run that fits the whole pool
        let all = pool.allocate(pool.size()).expect("coalesced run");
        assert_eq!(all.len(), pool.size());
    }

    #[test]
    fn test_write_leaves_code_readable() {
        for protection in [ProtectionPolicy::WriteXorExecute, ProtectionPolicy::ReadWriteExecute] {
            let page = platform::page_size();
            let config = JitConfig::default()
                .with_pool_size(2 * page)
                .with_protection(protection);
            let pool = ExecutablePool::new(&config).unwrap();
            let mut first = pool.allocate(4).unwrap();
            let mut second = pool.allocate(4).unwrap();
            first.write(&[0x90, 0x90, 0xC3]).expect("writes");
            second.write(&[0xC3]).expect("writes next to live code");

            let bytes = unsafe { std::slice::from_raw_parts(first.start(), 3) };
            assert_eq!(bytes, &[0x90, 0x90, 0xC3]);
            assert_eq!(unsafe { *second.start() }, 0xC3);
        }
    }

    #[test]
    fn test_writable_window_keeps_page_executable() {
        let pool = small_pool(2);
        let handle = pool.allocate(8).unwrap();
        let start = handle.start() as usize;
        let seen = unsafe { pool.with_writable_code(start, 8, || current_protection(start)) }
            .unwrap();
        if let Some(flags) = seen {
            assert!(flags.contains('x'), "page lost execute permission: {flags}");
            assert!(flags.contains('w'), "page not writable: {flags}");
        }
        if let Some(flags) = current_protection(start) {
            assert_eq!(&flags[..3], "r-x");
        }
    }

    /// Permission flags of the mapping holding `addr`, where the platform exposes them
    fn current_protection(addr: usize) -> Option<String> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        maps.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let (lo, hi) = fields.next()?.split_once('-')?;
            let lo = usize::from_str_radix(lo, 16).ok()?;
            let hi = usize::from_str_radix(hi, 16).ok()?;
            (lo <= addr && addr < hi).then(|| fields.next().map(str::to_string))?
        })
    }
}
