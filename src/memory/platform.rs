//! Platform-specific page mapping and protection.

use std::io;

/// Page permissions used by the executable pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadExecute,
    ReadWriteExecute,
}

#[cfg(unix)]
mod imp {
    use super::Protection;
    use std::io;
    use std::ptr;

    fn prot_flags(protection: Protection) -> libc::c_int {
        match protection {
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub fn page_size() -> usize {
        // SAFETY: sysconf is safe to call with _SC_PAGESIZE
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    /// Map `size` bytes of anonymous memory.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of the page size.
    pub unsafe fn map(size: usize, protection: Protection) -> io::Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot_flags(protection),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    /// # Safety
    /// `ptr`/`size` must describe a mapping returned by [`map`].
    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// # Safety
    /// `ptr` must be page aligned and `ptr..ptr+size` inside a live mapping.
    pub unsafe fn protect(ptr: *mut u8, size: usize, protection: Protection) -> io::Result<()> {
        if unsafe { libc::mprotect(ptr as *mut _, size, prot_flags(protection)) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::Protection;
    use std::io;
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    fn page_flags(protection: Protection) -> u32 {
        match protection {
            Protection::ReadExecute => PAGE_EXECUTE_READ,
            Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        }
    }

    pub fn page_size() -> usize {
        // SAFETY: SYSTEM_INFO can be zero-initialized and GetSystemInfo always succeeds
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    pub unsafe fn map(size: usize, protection: Protection) -> io::Result<*mut u8> {
        let ptr = unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, page_flags(protection))
        };
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn protect(ptr: *mut u8, size: usize, protection: Protection) -> io::Result<()> {
        let mut old = 0;
        if unsafe { VirtualProtect(ptr as *mut _, size, page_flags(protection), &mut old) } != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

pub use imp::page_size;

/// Map anonymous memory.
///
/// # Safety
/// `size` must be a non-zero multiple of the page size.
pub unsafe fn map(size: usize, protection: Protection) -> io::Result<*mut u8> {
    unsafe { imp::map(size, protection) }
}

/// Unmap memory obtained from [`map`].
///
/// # Safety
/// `ptr`/`size` must describe a live mapping returned by [`map`].
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    unsafe { imp::unmap(ptr, size) }
}

/// Change protection on a page-aligned range.
///
/// # Safety
/// The range must lie within a live mapping and start on a page boundary.
pub unsafe fn protect(ptr: *mut u8, size: usize, protection: Protection) -> io::Result<()> {
    unsafe { imp::protect(ptr, size, protection) }
}
