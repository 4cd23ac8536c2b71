//! # Page Allocator
//!
//! Reserves address space and changes its access protection. Both the
//! executable arena and the linear-memory plane are built on [`PageBlock`].

use core::ptr::NonNull;
use std::io;
use std::sync::OnceLock;

use bitflags::bitflags;

bitflags! {
    /// Memory protection flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Read permission.
        const READ = 1 << 0;
        /// Write permission.
        const WRITE = 1 << 1;
        /// Execute permission.
        const EXEC = 1 << 2;

        /// Read only.
        const READ_ONLY = Self::READ.bits();
        /// Read + Write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Execute.
        const READ_EXECUTE = Self::READ.bits() | Self::EXEC.bits();
    }
}

impl Protection {
    /// No access.
    pub const NONE: Protection = Protection::empty();

    /// Check if writable.
    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Check if executable.
    pub fn is_executable(&self) -> bool {
        self.contains(Self::EXEC)
    }

    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Host page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Round `value` up to a multiple of the host page size.
pub fn page_align(value: usize) -> usize {
    let page = page_size();
    (value + page - 1) & !(page - 1)
}

/// Lowest address the calling thread's stack may grow to, one page above its
/// guard area. `None` where the thread library cannot report it.
#[cfg(target_os = "linux")]
pub fn stack_floor() -> Option<usize> {
    // SAFETY: the attribute object is filled by pthread_getattr_np and
    // destroyed before returning.
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = core::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let mut guard: libc::size_t = 0;
        let known = libc::pthread_attr_getstack(&attr, &mut addr, &mut size) == 0
            && libc::pthread_attr_getguardsize(&attr, &mut guard) == 0;
        libc::pthread_attr_destroy(&mut attr);
        known.then(|| addr as usize + guard + page_size())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn stack_floor() -> Option<usize> {
    None
}

/// A reserved, page-aligned range of address space. Unmapped on drop.
#[derive(Debug)]
pub struct PageBlock {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the block is plain memory owned by exactly one holder.
unsafe impl Send for PageBlock {}

impl PageBlock {
    /// Reserve `size` bytes (rounded up to whole pages) with no access.
    ///
    /// `preferred` is only a placement hint.
    pub fn reserve(preferred: Option<usize>, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot reserve an empty page block",
            ));
        }
        let size = page_align(size);
        let hint = preferred.unwrap_or(0) as *mut libc::c_void;

        // SAFETY: anonymous private mapping; no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                hint,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        log::trace!("reserved {} bytes at {:p}", size, base);
        Ok(Self { base, size })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Change the protection of `[offset, offset + len)`.
    ///
    /// `offset` must be page-aligned; `len` is rounded up to whole pages.
    /// Writable-and-executable is refused.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        if protection.is_writable() && protection.is_executable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "refusing writable and executable mapping",
            ));
        }
        if offset % page_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("protect offset {:#x} is not page aligned", offset),
            ));
        }
        let len = page_align(len);
        if len == 0 {
            return Ok(());
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "protect range {:#x}+{:#x} exceeds block of {:#x}",
                    offset, len, self.size
                ),
            ));
        }

        // SAFETY: the range lies inside this block's mapping.
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(offset).cast(),
                len,
                protection.to_prot(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for PageBlock {
    fn drop(&mut self) {
        // SAFETY: base/size describe the mapping created in `reserve`.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.size) };
        if rc != 0 {
            log::warn!(
                "munmap of {:p} failed: {}",
                self.base,
                io::Error::last_os_error()
            );
        }
    }
}
