//! # Segment Memory
//!
//! Raw memory blocks backing stack segments, obtained under one of three
//! policies fixed at build time.
//!
//! ## Design
//!
//! - **Guarded** (`guard-pages`, Unix): an anonymous mapping whose lowest page
//!   is left inaccessible, so running off the low end of a segment faults
//!   instead of corrupting a neighbour. Transparent huge pages are disabled
//!   for the mapping so the guard stays page-sized.
//! - **Mapped** (`mmap-stacks`, Unix): a plain read/write anonymous mapping.
//! - **Heap**: `std::alloc`, 16-byte aligned. Used on non-Unix targets and
//!   when neither feature is enabled.
//!
//! A [`RawBlock`] releases its memory when dropped.

use std::alloc::Layout;
use std::io;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::OnceLock;

#[cfg(unix)]
use nix::libc;

/// Alignment of every block start.
pub const BLOCK_ALIGN: usize = 16;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// How segment memory is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Global allocator.
    Heap,
    /// Anonymous mapping.
    Mapped,
    /// Anonymous mapping with a protected low page.
    Guarded,
}

impl AllocPolicy {
    /// The policy selected by the enabled features.
    pub const fn build_default() -> Self {
        if cfg!(all(unix, feature = "mmap-stacks")) {
            AllocPolicy::Mapped
        } else if cfg!(all(unix, feature = "guard-pages")) {
            AllocPolicy::Guarded
        } else {
            AllocPolicy::Heap
        }
    }

    /// Policy name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocPolicy::Heap => "heap",
            AllocPolicy::Mapped => "mapped",
            AllocPolicy::Guarded => "guarded",
        }
    }
}

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The system page size.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no memory-safety preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 {
                return size as usize;
            }
        }
        FALLBACK_PAGE_SIZE
    })
}

fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// An owned block of memory for one segment.
#[derive(Debug)]
pub struct RawBlock {
    base: NonNull<u8>,
    len: usize,
    guard_len: usize,
    policy: AllocPolicy,
}

// SAFETY: a RawBlock is uniquely owned memory with no thread affinity.
unsafe impl Send for RawBlock {}

impl RawBlock {
    /// Obtain at least `min_len` usable bytes under `policy`.
    pub fn allocate(policy: AllocPolicy, min_len: usize) -> io::Result<Self> {
        if min_len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty segment block"));
        }
        match policy {
            AllocPolicy::Heap => Self::allocate_heap(min_len),
            #[cfg(unix)]
            AllocPolicy::Mapped => Self::allocate_mapped(min_len, false),
            #[cfg(unix)]
            AllocPolicy::Guarded => Self::allocate_mapped(min_len, true),
            #[cfg(not(unix))]
            AllocPolicy::Mapped | AllocPolicy::Guarded => Self::allocate_heap(min_len),
        }
    }

    fn allocate_heap(min_len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(min_len, BLOCK_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self {
            base,
            len: min_len,
            guard_len: 0,
            policy: AllocPolicy::Heap,
        })
    }

    #[cfg(unix)]
    fn allocate_mapped(min_len: usize, guarded: bool) -> io::Result<Self> {
        let page = page_size();
        let guard_len = if guarded { page } else { 0 };
        let len = guard_len + round_up(min_len, page);

        #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd"))]
        let stack_flag = libc::MAP_STACK;
        #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd")))]
        let stack_flag = 0;

        let initial_prot = if guarded {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };

        // SAFETY: anonymous private mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                initial_prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | stack_flag,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let block = Self {
            base,
            len,
            guard_len,
            policy: if guarded { AllocPolicy::Guarded } else { AllocPolicy::Mapped },
        };

        if guarded {
            // Dropping `block` on any failure below unmaps it.
            #[cfg(target_os = "linux")]
            {
                // SAFETY: the range is the mapping just created.
                let rc = unsafe { libc::madvise(ptr, len, libc::MADV_NOHUGEPAGE) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            // SAFETY: the range is the mapping just created.
            let rc = unsafe { libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_WRITE) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: the first page of the mapping.
            let rc = unsafe { libc::mprotect(ptr, guard_len, libc::PROT_NONE) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(block)
    }

    /// First usable byte (just above the guard page, if any).
    pub fn usable_start(&self) -> *mut u8 {
        // SAFETY: guard_len < len.
        unsafe { self.base.as_ptr().add(self.guard_len) }
    }

    /// Usable bytes.
    pub fn usable_len(&self) -> usize {
        self.len - self.guard_len
    }

    /// Address range of the guard page, if one is installed.
    pub fn guard_range(&self) -> Option<Range<usize>> {
        if self.guard_len == 0 {
            None
        } else {
            let start = self.base.as_ptr() as usize;
            Some(start..start + self.guard_len)
        }
    }

    /// Policy that produced this block.
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Total bytes reserved, guard included.
    pub fn reserved_len(&self) -> usize {
        self.len
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        match self.policy {
            AllocPolicy::Heap => {
                // SAFETY: same size and alignment as allocate_heap used.
                unsafe {
                    let layout = Layout::from_size_align_unchecked(self.len, BLOCK_ALIGN);
                    std::alloc::dealloc(self.base.as_ptr(), layout);
                }
            }
            #[cfg(unix)]
            AllocPolicy::Mapped | AllocPolicy::Guarded => {
                // SAFETY: base/len describe a mapping owned by this block.
                unsafe {
                    libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
                }
            }
            #[cfg(not(unix))]
            AllocPolicy::Mapped | AllocPolicy::Guarded => {}
        }
    }
}
