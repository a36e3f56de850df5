//! Foreign memory shared with the kernel or the NIC.
//!
//! Rings, superbufs, queue indices and the CTPIO aperture all live in memory
//! that another agent reads or writes concurrently. [`SharedRegion`] wraps
//! such a mapping with bounds-checked volatile accessors; [`SharedCounter`]
//! wraps one producer or consumer index and places the memory barriers that
//! the single-producer/single-consumer protocol depends on.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

struct Mapping {
    ptr: *mut u8,
    len: usize,
    /// Unmapped on drop when we created the mapping ourselves.
    owned: bool,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::munmap(self.ptr.cast(), self.len);
            }
        }
    }
}

// Safety: every access goes through volatile or atomic operations on memory
// that is by definition shared with another agent.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// A cloneable handle to a mapped region of shared memory.
///
/// Multi-byte accessors use little-endian byte order (the hardware's) and
/// require natural alignment.
#[derive(Clone)]
pub struct SharedRegion {
    map: Arc<Mapping>,
}

impl SharedRegion {
    /// Map `len` bytes of zeroed anonymous shared memory.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared region must not be empty",
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(SharedRegion {
            map: Arc::new(Mapping {
                ptr: ptr.cast(),
                len,
                owned: true,
            }),
        })
    }

    /// Wrap memory mapped by someone else.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned to at
    /// least 8 bytes, and remain mapped for as long as any clone of the
    /// returned region exists.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        SharedRegion {
            map: Arc::new(Mapping {
                ptr,
                len,
                owned: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len
    }

    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.ptr
    }

    #[inline]
    fn at(&self, off: usize, size: usize) -> *mut u8 {
        assert!(
            off.checked_add(size).is_some_and(|end| end <= self.map.len),
            "access at {off}+{size} outside shared region of {} bytes",
            self.map.len
        );
        unsafe { self.map.ptr.add(off) }
    }

    #[inline]
    fn aligned<T>(&self, off: usize) -> *mut T {
        let size = std::mem::size_of::<T>();
        let p = self.at(off, size);
        debug_assert!(p as usize % size == 0, "misaligned access at {off}");
        p.cast()
    }

    #[inline]
    pub fn read_u16(&self, off: usize) -> u16 {
        u16::from_le(unsafe { ptr::read_volatile(self.aligned::<u16>(off)) })
    }

    #[inline]
    pub fn read_u32(&self, off: usize) -> u32 {
        u32::from_le(unsafe { ptr::read_volatile(self.aligned::<u32>(off)) })
    }

    #[inline]
    pub fn read_u64(&self, off: usize) -> u64 {
        u64::from_le(unsafe { ptr::read_volatile(self.aligned::<u64>(off)) })
    }

    #[inline]
    pub fn write_u16(&self, off: usize, value: u16) {
        unsafe { ptr::write_volatile(self.aligned::<u16>(off), value.to_le()) }
    }

    #[inline]
    pub fn write_u32(&self, off: usize, value: u32) {
        unsafe { ptr::write_volatile(self.aligned::<u32>(off), value.to_le()) }
    }

    #[inline]
    pub fn write_u64(&self, off: usize, value: u64) {
        unsafe { ptr::write_volatile(self.aligned::<u64>(off), value.to_le()) }
    }

    /// Read a qword with acquire ordering: once a validity bit in it has
    /// been seen, everything the writer stored before it is visible too.
    #[inline]
    pub fn observe_u64(&self, off: usize) -> u64 {
        let p = self.aligned::<AtomicU64>(off);
        u64::from_le(unsafe { (*p).load(Ordering::Acquire) })
    }

    pub fn read_bytes(&self, off: usize, dst: &mut [u8]) {
        let src = self.at(off, dst.len());
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) }
    }

    pub fn write_bytes(&self, off: usize, src: &[u8]) {
        let dst = self.at(off, src.len());
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) }
    }

    /// Set `len` bytes starting at `off` to `byte`.
    pub fn fill(&self, off: usize, len: usize, byte: u8) {
        let dst = self.at(off, len);
        unsafe { ptr::write_bytes(dst, byte, len) }
    }

    /// Borrow a range of the region as a byte slice.
    ///
    /// # Safety
    ///
    /// No other agent may write the range while the slice is alive.
    pub unsafe fn slice(&self, off: usize, len: usize) -> &[u8] {
        let p = self.at(off, len);
        unsafe { std::slice::from_raw_parts(p, len) }
    }

    /// A 32-bit index stored at `off`.
    pub fn counter(&self, off: usize) -> SharedCounter {
        // Validates bounds and alignment up front.
        let _ = self.aligned::<AtomicU32>(off);
        assert!(off % 4 == 0, "counter at {off} is not 4-byte aligned");
        SharedCounter {
            region: self.clone(),
            off,
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("ptr", &self.map.ptr)
            .field("len", &self.map.len)
            .finish()
    }
}

/// A free-running u32 ring index in shared memory, in native byte order.
///
/// The side that produces entries calls [`publish`](Self::publish) after
/// writing them; the side that consumes calls [`observe`](Self::observe)
/// before reading them. An index owned by this side can be re-read with
/// [`load`](Self::load).
#[derive(Clone, Debug)]
pub struct SharedCounter {
    region: SharedRegion,
    off: usize,
}

impl SharedCounter {
    #[inline]
    fn atomic(&self) -> &AtomicU32 {
        unsafe { &*self.region.as_ptr().add(self.off).cast::<AtomicU32>() }
    }

    /// Store with release ordering: writes made before the call are visible
    /// to whoever observes the new value.
    #[inline]
    pub fn publish(&self, value: u32) {
        self.atomic().store(value, Ordering::Release);
    }

    /// Load with acquire ordering.
    #[inline]
    pub fn observe(&self) -> u32 {
        self.atomic().load(Ordering::Acquire)
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.atomic().load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, value: u32) {
        self.atomic().store(value, Ordering::Relaxed);
    }

    pub fn offset(&self) -> usize {
        self.off
    }
}
