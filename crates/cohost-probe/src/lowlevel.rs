//! Memory, atomic and timing primitives.
//!
//! This is the only module in the workspace containing `unsafe` code. Every
//! function exported here is safe to call; the invariants each unsafe block
//! relies on are stated next to it.

use std::alloc::{self, Layout};
use std::fs::File;
use std::ptr::NonNull;

/// Cache line size assumed throughout
pub const CACHE_LINE: usize = 64;

/// Width of one counter in the misaligned region
pub const COUNTER_WIDTH: usize = 4;

/// Whether a real split-lock (bus-locking) add is available on this target
pub const SPLIT_LOCK_SUPPORTED: bool = cfg!(target_arch = "x86_64");

/// A line-aligned allocation whose 4-byte counters start `misalignment`
/// bytes past the line boundary.
pub struct MisalignedRegion {
    base: NonNull<u8>,
    layout: Layout,
    misalignment: usize,
    slots: usize,
}

// The region is only ever touched through atomic instructions or volatile reads.
unsafe impl Send for MisalignedRegion {}
unsafe impl Sync for MisalignedRegion {}

impl MisalignedRegion {
    /// Allocate `slots + 1` eight-byte cells aligned to a cache line.
    ///
    /// Returns `None` when the allocator refuses the request.
    pub fn allocate(slots: usize, misalignment: usize) -> Option<Self> {
        let size = ((slots + 1) * 8).max(misalignment + slots * COUNTER_WIDTH);
        let layout = Layout::from_size_align(size, CACHE_LINE).ok()?;
        // SAFETY: layout has a non-zero size because slots + 1 >= 1.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw)?;
        Some(Self {
            base,
            layout,
            misalignment,
            slots,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Byte offset of a counter from the aligned base
    pub fn offset_of(&self, slot: usize) -> usize {
        self.misalignment + slot * COUNTER_WIDTH
    }

    /// Whether a counter spans two cache lines
    pub fn straddles_line(&self, slot: usize) -> bool {
        let start = self.offset_of(slot);
        start / CACHE_LINE != (start + COUNTER_WIDTH - 1) / CACHE_LINE
    }

    /// Atomically increment one counter
    #[inline]
    pub fn increment(&self, slot: usize) {
        assert!(slot < self.slots, "slot {} out of range", slot);
        // SAFETY: offset_of(slot) + 4 <= size by construction of the layout,
        // so the pointer stays inside the allocation for its whole width.
        let ptr = unsafe { self.base.as_ptr().add(self.offset_of(slot)) };
        split_lock_add(ptr);
    }

    /// Read a counter (not synchronized with concurrent increments)
    pub fn read(&self, slot: usize) -> u32 {
        assert!(slot < self.slots, "slot {} out of range", slot);
        // SAFETY: in bounds as in `increment`; read_unaligned tolerates the offset.
        unsafe {
            let ptr = self.base.as_ptr().add(self.offset_of(slot)) as *const u32;
            std::ptr::read_unaligned(ptr)
        }
    }
}

impl Drop for MisalignedRegion {
    fn drop(&mut self) {
        // SAFETY: base was returned by alloc_zeroed with exactly this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn split_lock_add(ptr: *mut u8) {
    // SAFETY: callers pass a pointer to four writable bytes inside a live
    // allocation. A lock-prefixed add has no alignment requirement on x86-64.
    unsafe {
        std::arch::asm!(
            "lock add dword ptr [{ptr}], 1",
            ptr = in(reg) ptr,
            options(nostack),
        );
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn split_lock_add(ptr: *mut u8) {
    use std::sync::atomic::{AtomicU32, Ordering};
    let aligned = (ptr as usize) & !(COUNTER_WIDTH - 1);
    // SAFETY: rounding down stays inside the line-aligned allocation, and the
    // aligned word is only accessed atomically.
    let counter = unsafe { &*(aligned as *const AtomicU32) };
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Volatile read-modify-write of one byte
#[inline(always)]
pub fn touch(byte: &mut u8) {
    // SAFETY: the reference guarantees a valid, exclusive, aligned byte.
    unsafe {
        let value = std::ptr::read_volatile(byte);
        std::ptr::write_volatile(byte, value.wrapping_add(1));
    }
}

/// Evict the line containing `byte` and time one reload of it.
///
/// On x86-64 the result is in TSC cycles; elsewhere it is nanoseconds and the
/// flush is skipped.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub fn flush_and_time_reload(byte: &u8) -> u64 {
    use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_lfence, _mm_mfence};

    let mut aux = 0u32;
    // SAFETY: clflush and volatile read operate on a valid shared reference;
    // lfence/rdtscp have no memory preconditions.
    unsafe {
        _mm_clflush(byte as *const u8);
        _mm_mfence();
        _mm_lfence();
        let start = __rdtscp(&mut aux);
        _mm_lfence();
        let _ = std::ptr::read_volatile(byte);
        _mm_lfence();
        let end = __rdtscp(&mut aux);
        _mm_lfence();
        end.saturating_sub(start)
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(never)]
pub fn flush_and_time_reload(byte: &u8) -> u64 {
    let start = std::time::Instant::now();
    // SAFETY: volatile read of a valid shared reference.
    let _ = unsafe { std::ptr::read_volatile(byte) };
    start.elapsed().as_nanos() as u64
}

/// Map a file read-only and shared so its pages are backed by the page cache
pub fn map_shared_readonly(file: &File) -> std::io::Result<memmap2::Mmap> {
    // SAFETY: the mapping is read-only; a concurrent truncation of the
    // library file would fault the probe, which the operator controls.
    unsafe { memmap2::Mmap::map(file) }
}

/// CPUID brand string, when the processor reports one
#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
pub fn cpuid_brand_string() -> Option<String> {
    use std::arch::x86_64::__cpuid;

    // SAFETY: cpuid is available on every x86-64 processor.
    let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_extended < 0x8000_0004 {
        return None;
    }

    let mut bytes = Vec::with_capacity(48);
    for leaf in 0x8000_0002u32..=0x8000_0004 {
        // SAFETY: leaf is within the supported extended range checked above.
        let regs = unsafe { __cpuid(leaf) };
        for reg in [regs.eax, regs.ebx, regs.ecx, regs.edx] {
            bytes.extend_from_slice(&reg.to_le_bytes());
        }
    }

    let brand = String::from_utf8_lossy(&bytes)
        .trim_matches(char::from(0))
        .trim()
        .to_string();
    (!brand.is_empty()).then_some(brand)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid_brand_string() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        let region = MisalignedRegion::allocate(64, 3).unwrap();
        assert_eq!(region.slots(), 64);
        assert_eq!(region.size(), 65 * 8);
        assert_eq!(region.offset_of(0), 3);
        assert!(region.offset_of(63) + COUNTER_WIDTH <= region.size());

        // 3 + 4k crosses a line at k = 15, 31, 47 and 63
        let straddling: Vec<usize> = (0..64).filter(|&s| region.straddles_line(s)).collect();
        assert_eq!(straddling, vec![15, 31, 47, 63]);
    }

    #[test]
    fn test_region_increment() {
        let region = MisalignedRegion::allocate(16, 2).unwrap();
        for _ in 0..10 {
            region.increment(15);
        }
        region.increment(0);

        if SPLIT_LOCK_SUPPORTED {
            assert_eq!(region.read(15), 10);
            assert_eq!(region.read(0), 1);
            assert_eq!(region.read(1), 0);
        }
    }

    #[test]
    fn test_small_region_fits_counters() {
        let region = MisalignedRegion::allocate(1, 63).unwrap();
        assert!(region.offset_of(0) + COUNTER_WIDTH <= region.size());
        region.increment(0);
    }

    #[test]
    fn test_touch() {
        let mut byte = 254u8;
        touch(&mut byte);
        assert_eq!(byte, 255);
        touch(&mut byte);
        assert_eq!(byte, 0);
    }

    #[test]
    fn test_timed_reload_runs() {
        let data = vec![7u8; CACHE_LINE * 4];
        let samples: Vec<u64> = (0..32).map(|_| flush_and_time_reload(&data[CACHE_LINE])).collect();
        assert_eq!(samples.len(), 32);
        if SPLIT_LOCK_SUPPORTED {
            assert!(samples.iter().all(|&s| s > 0));
        }
    }
}
