//! Buffer acquisition for injection targets.
//!
//! Commands that own their target corrupt a page-aligned anonymous mapping:
//! the lower half holds data, the upper half holds the relocated access
//! routines (instruction-fetch targets). Cache-flush displacement regions
//! use the same mapping type sized to the CPU's flush requirement.
//!
//! All access to mapped bytes is volatile so the invocation loads and
//! stores actually reach memory.

use std::io;
use std::ptr;
use thiserror::Error;

/// Minimum data buffer: two page-sized halves.
pub const MIN_DATABUF_SIZE: usize = 0x4000;

/// Word tag written into freshly allocated flush regions, as a debugging
/// aid when a displaced line shows up in an error report.
const FLUSH_FILL_TAG: u64 = 0xfa17_11e0_0000_0000;

/// Buffer allocation failures.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("mmap of {size} bytes failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("msync of buffer at {base:#x} failed: {source}")]
    Sync {
        base: u64,
        #[source]
        source: io::Error,
    },
    #[error("buffer size {0:#x} is not positive and page-aligned")]
    BadSize(usize),
}

/// The host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// A page-aligned anonymous mapping.
pub struct DataBuffer {
    base: *mut u8,
    size: usize,
}

// The mapping is exclusively owned and all byte access is volatile through
// offset-checked helpers, so handing the handle to the producer thread is
// sound.
unsafe impl Send for DataBuffer {}
unsafe impl Sync for DataBuffer {}

impl DataBuffer {
    /// Map `size` bytes of zeroed anonymous memory.
    pub fn alloc(size: usize) -> Result<Self, BufferError> {
        if size == 0 || size % page_size() != 0 {
            return Err(BufferError::BadSize(size));
        }
        // SAFETY: anonymous private mapping with a null hint; mmap validates
        // the rest and reports failure as MAP_FAILED.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(BufferError::Map {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            base: base.cast(),
            size,
        })
    }

    /// Map a displacement region and fill it with tagged words.
    pub fn alloc_flush_region(size: usize) -> Result<Self, BufferError> {
        let rounded = size.div_ceil(page_size()) * page_size();
        let buf = Self::alloc(rounded.max(page_size()))?;
        for off in (0..buf.size).step_by(8) {
            buf.store_u64(off, FLUSH_FILL_TAG | off as u64);
        }
        Ok(buf)
    }

    /// Base virtual address.
    pub fn base(&self) -> u64 {
        self.base as u64
    }

    /// Mapping size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base of the data half.
    pub fn data_half(&self) -> u64 {
        self.base()
    }

    /// Base of the instruction half.
    pub fn instr_half(&self) -> u64 {
        self.base() + (self.size / 2) as u64
    }

    /// Whether `addr` falls inside the mapping.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base() && addr < self.base() + self.size as u64
    }

    /// Offset of a contained virtual address.
    pub fn offset_of(&self, addr: u64) -> Option<usize> {
        self.contains(addr).then(|| (addr - self.base()) as usize)
    }

    /// Volatile single-byte load.
    #[inline]
    pub fn touch(&self, offset: usize) -> u8 {
        assert!(offset < self.size);
        // SAFETY: offset is bounds-checked against the live mapping.
        unsafe { ptr::read_volatile(self.base.add(offset)) }
    }

    /// Volatile load of a full cache line starting at `offset`.
    pub fn touch_line(&self, offset: usize, line: usize) {
        for i in 0..line {
            if offset + i < self.size {
                self.touch(offset + i);
            }
        }
    }

    /// Volatile single-byte store.
    #[inline]
    pub fn store(&self, offset: usize, value: u8) {
        assert!(offset < self.size);
        // SAFETY: offset is bounds-checked against the live mapping.
        unsafe { ptr::write_volatile(self.base.add(offset), value) }
    }

    /// Volatile word store.
    #[inline]
    pub fn store_u64(&self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.size);
        // SAFETY: offset is bounds-checked; anonymous mappings are 8-aligned
        // at page granularity and offset is a multiple of 8 at every caller.
        unsafe { ptr::write_volatile(self.base.add(offset).cast::<u64>(), value) }
    }

    /// Write the mapping back (DMA invocation path).
    pub fn msync(&self) -> Result<(), BufferError> {
        // SAFETY: base/size describe the live mapping owned by self.
        let rc = unsafe { libc::msync(self.base.cast(), self.size, libc::MS_SYNC) };
        if rc == -1 {
            return Err(BufferError::Sync {
                base: self.base(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for DataBuffer {
    fn drop(&mut self) {
        // SAFETY: base/size came from our own successful mmap.
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_split_the_mapping() {
        let buf = DataBuffer::alloc(MIN_DATABUF_SIZE).unwrap();
        assert_eq!(buf.data_half(), buf.base());
        assert_eq!(buf.instr_half(), buf.base() + MIN_DATABUF_SIZE as u64 / 2);
        assert!(buf.contains(buf.instr_half()));
        assert!(!buf.contains(buf.base() + MIN_DATABUF_SIZE as u64));
    }

    #[test]
    fn volatile_store_then_touch_round_trips() {
        let buf = DataBuffer::alloc(MIN_DATABUF_SIZE).unwrap();
        buf.store(0x123, 0xab);
        assert_eq!(buf.touch(0x123), 0xab);
    }

    #[test]
    fn unaligned_size_is_rejected() {
        assert!(matches!(
            DataBuffer::alloc(100),
            Err(BufferError::BadSize(100))
        ));
    }

    #[test]
    fn flush_region_is_tag_filled_and_rounded() {
        let region = DataBuffer::alloc_flush_region(page_size() + 1).unwrap();
        assert_eq!(region.size() % page_size(), 0);
        assert!(region.size() >= page_size() + 1);
        assert_eq!(region.touch(0), 0); // low byte of the tag word is the offset
        assert_ne!(region.touch(7), 0); // tag lives in the high bytes
    }

    #[test]
    fn offset_of_maps_contained_addresses() {
        let buf = DataBuffer::alloc(MIN_DATABUF_SIZE).unwrap();
        assert_eq!(buf.offset_of(buf.base() + 0x40), Some(0x40));
        assert_eq!(buf.offset_of(buf.base() - 1), None);
    }
}
