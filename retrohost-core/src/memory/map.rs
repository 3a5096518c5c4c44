//! Memory map table - the core's self-reported descriptors as one flat address space.
//!
//! Descriptors are kept in registration order. Address resolution is a pure
//! interval walk (`translate`); reads and writes then copy each resulting
//! segment to or from the descriptor's native buffer. Because segments are
//! applied in registration order, a later descriptor overrides an earlier one
//! on read, and a write reaches every descriptor that covers the address.

use std::ptr;

use tracing::trace;

use crate::error::{HostError, HostResult};
use crate::ffi::{self, retro_memory_descriptor};

/// One contiguous native buffer mapped at a logical address.
#[derive(Debug, Clone)]
pub struct MemoryDescriptor {
    pub flags: u64,
    base: *mut u8,
    pub offset: usize,
    pub start: u64,
    pub length: u64,
    pub select: u64,
    pub disconnect: u64,
    pub address_space: String,
}

impl MemoryDescriptor {
    /// Map `length` bytes at `base + offset` to logical address `start`.
    ///
    /// # Safety
    /// Unless `base` is null, `base + offset` must be valid for reads and
    /// writes of `length` bytes for as long as the descriptor is installed in
    /// a [`MemoryMapTable`].
    pub unsafe fn new(base: *mut u8, offset: usize, start: u64, length: u64) -> Self {
        Self {
            flags: 0,
            base,
            offset,
            start,
            length,
            select: 0,
            disconnect: 0,
            address_space: String::new(),
        }
    }

    /// Convert a descriptor reported through `SET_MEMORY_MAPS`.
    ///
    /// # Safety
    /// The core guarantees the buffer stays valid until it reports a new map
    /// or the game is unloaded; `raw.addrspace` must be null or a C string.
    pub(crate) unsafe fn from_raw(raw: &retro_memory_descriptor) -> Self {
        Self {
            flags: raw.flags,
            base: raw.ptr.cast::<u8>(),
            offset: raw.offset,
            start: raw.start as u64,
            length: raw.len as u64,
            select: raw.select as u64,
            disconnect: raw.disconnect as u64,
            address_space: ffi::string_from_ptr(raw.addrspace),
        }
    }

    pub fn with_address_space(mut self, name: impl Into<String>) -> Self {
        self.address_space = name.into();
        self
    }

    /// Exclusive end of the logical range.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Null buffers and zero-length entries never take part in translation.
    pub fn is_mapped(&self) -> bool {
        !self.base.is_null() && self.length > 0
    }

    fn host_ptr(&self, descriptor_offset: u64) -> *mut u8 {
        // SAFETY: callers only pass offsets produced by `translate`, which stay
        // inside `[0, length)`; the constructor contract covers the buffer.
        unsafe { self.base.add(self.offset + descriptor_offset as usize) }
    }
}

/// A piece of a logical request served by one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index of the descriptor in registration order.
    pub descriptor: usize,
    /// Byte offset inside the descriptor's logical range.
    pub descriptor_offset: u64,
    /// Byte offset inside the request.
    pub request_offset: u64,
    pub length: u64,
}

/// The set of descriptors negotiated for the current load.
#[derive(Debug, Clone, Default)]
pub struct MemoryMapTable {
    descriptors: Vec<MemoryDescriptor>,
}

impl MemoryMapTable {
    pub fn new(descriptors: Vec<MemoryDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &[MemoryDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Resolve `[address, address + length)` into per-descriptor segments.
    ///
    /// Segments come back in registration order, one per descriptor that
    /// overlaps the request.
    pub fn translate(&self, address: u64, length: u64) -> Vec<Segment> {
        let end = address.saturating_add(length);
        self.descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_mapped())
            .filter_map(|(index, d)| {
                let lo = address.max(d.start);
                let hi = end.min(d.end());
                (lo < hi).then(|| Segment {
                    descriptor: index,
                    descriptor_offset: lo - d.start,
                    request_offset: lo - address,
                    length: hi - lo,
                })
            })
            .collect()
    }

    /// Parts of the request no descriptor covers, as `(address, length)`.
    pub fn gaps(&self, address: u64, length: u64) -> Vec<(u64, u64)> {
        let mut covered: Vec<(u64, u64)> = self
            .translate(address, length)
            .iter()
            .map(|s| (s.request_offset, s.request_offset + s.length))
            .collect();
        covered.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = 0;
        for (lo, hi) in covered {
            if lo > cursor {
                gaps.push((address + cursor, lo - cursor));
            }
            cursor = cursor.max(hi);
        }
        if cursor < length {
            gaps.push((address + cursor, length - cursor));
        }
        gaps
    }

    /// Read `length` bytes starting at `address`.
    ///
    /// Fails with [`HostError::Unmapped`] when no descriptor touches the
    /// range. Bytes inside a partially mapped range that no descriptor
    /// covers read as zero.
    pub fn read(&self, address: u64, length: usize) -> HostResult<Vec<u8>> {
        let mut out = vec![0u8; length];
        if length == 0 {
            return Ok(out);
        }
        let segments = self.translate(address, length as u64);
        if segments.is_empty() {
            return Err(HostError::Unmapped {
                address,
                length: length as u64,
            });
        }
        for segment in &segments {
            let src = self.descriptors[segment.descriptor].host_ptr(segment.descriptor_offset);
            let dst = &mut out[segment.request_offset as usize..][..segment.length as usize];
            // SAFETY: `src` is valid for `segment.length` bytes per the
            // descriptor contract; `dst` is a distinct host allocation.
            unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        }
        if segments.iter().map(|s| s.length).sum::<u64>() < length as u64 {
            trace!(address, length, "zero-filled unmapped bytes in read");
        }
        Ok(out)
    }

    /// Write `bytes` starting at `address` into every covering descriptor.
    ///
    /// Fails with [`HostError::Unmapped`] when no descriptor touches the
    /// range; uncovered bytes of a partially mapped write are dropped.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> HostResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let segments = self.translate(address, bytes.len() as u64);
        if segments.is_empty() {
            return Err(HostError::Unmapped {
                address,
                length: bytes.len() as u64,
            });
        }
        for segment in &segments {
            let dst = self.descriptors[segment.descriptor].host_ptr(segment.descriptor_offset);
            let src = &bytes[segment.request_offset as usize..][..segment.length as usize];
            // SAFETY: see `read`; `ptr::copy` tolerates a core that maps the
            // same native buffer more than once.
            unsafe { ptr::copy(src.as_ptr(), dst, src.len()) };
        }
        Ok(())
    }
}
