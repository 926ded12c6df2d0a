#![warn(missing_docs)]
//! Heap buffers whose start address and capacity are both aligned.
//!
//! File I/O with `O_DIRECT` requires the memory buffer, the length and the file offset to be
//! multiples of the device's logical block size (typically 512 bytes or 4 KiB). `AlignedBuffer`
//! takes care of the memory side of that contract.

use std::{alloc, fmt, ops::Range, ptr::NonNull, slice};

/// A growable-up-to-capacity byte buffer whose backing allocation is aligned.
///
/// The capacity is fixed at construction. `len` is the number of valid bytes, and is always
/// `<= capacity`. Unlike `Vec<u8>`, pushing past capacity is an error rather than a reallocation:
/// staging buffers are sized once and reused for the lifetime of their owner.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,

    /// `layout.size()` gives the number of bytes _actually_ allocated, which will be
    /// a multiple of `align`.
    layout: alloc::Layout,

    len: usize,
}

// Safety: `AlignedBuffer` owns its allocation exclusively, just like `Vec<u8>`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Creates an empty buffer (`len == 0`) that can hold at least `capacity` bytes.
    ///
    /// The capacity is rounded up to a multiple of `align`.
    /// `align` must not be zero, and must be a power of two.
    ///
    /// ## Panics
    /// Panics if `capacity` is zero or if `align` is not a power of two.
    pub fn with_capacity(capacity: usize, align: usize) -> Self {
        assert_ne!(capacity, 0, "AlignedBuffer capacity must not be zero");
        let layout = alloc::Layout::from_size_align(capacity, align)
            .expect("failed to create Layout!")
            .pad_to_align();
        // Zeroed so that `set_len` can never expose uninitialised memory.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self {
            ptr,
            layout,
            len: 0,
        }
    }

    /// Creates a zero-filled buffer with `len` valid bytes.
    pub fn zeroed(len: usize, align: usize) -> Self {
        let mut buf = Self::with_capacity(len.max(1), align);
        buf.len = len;
        buf
    }

    /// Creates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8], align: usize) -> Self {
        let mut buf = Self::with_capacity(data.len().max(1), align);
        buf.extend_from_slice(data);
        buf
    }

    /// Returns the number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if there are no valid bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the total size of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the alignment, in bytes.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Returns the number of bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Sets the number of valid bytes.
    ///
    /// ## Panics
    /// Panics if `len > capacity`.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "len {len} exceeds capacity {}",
            self.capacity()
        );
        self.len = len;
    }

    /// Forgets all valid bytes. Does not free or zero the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends `data` to the end of the valid bytes.
    ///
    /// ## Panics
    /// Panics if `data` does not fit in the remaining capacity.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.remaining(),
            "cannot append {} bytes: only {} bytes remaining",
            data.len(),
            self.remaining()
        );
        let end = self.len + data.len();
        self.spare_range(self.len..end).copy_from_slice(data);
        self.len = end;
    }

    /// Returns an immutable slice of the valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns a mutable slice of the valid bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns a constant pointer to the start of the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Returns a mutable slice into the whole allocation, ignoring `len`.
    ///
    /// `range` indexes into the entire underlying buffer.
    ///
    /// ## Panics
    /// Panics if `range.end > capacity`.
    pub fn spare_range(&mut self, range: Range<usize>) -> &mut [u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.capacity());
        unsafe {
            slice::from_raw_parts_mut(self.ptr.as_ptr().add(range.start), range.len())
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("alignment", &self.alignment())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        const LEN: usize = 16;
        let mut buf = AlignedBuffer::zeroed(LEN, 8);
        for (i, byte) in buf.as_mut_slice().iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(
            buf.as_slice(),
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }

    #[test]
    fn test_alignment_and_padding() {
        let buf = AlignedBuffer::with_capacity(100, 4096);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.alignment(), 4096);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extend_and_clear() {
        let mut buf = AlignedBuffer::with_capacity(8, 8);
        buf.extend_from_slice(&[1, 2, 3]);
        buf.extend_from_slice(&[4, 5]);
        assert_eq!(buf.as_slice(), [1, 2, 3, 4, 5]);
        assert_eq!(buf.remaining(), 3);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "only 2 bytes remaining")]
    fn test_extend_past_capacity_panics() {
        let mut buf = AlignedBuffer::with_capacity(8, 8);
        buf.extend_from_slice(&[0; 6]);
        buf.extend_from_slice(&[0; 3]);
    }

    #[test]
    fn test_from_slice() {
        let buf = AlignedBuffer::from_slice(b"hello", 512);
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(buf.as_ptr() as usize % 512, 0);

        let empty = AlignedBuffer::from_slice(&[], 512);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_zeroed() {
        let buf = AlignedBuffer::zeroed(100, 512);
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.as_ptr() as usize % 512, 0);

        let empty = AlignedBuffer::zeroed(0, 512);
        assert!(empty.is_empty());
        assert_eq!(empty.as_slice(), &[] as &[u8]);
        assert_eq!(empty.as_ptr() as usize % 512, 0);
    }
}
