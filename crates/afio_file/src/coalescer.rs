use std::ops::Range;

use afio_aligned_bytes::AlignedBuffer;
use tracing::debug;

use crate::{error::FsError, request::Page};

/// Merges runs of contiguous pages into one staging buffer so that they can be written with a
/// single call.
///
/// The staging buffer is allocated once, and only ever touched during one write request.
#[derive(Debug)]
pub(crate) struct WriteCoalescer {
    buffer: AlignedBuffer,
}

impl WriteCoalescer {
    pub(crate) fn new(capacity: usize, align: usize) -> Self {
        Self {
            buffer: AlignedBuffer::with_capacity(capacity, align),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Checks that every page starts exactly where the previous page ends.
    pub(crate) fn check_contiguous(pages: &[Page]) -> Result<(), FsError> {
        for (i, pair) in pages.windows(2).enumerate() {
            if pair[0].end() != pair[1].offset {
                debug!(
                    page = i + 1,
                    expected = pair[0].end(),
                    actual = pair[1].offset,
                    "page offsets are not contiguous"
                );
                return Err(FsError::InvalidParameters);
            }
        }
        Ok(())
    }

    /// Splits `pages` into runs of consecutive pages whose total size fits in the staging buffer.
    /// A page that is larger than the buffer on its own forms a run of one.
    pub(crate) fn runs<'a>(&self, pages: &'a [Page]) -> Runs<'a> {
        Runs {
            pages,
            next: 0,
            capacity: self.capacity(),
        }
    }

    /// Copies `pages` back to back into the staging buffer, and returns the staged bytes.
    ///
    /// ## Panics
    /// Panics if the pages don't fit. Use [`Self::runs`] to split them first.
    pub(crate) fn stage(&mut self, pages: &[Page]) -> &[u8] {
        self.buffer.clear();
        for page in pages {
            self.buffer.extend_from_slice(page.buf.as_slice());
        }
        self.buffer.as_slice()
    }
}

/// Iterator over the index ranges of the runs, created by [`WriteCoalescer::runs`].
pub(crate) struct Runs<'a> {
    pages: &'a [Page],
    next: usize,
    capacity: usize,
}

impl Iterator for Runs<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.pages.len() {
            return None;
        }
        let start = self.next;
        let mut total = self.pages[start].len();
        let mut end = start + 1;
        while end < self.pages.len() && total + self.pages[end].len() <= self.capacity {
            total += self.pages[end].len();
            end += 1;
        }
        self.next = end;
        Some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(sizes: &[usize], first_offset: u64) -> Vec<Page> {
        let mut offset = first_offset;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let page = Page::new(AlignedBuffer::from_slice(&vec![i as u8; size], 8), offset);
                offset += size as u64;
                page
            })
            .collect()
    }

    #[test]
    fn test_runs_respect_capacity() {
        let coalescer = WriteCoalescer::new(32, 8);
        let pages = pages(&[8, 8, 8, 8, 8, 16, 16], 0);
        let runs: Vec<_> = coalescer.runs(&pages).collect();
        assert_eq!(runs, vec![0..4, 4..6, 6..7]);
    }

    #[test]
    fn test_oversized_page_is_its_own_run() {
        let coalescer = WriteCoalescer::new(16, 8);
        let pages = pages(&[8, 64, 8, 8], 0);
        let runs: Vec<_> = coalescer.runs(&pages).collect();
        assert_eq!(runs, vec![0..1, 1..2, 2..4]);
    }

    #[test]
    fn test_check_contiguous() {
        let mut pages = pages(&[8, 8, 8], 100);
        assert!(WriteCoalescer::check_contiguous(&pages).is_ok());
        pages[2].offset += 1;
        assert_eq!(
            WriteCoalescer::check_contiguous(&pages),
            Err(FsError::InvalidParameters)
        );
        assert!(WriteCoalescer::check_contiguous(&[]).is_ok());
    }

    #[test]
    fn test_stage_concatenates_pages() {
        let mut coalescer = WriteCoalescer::new(32, 8);
        let pages = pages(&[2, 3, 1], 0);
        assert_eq!(coalescer.stage(&pages), [0, 0, 1, 1, 1, 2]);
        // The buffer is reused, not appended to.
        assert_eq!(coalescer.stage(&pages[1..2]), [1, 1, 1]);
    }
}
