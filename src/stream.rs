//! A seekable, page-buffered byte stream over a remote task's address space —
//! the equivalent of a buffered file reader, but backed by `mach_vm_read`
//! instead of `read(2)`.
//!
//! The C++ draft this is modeled on (`MachTaskMemoryStreamBuf::xsgetn`) only
//! ever refilled a single page per call, with a `// TODO: Handle page
//! boundries` marking the gap; a request spanning more than one page silently
//! returned short. This version factors the read into head-partial,
//! middle-full, and tail-partial phases so a read of arbitrary length across
//! arbitrary page boundaries is handled in one pass.

use std::io::{Read, Seek, SeekFrom};

use crate::memory::Memory;

/// Treated as "far past any valid read"; `SeekFrom::End` is not precisely
/// sized because the stream has no natural end-of-file.
const END_SENTINEL: u64 = u64::MAX / 2;

/// The minimal capability [`PagedStream`] needs from a memory source. Lets
/// tests exercise the paging logic against a plain byte buffer instead of a
/// real task port.
pub trait RemoteMemory {
    fn page_size(&self) -> u64;
    fn read_page(&self, page_address: u64, len: usize) -> std::io::Result<Vec<u8>>;
}

impl RemoteMemory for Memory {
    fn page_size(&self) -> u64 {
        Memory::page_size(self)
    }

    fn read_page(&self, page_address: u64, len: usize) -> std::io::Result<Vec<u8>> {
        self.read(page_address, len)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// A seekable byte stream over `source`, starting at absolute address `base`.
pub struct PagedStream<M> {
    source: M,
    base: u64,
    offset: u64,
    page_address: Option<u64>,
    page: Vec<u8>,
}

impl<M: RemoteMemory> PagedStream<M> {
    pub fn new(source: M, base: u64) -> Self {
        Self {
            source,
            base,
            offset: 0,
            page_address: None,
            page: Vec::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// The absolute address the next read will start at.
    pub fn position(&self) -> u64 {
        self.base.wrapping_add(self.offset)
    }

    fn page_size(&self) -> u64 {
        self.source.page_size()
    }

    /// Ensures `self.page` holds the page containing `address`, refilling it
    /// if the currently buffered page doesn't already cover it.
    fn ensure_page(&mut self, address: u64) -> std::io::Result<()> {
        let page_size = self.page_size();
        let page_address = address & !(page_size - 1);

        if self.page_address == Some(page_address) {
            return Ok(());
        }

        self.page = self.source.read_page(page_address, page_size as usize)?;
        self.page_address = Some(page_address);
        Ok(())
    }
}

impl<M: RemoteMemory> Read for PagedStream<M> {
    /// Reads `buf.len()` bytes, or as many as are available before a page
    /// read fails. A short read (including zero) is reported through the
    /// returned count, never as an `Err`.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let page_size = self.page_size();
        let mut produced = 0;

        while produced < buf.len() {
            let address = self.position();
            let page_address = address & !(page_size - 1);
            let page_offset = (address - page_address) as usize;

            // Head-partial on the first iteration if `address` isn't page
            // aligned; middle-full once `want` below equals a whole page;
            // tail-partial on the last iteration. All three share this body.
            if self.ensure_page(address).is_err() {
                break;
            }

            let available = self.page.len().saturating_sub(page_offset);
            if available == 0 {
                break;
            }

            let want = (buf.len() - produced).min(available);
            buf[produced..produced + want]
                .copy_from_slice(&self.page[page_offset..page_offset + want]);
            produced += want;
            self.offset += want as u64;

            if want < available {
                // Filled the caller's buffer before exhausting the page.
                break;
            }
        }

        Ok(produced)
    }
}

impl<M> Seek for PagedStream<M> {
    /// Only the input (read) direction is supported; `SeekFrom::End` lands on
    /// a sentinel position rather than a precisely computed end of stream.
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.offset = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => checked_add_signed(self.offset, delta)?,
            SeekFrom::End(delta) => checked_add_signed(END_SENTINEL, delta)?,
        };
        Ok(self.offset)
    }
}

fn checked_add_signed(base: u64, delta: i64) -> std::io::Result<u64> {
    base.checked_add_signed(delta).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek out of range")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMemory {
        page_size: u64,
        bytes: Vec<u8>,
    }

    impl RemoteMemory for FakeMemory {
        fn page_size(&self) -> u64 {
            self.page_size
        }

        fn read_page(&self, page_address: u64, len: usize) -> std::io::Result<Vec<u8>> {
            let start = page_address as usize;
            let end = (start + len).min(self.bytes.len());
            if start >= self.bytes.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "past end",
                ));
            }
            Ok(self.bytes[start..end].to_vec())
        }
    }

    fn fake(page_size: u64, len: usize) -> FakeMemory {
        FakeMemory {
            page_size,
            bytes: (0..len).map(|i| (i % 256) as u8).collect(),
        }
    }

    #[test]
    fn head_partial_read_within_one_page() {
        let mut stream = PagedStream::new(fake(0x10, 0x100), 0x4);
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn read_spans_head_middle_and_tail_pages() {
        // page size 0x10: start at offset 0xc (head-partial, 4 bytes left in
        // page 0), then a full page at 0x10, then a partial tail at 0x20.
        let mut stream = PagedStream::new(fake(0x10, 0x40), 0xc);
        let mut buf = [0u8; 0x18];
        assert_eq!(stream.read(&mut buf).unwrap(), buf.len());
        let expected: Vec<u8> = (0xc..0xc + 0x18).map(|i| (i % 256) as u8).collect();
        assert_eq!(&buf[..], expected.as_slice());
    }

    #[test]
    fn short_read_past_end_returns_partial_count() {
        let mut stream = PagedStream::new(fake(0x10, 0x10), 0);
        let mut buf = [0u8; 0x20];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0x10);
    }

    #[test]
    fn seek_current_and_start() {
        let mut stream = PagedStream::new(fake(0x10, 0x40), 0);
        stream.seek(SeekFrom::Start(0x10)).unwrap();
        assert_eq!(stream.position(), 0x10);
        stream.seek(SeekFrom::Current(4)).unwrap();
        assert_eq!(stream.position(), 0x14);
    }

    #[test]
    fn seek_end_lands_past_any_valid_read() {
        let mut stream = PagedStream::new(fake(0x10, 0x40), 0);
        stream.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
