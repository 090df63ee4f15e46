//! Bounded on-disk paged buffer.
//!
//! State-sync chunk downloads land here instead of in memory: the buffer is
//! an anonymous temporary file sized up front to `num_chunks × chunk_size`,
//! so a failed allocation aborts the sync attempt before any bytes move.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;

/// A fixed-capacity scratch file with positioned writes.
pub struct PagedBuffer {
    file: Mutex<File>,
    capacity: u64,
}

impl PagedBuffer {
    /// Allocate a buffer of exactly `capacity` bytes on disk.
    pub fn bounded(capacity: u64) -> io::Result<PagedBuffer> {
        let file = tempfile::tempfile()?;
        file.set_len(capacity)?;
        Ok(PagedBuffer {
            file: Mutex::new(file),
            capacity,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Write `data` at `offset`, failing on out-of-bounds writes.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if offset + data.len() as u64 > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past buffer capacity",
            ));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if offset + len as u64 > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read past buffer capacity",
            ));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positioned_writes_and_reads() {
        let buffer = PagedBuffer::bounded(64).unwrap();
        buffer.write_at(0, b"head").unwrap();
        buffer.write_at(32, b"tail").unwrap();

        assert_eq!(buffer.read_at(0, 4).unwrap(), b"head");
        assert_eq!(buffer.read_at(32, 4).unwrap(), b"tail");
        // Untouched pages read as zeroes.
        assert_eq!(buffer.read_at(8, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn rejects_out_of_bounds() {
        let buffer = PagedBuffer::bounded(16).unwrap();
        assert!(buffer.write_at(10, &[0u8; 8]).is_err());
        assert!(buffer.read_at(10, 8).is_err());
        assert_eq!(buffer.capacity(), 16);
    }

    #[test]
    fn chunk_reassembly_pattern() {
        let chunk_size = 8u64;
        let buffer = PagedBuffer::bounded(3 * chunk_size).unwrap();
        let chunks: [&[u8]; 3] = [b"aaaaaaaa", b"bbbbbbbb", b"cc"];
        for (i, chunk) in chunks.iter().enumerate() {
            buffer.write_at(i as u64 * chunk_size, chunk).unwrap();
        }

        let mut assembled = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assembled.extend(buffer.read_at(i as u64 * chunk_size, chunk.len()).unwrap());
        }
        assert_eq!(assembled, b"aaaaaaaabbbbbbbbcc");
    }
}
