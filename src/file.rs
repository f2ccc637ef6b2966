//! Thin file and buffer helpers: explicit little-endian I/O, seek/tell,
//! truncation, and read-only memory maps.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Result, ZipError};

/// Map a file read-only into the address space.
///
/// The map stays valid for the lifetime of the returned [`Mmap`]; callers
/// share it across worker threads behind an `Arc`.
pub fn map_file(file: &File) -> Result<Mmap> {
    // SAFETY: the map is read-only and parzip never truncates or writes the
    // source file while a map of it is alive. Concurrent modification by
    // other processes is outside the engine's contract, as for any reader.
    unsafe { Mmap::map(file) }.map_err(|e| ZipError::io("could not mmap file", e))
}

/// Seekable output file with little-endian write helpers.
///
/// The archive writer is the only owner of this handle; all offsets are
/// byte positions from the start of the file.
pub struct OutputFile {
    f: File,
}

impl OutputFile {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path)
            .map_err(|e| ZipError::io(format!("could not create {}", path.display()), e))?;
        Ok(OutputFile { f })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.f
            .write_all(data)
            .map_err(|e| ZipError::io("could not write to archive", e))
    }

    pub fn write16le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    pub fn write32le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    pub fn write64le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Current byte offset.
    pub fn tell(&mut self) -> Result<u64> {
        self.f
            .stream_position()
            .map_err(|e| ZipError::io("could not read archive position", e))
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.f
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ZipError::io("could not seek in archive", e))?;
        Ok(())
    }

    /// Cut the file at `offset` and leave the cursor there. Used to discard
    /// the partial bytes of a failed entry.
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        self.f
            .set_len(offset)
            .map_err(|e| ZipError::io("could not truncate archive", e))?;
        self.seek(offset)
    }
}

/// Forward-only cursor over a byte slice with little-endian readers.
///
/// Parsing reads straight out of the archive's memory map; every accessor
/// bounds-checks and reports truncation as a format error.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(ZipError::format("archive truncated"));
        }
        self.pos += n;
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ZipError::format("archive truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read16le(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read32le(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read64le(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn byte_reader_walks_le_values() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1234u16.to_le_bytes());
        buf.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        buf.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        buf.extend_from_slice(b"tail");

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read16le().unwrap(), 0x1234);
        assert_eq!(r.read32le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read64le().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.read_bytes(4).unwrap(), b"tail");
        assert_eq!(r.remaining(), 0);
        assert!(r.read16le().is_err());
    }

    #[test]
    fn byte_reader_seek_and_skip() {
        let buf = [1u8, 2, 3, 4, 5];
        let mut r = ByteReader::new(&buf);
        r.skip(2).unwrap();
        assert_eq!(r.tell(), 2);
        r.seek(0);
        assert_eq!(r.read_bytes(1).unwrap(), &[1]);
        assert!(r.skip(10).is_err());
    }

    #[test]
    fn output_file_rewrites_in_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut of = OutputFile::create(&path).unwrap();
        of.write32le(0xAAAA_AAAA).unwrap();
        of.write32le(0xBBBB_BBBB).unwrap();
        let end = of.tell().unwrap();
        of.seek(0).unwrap();
        of.write32le(0x1111_1111).unwrap();
        of.seek(end).unwrap();
        of.write16le(0x22).unwrap();

        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[0..4], &0x1111_1111u32.to_le_bytes());
        assert_eq!(&data[4..8], &0xBBBB_BBBBu32.to_le_bytes());
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut of = OutputFile::create(&path).unwrap();
        of.write_all(b"keepdrop").unwrap();
        of.truncate(4).unwrap();
        of.write_all(b"!").unwrap();

        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"keep!");
    }

    #[test]
    fn map_file_sees_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"mapped bytes").unwrap();
        let f = File::open(&path).unwrap();
        let map = map_file(&f).unwrap();
        assert_eq!(&map[..], b"mapped bytes");
    }
}
