//! Journal inspection: info block, header, and the clean/dirty check.
//!
//! This crate never replays the journal — it only reads enough of it to
//! answer "was this volume unmounted cleanly". Grounded on
//! `examples/original_source/lib/libhfs/libhfs.c`'s journal read path: the
//! info block lives at the absolute byte offset
//! `volume_header.journal_info_block * block_size` (a direct block number,
//! not a fork/CNID lookup), and the header lives at the absolute byte
//! offset named by the info block's own `offset` field.

use crate::bytes::Cursor;
use crate::error::Result;

pub const JOURNAL_INFO_BLOCK_SIZE: usize = 4 + 8 * 4 + 8 + 8 + 32 * 4;
pub const JOURNAL_HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 4 + 4 + 4;

/// `JIB` — points at the journal's physical location and carries the
/// device signature used to validate it belongs to this volume.
#[derive(Debug, Clone)]
pub struct JournalInfoBlock {
    pub flags: u32,
    pub device_signature: [u32; 8],
    pub offset: u64,
    pub size: u64,
}

impl JournalInfoBlock {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        let flags = c.read_u32()?;
        let mut device_signature = [0u32; 8];
        for slot in &mut device_signature {
            *slot = c.read_u32()?;
        }
        let offset = c.read_u64()?;
        let size = c.read_u64()?;
        Ok(JournalInfoBlock { flags, device_signature, offset, size })
    }
}

/// `jhdr` — the journal's own header, read at `JournalInfoBlock::offset`.
#[derive(Debug, Clone)]
pub struct JournalHeader {
    pub magic: u32,
    pub endian: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub blocklist_header_size: u32,
    pub checksum: u32,
    pub journal_header_size: u32,
}

impl JournalHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        Ok(JournalHeader {
            magic: c.read_u32()?,
            endian: c.read_u32()?,
            start: c.read_u64()?,
            end: c.read_u64()?,
            size: c.read_u64()?,
            blocklist_header_size: c.read_u32()?,
            checksum: c.read_u32()?,
            journal_header_size: c.read_u32()?,
        })
    }

    /// A journal with `start == end` has nothing left to replay.
    pub fn is_clean(&self) -> bool {
        self.start == self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::Write;

    fn build_info_block(offset: u64, size: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(1).unwrap(); // flags
        for i in 0..8u32 {
            buf.write_u32::<BigEndian>(i).unwrap();
        }
        buf.write_u64::<BigEndian>(offset).unwrap();
        buf.write_u64::<BigEndian>(size).unwrap();
        buf.write_all(&[0u8; 32 * 4]).unwrap();
        buf
    }

    fn build_header(start: u64, end: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(0x4A4E4C78).unwrap(); // "JNLx"
        buf.write_u32::<BigEndian>(0x12345678).unwrap();
        buf.write_u64::<BigEndian>(start).unwrap();
        buf.write_u64::<BigEndian>(end).unwrap();
        buf.write_u64::<BigEndian>(1024 * 1024).unwrap();
        buf.write_u32::<BigEndian>(4096).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(JOURNAL_HEADER_SIZE as u32).unwrap();
        buf
    }

    #[test]
    fn parses_info_block_fields() {
        let buf = build_info_block(8192, 16 * 1024 * 1024);
        let jib = JournalInfoBlock::parse(&buf).unwrap();
        assert_eq!(jib.offset, 8192);
        assert_eq!(jib.size, 16 * 1024 * 1024);
        assert_eq!(jib.device_signature[3], 3);
    }

    #[test]
    fn clean_journal_has_equal_start_and_end() {
        let buf = build_header(100, 100);
        let jh = JournalHeader::parse(&buf).unwrap();
        assert!(jh.is_clean());
    }

    #[test]
    fn dirty_journal_has_unequal_start_and_end() {
        let buf = build_header(100, 4096);
        let jh = JournalHeader::parse(&buf).unwrap();
        assert!(!jh.is_clean());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let buf = vec![0u8; 4];
        assert!(JournalInfoBlock::parse(&buf).is_err());
    }
}
