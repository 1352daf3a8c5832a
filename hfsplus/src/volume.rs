//! Volume header, classic-HFS wrapper (MDB) detection, and the fork/extent
//! descriptors shared by every on-disk record that owns a fork.
//!
//! Grounded on `hfsplus/src/volume.rs` (teacher), reworked to parse from
//! borrowed byte slices via [`crate::bytes::Cursor`] instead of a live
//! `Read + Seek` stream, so buffers fetched through [`crate::device::DeviceReader`]
//! can be fed straight in. Wrapper/MDB detection is grounded on
//! `examples/original_source/lib/libhfs/libhfs.c`'s volume-open path, which
//! reads the MDB first and, on a classic-HFS signature, derives the embedded
//! volume's base offset before re-reading the real volume header.

use bitflags::bitflags;

use crate::bytes::Cursor;
use crate::error::{HfsPlusError, Result};

/// Byte offset of the volume header (or MDB) from the start of the
/// partition/wrapper.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;

/// HFS+ signature: "H+" (0x482B)
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;

/// HFSX signature: "HX" (0x4858) — case-sensitive variant
pub const HFSX_SIGNATURE: u16 = 0x4858;

/// Classic HFS signature ("BD"), seen when HFS+ is embedded in an HFS wrapper.
pub const HFS_WRAPPER_SIGNATURE: u16 = 0x4244;

/// HFS+ volume header version
pub const HFS_PLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

bitflags! {
    /// `VolumeHeader::attributes` bit set (Apple `VolumeAttributes` in
    /// `hfs/hfs_format.h`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeAttributes: u32 {
        const HARDWARE_LOCK   = 1 << 7;
        const UNMOUNTED       = 1 << 8;
        const SPARED_BLOCKS   = 1 << 9;
        const NO_CACHE_REQUIRED = 1 << 10;
        const INCONSISTENT    = 1 << 11;
        const CNIDS_REUSED    = 1 << 12;
        const JOURNALED       = 1 << 13;
        const SOFTWARE_LOCK   = 1 << 15;
    }
}

impl VolumeAttributes {
    /// "Unmounted cleanly" in the sense the rest of the crate cares about:
    /// the unmounted bit is set and the inconsistent bit is clear.
    pub fn is_clean(self) -> bool {
        self.contains(VolumeAttributes::UNMOUNTED)
            && !self.contains(VolumeAttributes::INCONSISTENT)
    }
}

/// An extent descriptor: contiguous range of allocation blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

/// Fork data: describes a data or resource fork
#[derive(Debug, Clone, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

impl ForkData {
    /// The inline extents, stopping at the first zero-length entry.
    pub fn inline_extents(&self) -> impl Iterator<Item = &ExtentDescriptor> {
        self.extents.iter().take_while(|e| e.block_count > 0)
    }
}

/// Classic-HFS Master Directory Block, read only far enough to detect and
/// locate an embedded HFS+/HFSX volume (a "wrapped" volume, per TN1150).
/// Every other MDB field is of no interest to a read-only HFS+ decoder.
#[derive(Debug, Clone)]
pub struct MasterDirectoryBlock {
    pub signature: u16,
    pub block_size: u32,
    pub first_block: u16,
    pub embedded_signature: u16,
    pub embedded_extent: ExtentDescriptor,
}

impl MasterDirectoryBlock {
    /// Parse just the fields needed to find an embedded HFS+ volume out of
    /// the 1024-byte region starting at the wrapper's `VOLUME_HEADER_OFFSET`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        let signature = c.read_u16()?;
        c.advance(4)?; // date_created
        c.advance(4)?; // date_modified
        c.advance(2)?; // attributes
        c.advance(2)?; // root_file_count
        c.advance(2)?; // volume_bitmap
        c.advance(2)?; // next_alloc_block
        c.advance(2)?; // total_blocks
        let block_size = c.read_u32()?;
        c.advance(4)?; // clump_size
        let first_block = c.read_u16()?;
        c.advance(4)?; // next_cnid
        c.advance(2)?; // free_blocks
        c.advance(28)?; // volume_name
        c.advance(4)?; // date_backedup
        c.advance(2)?; // backup_seqnum
        c.advance(4)?; // write_count
        c.advance(4)?; // extents_clump_size
        c.advance(4)?; // catalog_clump_size
        c.advance(2)?; // root_folder_count
        c.advance(4)?; // file_count
        c.advance(4)?; // folder_count
        c.advance(4 * 8)?; // finder_info
        let embedded_signature = c.read_u16()?;
        let embedded_extent = read_extent_descriptor16(&mut c)?;

        Ok(MasterDirectoryBlock {
            signature,
            block_size,
            first_block,
            embedded_signature,
            embedded_extent,
        })
    }

    /// Byte offset, relative to the start of the partition, of the embedded
    /// volume's own offset-1024 volume header.
    pub fn embedded_base_offset(&self) -> u64 {
        self.first_block as u64 * 512
            + self.embedded_extent.start_block as u64 * self.block_size as u64
    }
}

/// Classic-HFS extents use 16-bit fields, unlike HFS+'s 32-bit ones.
fn read_extent_descriptor16(c: &mut Cursor) -> Result<ExtentDescriptor> {
    Ok(ExtentDescriptor {
        start_block: c.read_u16()? as u32,
        block_count: c.read_u16()? as u32,
    })
}

/// The HFS+ Volume Header (512 bytes at offset 1024)
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: VolumeAttributes,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encoding_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
    /// true if this is HFSX (case-sensitive)
    pub is_hfsx: bool,
}

fn read_extent_descriptor(c: &mut Cursor) -> Result<ExtentDescriptor> {
    Ok(ExtentDescriptor {
        start_block: c.read_u32()?,
        block_count: c.read_u32()?,
    })
}

pub(crate) fn read_fork_data(c: &mut Cursor) -> Result<ForkData> {
    let logical_size = c.read_u64()?;
    let clump_size = c.read_u32()?;
    let total_blocks = c.read_u32()?;
    let mut extents = [ExtentDescriptor::default(); 8];
    for extent in &mut extents {
        *extent = read_extent_descriptor(c)?;
    }
    Ok(ForkData {
        logical_size,
        clump_size,
        total_blocks,
        extents,
    })
}

impl VolumeHeader {
    /// Parse the 512-byte volume header from `data`, which must begin at
    /// the header's own offset (i.e. the caller has already added
    /// [`VOLUME_HEADER_OFFSET`], and possibly a wrapper's embedded base
    /// offset, to whatever it read from the device).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);

        let signature = c.read_u16()?;
        let is_hfsx = match signature {
            HFS_PLUS_SIGNATURE => false,
            HFSX_SIGNATURE => true,
            _ => return Err(HfsPlusError::InvalidSignature(signature)),
        };

        let version = c.read_u16()?;
        match version {
            HFS_PLUS_VERSION | HFSX_VERSION => {}
            _ => return Err(HfsPlusError::UnsupportedVersion(version)),
        }

        let attributes = VolumeAttributes::from_bits_truncate(c.read_u32()?);
        let last_mounted_version = c.read_u32()?;
        let journal_info_block = c.read_u32()?;
        let create_date = c.read_u32()?;
        let modify_date = c.read_u32()?;
        let backup_date = c.read_u32()?;
        let checked_date = c.read_u32()?;
        let file_count = c.read_u32()?;
        let folder_count = c.read_u32()?;
        let block_size = c.read_u32()?;
        let total_blocks = c.read_u32()?;
        let free_blocks = c.read_u32()?;
        let next_allocation = c.read_u32()?;
        let rsrc_clump_size = c.read_u32()?;
        let data_clump_size = c.read_u32()?;
        let next_catalog_id = c.read_u32()?;
        let write_count = c.read_u32()?;
        let encoding_bitmap = c.read_u64()?;

        let mut finder_info = [0u32; 8];
        for fi in &mut finder_info {
            *fi = c.read_u32()?;
        }

        let allocation_file = read_fork_data(&mut c)?;
        let extents_file = read_fork_data(&mut c)?;
        let catalog_file = read_fork_data(&mut c)?;
        let attributes_file = read_fork_data(&mut c)?;
        let startup_file = read_fork_data(&mut c)?;

        Ok(VolumeHeader {
            signature,
            version,
            attributes,
            last_mounted_version,
            journal_info_block,
            create_date,
            modify_date,
            backup_date,
            checked_date,
            file_count,
            folder_count,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count,
            encoding_bitmap,
            finder_info,
            allocation_file,
            extents_file,
            catalog_file,
            attributes_file,
            startup_file,
            is_hfsx,
        })
    }
}

/// HFS epoch (1904-01-01 UTC) to Unix epoch offset, in seconds.
pub const HFS_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Convert an HFS+ on-disk timestamp (seconds since 1904-01-01 UTC) to a
/// Unix timestamp (seconds since 1970-01-01 UTC; may be negative for dates
/// before 1970).
pub fn hfs_time_to_unix(hfs_seconds: u32) -> i64 {
    hfs_seconds as i64 - HFS_EPOCH_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0] = 0x48;
        buf[1] = 0x2B; // "H+"
        buf[2] = 0x00;
        buf[3] = 0x04; // version 4
        buf[8] = 0x00;
        buf[9] = 0x00;
        buf[10] = 0x02;
        buf[11] = 0x00; // attributes = 0x200 (unmounted)
        // block_size at offset 40
        buf[40..44].copy_from_slice(&4096u32.to_be_bytes());
        buf
    }

    #[test]
    fn parses_minimal_header() {
        let buf = sample_header_bytes();
        let header = VolumeHeader::parse(&buf).unwrap();
        assert!(!header.is_hfsx);
        assert_eq!(header.version, HFS_PLUS_VERSION);
        assert_eq!(header.block_size, 4096);
        assert!(header.attributes.contains(VolumeAttributes::UNMOUNTED));
        assert!(header.attributes.is_clean());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = sample_header_bytes();
        buf[0] = 0;
        buf[1] = 0;
        match VolumeHeader::parse(&buf) {
            Err(HfsPlusError::InvalidSignature(0)) => {}
            other => panic!("expected InvalidSignature, got {other:?}"),
        }
    }

    #[test]
    fn hfs_epoch_converts_to_unix() {
        // 1904-01-01 itself is 0 in HFS and -2082844800 in Unix time.
        assert_eq!(hfs_time_to_unix(0), -HFS_EPOCH_OFFSET);
        // 2082844800 HFS seconds is exactly 1970-01-01 Unix time 0.
        assert_eq!(hfs_time_to_unix(2_082_844_800), 0);
    }
}
