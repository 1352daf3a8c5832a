//! Catalog B-tree key/record parsing: folders, files, thread records, and
//! BSD permissions.
//!
//! Grounded on `hfsplus/src/catalog.rs` (teacher), reworked onto the
//! `DeviceReader`-based `btree` API and `bytes::Cursor`, and trimmed of its
//! ad hoc path-resolution logic — path walking, hard-link following, and
//! rsrc-suffix handling now live in `resolver`, which treats path resolution
//! as a component of its own with behavior the teacher never implemented.

use std::cmp::Ordering;

use crate::btree::{self, BTreeHeaderRecord};
use crate::bytes::Cursor;
use crate::device::DeviceReader;
use crate::error::{HfsPlusError, Result};
use crate::unicode;
use crate::volume::{self, ForkData, VolumeHeader};

/// Well-known Catalog Node IDs
pub const CNID_ROOT_PARENT: u32 = 1;
pub const CNID_ROOT_FOLDER: u32 = 2;
pub const CNID_EXTENTS_FILE: u32 = 3;
pub const CNID_CATALOG_FILE: u32 = 4;
pub const CNID_BAD_BLOCKS_FILE: u32 = 5;
pub const CNID_ALLOCATION_FILE: u32 = 6;
pub const CNID_STARTUP_FILE: u32 = 7;
pub const CNID_ATTRIBUTES_FILE: u32 = 8;

/// Catalog record types
pub const RECORD_TYPE_FOLDER: u16 = 0x0001;
pub const RECORD_TYPE_FILE: u16 = 0x0002;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 0x0003;
pub const RECORD_TYPE_FILE_THREAD: u16 = 0x0004;

/// Creator/type FourCCs identifying hard-link stub records (TN1150).
/// A file record is a regular hard-link stub when its creator/type match
/// `HFS_HFSPLUS_CREATOR`/`HFS_HARD_LINK_FILE_TYPE`; a folder record is a
/// directory hard-link stub when its creator/type match
/// `HFS_MACS_CREATOR`/`HFS_DIR_HARD_LINK_FILE_TYPE`. Not present in the
/// retrieved original-source pack; these are the well-known public values
/// also implied by the private catalog folder names (see `resolver`).
pub const HFS_HFSPLUS_CREATOR: u32 = 0x6866732B; // 'hfs+'
pub const HFS_HARD_LINK_FILE_TYPE: u32 = 0x686C6E6B; // 'hlnk'
pub const HFS_MACS_CREATOR: u32 = 0x4D414353; // 'MACS'
pub const HFS_DIR_HARD_LINK_FILE_TYPE: u32 = 0x66647270; // 'fdrp'

/// BSD `UF_COMPRESSED` flag bit, set on files whose data is stored via
/// `com.apple.decmpfs` rather than in the data fork directly.
pub const HFS_UF_COMPRESSED: u32 = 0x0000_0020;

/// BSD permissions
#[derive(Debug, Clone)]
pub struct HfsPlusBsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

/// Catalog file record
#[derive(Debug, Clone)]
pub struct CatalogFile {
    pub file_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: HfsPlusBsdInfo,
    pub user_info_type: u32,
    pub user_info_creator: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
    pub text_encoding: u32,
}

impl CatalogFile {
    /// A regular hard-link stub: creator/type match the reserved
    /// `hfs+`/`hlnk` pair (TN1150). Its BSD `special.inode_num` field names
    /// the private-folder `iNode<n>` entry holding the real data.
    pub fn is_hard_link(&self) -> bool {
        self.user_info_creator == HFS_HFSPLUS_CREATOR && self.user_info_type == HFS_HARD_LINK_FILE_TYPE
    }

    /// A directory hard-link stub: a *file* record (TN1150 represents
    /// directory hard links this way, not as a second folder record) whose
    /// creator/type match the reserved `MACS`/`fdrp` pair.
    pub fn is_dir_hard_link(&self) -> bool {
        self.user_info_creator == HFS_MACS_CREATOR && self.user_info_type == HFS_DIR_HARD_LINK_FILE_TYPE
    }

    pub fn is_compressed(&self) -> bool {
        self.permissions.owner_flags as u32 & HFS_UF_COMPRESSED != 0
    }

    pub fn inode_number(&self) -> u32 {
        self.permissions.special
    }
}

/// Catalog folder record.
///
/// Folders carry no creator/type FourCC (`DInfo`/`DXInfo`, not `FInfo`), so
/// unlike file hard links, a "directory hard link" is never represented as
/// a `CatalogFolder` — see [`CatalogFile::is_dir_hard_link`].
#[derive(Debug, Clone)]
pub struct CatalogFolder {
    pub folder_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: HfsPlusBsdInfo,
    pub valence: u32,
    pub text_encoding: u32,
}

impl CatalogFolder {
    pub fn inode_number(&self) -> u32 {
        self.permissions.special
    }
}

/// Catalog thread record (points back to the parent)
#[derive(Debug, Clone)]
pub struct CatalogThread {
    pub parent_id: u32,
    pub node_name: String,
}

/// Parsed catalog record
#[derive(Debug, Clone)]
pub enum CatalogRecord {
    Folder(CatalogFolder),
    File(CatalogFile),
    FolderThread(CatalogThread),
    FileThread(CatalogThread),
}

/// Catalog key: (parentID, nodeName)
#[derive(Debug, Clone)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub node_name: Vec<u16>, // UTF-16 code points
}

/// Parse a catalog key from raw record data.
/// Returns (key, offset of record data after the key, 2-byte aligned).
fn parse_catalog_key(data: &[u8]) -> Result<(CatalogKey, usize)> {
    if data.len() < 8 {
        return Err(HfsPlusError::InvalidBTree("catalog key too short".into()));
    }

    let key_length = u16::from_be_bytes([data[0], data[1]]) as usize;
    let parent_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    let name_length = u16::from_be_bytes([data[6], data[7]]) as usize;

    let name_start = 8;
    let name_end = name_start + name_length * 2;
    if name_end > data.len() {
        return Err(HfsPlusError::InvalidBTree(format!(
            "catalog key name extends beyond data: name_end={name_end}, data_len={}",
            data.len()
        )));
    }

    let node_name = unicode::utf16be_to_u16(&data[name_start..name_end]);

    let record_offset = 2 + key_length;
    let record_offset = if record_offset % 2 != 0 {
        record_offset + 1
    } else {
        record_offset
    };

    Ok((CatalogKey { parent_id, node_name }, record_offset))
}

fn parse_bsd_info(c: &mut Cursor) -> Result<HfsPlusBsdInfo> {
    Ok(HfsPlusBsdInfo {
        owner_id: c.read_u32()?,
        group_id: c.read_u32()?,
        admin_flags: c.read_u8()?,
        owner_flags: c.read_u8()?,
        file_mode: c.read_u16()?,
        special: c.read_u32()?,
    })
}

/// Parse a catalog record from raw data (after the key).
fn parse_catalog_record(data: &[u8]) -> Result<CatalogRecord> {
    if data.len() < 2 {
        return Err(HfsPlusError::InvalidBTree("catalog record too short".into()));
    }

    let record_type = u16::from_be_bytes([data[0], data[1]]);
    let mut c = Cursor::new(data);
    c.advance(2)?;

    match record_type {
        RECORD_TYPE_FOLDER => {
            let _flags = c.read_u16()?;
            let valence = c.read_u32()?;
            let folder_id = c.read_u32()?;
            let create_date = c.read_u32()?;
            let content_mod_date = c.read_u32()?;
            let attribute_mod_date = c.read_u32()?;
            let access_date = c.read_u32()?;
            let backup_date = c.read_u32()?;
            let permissions = parse_bsd_info(&mut c)?;
            c.advance(16)?; // DInfo (frRect, frFlags, frLocation, frView)
            c.advance(16)?; // DXInfo
            let text_encoding = c.read_u32()?;

            Ok(CatalogRecord::Folder(CatalogFolder {
                folder_id,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                permissions,
                valence,
                text_encoding,
            }))
        }
        RECORD_TYPE_FILE => {
            let _flags = c.read_u16()?;
            let _reserved = c.read_u32()?;
            let file_id = c.read_u32()?;
            let create_date = c.read_u32()?;
            let content_mod_date = c.read_u32()?;
            let attribute_mod_date = c.read_u32()?;
            let access_date = c.read_u32()?;
            let backup_date = c.read_u32()?;
            let permissions = parse_bsd_info(&mut c)?;
            // FileInfo: fdType(4) fdCreator(4) fdFlags(2) fdLocation(4) fdFldr(2)
            let user_info_type = c.read_u32()?;
            let user_info_creator = c.read_u32()?;
            c.advance(8)?; // fdFlags, fdLocation, fdFldr
            c.advance(16)?; // ExtendedFileInfo
            let text_encoding = c.read_u32()?;
            let _reserved2 = c.read_u32()?;
            let data_fork = volume::read_fork_data(&mut c)?;
            let resource_fork = volume::read_fork_data(&mut c)?;

            Ok(CatalogRecord::File(CatalogFile {
                file_id,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                permissions,
                user_info_type,
                user_info_creator,
                data_fork,
                resource_fork,
                text_encoding,
            }))
        }
        RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
            let _reserved = c.read_u16()?;
            let parent_id = c.read_u32()?;
            let name_length = c.read_u16()? as usize;
            let name_buf = c.take(name_length * 2)?;
            let name_u16 = unicode::utf16be_to_u16(name_buf);
            let node_name = unicode::utf16_to_string(&name_u16);

            let record = CatalogThread { parent_id, node_name };

            if record_type == RECORD_TYPE_FOLDER_THREAD {
                Ok(CatalogRecord::FolderThread(record))
            } else {
                Ok(CatalogRecord::FileThread(record))
            }
        }
        other => Err(HfsPlusError::InvalidBTree(format!(
            "unknown catalog record type: 0x{other:04X}"
        ))),
    }
}

/// Compare a catalog key in a B-tree record against a target (parent_id, name).
/// For HFSX: binary name comparison. For HFS+: case-insensitive.
fn make_catalog_comparator(target_parent_id: u32, target_name: &[u16], is_hfsx: bool) -> impl Fn(&[u8]) -> Ordering + '_ {
    move |record_data: &[u8]| {
        let (key, _) = match parse_catalog_key(record_data) {
            Ok(k) => k,
            Err(_) => return Ordering::Less,
        };

        match key.parent_id.cmp(&target_parent_id) {
            Ordering::Equal => {}
            ord => return ord,
        }

        if is_hfsx {
            unicode::compare_binary(&key.node_name, target_name)
        } else {
            unicode::compare_case_insensitive(&key.node_name, target_name)
        }
    }
}

/// Look up a catalog record by (parent_id, name).
pub fn lookup_catalog(
    device: &DeviceReader,
    vol: &VolumeHeader,
    btree_header: &BTreeHeaderRecord,
    parent_id: u32,
    name: &str,
) -> Result<Option<CatalogRecord>> {
    let name_u16 = unicode::string_to_utf16(name);
    let comparator = make_catalog_comparator(parent_id, &name_u16, vol.is_hfsx);

    match btree::search_btree(device, btree_header, &comparator)? {
        Some((node, record_idx)) => {
            let record_data = node.record_data(record_idx)?;
            let (_, record_offset) = parse_catalog_key(record_data)?;
            if record_offset >= record_data.len() {
                return Err(HfsPlusError::InvalidBTree("record data missing after key".into()));
            }
            let record = parse_catalog_record(&record_data[record_offset..])?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Look up a catalog record directly by CNID, via its thread record: thread
/// records are keyed by `(cnid, "")`, i.e. an empty name under a parent_id
/// equal to the CNID of interest.
pub fn lookup_by_cnid(
    device: &DeviceReader,
    vol: &VolumeHeader,
    btree_header: &BTreeHeaderRecord,
    cnid: u32,
) -> Result<Option<(CatalogRecord, CatalogThread)>> {
    let empty: Vec<u16> = Vec::new();
    let comparator = make_catalog_comparator(cnid, &empty, vol.is_hfsx);
    let (thread_node, thread_idx) = match btree::search_btree(device, btree_header, &comparator)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let thread_data = thread_node.record_data(thread_idx)?;
    let (_, thread_off) = parse_catalog_key(thread_data)?;
    let thread = match parse_catalog_record(&thread_data[thread_off..])? {
        CatalogRecord::FolderThread(t) | CatalogRecord::FileThread(t) => t,
        other => {
            return Err(HfsPlusError::CorruptedData(format!(
                "expected thread record for cnid {cnid}, got {other:?}"
            )))
        }
    };

    match lookup_catalog(device, vol, btree_header, thread.parent_id, &thread.node_name)? {
        Some(record) => Ok(Some((record, thread))),
        None => Err(HfsPlusError::CorruptedData(format!(
            "thread record for cnid {cnid} points to missing catalog entry"
        ))),
    }
}

/// List all entries in a directory (by parent CNID).
pub fn list_directory(
    device: &DeviceReader,
    vol: &VolumeHeader,
    btree_header: &BTreeHeaderRecord,
    parent_cnid: u32,
) -> Result<Vec<(String, CatalogRecord)>> {
    let empty_name: Vec<u16> = Vec::new();
    let comparator = make_catalog_comparator(parent_cnid, &empty_name, vol.is_hfsx);
    let start_node = match btree::find_starting_leaf(device, btree_header, &comparator)? {
        Some(n) => n,
        None => return Ok(Vec::new()),
    };

    let match_fn = |record_data: &[u8]| -> Option<bool> {
        match parse_catalog_key(record_data) {
            Ok((key, _)) => {
                if key.parent_id < parent_cnid {
                    Some(false)
                } else if key.parent_id == parent_cnid {
                    Some(true)
                } else {
                    None
                }
            }
            Err(_) => Some(false),
        }
    };

    let parse_fn = |record_data: &[u8]| -> Result<Option<(String, CatalogRecord)>> {
        let (key, record_offset) = parse_catalog_key(record_data)?;
        if record_offset >= record_data.len() {
            return Ok(None);
        }
        let record = parse_catalog_record(&record_data[record_offset..])?;
        match record {
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => Ok(None),
            other => Ok(Some((unicode::utf16_to_string(&key.node_name), other))),
        }
    };

    let raw: Vec<Option<(String, CatalogRecord)>> =
        btree::scan_leaves(device, btree_header, start_node, &match_fn, &parse_fn)?;
    Ok(raw.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::volume::ExtentDescriptor;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct TempFile(std::path::PathBuf);
    impl TempFile {
        fn new(data: &[u8]) -> Self {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let n = COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
            let mut path = std::env::temp_dir();
            path.push(format!("hfsplus-catalog-test-{}-{n}", std::process::id()));
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(data).unwrap();
            TempFile(path)
        }
    }
    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn open_device(data: &[u8]) -> DeviceReader {
        let temp = TempFile::new(data);
        let mut cfg = VolumeConfig::default();
        cfg.use_ublio = false;
        cfg.blksize = Some(64);
        DeviceReader::open(&temp.0, &cfg).unwrap()
    }

    fn folder_record_bytes(folder_id: u32, valence: u32) -> Vec<u8> {
        let mut r = vec![0u8; 88];
        r[0..2].copy_from_slice(&RECORD_TYPE_FOLDER.to_be_bytes());
        r[4..8].copy_from_slice(&valence.to_be_bytes());
        r[8..12].copy_from_slice(&folder_id.to_be_bytes());
        r
    }

    fn catalog_key_bytes(parent_id: u32, name: &str) -> Vec<u8> {
        let name_u16: Vec<u16> = name.encode_utf16().collect();
        let mut key = Vec::new();
        let key_len = 6 + 2 + name_u16.len() * 2;
        key.extend_from_slice(&(key_len as u16).to_be_bytes());
        key.extend_from_slice(&parent_id.to_be_bytes());
        key.extend_from_slice(&(name_u16.len() as u16).to_be_bytes());
        for u in name_u16 {
            key.extend_from_slice(&u.to_be_bytes());
        }
        if key.len() % 2 != 0 {
            key.push(0);
        }
        key
    }

    /// Build a single-leaf catalog B-tree with one folder named "docs"
    /// under the root folder.
    fn build_catalog_tree() -> (DeviceReader, VolumeHeader, BTreeHeaderRecord) {
        let node_size: u16 = 512;
        let mut image = vec![0u8; node_size as usize * 2];

        let key = catalog_key_bytes(CNID_ROOT_FOLDER, "docs");
        let record = folder_record_bytes(100, 0);
        let mut rec_bytes = key.clone();
        rec_bytes.extend_from_slice(&record);
        if rec_bytes.len() % 2 != 0 {
            rec_bytes.push(0);
        }

        {
            let node = &mut image[0..node_size as usize];
            node[8] = btree::NODE_KIND_HEADER;
            node[10..12].copy_from_slice(&3u16.to_be_bytes());
            node[16..20].copy_from_slice(&1u32.to_be_bytes());
            node[32..34].copy_from_slice(&node_size.to_be_bytes());
            let tail = node.len();
            node[tail - 2..tail].copy_from_slice(&(tail as u16 - 8).to_be_bytes());
            node[tail - 4..tail - 2].copy_from_slice(&14u16.to_be_bytes());
            node[tail - 6..tail - 4].copy_from_slice(&14u16.to_be_bytes());
            node[tail - 8..tail - 6].copy_from_slice(&14u16.to_be_bytes());
        }
        {
            let node = &mut image[node_size as usize..node_size as usize * 2];
            node[8] = btree::NODE_KIND_LEAF;
            node[10..12].copy_from_slice(&1u16.to_be_bytes());
            node[14..14 + rec_bytes.len()].copy_from_slice(&rec_bytes);
            let end = 14 + rec_bytes.len();
            let tail = node.len();
            node[tail - 2..tail].copy_from_slice(&(end as u16).to_be_bytes());
            node[tail - 4..tail - 2].copy_from_slice(&14u16.to_be_bytes());
        }

        let device = open_device(&image);
        let header = BTreeHeaderRecord {
            tree_depth: 0,
            root_node: 1,
            leaf_records: 1,
            first_leaf_node: 1,
            last_leaf_node: 1,
            node_size,
            max_key_length: 255,
            total_nodes: 2,
            free_nodes: 0,
            key_compare_type: 0,
            extents: vec![ExtentDescriptor {
                start_block: 0,
                block_count: 100,
            }],
            block_size: node_size as u32,
        };

        let mut vol_buf = vec![0u8; 512];
        vol_buf[0] = 0x48;
        vol_buf[1] = 0x2B;
        vol_buf[3] = 0x04;
        vol_buf[40..44].copy_from_slice(&(node_size as u32).to_be_bytes());
        let vol = VolumeHeader::parse(&vol_buf).unwrap();

        (device, vol, header)
    }

    #[test]
    fn lookup_catalog_finds_folder_by_name() {
        let (device, vol, header) = build_catalog_tree();
        let record = lookup_catalog(&device, &vol, &header, CNID_ROOT_FOLDER, "docs")
            .unwrap()
            .expect("docs should be found");
        match record {
            CatalogRecord::Folder(f) => assert_eq!(f.folder_id, 100),
            other => panic!("expected folder, got {other:?}"),
        }
    }

    #[test]
    fn lookup_catalog_missing_name_returns_none() {
        let (device, vol, header) = build_catalog_tree();
        let record = lookup_catalog(&device, &vol, &header, CNID_ROOT_FOLDER, "missing").unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn list_directory_returns_the_one_child() {
        let (device, vol, header) = build_catalog_tree();
        let entries = list_directory(&device, &vol, &header, CNID_ROOT_FOLDER).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "docs");
    }
}
