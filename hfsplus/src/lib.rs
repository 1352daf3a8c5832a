//! A read-only HFS+/HFSX volume decoder and query engine.
//!
//! [`HfsVolume::open`] carries out the orchestration spec §4.11 describes:
//! classic-HFS wrapper detection, catalog/extents-overflow/attributes
//! B-tree header reads, the HX case-sensitivity correction, journal
//! clean-check, hard-link private-folder discovery, and path-cache setup.
//! Everything afterwards — [`HfsVolume::lookup`], [`HfsVolume::stat`],
//! [`HfsVolume::open_file`], [`HfsVolume::list_dir`],
//! [`HfsVolume::list_xattr`]/[`HfsVolume::get_xattr`],
//! [`HfsVolume::find_by_cnid`] — is a thin dispatch layer over `resolver`,
//! `catalog`, `extents`, `attributes`, and `decmpfs`.

pub mod attributes;
pub mod btree;
pub mod bytes;
pub mod catalog;
pub mod config;
pub mod decmpfs;
pub mod device;
pub mod error;
pub mod extents;
pub mod journal;
pub mod pathcache;
pub mod resolver;
pub mod unicode;
pub mod volume;

use std::path::Path;
use std::sync::Arc;

use crate::btree::BTreeHeaderRecord;
use crate::catalog::{CatalogFile, CatalogFolder, CatalogRecord, HfsPlusBsdInfo, CNID_ROOT_FOLDER};
use crate::device::DeviceReader;
pub use crate::error::{HfsPlusError, Result};
use crate::extents::{ForkReader, FORK_TYPE_DATA, FORK_TYPE_RESOURCE};
use crate::journal::{JournalHeader, JournalInfoBlock};
use crate::pathcache::PathCache;
use crate::resolver::{ForkKind, HardLinkFolders, ResolveContext};
use crate::volume::{
    hfs_time_to_unix, MasterDirectoryBlock, VolumeAttributes, HFS_PLUS_SIGNATURE, HFSX_SIGNATURE,
    HFS_WRAPPER_SIGNATURE, VOLUME_HEADER_OFFSET,
};
pub use crate::config::VolumeConfig;
pub use crate::volume::VolumeHeader;

/// A record's kind as surfaced through the public API (hard-link stubs are
/// already resolved to their target by the time callers see this).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry returned by [`HfsVolume::list_dir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub cnid: u32,
    pub kind: EntryKind,
}

/// POSIX-flavored stat information (spec §4.12).
#[derive(Debug, Clone)]
pub struct FileStat {
    pub cnid: u32,
    pub kind: EntryKind,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub create_time: i64,
    pub modify_time: i64,
    pub access_time: i64,
    pub backup_time: i64,
}

/// `S_IFMT`, the file-type mask of a BSD `st_mode`. A zero here marks a
/// pre-OS-X record that never had real BSD permissions assigned.
const S_IFMT: u16 = 0o170000;

enum FileHandleBody {
    Plain(ForkReader),
    Compressed(decmpfs::DecmpfsContext),
}

/// A file opened via [`HfsVolume::open_file`]: its resolved extent list, or
/// a ready [`decmpfs::DecmpfsContext`] when the file is transparently
/// compressed.
pub struct FileHandle {
    file_id: u32,
    logical_size: u64,
    body: FileHandleBody,
}

impl FileHandle {
    pub fn cnid(&self) -> u32 {
        self.file_id
    }

    pub fn len(&self) -> u64 {
        self.logical_size
    }

    pub fn is_empty(&self) -> bool {
        self.logical_size == 0
    }

    /// `pread`-style read: up to `buf.len()` bytes starting at logical
    /// offset `offset`. Returns the number of bytes produced (0 at EOF).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match &self.body {
            FileHandleBody::Plain(fork) => fork.read_at(buf, offset),
            FileHandleBody::Compressed(ctx) => ctx.read_at(buf, offset),
        }
    }
}

/// Whether the volume's journal (if any) was unmounted cleanly.
struct JournalStatus {
    clean: bool,
}

/// An opened HFS+/HFSX volume. Cheap to share: every read path borrows
/// `&self` and the underlying device is reference-counted, so a caller
/// wanting concurrent access need only wrap `HfsVolume` in its own `Arc`.
pub struct HfsVolume {
    device: Arc<DeviceReader>,
    header: VolumeHeader,
    catalog_btree: BTreeHeaderRecord,
    extents_btree: BTreeHeaderRecord,
    attributes_btree: Option<BTreeHeaderRecord>,
    journal: Option<JournalStatus>,
    hard_links: HardLinkFolders,
    cache: PathCache,
    cfg: VolumeConfig,
    volume_name: String,
}

impl HfsVolume {
    /// Open and validate a volume per spec §4.11's eight-step algorithm.
    pub fn open(path: &Path, cfg: VolumeConfig) -> Result<Self> {
        let device = Arc::new(DeviceReader::open(path, &cfg)?);
        let mut header = Self::read_volume_header(&device)?;

        let catalog_btree =
            btree::read_btree_header(&device, &header.catalog_file.extents, header.block_size)?;
        let extents_btree =
            btree::read_btree_header(&device, &header.extents_file.extents, header.block_size)?;

        // An HX-signature volume's real case sensitivity is decided by the
        // catalog B-tree's own key_compare_type, not by the signature alone
        // (TN1150): 0xCF means the volume actually compares names
        // case-insensitively despite the HX signature.
        if header.is_hfsx && catalog_btree.key_compare_type == btree::KEY_COMPARE_CASE_FOLDING {
            header.is_hfsx = false;
        }

        let attributes_btree = if header.attributes_file.total_blocks > 0 {
            Some(btree::read_btree_header(
                &device,
                &header.attributes_file.extents,
                header.block_size,
            )?)
        } else {
            None
        };

        let journal = if header.attributes.contains(VolumeAttributes::JOURNALED) {
            Some(Self::read_journal_status(&device, &header)?)
        } else {
            None
        };

        let hard_links = HardLinkFolders::discover(&device, &header, &catalog_btree)?;

        let (_root_record, root_thread) =
            catalog::lookup_by_cnid(&device, &header, &catalog_btree, CNID_ROOT_FOLDER)?.ok_or_else(|| {
                HfsPlusError::CorruptedData("volume has no root folder thread record".into())
            })?;

        Ok(HfsVolume {
            device,
            cache: PathCache::new(cfg.cache_size),
            volume_name: root_thread.node_name,
            header,
            catalog_btree,
            extents_btree,
            attributes_btree,
            journal,
            hard_links,
            cfg,
        })
    }

    /// Releases the device handle and every buffer this volume owns. A
    /// no-op beyond documenting the moment of release: Rust's `Drop` does
    /// the actual work when `self` goes out of scope.
    pub fn close(self) {}

    fn read_volume_header(device: &DeviceReader) -> Result<VolumeHeader> {
        let mut buf = vec![0u8; 512];
        device.read_at(&mut buf, VOLUME_HEADER_OFFSET)?;

        match VolumeHeader::parse(&buf) {
            Ok(header) => Ok(header),
            Err(HfsPlusError::InvalidSignature(sig)) if sig == HFS_WRAPPER_SIGNATURE => {
                let mdb = MasterDirectoryBlock::parse(&buf)?;
                if mdb.embedded_signature != HFS_PLUS_SIGNATURE && mdb.embedded_signature != HFSX_SIGNATURE {
                    return Err(HfsPlusError::InvalidSignature(mdb.embedded_signature));
                }
                let base = mdb.embedded_base_offset();
                let mut embedded = vec![0u8; 512];
                device.read_at(&mut embedded, base + VOLUME_HEADER_OFFSET)?;
                VolumeHeader::parse(&embedded)
            }
            Err(e) => Err(e),
        }
    }

    fn read_journal_status(device: &DeviceReader, header: &VolumeHeader) -> Result<JournalStatus> {
        let info_offset = header.journal_info_block as u64 * header.block_size as u64;
        let mut info_buf = vec![0u8; journal::JOURNAL_INFO_BLOCK_SIZE];
        device.read_at(&mut info_buf, info_offset)?;
        let info = JournalInfoBlock::parse(&info_buf)?;

        let mut header_buf = vec![0u8; journal::JOURNAL_HEADER_SIZE];
        device.read_at(&mut header_buf, info.offset)?;
        let jh = JournalHeader::parse(&header_buf)?;
        Ok(JournalStatus { clean: jh.is_clean() })
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// `None` on an unjournaled volume; `Some(true)` if the journal's
    /// `start`/`end` agree (nothing left to replay).
    pub fn is_journal_clean(&self) -> Option<bool> {
        self.journal.as_ref().map(|j| j.clean)
    }

    fn resolve_ctx(&self) -> ResolveContext {
        ResolveContext {
            device: &self.device,
            vol: &self.header,
            catalog_btree: &self.catalog_btree,
            cache: &self.cache,
            cfg: &self.cfg,
            hard_links: self.hard_links,
        }
    }

    /// Resolve an absolute POSIX path to its catalog record, the entry's
    /// own name, and which fork it names (spec §4.9/§4.12).
    pub fn lookup(&self, path: &str) -> Result<(CatalogRecord, String, ForkKind)> {
        resolver::resolve(&self.resolve_ctx(), path)
    }

    /// Fetch a catalog record directly by CNID, via its thread record,
    /// returning the record alongside its own (parent-relative) name.
    pub fn find_by_cnid(&self, cnid: u32) -> Result<(CatalogRecord, String)> {
        catalog::lookup_by_cnid(&self.device, &self.header, &self.catalog_btree, cnid)?
            .map(|(record, thread)| (record, thread.node_name))
            .ok_or_else(|| HfsPlusError::FileNotFound(format!("cnid {cnid}")))
    }

    fn require_cnid(record: &CatalogRecord) -> Result<u32> {
        match record {
            CatalogRecord::Folder(f) => Ok(f.folder_id),
            CatalogRecord::File(f) => Ok(f.file_id),
            other => Err(HfsPlusError::CorruptedData(format!(
                "unexpected thread record where an entry was expected: {other:?}"
            ))),
        }
    }

    /// Apply the pre-OS-X default (spec §4.12): records whose `file_mode &
    /// S_IFMT == 0` never had real BSD permissions assigned, so the
    /// configured defaults stand in for owner/group/mode together.
    fn resolve_permissions(&self, bsd: &HfsPlusBsdInfo, is_dir: bool) -> (u32, u32, u16) {
        if bsd.file_mode & S_IFMT == 0 {
            let mode = if is_dir {
                self.cfg.default_dir_mode
            } else {
                self.cfg.default_file_mode
            };
            (self.cfg.default_uid, self.cfg.default_gid, mode)
        } else {
            (bsd.owner_id, bsd.group_id, bsd.file_mode)
        }
    }

    fn decmpfs_logical_size(&self, file_id: u32) -> Result<Option<u64>> {
        let attr_btree = match &self.attributes_btree {
            Some(b) => b,
            None => return Ok(None),
        };
        let attr = attributes::get_xattr(
            &self.device,
            &self.header,
            attr_btree,
            &self.extents_btree,
            file_id,
            "com.apple.decmpfs",
        )?;
        match attr {
            Some(bytes) => Ok(Some(decmpfs::DecmpfsHeader::parse(&bytes)?.logical_size)),
            None => Ok(None),
        }
    }

    fn stat_folder(folder: &CatalogFolder) -> (u32, EntryKind, u64, u32) {
        (folder.folder_id, EntryKind::Directory, 0, folder.valence + 2)
    }

    /// Build [`FileStat`] for an already-resolved record and fork.
    fn stat_record(&self, record: &CatalogRecord, fork: ForkKind) -> Result<FileStat> {
        match record {
            CatalogRecord::Folder(folder) => {
                let (cnid, kind, size, nlink) = Self::stat_folder(folder);
                let (uid, gid, mode) = self.resolve_permissions(&folder.permissions, true);
                Ok(FileStat {
                    cnid,
                    kind,
                    size,
                    nlink,
                    uid,
                    gid,
                    mode,
                    create_time: hfs_time_to_unix(folder.create_date),
                    modify_time: hfs_time_to_unix(folder.content_mod_date),
                    access_time: hfs_time_to_unix(folder.access_date),
                    backup_time: hfs_time_to_unix(folder.backup_date),
                })
            }
            CatalogRecord::File(file) => {
                let mut size = if fork == ForkKind::Resource {
                    file.resource_fork.logical_size
                } else {
                    file.data_fork.logical_size
                };
                if fork == ForkKind::Data && file.is_compressed() {
                    if let Some(real_size) = self.decmpfs_logical_size(file.file_id)? {
                        size = real_size;
                    }
                }
                let (uid, gid, mode) = self.resolve_permissions(&file.permissions, false);
                Ok(FileStat {
                    cnid: file.file_id,
                    kind: EntryKind::File,
                    size,
                    nlink: 1,
                    uid,
                    gid,
                    mode,
                    create_time: hfs_time_to_unix(file.create_date),
                    modify_time: hfs_time_to_unix(file.content_mod_date),
                    access_time: hfs_time_to_unix(file.access_date),
                    backup_time: hfs_time_to_unix(file.backup_date),
                })
            }
            other => Err(HfsPlusError::CorruptedData(format!(
                "unexpected thread record where an entry was expected: {other:?}"
            ))),
        }
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let (record, _name, fork) = self.lookup(path)?;
        self.stat_record(&record, fork)
    }

    pub fn stat_by_cnid(&self, cnid: u32) -> Result<FileStat> {
        let (record, _name) = self.find_by_cnid(cnid)?;
        self.stat_record(&record, ForkKind::Data)
    }

    fn open_file_record(&self, file: &CatalogFile, fork: ForkKind) -> Result<FileHandle> {
        let (fork_type, fork_data) = match fork {
            ForkKind::Data => (FORK_TYPE_DATA, &file.data_fork),
            ForkKind::Resource => (FORK_TYPE_RESOURCE, &file.resource_fork),
        };

        if fork == ForkKind::Data && file.is_compressed() {
            if let Some(attr_btree) = &self.attributes_btree {
                let attr_bytes = attributes::get_xattr(
                    &self.device,
                    &self.header,
                    attr_btree,
                    &self.extents_btree,
                    file.file_id,
                    "com.apple.decmpfs",
                )?;
                if let Some(attr_bytes) = attr_bytes {
                    let rsrc_extents = extents::resolve_extents(
                        &self.device,
                        &self.extents_btree,
                        &file.resource_fork,
                        file.file_id,
                        FORK_TYPE_RESOURCE,
                    )?;
                    let ctx = decmpfs::DecmpfsContext::open(
                        &attr_bytes,
                        Arc::clone(&self.device),
                        rsrc_extents,
                        self.header.block_size,
                        file.resource_fork.logical_size,
                    )?;
                    return Ok(FileHandle {
                        file_id: file.file_id,
                        logical_size: ctx.logical_size(),
                        body: FileHandleBody::Compressed(ctx),
                    });
                }
            }
        }

        let resolved =
            extents::resolve_extents(&self.device, &self.extents_btree, fork_data, file.file_id, fork_type)?;
        let reader = ForkReader::new(
            Arc::clone(&self.device),
            resolved,
            self.header.block_size,
            fork_data.logical_size,
        );
        Ok(FileHandle {
            file_id: file.file_id,
            logical_size: fork_data.logical_size,
            body: FileHandleBody::Plain(reader),
        })
    }

    /// Open a file for reading (spec §4.12). Transparently compressed files
    /// (`com.apple.decmpfs` present and the BSD `UF_COMPRESSED` bit set) are
    /// served through [`decmpfs::DecmpfsContext`] rather than their data
    /// fork's raw bytes.
    pub fn open_file(&self, path: &str) -> Result<FileHandle> {
        let (record, _name, fork) = self.lookup(path)?;
        match record {
            CatalogRecord::File(file) => self.open_file_record(&file, fork),
            CatalogRecord::Folder(_) => Err(HfsPlusError::NotADirectory(format!("{path} is a directory"))),
            other => Err(HfsPlusError::CorruptedData(format!(
                "unexpected thread record where a file was expected: {other:?}"
            ))),
        }
    }

    fn classify_entry(&self, record: CatalogRecord) -> Result<(u32, EntryKind)> {
        match record {
            CatalogRecord::Folder(f) => Ok((f.folder_id, EntryKind::Directory)),
            CatalogRecord::File(file) if file.is_dir_hard_link() => {
                let ctx = self.resolve_ctx();
                let folder = resolver::resolve_dir_hard_link(&ctx, file, self.cfg.max_link_depth)?;
                Ok((folder.folder_id, EntryKind::Directory))
            }
            CatalogRecord::File(file) => {
                let ctx = self.resolve_ctx();
                let resolved = resolver::resolve_file_hard_link(&ctx, file, self.cfg.max_link_depth)?;
                Ok((resolved.file_id, EntryKind::File))
            }
            other => Err(HfsPlusError::CorruptedData(format!(
                "unexpected thread record in directory listing: {other:?}"
            ))),
        }
    }

    /// List a folder's children by CNID, resolving hard-link stubs to their
    /// real target and omitting the private hard-link/journal names (spec
    /// §4.9, §4.12).
    pub fn list_dir_by_cnid(&self, folder_id: u32) -> Result<Vec<DirEntry>> {
        let entries = catalog::list_directory(&self.device, &self.header, &self.catalog_btree, folder_id)?;
        let mut out = Vec::with_capacity(entries.len());
        for (name, record) in entries {
            if folder_id == CNID_ROOT_FOLDER && resolver::PRIVATE_NAMES.contains(&name.as_str()) {
                continue;
            }
            let (cnid, kind) = self.classify_entry(record)?;
            out.push(DirEntry { name, cnid, kind });
        }
        Ok(out)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (record, _name, _fork) = self.lookup(path)?;
        match record {
            CatalogRecord::Folder(f) => self.list_dir_by_cnid(f.folder_id),
            _ => Err(HfsPlusError::NotADirectory(path.to_string())),
        }
    }

    pub fn list_xattr(&self, path: &str) -> Result<Vec<String>> {
        let (record, _name, _fork) = self.lookup(path)?;
        let cnid = Self::require_cnid(&record)?;
        match &self.attributes_btree {
            Some(attr_btree) => attributes::list_xattr(&self.device, &self.header, attr_btree, cnid),
            None => Ok(Vec::new()),
        }
    }

    /// Fetch one named extended attribute's raw bytes. An absent attribute
    /// (or a volume with no attributes B-tree at all) is reported as
    /// `FileNotFound`, matching the rest of the lookup surface (spec §4.12).
    pub fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let (record, _entry_name, _fork) = self.lookup(path)?;
        let cnid = Self::require_cnid(&record)?;
        let attr_btree = self
            .attributes_btree
            .as_ref()
            .ok_or_else(|| HfsPlusError::FileNotFound(format!("attribute {name}")))?;
        attributes::get_xattr(&self.device, &self.header, attr_btree, &self.extents_btree, cnid, name)?
            .ok_or_else(|| HfsPlusError::FileNotFound(format!("attribute {name}")))
    }
}
