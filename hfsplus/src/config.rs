//! Volume configuration recognized by [`crate::HfsVolume::open`].
//!
//! None of this is parsed from `argv` or a config file by this crate — a
//! front-end builds a `VolumeConfig` however it likes and hands it to
//! `open`. See spec §6 for the authoritative option table.

/// Tunables honored while opening and operating on a volume.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Path-cache slot count. 0 disables the cache.
    pub cache_size: usize,
    /// Override the autodetected device logical block size.
    pub blksize: Option<u32>,
    /// Filename suffix exposing the alternate (non-default) fork, e.g. `#rsrc`.
    pub rsrc_suffix: Option<String>,
    /// When set, data and resource forks are swapped: the suffix accesses
    /// the data fork and a bare path accesses the resource fork.
    pub rsrc_only: bool,
    /// Enable the coalesced ("ublio") device-read cache.
    pub use_ublio: bool,
    /// Coalesced cache slot count.
    pub ublio_items: usize,
    /// Coalesced cache recycle grace window, in requests.
    pub ublio_grace: u64,
    /// Used for records whose `file_mode & S_IFMT == 0`.
    pub default_file_mode: u16,
    pub default_dir_mode: u16,
    pub default_uid: u32,
    pub default_gid: u32,
    /// Maximum number of directory-hard-link resolutions to follow before
    /// declaring a cycle (spec §8, "Directory hard link cycle").
    pub max_link_depth: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            cache_size: 1024,
            blksize: None,
            rsrc_suffix: Some("#rsrc".to_string()),
            rsrc_only: false,
            use_ublio: true,
            ublio_items: 256,
            ublio_grace: 32,
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            default_uid: 0,
            default_gid: 0,
            max_link_depth: 16,
        }
    }
}
