//! Block-aligned random-access device reader, with an optional
//! request-coalescing ("ublio") cache layered on top.
//!
//! Grounded on `examples/original_source/lib/ublio/ublio.c` (slot recycling
//! discipline, grace window, aligned three-part read) and
//! `examples/original_source/src/hfslib.c` (the plain aligned-read path).
//! The teacher crate (`examples/Dil4rd-dpp/hfsplus`) has no device
//! abstraction of its own — it reads straight off a `Read + Seek` — so this
//! module is new.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::VolumeConfig;
use crate::error::{HfsPlusError, Result};

const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Autodetect a character/block device's logical sector size via
/// `ioctl(BLKSSZGET)` on Linux; falls back to 512 everywhere else (regular
/// image files included, matching the distilled spec's fallback).
#[cfg(target_os = "linux")]
fn autodetect_block_size(file: &File) -> u32 {
    use std::os::unix::io::AsRawFd;
    const BLKSSZGET: libc::c_ulong = 0x1268;
    let mut size: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut size as *mut libc::c_int) };
    if rc == 0 && size > 0 {
        size as u32
    } else {
        DEFAULT_BLOCK_SIZE
    }
}

#[cfg(not(target_os = "linux"))]
fn autodetect_block_size(_file: &File) -> u32 {
    DEFAULT_BLOCK_SIZE
}

/// A single cached block, keyed by its aligned byte offset.
struct Slot {
    offset: u64,
    data: Vec<u8>,
    valid: bool,
    last_access: u64,
}

struct CoalescedCache {
    slots: Vec<Slot>,
    grace: u64,
    counter: u64,
}

impl CoalescedCache {
    fn new(items: usize, block_size: usize, grace: u64) -> Self {
        let slots = (0..items)
            .map(|_| Slot {
                offset: 0,
                data: vec![0u8; block_size],
                valid: false,
                last_access: 0,
            })
            .collect();
        CoalescedCache {
            slots,
            grace,
            counter: 0,
        }
    }

    fn find(&self, offset: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.valid && s.offset == offset)
    }

    /// Pick a slot to evict: the oldest-accessed slot outside
    /// `[range_start, range_end)` (the aligned byte range of the request
    /// currently being serviced), skipping slots touched within `grace`
    /// requests of the current counter.
    fn recycle_candidate(&self, range_start: u64, range_end: u64, block_size: u64) -> usize {
        let mut best: Option<(usize, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.valid {
                return i;
            }
            if slot.offset >= range_start && slot.offset < range_end {
                continue;
            }
            if self.counter.saturating_sub(slot.last_access) < self.grace {
                continue;
            }
            let _ = block_size;
            match best {
                Some((_, t)) if t <= slot.last_access => {}
                _ => best = Some((i, slot.last_access)),
            }
        }
        best.map(|(i, _)| i).unwrap_or(0)
    }
}

/// How a [`DeviceReader`] services a read: straight through, or via the
/// coalesced block cache.
enum Backend {
    Direct,
    Coalesced(Mutex<CoalescedCache>),
}

/// Block-aligned, concurrency-safe reader over a device or image file.
pub struct DeviceReader {
    file: File,
    block_size: u32,
    backend: Backend,
    request_counter: AtomicU64,
}

impl DeviceReader {
    /// Open `path` and configure block alignment/caching per `cfg`.
    pub fn open(path: &Path, cfg: &VolumeConfig) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let block_size = cfg.blksize.unwrap_or_else(|| autodetect_block_size(&file));
        let backend = if cfg.use_ublio {
            Backend::Coalesced(Mutex::new(CoalescedCache::new(
                cfg.ublio_items.max(1),
                block_size as usize,
                cfg.ublio_grace,
            )))
        } else {
            Backend::Direct
        };
        Ok(DeviceReader {
            file,
            block_size,
            backend,
            request_counter: AtomicU64::new(0),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Read exactly `buf.len()` bytes starting at absolute byte `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        match &self.backend {
            Backend::Direct => self.read_direct(buf, offset),
            Backend::Coalesced(cache) => self.read_coalesced(cache, buf, offset),
        }
    }

    fn read_direct(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let bs = self.block_size as u64;
        let aligned_start = (offset / bs) * bs;
        let aligned_end = ((offset + buf.len() as u64 + bs - 1) / bs) * bs;
        let mut bounce = vec![0u8; (aligned_end - aligned_start) as usize];
        self.positional_read_exact(&mut bounce, aligned_start)?;
        let lead = (offset - aligned_start) as usize;
        bounce_into(buf, &bounce, lead);
        Ok(())
    }

    fn read_coalesced(&self, cache: &Mutex<CoalescedCache>, buf: &mut [u8], offset: u64) -> Result<()> {
        let bs = self.block_size as u64;
        let aligned_start = (offset / bs) * bs;
        let aligned_end = ((offset + buf.len() as u64 + bs - 1) / bs) * bs;

        let mut cache = cache.lock();
        cache.counter = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let counter = cache.counter;

        let mut block_off = aligned_start;
        while block_off < aligned_end {
            let slot_idx = match cache.find(block_off) {
                Some(i) => i,
                None => {
                    let idx = cache.recycle_candidate(aligned_start, aligned_end, bs);
                    let mut block_buf = vec![0u8; bs as usize];
                    self.positional_read_exact(&mut block_buf, block_off)?;
                    let slot = &mut cache.slots[idx];
                    slot.offset = block_off;
                    slot.data = block_buf;
                    slot.valid = true;
                    idx
                }
            };
            cache.slots[slot_idx].last_access = counter;

            let slot = &cache.slots[slot_idx];
            let block_end = block_off + bs;
            let copy_start = offset.max(block_off);
            let copy_end = (offset + buf.len() as u64).min(block_end);
            if copy_end > copy_start {
                let src_off = (copy_start - block_off) as usize;
                let dst_off = (copy_start - offset) as usize;
                let len = (copy_end - copy_start) as usize;
                buf[dst_off..dst_off + len].copy_from_slice(&slot.data[src_off..src_off + len]);
            }
            block_off = block_end;
        }
        Ok(())
    }

    fn positional_read_exact(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                HfsPlusError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read at offset {offset}"),
                ))
            } else {
                HfsPlusError::Io(e)
            }
        })
    }
}

fn bounce_into(dst: &mut [u8], bounce: &[u8], lead: usize) {
    dst.copy_from_slice(&bounce[lead..lead + dst.len()]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(data: &[u8]) -> tempfile_path::TempPath {
        tempfile_path::TempPath::new(data)
    }

    // Minimal inline temp-file helper so this test module needs no
    // dev-dependency beyond std.
    mod tempfile_path {
        use std::fs::File;
        use std::io::Write;
        use std::path::{Path, PathBuf};
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempPath(PathBuf);
        impl TempPath {
            pub fn new(data: &[u8]) -> Self {
                let n = COUNTER.fetch_add(1, Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!("hfsplus-device-test-{}-{n}", std::process::id()));
                let mut f = File::create(&path).unwrap();
                f.write_all(data).unwrap();
                TempPath(path)
            }
        }
        impl AsRef<Path> for TempPath {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }
        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn direct_read_respects_block_alignment() {
        let data: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let path = write_temp(&data);
        let mut cfg = VolumeConfig::default();
        cfg.use_ublio = false;
        cfg.blksize = Some(512);
        let reader = DeviceReader::open(path.as_ref(), &cfg).unwrap();

        let mut buf = [0u8; 10];
        reader.read_at(&mut buf, 500).unwrap();
        assert_eq!(&buf, &data[500..510]);
    }

    #[test]
    fn coalesced_read_matches_direct() {
        let data: Vec<u8> = (0u8..=255).cycle().take(8192).collect();
        let path = write_temp(&data);
        let mut cfg = VolumeConfig::default();
        cfg.use_ublio = true;
        cfg.blksize = Some(512);
        cfg.ublio_items = 4;
        cfg.ublio_grace = 1;
        let reader = DeviceReader::open(path.as_ref(), &cfg).unwrap();

        let mut buf = [0u8; 300];
        reader.read_at(&mut buf, 700).unwrap();
        assert_eq!(&buf[..], &data[700..1000]);

        // Re-read through more blocks than there are slots to force eviction.
        for start in [0u64, 512, 1024, 1536, 2048, 2560] {
            let mut b = [0u8; 64];
            reader.read_at(&mut b, start).unwrap();
            assert_eq!(&b[..], &data[start as usize..start as usize + 64]);
        }
    }

    #[test]
    fn short_file_is_unexpected_eof() {
        let data = vec![1u8; 100];
        let path = write_temp(&data);
        let mut cfg = VolumeConfig::default();
        cfg.use_ublio = false;
        cfg.blksize = Some(512);
        let reader = DeviceReader::open(path.as_ref(), &cfg).unwrap();

        let mut buf = [0u8; 10];
        assert!(reader.read_at(&mut buf, 1000).is_err());
    }
}
