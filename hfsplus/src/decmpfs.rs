//! `com.apple.decmpfs` transparent-compression decoder.
//!
//! No teacher counterpart; grounded almost one-to-one on
//! `examples/original_source/lib/libhfsuser/decmpfs.c`: the chunk-map
//! layouts for zlib vs. LZVN/LZFSE, the `0xFF`/`0x06`-prefixed
//! "stored uncompressed" per-chunk heuristic, and sparse-as-zero-fill.

use std::sync::Arc;

use flate2::read::ZlibDecoder;
use parking_lot::RwLock;

use crate::device::DeviceReader;
use crate::error::{HfsPlusError, Result};
use crate::extents::ForkReader;

const MAGIC: u32 = 0x66706D63; // "fpmc"
const CHUNK_SIZE: u64 = 65536;

/// The two codec families a `decmpfs` compression type selects between, each
/// paired with a storage location (inline vs. resource-fork). See spec
/// §4.7's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Zlib,
    Sparse,
    Lzvn,
    Lzfse,
}

#[derive(Debug, Clone, Copy)]
struct CompressionKind {
    codec: Codec,
    inline: bool,
}

fn decode_compression_type(t: u8) -> Result<CompressionKind> {
    let (codec, inline) = match t {
        3 => (Codec::Zlib, true),
        4 => (Codec::Zlib, false),
        5 => (Codec::Sparse, true),
        6 => (Codec::Sparse, false),
        7 => (Codec::Lzvn, true),
        8 => (Codec::Lzvn, false),
        11 => (Codec::Lzfse, true),
        12 => (Codec::Lzfse, false),
        other => return Err(HfsPlusError::UnsupportedCompression(other)),
    };
    Ok(CompressionKind { codec, inline })
}

/// The 16-byte `com.apple.decmpfs` attribute header.
#[derive(Debug, Clone)]
pub struct DecmpfsHeader {
    pub compression_type: u8,
    pub logical_size: u64,
}

impl DecmpfsHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(HfsPlusError::CorruptedData("decmpfs attribute shorter than its header".into()));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC {
            return Err(HfsPlusError::CorruptedData(format!(
                "decmpfs magic mismatch: 0x{magic:08X}"
            )));
        }
        let compression_type = data[4];
        // data[5..8] reserved.
        let logical_size = u64::from_le_bytes(data[8..16].try_into().unwrap());
        Ok(DecmpfsHeader {
            compression_type,
            logical_size,
        })
    }
}

/// One (offset, length) entry in a chunked resource-fork payload's chunk map.
#[derive(Debug, Clone, Copy)]
struct ChunkSpan {
    offset: u64,
    length: u64,
}

enum Payload {
    /// Fully decoded at open time (inline storage is at most a few KB).
    Inline(Vec<u8>),
    /// Resource-fork-stored, decoded one 64 KiB chunk at a time.
    Chunked {
        fork: ForkReader,
        chunks: Vec<ChunkSpan>,
        current: RwLock<Option<(usize, Vec<u8>)>>,
    },
}

/// A fully opened `decmpfs` payload: the parsed header plus whatever state
/// is needed to serve `pread`-style reads against the logical (decompressed)
/// byte stream.
pub struct DecmpfsContext {
    pub header: DecmpfsHeader,
    kind: CompressionKind,
    payload: Payload,
}

impl DecmpfsContext {
    /// Parse the attribute payload and, for resource-fork storage, the
    /// fork's chunk-map header. `resource_fork` must already be open over
    /// the file's resource-fork extents.
    pub fn open(
        attr_bytes: &[u8],
        device: Arc<DeviceReader>,
        resource_fork_extents: Vec<crate::volume::ExtentDescriptor>,
        block_size: u32,
        resource_fork_logical_size: u64,
    ) -> Result<Self> {
        let header = DecmpfsHeader::parse(attr_bytes)?;
        let kind = decode_compression_type(header.compression_type)?;

        if kind.codec == Codec::Sparse {
            // Zero-filled logical file; no payload to read regardless of
            // the nominal storage location (spec §4.7).
            return Ok(DecmpfsContext {
                header,
                kind,
                payload: Payload::Inline(Vec::new()),
            });
        }

        if kind.inline {
            let compressed = &attr_bytes[16..];
            let decoded = decode_chunk(kind.codec, compressed, header.logical_size as usize)?;
            return Ok(DecmpfsContext {
                header,
                kind,
                payload: Payload::Inline(decoded),
            });
        }

        let fork = ForkReader::new(
            device,
            resource_fork_extents,
            block_size,
            resource_fork_logical_size,
        );
        let chunks = read_chunk_map(&fork, kind.codec)?;
        Ok(DecmpfsContext {
            header,
            kind,
            payload: Payload::Chunked {
                fork,
                chunks,
                current: RwLock::new(None),
            },
        })
    }

    pub fn logical_size(&self) -> u64 {
        self.header.logical_size
    }

    /// Read up to `buf.len()` decompressed bytes starting at logical offset
    /// `offset`. Returns the number of bytes produced (0 at EOF).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.header.logical_size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.header.logical_size - offset) as usize;
        match &self.payload {
            Payload::Inline(data) => {
                let start = offset as usize;
                let end = (start + want).min(data.len());
                let n = end.saturating_sub(start);
                buf[..n].copy_from_slice(&data[start..end]);
                Ok(n)
            }
            Payload::Chunked { chunks, current, .. } => {
                let mut done = 0usize;
                while done < want {
                    let logical_pos = offset + done as u64;
                    let chunk_idx = (logical_pos / CHUNK_SIZE) as usize;
                    if chunk_idx >= chunks.len() {
                        break;
                    }
                    let chunk_start = chunk_idx as u64 * CHUNK_SIZE;
                    let within_chunk = (logical_pos - chunk_start) as usize;

                    {
                        let guard = current.read();
                        if let Some((idx, data)) = guard.as_ref() {
                            if *idx == chunk_idx {
                                let n = copy_from_chunk(data, within_chunk, &mut buf[done..], want - done);
                                done += n;
                                continue;
                            }
                        }
                    }

                    let decoded = self.decode_chunk_at(chunk_idx)?;
                    {
                        let mut guard = current.write();
                        if guard.as_ref().map(|(idx, _)| *idx) != Some(chunk_idx) {
                            *guard = Some((chunk_idx, decoded));
                        }
                        let (_, data) = guard.as_ref().unwrap();
                        let n = copy_from_chunk(data, within_chunk, &mut buf[done..], want - done);
                        done += n;
                    }
                }
                Ok(done)
            }
        }
    }

    fn decode_chunk_at(&self, chunk_idx: usize) -> Result<Vec<u8>> {
        let Payload::Chunked { fork, chunks, .. } = &self.payload else {
            unreachable!("decode_chunk_at only called on chunked payloads");
        };
        let span = chunks[chunk_idx];
        let mut compressed = vec![0u8; span.length as usize];
        let n = fork.read_at(&mut compressed, span.offset)?;
        compressed.truncate(n);

        let remaining_logical = self.header.logical_size - chunk_idx as u64 * CHUNK_SIZE;
        let expected_len = remaining_logical.min(CHUNK_SIZE) as usize;
        decode_chunk(self.kind.codec, &compressed, expected_len)
    }
}

fn copy_from_chunk(chunk: &[u8], within: usize, out: &mut [u8], want: usize) -> usize {
    let avail = chunk.len().saturating_sub(within);
    let n = avail.min(out.len()).min(want);
    out[..n].copy_from_slice(&chunk[within..within + n]);
    n
}

/// Decode one already-extracted compressed chunk (or the whole inline
/// payload, treated as a single chunk) to exactly `expected_len` bytes,
/// honoring the "stored uncompressed" heuristic (spec §4.7): a leading
/// `0xFF` (zlib) or `0x06` (LZVN/LZFSE) byte means the rest of the chunk is
/// a verbatim copy, not a compressed stream.
fn decode_chunk(codec: Codec, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if compressed.is_empty() {
        return Ok(Vec::new());
    }

    let stored_marker = match codec {
        Codec::Zlib => 0xFFu8,
        Codec::Lzvn | Codec::Lzfse => 0x06u8,
        Codec::Sparse => return Ok(vec![0u8; expected_len]),
    };

    if compressed[0] == stored_marker {
        let raw = &compressed[1..];
        let n = raw.len().min(expected_len);
        return Ok(raw[..n].to_vec());
    }

    match codec {
        Codec::Zlib => {
            // `Read::read` may legally return fewer bytes than the buffer
            // even mid-stream, not only at EOF, so this loops to completion
            // the way the corpus's own decoders do rather than trusting a
            // single call.
            let mut out = Vec::with_capacity(expected_len);
            let mut decoder = ZlibDecoder::new(compressed);
            use std::io::Read;
            decoder
                .read_to_end(&mut out)
                .map_err(|e| HfsPlusError::CorruptedData(format!("zlib decmpfs chunk: {e}")))?;
            out.truncate(expected_len.min(out.len()));
            Ok(out)
        }
        Codec::Lzvn | Codec::Lzfse => {
            // `lzfse::decode_buffer` accepts both LZVN and LZFSE streams;
            // the corpus's own LZFSE/LZVN reader (`udif::reader`) takes the
            // same shortcut since liblzfse's decoder auto-detects the frame
            // format. Oversize the output buffer the same way, since the
            // decoder requires headroom beyond the exact expected length.
            let mut out = vec![0u8; expected_len.max(64) * 2];
            let n = lzfse::decode_buffer(compressed, &mut out)
                .map_err(|e| HfsPlusError::CorruptedData(format!("LZFSE/LZVN decmpfs chunk: {e:?}")))?;
            out.truncate(n.min(expected_len));
            Ok(out)
        }
        Codec::Sparse => unreachable!("handled above"),
    }
}

/// Parse the resource fork's chunk-offset table. Layout differs by codec
/// family (spec §4.7):
/// - zlib: `u32` big-endian `chunk_table_offset` at fork offset 0 (typically
///   256); at `chunk_table_offset + 4`, a `u32` big-endian chunk count `N`,
///   then `N` little-endian `(offset, length)` pairs, each relative to
///   `chunk_table_offset + 4`.
/// - LZVN/LZFSE: `u32` little-endian start offset `S` at fork offset 0; the
///   first `S` bytes hold `N + 1` little-endian `u32` offsets; chunk `i`
///   spans `[chunks[i], chunks[i+1])`.
fn read_chunk_map(fork: &ForkReader, codec: Codec) -> Result<Vec<ChunkSpan>> {
    match codec {
        Codec::Zlib => {
            let mut head = [0u8; 4];
            fork.read_at(&mut head, 0)?;
            let table_offset = u32::from_be_bytes(head) as u64;

            let mut count_buf = [0u8; 4];
            fork.read_at(&mut count_buf, table_offset + 4)?;
            let count = u32::from_be_bytes(count_buf) as usize;

            let base = table_offset + 4;
            let mut pairs = vec![0u8; count * 8];
            fork.read_at(&mut pairs, base + 4)?;

            let mut spans = Vec::with_capacity(count);
            let mut prev_offset: Option<u64> = None;
            for chunk in pairs.chunks_exact(8) {
                let off = u32::from_le_bytes(chunk[0..4].try_into().unwrap()) as u64;
                let len = u32::from_le_bytes(chunk[4..8].try_into().unwrap()) as u64;
                if let Some(p) = prev_offset {
                    if off <= p {
                        return Err(HfsPlusError::CorruptedData(
                            "decmpfs chunk map offsets are not strictly increasing".into(),
                        ));
                    }
                }
                prev_offset = Some(off);
                spans.push(ChunkSpan {
                    offset: base + off,
                    length: len,
                });
            }
            Ok(spans)
        }
        Codec::Lzvn | Codec::Lzfse => {
            let mut head = [0u8; 4];
            fork.read_at(&mut head, 0)?;
            let start_offset = u32::from_le_bytes(head) as u64;

            if start_offset < 4 || start_offset % 4 != 0 {
                return Err(HfsPlusError::CorruptedData(format!(
                    "decmpfs LZVN/LZFSE chunk table start offset {start_offset} is not a valid u32 array length"
                )));
            }
            let mut table = vec![0u8; start_offset as usize];
            fork.read_at(&mut table, 0)?;

            let offsets: Vec<u64> = table
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as u64)
                .collect();
            if offsets.len() < 2 {
                return Err(HfsPlusError::CorruptedData(
                    "decmpfs LZVN/LZFSE chunk table has fewer than 2 entries".into(),
                ));
            }

            let mut spans = Vec::with_capacity(offsets.len() - 1);
            for w in offsets.windows(2) {
                if w[1] <= w[0] {
                    return Err(HfsPlusError::CorruptedData(
                        "decmpfs chunk map offsets are not strictly increasing".into(),
                    ));
                }
                spans.push(ChunkSpan {
                    offset: w[0],
                    length: w[1] - w[0],
                });
            }
            Ok(spans)
        }
        Codec::Sparse => Ok(Vec::new()),
    }
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
            path.push(format!("hfsplus-decmpfs-test-{}-{n}", std::process::id()));
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

    fn open_device(data: &[u8]) -> Arc<DeviceReader> {
        let temp = TempFile::new(data);
        let mut cfg = VolumeConfig::default();
        cfg.use_ublio = false;
        cfg.blksize = Some(64);
        Arc::new(DeviceReader::open(&temp.0, &cfg).unwrap())
    }

    fn header_bytes(compression_type: u8, logical_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = compression_type;
        buf[8..16].copy_from_slice(&logical_size.to_le_bytes());
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = header_bytes(3, 10);
        buf[0] = 0;
        assert!(DecmpfsHeader::parse(&buf).is_err());
    }

    #[test]
    fn inline_sparse_is_zero_fill() {
        let mut attr = header_bytes(5, 40);
        attr.extend_from_slice(b"ignored");
        let device = open_device(&[0u8; 64]);
        let ctx = DecmpfsContext::open(&attr, device, Vec::new(), 64, 0).unwrap();
        let mut buf = [0xAAu8; 40];
        let n = ctx.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 40);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn inline_zlib_stored_uncompressed_heuristic() {
        let payload = b"hello world, stored raw";
        let mut attr = header_bytes(3, payload.len() as u64);
        attr.push(0xFF);
        attr.extend_from_slice(payload);
        let device = open_device(&[0u8; 64]);
        let ctx = DecmpfsContext::open(&attr, device, Vec::new(), 64, 0).unwrap();
        let mut buf = vec![0u8; payload.len()];
        let n = ctx.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], payload);
    }

    #[test]
    fn inline_zlib_decompresses() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        let original = b"the quick brown fox jumps over the lazy dog";
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, original).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut attr = header_bytes(3, original.len() as u64);
        attr.extend_from_slice(&compressed);
        let device = open_device(&[0u8; 64]);
        let ctx = DecmpfsContext::open(&attr, device, Vec::new(), 64, 0).unwrap();
        let mut buf = vec![0u8; original.len()];
        let n = ctx.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], &original[..]);
    }

    #[test]
    fn chunk_boundary_read_is_contiguous() {
        // Build a resource fork with two zlib chunks stored uncompressed
        // (0xFF heuristic) so this test needs no real deflate stream, and
        // verify a read spanning the 65536-byte chunk boundary returns
        // contiguous bytes.
        let chunk0: Vec<u8> = (0u8..=255).cycle().take(CHUNK_SIZE as usize).collect();
        let chunk1: Vec<u8> = (0u8..=255).cycle().skip(7).take(100).collect();

        let mut fork = Vec::new();
        let table_offset = 256u32;
        fork.extend_from_slice(&table_offset.to_be_bytes());
        fork.resize(table_offset as usize + 4, 0);
        fork.extend_from_slice(&2u32.to_be_bytes()); // chunk count, at table_offset + 4

        // Offsets in the chunk map are relative to `table_offset + 4` (the
        // base `base` in `read_chunk_map`'s zlib branch), not to the start
        // of the fork.
        let base = table_offset + 4;
        let pairs_region_len = 2 * 8u32;
        let data_base = base + 4 + pairs_region_len; // +4 for the count field
        let c0_off = data_base - base;
        let c0_len = chunk0.len() as u32 + 1;
        let c1_off = c0_off + c0_len;
        let c1_len = chunk1.len() as u32 + 1;
        fork.extend_from_slice(&c0_off.to_le_bytes());
        fork.extend_from_slice(&c0_len.to_le_bytes());
        fork.extend_from_slice(&c1_off.to_le_bytes());
        fork.extend_from_slice(&c1_len.to_le_bytes());
        assert_eq!(fork.len() as u32, data_base);

        fork.push(0xFF);
        fork.extend_from_slice(&chunk0);
        fork.push(0xFF);
        fork.extend_from_slice(&chunk1);

        let device = open_device(&fork);
        let fork_len = fork.len() as u64;

        let logical_size = CHUNK_SIZE + chunk1.len() as u64;
        let attr = header_bytes(4, logical_size);

        let resolved = vec![ExtentDescriptor {
            start_block: 0,
            block_count: (fork_len / 64) as u32 + 1,
        }];
        let ctx = DecmpfsContext::open(&attr, device, resolved, 64, fork_len).unwrap();

        let mut buf = vec![0u8; 200];
        let n = ctx.read_at(&mut buf, CHUNK_SIZE - 100).unwrap();
        assert_eq!(n, 200);
        let mut expected = chunk0[chunk0.len() - 100..].to_vec();
        expected.extend_from_slice(&chunk1[..100]);
        assert_eq!(buf, expected);
    }
}
