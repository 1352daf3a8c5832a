use thiserror::Error;

#[derive(Error, Debug)]
pub enum HfsPlusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid HFS+ signature: 0x{0:04X} (expected 0x482B or 0x4858)")]
    InvalidSignature(u16),

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("corrupt B-tree node {node}: {reason}")]
    CorruptNode { node: u32, reason: String },

    #[error("corrupt extent list for cnid {cnid}: {reason}")]
    CorruptExtents { cnid: u32, reason: String },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported decmpfs compression type {0}")]
    UnsupportedCompression(u8),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("path is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("truncated read: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, HfsPlusError>;
