//! Forward cursor over a borrowed byte slice.
//!
//! Every on-disk struct parser in this crate reads through a `Cursor`
//! instead of `std::io::Cursor` directly so that a short read produces the
//! typed `Truncated` error instead of a bare `UnexpectedEof`, and so callers
//! can ask "how many bytes are left" without reaching into the internals.
//! Integer decoding itself is delegated to `byteorder::ReadBytesExt`, the
//! same crate the on-disk struct parsers are grounded on.

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{HfsPlusError, Result};

/// A read-only, allocation-free cursor over `&[u8]`.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(HfsPlusError::Truncated {
                expected: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Advance the cursor by `n` bytes without reading them.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    /// Seek to an absolute offset from the start of the underlying slice.
    pub fn seek_to(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(HfsPlusError::Truncated {
                expected: pos,
                available: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Read exactly `n` bytes and return a slice into the underlying buffer.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.require(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let mut slice = &self.data[self.pos..];
        let v = slice.read_u8().expect("length checked by require");
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        let mut slice = &self.data[self.pos..];
        let v = slice
            .read_u16::<BigEndian>()
            .expect("length checked by require");
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let mut slice = &self.data[self.pos..];
        let v = slice
            .read_u32::<BigEndian>()
            .expect("length checked by require");
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.require(8)?;
        let mut slice = &self.data[self.pos..];
        let v = slice
            .read_u64::<BigEndian>()
            .expect("length checked by require");
        self.pos += 8;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_integers() {
        let data = [0x00, 0x2A, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let mut c = Cursor::new(&data);
        assert_eq!(c.read_u16().unwrap(), 0x002A);
        assert_eq!(c.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(c.remaining(), 4);
        assert_eq!(c.read_u32().unwrap(), 0x01020304);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn short_read_is_truncated_not_panic() {
        let data = [0x00];
        let mut c = Cursor::new(&data);
        match c.read_u16() {
            Err(HfsPlusError::Truncated { expected, available }) => {
                assert_eq!(expected, 2);
                assert_eq!(available, 1);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn take_returns_slice_and_advances() {
        let data = [1, 2, 3, 4, 5];
        let mut c = Cursor::new(&data);
        assert_eq!(c.take(3).unwrap(), &[1, 2, 3]);
        assert_eq!(c.position(), 3);
        assert_eq!(c.take(2).unwrap(), &[4, 5]);
        assert!(c.take(1).is_err());
    }
}
