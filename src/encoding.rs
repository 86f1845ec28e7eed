//! Bounds-checked reading of the big-endian binary records used across the
//! chain files and indices. Writers build plain `Vec<u8>` buffers with
//! `to_be_bytes`; this module owns the read side.

use crate::errors::{ChainError, ChainResult};

/// Cursor over a byte slice. Every read is bounds-checked and reports the
/// missing byte count so callers can distinguish a truncated tail from
/// corrupted content.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> ChainResult<u8> {
        let byte = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| short_read(1, 0))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> ChainResult<u16> {
        let bytes: [u8; 2] = self.read_bytes(2)?.try_into().expect("length checked");
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> ChainResult<u32> {
        let bytes: [u8; 4] = self.read_bytes(4)?.try_into().expect("length checked");
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> ChainResult<u64> {
        let bytes: [u8; 8] = self.read_bytes(8)?.try_into().expect("length checked");
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> ChainResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(short_read(len, self.remaining()));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a `u32`-length-prefixed byte vector.
    pub fn read_var_bytes(&mut self) -> ChainResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

fn short_read(wanted: usize, available: usize) -> ChainError {
    ChainError::Encoding(format!(
        "unexpected end of buffer: wanted {wanted} bytes, {available} available"
    ))
}

/// Returns true when the error reports a buffer that ended mid-record, the
/// signature of a partially flushed tail after a crash.
pub fn is_truncation(err: &ChainError) -> bool {
    matches!(err, ChainError::Encoding(msg) if msg.starts_with("unexpected end of buffer"))
}

pub fn put_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_integers_big_endian() {
        let mut buf = Vec::new();
        buf.push(0x07);
        buf.extend_from_slice(&0x0102u16.to_be_bytes());
        buf.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        buf.extend_from_slice(&42u64.to_be_bytes());

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_u8().unwrap(), 0x07);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert!(reader.is_empty());
    }

    #[test]
    fn var_bytes_round_trip() {
        let mut buf = Vec::new();
        put_var_bytes(&mut buf, b"payload");
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_var_bytes().unwrap(), b"payload".to_vec());
    }

    #[test]
    fn short_read_is_reported_as_truncation() {
        let buf = [0u8; 3];
        let mut reader = ByteReader::new(&buf);
        let err = reader.read_u32().unwrap_err();
        assert!(is_truncation(&err));
    }
}
