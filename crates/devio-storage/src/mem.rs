use std::io::SeekFrom;

use crate::util::{checked_end, resolve_seek};
use crate::{Result, Stream, StreamError};

/// In-memory stream backed by a `Vec<u8>`.
///
/// Growable by default: writes past the end extend the buffer with zeros in between. A fixed
/// stream rejects writes past its end instead, which makes it a stand-in for a preallocated
/// RAM disk.
#[derive(Debug, Clone, Default)]
pub struct MemStream {
    data: Vec<u8>,
    position: u64,
    fixed: bool,
    read_only: bool,
}

impl MemStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled stream of `len` bytes.
    pub fn with_len(len: u64) -> Result<Self> {
        let len = usize::try_from(len).map_err(|_| StreamError::OffsetOverflow)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| StreamError::InvalidConfig("in-memory stream too large"))?;
        data.resize(len, 0);
        Ok(Self::from_vec(data))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            position: 0,
            fixed: false,
            read_only: false,
        }
    }

    /// Disallow growth past the current length.
    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for MemStream {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl Stream for MemStream {
    fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(pos, self.position, self.data.len() as u64)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if self.position >= len {
            return Ok(0);
        }
        let start = self.position as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = checked_end(self.position, buf.len())?;
        if end > self.data.len() as u64 {
            if self.fixed {
                return Err(StreamError::WriteBeyondEnd {
                    position: self.position,
                    len: buf.len() as u64,
                    length: self.data.len() as u64,
                });
            }
            self.set_len(end)?;
        }
        let start = self.position as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        self.position = end;
        Ok(buf.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(StreamError::ReadOnly);
        }
        if self.fixed && len != self.data.len() as u64 {
            return Err(StreamError::NotSupported("resizing a fixed in-memory stream"));
        }
        let len = usize::try_from(len).map_err(|_| StreamError::OffsetOverflow)?;
        if len > self.data.len() {
            self.data
                .try_reserve(len - self.data.len())
                .map_err(|_| StreamError::InvalidConfig("in-memory stream too large"))?;
        }
        self.data.resize(len, 0);
        Ok(())
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }
}
