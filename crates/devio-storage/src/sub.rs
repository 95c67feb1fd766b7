use std::io::SeekFrom;

use crate::util::{checked_end, resolve_seek};
use crate::{Result, Stream, StreamError};

/// A fixed window `[start, start + length)` of a parent stream, re-based to offset 0.
///
/// The window never grows or shrinks. Reads stop at the window end; writes that would cross it
/// are rejected before any byte is transferred.
pub struct SubStream<S> {
    parent: S,
    start: u64,
    length: u64,
    position: u64,
}

impl<S: Stream> SubStream<S> {
    pub fn new(parent: S, start: u64, length: u64) -> Result<Self> {
        let end = start
            .checked_add(length)
            .ok_or(StreamError::OffsetOverflow)?;
        let parent_len = parent.len()?;
        if end > parent_len {
            return Err(StreamError::OutOfRange {
                offset: start,
                len: length,
                length: parent_len,
            });
        }
        Ok(Self {
            parent,
            start,
            length,
            position: 0,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn parent(&self) -> &S {
        &self.parent
    }

    pub fn into_inner(self) -> S {
        self.parent
    }
}

impl<S: Stream> Stream for SubStream<S> {
    fn len(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = resolve_seek(pos, self.position, self.length)?;
        if target > self.length {
            return Err(StreamError::OutOfRange {
                offset: target,
                len: 0,
                length: self.length,
            });
        }
        self.position = target;
        Ok(target)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.length - self.position;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(remaining) as usize;
        self.parent
            .seek(SeekFrom::Start(self.start + self.position))?;
        let n = self.parent.read(&mut buf[..count])?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let end = checked_end(self.position, buf.len())?;
        if end > self.length {
            return Err(StreamError::OutOfRange {
                offset: self.position,
                len: buf.len() as u64,
                length: self.length,
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.parent
            .seek(SeekFrom::Start(self.start + self.position))?;
        self.parent.write_all(buf)?;
        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.parent.flush()
    }

    fn can_write(&self) -> bool {
        self.parent.can_write()
    }

    fn alignment(&self) -> u32 {
        self.parent.alignment()
    }
}
