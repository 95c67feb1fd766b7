use std::io::SeekFrom;

use crate::Result;

/// A positioned, random-access byte store.
///
/// Every composition layer in this crate ([`crate::AligningStream`], [`crate::SubStream`],
/// [`crate::CombinedSeekStream`]) implements this trait, as do the concrete backends, so the
/// layers can be stacked in any order and consumers never need to know which one is in play.
///
/// Ownership of a backing store is expressed through the type parameter of a layer: wrapping a
/// `&mut S` borrows the store, wrapping `S` or `Box<dyn Stream>` owns it and drops it together
/// with the layer.
pub trait Stream {
    /// Logical length of the address space `[0, len)`.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current position. May be past the end.
    fn position(&self) -> u64;

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Read up to `buf.len()` bytes at the current position and advance by the amount read.
    ///
    /// Returns `Ok(0)` at or past the end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes at the current position and advance by the amount written.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(crate::StreamError::NotSupported("set_len"))
    }

    fn can_write(&self) -> bool {
        true
    }

    /// Alignment that physical I/O through this stream is guaranteed to respect.
    fn alignment(&self) -> u32 {
        1
    }

    /// Read until `buf` is full or the stream reports end of data.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Write all of `buf`, failing if the stream stops accepting bytes.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..])?;
            if n == 0 {
                let position = self.position();
                return Err(crate::StreamError::WriteBeyondEnd {
                    position,
                    len: (buf.len() - done) as u64,
                    length: self.len()?,
                });
            }
            done += n;
        }
        Ok(())
    }
}

impl<S: Stream + ?Sized> Stream for Box<S> {
    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn alignment(&self) -> u32 {
        (**self).alignment()
    }
}

impl<S: Stream + ?Sized> Stream for &mut S {
    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn alignment(&self) -> u32 {
        (**self).alignment()
    }
}
