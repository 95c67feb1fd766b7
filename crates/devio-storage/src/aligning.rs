use std::io::SeekFrom;
use std::sync::Arc;

use tracing::trace;

use crate::pool::ScratchPool;
use crate::util::{check_alignment, checked_end, resolve_seek};
use crate::{Result, Stream, StreamError};

/// Makes every read and write against the backing stream land on `alignment` boundaries.
///
/// Callers may use any position and length. Misaligned reads are widened to the enclosing
/// aligned span and copied out of a scratch buffer; misaligned writes read back the partially
/// covered boundary blocks, splice the caller's bytes in, and write the whole span
/// (read-modify-write). The backing stream only ever sees offsets and lengths that are multiples
/// of `alignment`.
///
/// Reads starting at or past the end return 0 bytes and reads spanning the end are clamped.
/// Writes never cross the end: they either grow the backing stream in `grow_interval + 1` sized
/// steps, or fail with [`StreamError::WriteBeyondEnd`] when growth is disabled.
pub struct AligningStream<S> {
    inner: S,
    alignment: u32,
    mask: u64,
    grow_interval: u64,
    position: u64,
    pool: Arc<ScratchPool>,
}

impl<S: Stream> AligningStream<S> {
    /// `alignment` must be a power of two. `grow_interval` is either 0 (never grow) or a
    /// power-of-two-minus-one mask no smaller than `alignment - 1`.
    pub fn new(inner: S, alignment: u32, grow_interval: u64) -> Result<Self> {
        let alignment_u64 = check_alignment(u64::from(alignment))?;
        if grow_interval != 0 {
            let step = grow_interval
                .checked_add(1)
                .ok_or(StreamError::InvalidConfig("grow_interval too large"))?;
            if !step.is_power_of_two() || step < alignment_u64 {
                return Err(StreamError::InvalidConfig(
                    "grow_interval must be a power of two minus one and cover the alignment",
                ));
            }
        }
        Ok(Self {
            inner,
            alignment,
            mask: alignment_u64 - 1,
            grow_interval,
            position: 0,
            pool: ScratchPool::global(),
        })
    }

    /// Use a dedicated scratch pool instead of the process-wide one.
    pub fn with_pool(mut self, pool: Arc<ScratchPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn grow_interval(&self) -> u64 {
        self.grow_interval
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Bytes of padding before `position` and after `position + len` needed to reach
    /// alignment boundaries.
    fn padding(&self, position: u64, len: u64) -> Result<(u64, u64)> {
        let prefix = position & self.mask;
        let end = position.checked_add(len).ok_or(StreamError::OffsetOverflow)?;
        let suffix = end.wrapping_neg() & self.mask;
        // The aligned end must itself be representable.
        end.checked_add(suffix).ok_or(StreamError::OffsetOverflow)?;
        Ok((prefix, suffix))
    }

    /// Make sure a write covering `[.., end)`, padded out to `[.., aligned_end)`, fits in the
    /// backing stream, growing it when allowed. Returns the backing length to write against.
    ///
    /// Without growth only the logical `end` has to fit: the padded tail of the last block of an
    /// image whose length is not aligned lies past the end of the media and is never written.
    fn ensure_extent(&mut self, end: u64, aligned_end: u64, len: u64) -> Result<u64> {
        let current = self.inner.len()?;
        if aligned_end <= current {
            return Ok(current);
        }
        if self.grow_interval == 0 {
            if end <= current {
                return Ok(current);
            }
            return Err(StreamError::WriteBeyondEnd {
                position: self.position,
                len,
                length: current,
            });
        }
        let new_len = aligned_end
            .checked_add(self.grow_interval)
            .ok_or(StreamError::OffsetOverflow)?
            & !self.grow_interval;
        trace!(current, new_len, "growing backing stream");
        self.inner.set_len(new_len)?;
        Ok(new_len)
    }
}

impl<S: Stream> Stream for AligningStream<S> {
    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match pos {
            SeekFrom::End(_) => self.inner.len()?,
            _ => 0,
        };
        self.position = resolve_seek(pos, self.position, len)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let length = self.inner.len()?;
        if buf.is_empty() || self.position >= length {
            return Ok(0);
        }

        let mut count = buf.len() as u64;
        let end = checked_end(self.position, buf.len())?;
        if end > length {
            count = length - self.position;
            trace!(
                position = self.position,
                requested = buf.len(),
                available = count,
                "short read at end of media"
            );
        }
        let buf = &mut buf[..count as usize];

        let (prefix, suffix) = self.padding(self.position, count)?;
        if prefix == 0 && suffix == 0 {
            self.inner.seek(SeekFrom::Start(self.position))?;
            let n = self.inner.read_full(buf)?;
            self.position += n as u64;
            return Ok(n);
        }

        let total =
            usize::try_from(prefix + count + suffix).map_err(|_| StreamError::OffsetOverflow)?;
        let prefix = prefix as usize;
        let pool = Arc::clone(&self.pool);
        let mut scratch = pool.acquire(total);

        self.inner.seek(SeekFrom::Start(self.position - prefix as u64))?;
        let n = self.inner.read_full(&mut scratch)?;
        if n <= prefix {
            return Ok(0);
        }
        let n = (n - prefix).min(buf.len());
        buf[..n].copy_from_slice(&scratch[prefix..prefix + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.inner.can_write() {
            return Err(StreamError::ReadOnly);
        }

        let count = buf.len() as u64;
        let (prefix, suffix) = self.padding(self.position, count)?;
        let aligned_start = self.position - prefix;
        let end = self.position + count;
        let aligned_end = end + suffix;
        let extent = self.ensure_extent(end, aligned_end, count)?;

        if prefix == 0 && suffix == 0 {
            self.inner.seek(SeekFrom::Start(self.position))?;
            self.inner.write_all(buf)?;
            self.position += count;
            return Ok(buf.len());
        }

        let total =
            usize::try_from(aligned_end - aligned_start).map_err(|_| StreamError::OffsetOverflow)?;
        let block = self.alignment as usize;
        let pool = Arc::clone(&self.pool);
        let mut scratch = pool.acquire(total);

        if prefix != 0 {
            self.inner.seek(SeekFrom::Start(aligned_start))?;
            self.inner.read_full(&mut scratch[..block])?;
        }
        // The tail block is only separate from the head block when the span covers more than one.
        if suffix != 0 && (prefix == 0 || total > block) {
            let tail_start = aligned_end - block as u64;
            self.inner.seek(SeekFrom::Start(tail_start))?;
            self.inner.read_full(&mut scratch[total - block..])?;
        }

        let prefix = prefix as usize;
        scratch[prefix..prefix + buf.len()].copy_from_slice(buf);

        // Clipped only when the media itself ends inside the last block.
        let write_len = (aligned_end.min(extent) - aligned_start) as usize;
        self.inner.seek(SeekFrom::Start(aligned_start))?;
        self.inner.write_all(&scratch[..write_len])?;
        self.position += count;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    /// Resize the backing stream. The new length must be a multiple of the alignment.
    fn set_len(&mut self, len: u64) -> Result<()> {
        if len & self.mask != 0 {
            return Err(StreamError::InvalidConfig(
                "length must be a multiple of the alignment",
            ));
        }
        self.inner.set_len(len)
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn alignment(&self) -> u32 {
        self.alignment
    }
}
