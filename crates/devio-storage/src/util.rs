use std::io::SeekFrom;

use crate::{Result, StreamError};

/// Validate that `alignment` is a non-zero power of two and return it as a `u64`.
pub fn check_alignment(alignment: u64) -> Result<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(StreamError::InvalidAlignment { alignment });
    }
    Ok(alignment)
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    let mask = check_alignment(alignment)? - 1;
    value
        .checked_add(mask)
        .map(|v| v & !mask)
        .ok_or(StreamError::OffsetOverflow)
}

/// `offset + len`, failing instead of wrapping.
pub fn checked_end(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .ok_or(StreamError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: usize, length: u64) -> Result<()> {
    let end = checked_end(offset, len)?;
    if end > length {
        return Err(StreamError::OutOfRange {
            offset,
            len: len as u64,
            length,
        });
    }
    Ok(())
}

/// Resolve a [`SeekFrom`] against the current position and length into an absolute offset.
///
/// Seeking past the end is allowed; seeking before the start is not.
pub fn resolve_seek(pos: SeekFrom, current: u64, length: u64) -> Result<u64> {
    let (base, delta) = match pos {
        SeekFrom::Start(offset) => return Ok(offset),
        SeekFrom::Current(delta) => (current, delta),
        SeekFrom::End(delta) => (length, delta),
    };
    if delta >= 0 {
        base.checked_add(delta as u64)
            .ok_or(StreamError::OffsetOverflow)
    } else {
        base.checked_sub(delta.unsigned_abs())
            .ok_or(StreamError::NegativeSeek)
    }
}
