//! Stream composition layer for devio virtual disks.
//!
//! The protocol server addresses its backing store with arbitrary offsets and lengths. This
//! crate turns those requests into bounds-checked, aligned operations on one or more real byte
//! stores:
//!
//! - [`Stream`]: positioned random-access byte store implemented by every layer
//! - [`AligningStream`]: forces all backing I/O onto power-of-two boundaries (read-modify-write)
//! - [`SubStream`]: fixed window of a parent stream, re-based to offset 0
//! - [`CombinedSeekStream`]: concatenation of member streams, optionally extendable
//! - [`MemStream`], [`FileStream`]: concrete backends
//! - [`ScratchPool`]: size-classed scratch buffers for misaligned I/O

mod aligning;
mod combined;
mod error;
mod file;
mod mem;
mod pool;
mod stream;
mod sub;
pub mod util;

pub use aligning::AligningStream;
pub use combined::{CombinedSeekStream, MemberFactory};
pub use error::{Result, StreamError};
pub use file::FileStream;
pub use mem::MemStream;
pub use pool::{PooledBuffer, ScratchPool};
pub use stream::Stream;
pub use sub::SubStream;

/// Conventional disk sector size.
pub const SECTOR_SIZE: u32 = 512;

#[cfg(test)]
mod proptests;
