use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock};

/// Smallest size class handed out by the pool.
const MIN_CLASS_SHIFT: u32 = 9; // 512 bytes
/// Largest pooled size class. Bigger requests are allocated and freed directly.
const MAX_CLASS_SHIFT: u32 = 26; // 64 MiB
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
/// Idle buffers kept per size class.
const DEFAULT_MAX_IDLE_PER_CLASS: usize = 4;

/// Scratch-buffer pool keyed by power-of-two size class.
///
/// Misaligned I/O needs a transient buffer covering the aligned span, which can be as large as
/// the maximum transfer size. Acquiring from the pool returns a [`PooledBuffer`] guard that hands
/// the allocation back when dropped, including on early returns and error paths.
pub struct ScratchPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    max_idle_per_class: usize,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE_PER_CLASS)
    }

    pub fn with_max_idle(max_idle_per_class: usize) -> Self {
        Self {
            classes: (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            max_idle_per_class,
        }
    }

    /// Process-wide pool shared by streams that were not given their own.
    pub fn global() -> Arc<ScratchPool> {
        static GLOBAL: OnceLock<Arc<ScratchPool>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ScratchPool::new())).clone()
    }

    /// Borrow a zero-filled buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> PooledBuffer<'_> {
        let class = size_class(len);
        let mut buf = class
            .and_then(|idx| {
                self.classes[idx]
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .pop()
            })
            .unwrap_or_else(|| {
                let capacity = class.map_or(len, class_size);
                Vec::with_capacity(capacity)
            });
        buf.clear();
        buf.resize(len, 0);
        PooledBuffer {
            pool: self,
            class,
            buf,
        }
    }

    /// Number of idle buffers currently held for the size class serving `len`.
    pub fn idle_count(&self, len: usize) -> usize {
        size_class(len).map_or(0, |idx| {
            self.classes[idx]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len()
        })
    }

    fn release(&self, class: usize, buf: Vec<u8>) {
        let mut idle = self.classes[class]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < self.max_idle_per_class {
            idle.push(buf);
        }
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}

fn size_class(len: usize) -> Option<usize> {
    let shift = len
        .max(1)
        .checked_next_power_of_two()?
        .trailing_zeros()
        .max(MIN_CLASS_SHIFT);
    (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
}

fn class_size(idx: usize) -> usize {
    1usize << (idx as u32 + MIN_CLASS_SHIFT)
}

/// Scratch buffer on loan from a [`ScratchPool`].
pub struct PooledBuffer<'a> {
    pool: &'a ScratchPool,
    class: Option<usize>,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            let buf = std::mem::take(&mut self.buf);
            self.pool.release(class, buf);
        }
    }
}
