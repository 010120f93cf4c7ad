//! Process-wide byte buffer pool.
//!
//! Buffers are recycled in power-of-two size classes to keep fragmentation
//! bounded. [`get`] hands ownership of a buffer to the caller as a
//! [`PooledBuf`] guard; dropping the guard returns the buffer to its class,
//! so a buffer is released exactly once on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Smallest pooled class, 1 KiB.
const MIN_CLASS_SHIFT: u32 = 10;
/// Largest pooled class, 64 KiB. Bigger requests bypass the pool.
const MAX_CLASS_SHIFT: u32 = 16;
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Per-class cap on retained buffers.
const MAX_RETAINED: usize = 64;

struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
}

static POOL: OnceLock<BufferPool> = OnceLock::new();

fn pool() -> &'static BufferPool {
    POOL.get_or_init(|| BufferPool {
        classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
    })
}

fn class_of(size: usize) -> Option<usize> {
    if size == 0 || size > 1 << MAX_CLASS_SHIFT {
        return None;
    }
    let shift = usize::BITS - (size - 1).leading_zeros();
    let shift = shift.max(MIN_CLASS_SHIFT);
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

/// Takes a buffer of exactly `size` bytes from the pool.
///
/// Contents are unspecified; callers must not read bytes they have not
/// written. The buffer returns to the pool when the guard is dropped.
pub fn get(size: usize) -> PooledBuf {
    let class = class_of(size);
    let mut buf = match class {
        Some(c) => {
            let mut slots = pool().classes[c]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slots.pop().unwrap_or_else(|| {
                vec![0u8; 1 << (c as u32 + MIN_CLASS_SHIFT)]
            })
        }
        None => vec![0u8; size],
    };
    // Class buffers are allocated at full class capacity; expose only the
    // requested prefix.
    buf.resize(buf.capacity().max(size), 0);
    PooledBuf { buf, len: size, class }
}

/// An owned, pooled byte region of a fixed length.
pub struct PooledBuf {
    buf: Vec<u8>,
    len: usize,
    class: Option<usize>,
}

impl PooledBuf {
    /// Length of the usable region.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(c) = self.class else { return };
        let buf = std::mem::take(&mut self.buf);
        let mut slots = pool().classes[c]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slots.len() < MAX_RETAINED {
            slots.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_selection() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(1024), Some(0));
        assert_eq!(class_of(1025), Some(1));
        assert_eq!(class_of(16 * 1024), Some(4));
        assert_eq!(class_of(64 * 1024), Some(6));
        assert_eq!(class_of(64 * 1024 + 1), None);
        assert_eq!(class_of(0), None);
    }

    #[test]
    fn test_get_len() {
        for size in [1, 7, 1024, 6144, 10239, 65536, 1 << 20] {
            let buf = get(size);
            assert_eq!(buf.len(), size);
            assert_eq!(&buf[..].len(), &size);
        }
    }

    #[test]
    fn test_reuse() {
        let mut buf = get(4096);
        buf[0] = 0xAB;
        drop(buf);

        // The recycled buffer keeps its class capacity regardless of the
        // requested length.
        let buf = get(3000);
        assert_eq!(buf.len(), 3000);
    }

    #[test]
    fn test_oversized_bypasses_pool() {
        let buf = get(1 << 20);
        assert!(buf.class.is_none());
    }
}
