use std::sync::{Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{CodeRangeError};

/** The maximum number of generated-code ranges. */
pub const CAPACITY: usize = 64;

/**
 * A set of address ranges that hold generated code.
 *
 * Readers run in signal context, so they take no locks: each slot is a pair
 * of atomics, and a slot is live while its `size` is nonzero. Writers
 * serialize on a [`Mutex`], write `start` before publishing `size`, and
 * retire a slot by clearing `size`.
 */
#[derive(Debug)]
pub struct CodeRanges {
    starts: [AtomicUsize; CAPACITY],
    sizes: [AtomicUsize; CAPACITY],
    writer: Mutex<()>,
}

impl CodeRanges {
    pub fn new() -> Self {
        CodeRanges {
            starts: std::array::from_fn(|_| AtomicUsize::new(0)),
            sizes: std::array::from_fn(|_| AtomicUsize::new(0)),
            writer: Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock is still usable.
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, start: usize, size: usize) -> Result<(), CodeRangeError> {
        if size == 0 {
            return Err(CodeRangeError::Empty {start});
        }
        let _guard = self.lock();
        let i = self.sizes.iter().position(|s| s.load(Ordering::Relaxed) == 0)
            .ok_or(CodeRangeError::Full {capacity: CAPACITY})?;
        self.starts[i].store(start, Ordering::Relaxed);
        self.sizes[i].store(size, Ordering::Release);
        Ok(())
    }

    /** Panics if `start..start+size` was never added. */
    pub fn remove(&self, start: usize, size: usize) {
        let _guard = self.lock();
        for i in 0..CAPACITY {
            if self.sizes[i].load(Ordering::Relaxed) == size && self.starts[i].load(Ordering::Relaxed) == start {
                self.sizes[i].store(0, Ordering::Release);
                return;
            }
        }
        panic!("Generated code range {:#x}+{:#x} was never added", start, size);
    }

    /** Tests whether any range contains `pc`. Lock-free. */
    pub fn contains(&self, pc: usize) -> bool {
        (0..CAPACITY).any(|i| {
            let size = self.sizes[i].load(Ordering::Acquire);
            size != 0 && pc.wrapping_sub(self.starts[i].load(Ordering::Relaxed)) < size
        })
    }
}

impl Default for CodeRanges {
    fn default() -> Self { Self::new() }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn add_and_remove() {
        let ranges = CodeRanges::new();
        ranges.add(0x1000, 0x100).unwrap();
        ranges.add(0x4000, 0x10).unwrap();
        assert!(ranges.contains(0x1000));
        assert!(ranges.contains(0x10FF));
        assert!(!ranges.contains(0x1100));
        assert!(!ranges.contains(0xFFF));
        assert!(ranges.contains(0x400F));
        ranges.remove(0x1000, 0x100);
        assert!(!ranges.contains(0x1000));
        assert!(ranges.contains(0x4000));
    }

    #[test]
    fn full() {
        let ranges = CodeRanges::new();
        for i in 0..CAPACITY {
            ranges.add(i * 0x100, 0x10).unwrap();
        }
        assert_eq!(ranges.add(0x10_0000, 0x10), Err(CodeRangeError::Full {capacity: CAPACITY}));
        ranges.remove(0x300, 0x10);
        ranges.add(0x10_0000, 0x10).unwrap();
        assert!(ranges.contains(0x10_0008));
        assert!(!ranges.contains(0x308));
    }

    #[test]
    fn empty() {
        assert_eq!(CodeRanges::new().add(0x1000, 0), Err(CodeRangeError::Empty {start: 0x1000}));
    }

    #[test]
    #[should_panic(expected = "never added")]
    fn remove_unknown() {
        let ranges = CodeRanges::new();
        ranges.add(0x1000, 0x100).unwrap();
        ranges.remove(0x1000, 0x80);
    }
}
