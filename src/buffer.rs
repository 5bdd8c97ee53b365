use std::ops::{DerefMut};

#[cfg(test)]
mod mmap;
#[cfg(test)]
pub use mmap::{Mmap};

mod vec;
pub use vec::{VecU8};

/**
 * A byte array with a write pointer, into which machine code is assembled.
 *
 * Positions are byte offsets from the start of the array. Assemblers never
 * see absolute addresses; those only exist once the embedder copies the
 * finished code into executable memory.
 */
pub trait Buffer: DerefMut<Target=[u8]> {
    /** Get the write pointer. */
    fn get_pos(&self) -> usize;

    /** Set the write pointer. */
    fn set_pos(&mut self, pos: usize);

    /** Writes a single byte at the write pointer, incrementing it. */
    fn write_byte(&mut self, byte: u8) {
        let pos = self.get_pos();
        self[pos] = byte;
        self.set_pos(pos + 1);
    }

    /**
     * Writes up to 8 bytes at the write pointer, little-endian, as if using
     * `write_byte()` repeatedly.
     */
    fn write(&mut self, mut bytes: u64, len: usize) {
        assert!(len <= 8);
        for _ in 0..len {
            self.write_byte(bytes as u8);
            bytes >>= 8;
        }
        assert_eq!(bytes, 0);
    }

    /** Writes all of `bytes` at the write pointer. */
    fn write_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    /** Reads a single byte. */
    fn read_byte(&self, pos: usize) -> u8 {
        self[pos]
    }

    /** Reads up to 8 bytes, as if using `read_byte()` repeatedly. */
    fn read(&self, pos: usize, len: usize) -> u64 {
        assert!(len <= 8);
        let mut bytes: u64 = 0;
        for i in (0..len).rev() {
            bytes <<= 8;
            bytes |= u64::from(self[pos + i]);
        }
        bytes
    }

    /**
     * Overwrites `len` bytes at `pos` without moving the write pointer.
     * Used to patch branch displacements.
     */
    fn overwrite(&mut self, pos: usize, bytes: u64, len: usize) {
        let old_pos = self.get_pos();
        self.set_pos(pos);
        self.write(bytes, len);
        self.set_pos(old_pos);
    }
}

//-----------------------------------------------------------------------------
