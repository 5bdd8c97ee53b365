use memmap::{MmapMut};

/**
 * A page-aligned copy of a finished stub, which tests can call into.
 *
 * The stub is never patched once it is here, so unlike [`VecU8`] this is not
 * a [`Buffer`].
 *
 * [`VecU8`]: super::VecU8
 * [`Buffer`]: super::Buffer
 */
pub struct Mmap {
    memory: MmapMut,
    len: usize,
}

impl Mmap {
    /** Maps a fresh anonymous page range and copies `code` to its start. */
    pub fn from_code(code: &[u8]) -> std::io::Result<Self> {
        let mut memory = MmapMut::map_anon(std::cmp::max(code.len(), 1))?;
        memory[..code.len()].copy_from_slice(code);
        Ok(Mmap {memory, len: code.len()})
    }

    /**
     * Flips the pages to read-and-execute, passes the code to `callback`,
     * then flips them back so that the mapping can be dropped.
     */
    pub fn execute<T>(mut self, callback: impl FnOnce(&[u8]) -> T)
    -> std::io::Result<(Self, T)> {
        let code = self.memory.make_exec()?;
        let result = callback(&code[..self.len]);
        self.memory = code.make_mut()?;
        Ok((self, result))
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn ret() {
        let code = Mmap::from_code(&[0xC3]).expect("Couldn't allocate");
        let (_code, first) = code.execute(|bytes| (bytes.len(), bytes[0]))
            .expect("Couldn't change permissions");
        assert_eq!(first, (1, 0xC3));
    }

    #[test]
    fn empty() {
        let code = Mmap::from_code(&[]).expect("Couldn't allocate");
        let (_code, len) = code.execute(|bytes| bytes.len())
            .expect("Couldn't change permissions");
        assert_eq!(len, 0);
    }
}
