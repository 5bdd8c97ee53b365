//! Unwind information for the code emitted by a macro assembler.
//!
//! [`Cfi`] tracks the distance from the stack pointer to the canonical frame
//! address (CFA) as instructions are emitted, and records the changes as a
//! stream of DWARF call-frame instructions. The stream assumes a code
//! alignment factor of 1 and a data alignment factor chosen by the target.

/** A DWARF register number. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DwarfReg(pub u16);

// DWARF call-frame instruction opcodes.
const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xC0;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_REMEMBER_STATE: u8 = 0x0A;
const DW_CFA_RESTORE_STATE: u8 = 0x0B;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0E;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;

fn write_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_sleb128(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/**
 * The unwind-info cursor of a macro assembler.
 *
 * Every method that changes the unwind state takes the current code position
 * `pc`, which must never decrease.
 */
#[derive(Debug, Clone)]
pub struct Cfi {
    /// The multiplier applied to register save offsets, e.g. `-8`.
    data_alignment_factor: i32,
    /// The distance from the stack pointer to the CFA.
    cfa_offset: i32,
    /// Saved `cfa_offset`s, for `remember_state()` and `restore_state()`.
    remembered: Vec<i32>,
    /// The DWARF call-frame instructions.
    opcodes: Vec<u8>,
    /// The code position described by the end of `opcodes`.
    last_pc: usize,
}

impl Cfi {
    /**
     * Constructs a `Cfi` for a function entered with `initial_cfa_offset`
     * bytes between the stack pointer and the CFA, i.e. the size of the
     * return address on targets that push one.
     */
    pub fn new(initial_cfa_offset: i32, data_alignment_factor: i32) -> Self {
        assert_ne!(data_alignment_factor, 0);
        Cfi {
            data_alignment_factor,
            cfa_offset: initial_cfa_offset,
            remembered: Vec::new(),
            opcodes: Vec::new(),
            last_pc: 0,
        }
    }

    /** The distance from the stack pointer to the CFA. */
    pub fn current_cfa_offset(&self) -> i32 { self.cfa_offset }

    /** The DWARF call-frame instructions emitted so far. */
    #[cfg(test)]
    pub fn opcodes(&self) -> &[u8] { &self.opcodes }

    pub fn into_opcodes(self) -> Vec<u8> { self.opcodes }

    fn advance(&mut self, pc: usize) {
        assert!(pc >= self.last_pc, "CFI cannot go backwards");
        let delta = pc - self.last_pc;
        if delta == 0 {
            // Nothing to do.
        } else if delta < 0x40 {
            self.opcodes.push(DW_CFA_ADVANCE_LOC | delta as u8);
        } else if delta <= 0xFF {
            self.opcodes.push(DW_CFA_ADVANCE_LOC1);
            self.opcodes.push(delta as u8);
        } else if delta <= 0xFFFF {
            self.opcodes.push(DW_CFA_ADVANCE_LOC2);
            self.opcodes.extend_from_slice(&(delta as u16).to_le_bytes());
        } else {
            self.opcodes.push(DW_CFA_ADVANCE_LOC4);
            self.opcodes.extend_from_slice(&(delta as u32).to_le_bytes());
        }
        self.last_pc = pc;
    }

    /** Records that the CFA is now `offset` bytes above the stack pointer. */
    pub fn def_cfa_offset(&mut self, pc: usize, offset: i32) {
        if offset == self.cfa_offset {
            return;
        }
        assert!(offset >= 0);
        self.advance(pc);
        self.opcodes.push(DW_CFA_DEF_CFA_OFFSET);
        write_uleb128(&mut self.opcodes, offset as u32);
        self.cfa_offset = offset;
    }

    /** Records that the stack pointer moved down by `delta` bytes. */
    pub fn adjust_cfa_offset(&mut self, pc: usize, delta: i32) {
        self.def_cfa_offset(pc, self.cfa_offset + delta);
    }

    /** Records that `reg` has been saved at `[sp + sp_offset]`. */
    pub fn rel_offset(&mut self, pc: usize, reg: DwarfReg, sp_offset: i32) {
        let cfa_relative = sp_offset - self.cfa_offset;
        assert_eq!(cfa_relative % self.data_alignment_factor, 0);
        let factored = cfa_relative / self.data_alignment_factor;
        self.advance(pc);
        if factored >= 0 && reg.0 < 0x40 {
            self.opcodes.push(DW_CFA_OFFSET | reg.0 as u8);
            write_uleb128(&mut self.opcodes, factored as u32);
        } else {
            self.opcodes.push(DW_CFA_OFFSET_EXTENDED_SF);
            write_uleb128(&mut self.opcodes, u32::from(reg.0));
            write_sleb128(&mut self.opcodes, factored);
        }
    }

    /** Records that `reg` holds its value from the caller again. */
    pub fn restore(&mut self, pc: usize, reg: DwarfReg) {
        self.advance(pc);
        if reg.0 < 0x40 {
            self.opcodes.push(DW_CFA_RESTORE | reg.0 as u8);
        } else {
            self.opcodes.push(DW_CFA_RESTORE_EXTENDED);
            write_uleb128(&mut self.opcodes, u32::from(reg.0));
        }
    }

    /** Pushes the current unwind state. */
    pub fn remember_state(&mut self, pc: usize) {
        self.advance(pc);
        self.opcodes.push(DW_CFA_REMEMBER_STATE);
        self.remembered.push(self.cfa_offset);
    }

    /** Pops the unwind state pushed by the matching `remember_state()`. */
    pub fn restore_state(&mut self, pc: usize) {
        let offset = self.remembered.pop().expect("restore_state() without remember_state()");
        self.advance(pc);
        self.opcodes.push(DW_CFA_RESTORE_STATE);
        self.cfa_offset = offset;
    }
}

//-----------------------------------------------------------------------------
