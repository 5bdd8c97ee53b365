//! Tools for generating AArch64 code.
//!
//! One method call on an [`Assembler`] generates one 4-byte instruction.
//! Memory operands are `(base, offset)` pairs; where the offset cannot be
//! encoded the assembler panics, as stub frames and thread blocks are small.

use crate::buffer::{Buffer};
use crate::label::{Patch};
use super::{Register, Fp, Width, Condition, AddOp, LogicOp};

use Register::*;

/** A memory operand `[base + offset]`. */
pub type Address = (Register, i32);

//-----------------------------------------------------------------------------

/// Computes the displacement from `from` to `to`.
pub fn disp(from: usize, to: usize) -> i64 {
    if from > i64::MAX as usize || to > i64::MAX as usize {
        panic!("Displacements greater than isize::MAX are not supported");
    }
    (to as i64) - (from as i64)
}

/// Returns a bitmask representing `x` as a `bits`-bit signed integer.
fn signed(x: i64, bits: usize) -> Option<u32> {
    let limit: i64 = 1 << (bits - 1);
    if x >= limit || x < -limit {
        None
    } else {
        Some((x & (2*limit - 1)) as u32)
    }
}

/// Computes a bitmask representing the offset from `from` to `target`, in
/// instructions. Returns a dummy value if the target is `None`. Returns
/// `None` if the offset is not encodable.
pub fn jump_offset(from: usize, to: Option<usize>, bits: usize) -> Option<u32> {
    match to {
        Some(to) => {
            let offset = disp(from, to);
            assert_eq!(offset & 3, 0);
            signed(offset >> 2, bits)
        },
        None => {
            Some(1 << (bits - 1))
        },
    }
}

/**
 * Encodes `value` as a bitmask immediate of `width`, returning the
 * `(N, immr, imms)` fields. Only single runs of ones, possibly rotated, are
 * supported; i.e. the element size is always the full width.
 */
pub fn logic_immediate(width: Width, value: u64) -> Option<(u32, u32, u32)> {
    let bits = width.size() as u32 * 8;
    let mask = if bits == 64 { !0 } else { (1u64 << bits) - 1 };
    if value & !mask != 0 { return None; }
    let rotated = |r: u32| if r == 0 { value } else { ((value << r) | (value >> (bits - r))) & mask };
    let ones = value.count_ones();
    if ones == 0 || ones == bits { return None; }
    let run = (1u64 << ones) - 1;
    let immr = (0..bits).find(|&r| rotated(r) == run)?;
    Some((width as u32, immr, ones - 1))
}

/// Returns the scaled 12-bit unsigned offset field for an access of
/// `1 << scale` bytes, if `offset` fits it.
fn scaled_offset(offset: i32, scale: u32) -> Option<u32> {
    let offset = u32::try_from(offset).ok()?;
    if offset & ((1 << scale) - 1) != 0 { return None; }
    let field = offset >> scale;
    (field < 0x1000).then_some(field)
}

//-----------------------------------------------------------------------------

/// An assembler, implementing the subset of A64 needed by call-boundary
/// stubs.
pub struct Assembler<B: Buffer> {
    /// The area we're filling with code.
    buffer: B,
}

impl<B: Buffer> Assembler<B> {
    pub fn new(buffer: B) -> Self {
        Assembler {buffer}
    }

    pub fn get_pos(&self) -> usize {
        self.buffer.get_pos()
    }

    pub fn into_buffer(self) -> B { self.buffer }

    pub fn write_instruction(&mut self, opcode: u32) {
        self.buffer.write(u64::from(opcode), 4);
    }

    /// Modifies a branch instruction at `patch` so that it jumps to
    /// `new_target` instead of `old_target`.
    pub fn patch(&mut self, patch: Patch, old_target: Option<usize>, new_target: Option<usize>) {
        let at = patch.address();
        let old = self.buffer.read(at, 4) as u32;
        let (bits, shift) = if (old & 0xFF000010) == 0x54000000 {
            // Conditional branch.
            (19, 5)
        } else if (old & 0x7C000000) == 0x14000000 {
            // Jump or call.
            (26, 0)
        } else if (old & 0x7E000000) == 0x34000000 {
            // Compare and branch.
            (19, 5)
        } else if (old & 0x7E000000) == 0x36000000 {
            // Test bit and branch.
            (14, 5)
        } else {
            panic!("not a jump or call instruction");
        };
        let mask = (1u32 << bits) - 1;
        let old_offset = jump_offset(at, old_target, bits).unwrap();
        let new_offset = jump_offset(at, new_target, bits).expect("Cannot jump so far");
        assert_eq!((old >> shift) & mask, old_offset);
        let new = old ^ ((old_offset ^ new_offset) << shift);
        self.buffer.overwrite(at, u64::from(new), 4);
    }

    // Arithmetic.

    /// Assembles an `add`, `sub` or similar with a 12-bit immediate, which
    /// may be shifted left by 12.
    pub fn const_add(&mut self, op: AddOp, width: Width, rd: Register, rn: Register, imm: u32) {
        let (sh, imm12) = if imm < 0x1000 {
            (0, imm)
        } else if imm & 0xFFF == 0 && imm < 0x100_0000 {
            (1, imm >> 12)
        } else {
            panic!("Immediate {:#x} cannot be encoded", imm);
        };
        self.write_instruction(
            width.sf() | (op as u32) << 29 | 0x11000000 | sh << 22 |
            imm12 << 10 | rn.code() << 5 | rd.code()
        );
    }

    /// Assembles an `and`, `orr` or similar with a bitmask immediate.
    pub fn const_logic(&mut self, op: LogicOp, width: Width, rd: Register, rn: Register, imm: u64) {
        let (n, immr, imms) = logic_immediate(width, imm)
            .unwrap_or_else(|| panic!("Cannot encode {:#x} as a bitmask", imm));
        self.write_instruction(
            width.sf() | (op as u32) << 29 | 0x12000000 | n << 22 |
            immr << 16 | imms << 10 | rn.code() << 5 | rd.code()
        );
    }

    /// `tst rn, #imm`.
    pub fn const_test(&mut self, width: Width, rn: Register, imm: u64) {
        self.const_logic(LogicOp::ANDS, width, RZR, rn, imm);
    }

    /// `cmp rn, rm`.
    pub fn cmp(&mut self, width: Width, rn: Register, rm: Register) {
        self.write_instruction(width.sf() | 0x6B000000 | rm.code() << 16 | rn.code() << 5 | RZR.code());
    }

    /// Moves between core registers. Neither may be `RSP`.
    pub fn move_(&mut self, width: Width, rd: Register, rm: Register) {
        self.write_instruction(width.sf() | 0x2A0003E0 | rm.code() << 16 | rd.code());
    }

    /// Moves to or from the stack pointer; `RZR` means `RSP`.
    pub fn move_sp(&mut self, rd: Register, rn: Register) {
        self.const_add(AddOp::ADD, Width::X, rd, rn, 0);
    }

    /// `movz` if `keep` is false, otherwise `movk`.
    pub fn move_wide(&mut self, width: Width, rd: Register, imm16: u16, hw: u32, keep: bool) {
        assert!(hw < 2 || width == Width::X);
        let opcode = if keep { 0x72800000 } else { 0x52800000 };
        self.write_instruction(width.sf() | opcode | hw << 21 | u32::from(imm16) << 5 | rd.code());
    }

    /// Puts `imm` into `rd`, using one `movz` and up to three `movk`s.
    pub fn const_(&mut self, width: Width, rd: Register, imm: u64) {
        let chunks = width.size() / 2;
        assert!(chunks == 4 || imm >> 32 == 0, "Immediate {:#x} is too wide", imm);
        let mut first = true;
        for hw in 0..chunks as u32 {
            let imm16 = (imm >> (16 * hw)) as u16;
            if imm16 != 0 || (first && imm >> (16 * hw) == 0) {
                self.move_wide(width, rd, imm16, hw, !first);
                first = false;
            }
        }
    }

    /// Sign- or zero-extends the low `size` bytes of `rn` into `rd` as a
    /// 32-bit value.
    pub fn extend(&mut self, signed: bool, size: usize, rd: Register, rn: Register) {
        let imms = match size {
            1 => 7,
            2 => 15,
            _ => panic!("Bad size {} for an extension", size),
        };
        let opcode = if signed { 0x13000000 } else { 0x53000000 };
        self.write_instruction(opcode | imms << 10 | rn.code() << 5 | rd.code());
    }

    /// Moves between floating-point registers.
    pub fn fmove(&mut self, width: Width, fd: Fp, fn_: Fp) {
        self.write_instruction(0x1E204000 | (width as u32) << 22 | fn_.code() << 5 | fd.code());
    }

    // Memory.

    /// Assembles a load or store of `1 << scale` bytes. `vector` selects the
    /// floating-point registers.
    fn mem(&mut self, load: bool, vector: bool, scale: u32, rt: u32, address: Address) {
        let (rn, offset) = address;
        let opc = u32::from(load) << 22;
        let v = u32::from(vector) << 26;
        if let Some(field) = scaled_offset(offset, scale) {
            self.write_instruction(scale << 30 | 0x39000000 | v | opc | field << 10 | rn.code() << 5 | rt);
        } else if (-256..256).contains(&offset) {
            let field = (offset as u32) & 0x1FF;
            self.write_instruction(scale << 30 | 0x38000000 | v | opc | field << 12 | rn.code() << 5 | rt);
        } else {
            panic!("Offset {} is out of range", offset);
        }
    }

    /// Loads and zero-extends a 32- or 64-bit value.
    pub fn load(&mut self, width: Width, rt: Register, address: Address) {
        self.mem(true, false, 2 + width as u32, rt.code(), address);
    }

    pub fn store(&mut self, width: Width, address: Address, rt: Register) {
        self.mem(false, false, 2 + width as u32, rt.code(), address);
    }

    /// Loads and zero-extends a byte.
    pub fn load_byte(&mut self, rt: Register, address: Address) {
        self.mem(true, false, 0, rt.code(), address);
    }

    pub fn load_fp(&mut self, width: Width, ft: Fp, address: Address) {
        self.mem(true, true, 2 + width as u32, ft.code(), address);
    }

    pub fn store_fp(&mut self, width: Width, address: Address, ft: Fp) {
        self.mem(false, true, 2 + width as u32, ft.code(), address);
    }

    /// Assembles `ldp` or `stp` of 64-bit values. `vector` selects the
    /// floating-point registers.
    fn pair(&mut self, load: bool, vector: bool, rt: u32, rt2: u32, address: Address) {
        let (rn, offset) = address;
        assert_eq!(offset & 7, 0, "Misaligned pair offset {}", offset);
        let field = signed(i64::from(offset >> 3), 7)
            .unwrap_or_else(|| panic!("Pair offset {} is out of range", offset));
        let opcode = if vector { 0x6D000000 } else { 0xA9000000 };
        self.write_instruction(
            opcode | u32::from(load) << 22 | field << 15 | rt2 << 10 | rn.code() << 5 | rt
        );
    }

    pub fn store_pair(&mut self, address: Address, rt: Register, rt2: Register) {
        self.pair(false, false, rt.code(), rt2.code(), address);
    }

    pub fn load_pair(&mut self, rt: Register, rt2: Register, address: Address) {
        self.pair(true, false, rt.code(), rt2.code(), address);
    }

    pub fn store_fp_pair(&mut self, address: Address, ft: Fp, ft2: Fp) {
        self.pair(false, true, ft.code(), ft2.code(), address);
    }

    pub fn load_fp_pair(&mut self, ft: Fp, ft2: Fp, address: Address) {
        self.pair(true, true, ft.code(), ft2.code(), address);
    }

    /// `ldaxr rt, [rn]`: load-acquire exclusive.
    pub fn load_acquire_exclusive(&mut self, width: Width, rt: Register, rn: Register) {
        self.write_instruction((width as u32) << 30 | 0x885FFC00 | rn.code() << 5 | rt.code());
    }

    /// `stlxr rs, rt, [rn]`: store-release exclusive. `rs` receives 0 on
    /// success.
    pub fn store_release_exclusive(&mut self, width: Width, rs: Register, rt: Register, rn: Register) {
        self.write_instruction(
            (width as u32) << 30 | 0x8800FC00 | rs.code() << 16 | rn.code() << 5 | rt.code()
        );
    }

    // Control flow.

    /// Assembles a conditional branch to `target`.
    pub fn jump_if(&mut self, cc: Condition, target: Option<usize>) -> Patch {
        let pos = self.get_pos();
        let offset = jump_offset(pos, target, 19).expect("Cannot jump so far");
        self.write_instruction(0x54000000 | offset << 5 | cc as u32);
        Patch::new(pos)
    }

    /// Assembles an unconditional branch to `target`.
    pub fn const_jump(&mut self, target: Option<usize>) -> Patch {
        let pos = self.get_pos();
        let offset = jump_offset(pos, target, 26).expect("Cannot jump so far");
        self.write_instruction(0x14000000 | offset);
        Patch::new(pos)
    }

    /// Assembles `cbz` if `if_zero`, otherwise `cbnz`.
    pub fn compare_and_jump(&mut self, width: Width, rt: Register, if_zero: bool, target: Option<usize>) -> Patch {
        let pos = self.get_pos();
        let offset = jump_offset(pos, target, 19).expect("Cannot jump so far");
        let nz = u32::from(!if_zero) << 24;
        self.write_instruction(width.sf() | 0x34000000 | nz | offset << 5 | rt.code());
        Patch::new(pos)
    }

    /// Assembles `tbz` if `if_zero`, otherwise `tbnz`.
    pub fn test_bit_and_jump(&mut self, rt: Register, bit: u32, if_zero: bool, target: Option<usize>) -> Patch {
        assert!(bit < 64);
        let pos = self.get_pos();
        let offset = jump_offset(pos, target, 14).expect("Cannot jump so far");
        let nz = u32::from(!if_zero) << 24;
        self.write_instruction(
            (bit >> 5) << 31 | 0x36000000 | nz | (bit & 0x1F) << 19 | offset << 5 | rt.code()
        );
        Patch::new(pos)
    }

    /// `br rn`.
    pub fn jump(&mut self, rn: Register) {
        self.write_instruction(0xD61F0000 | rn.code() << 5);
    }

    /// `blr rn`.
    pub fn call(&mut self, rn: Register) {
        self.write_instruction(0xD63F0000 | rn.code() << 5);
    }

    pub fn ret(&mut self) {
        self.write_instruction(0xD65F0000 | RLR.code() << 5);
    }

    pub fn brk(&mut self, imm16: u16) {
        self.write_instruction(0xD4200000 | u32::from(imm16) << 5);
    }
}

//-----------------------------------------------------------------------------
