//! Tools for generating IA-32 code.
//!
//! One method call on an [`Assembler`] generates one instruction. The
//! instructions are the 32-bit forms of those in the x86_64 assembler, minus
//! the REX prefixes, plus the few x87 loads and stores needed to handle
//! `float` and `double` results.

use crate::buffer::{Buffer};
use crate::label::{Patch};
use super::super::x86_64::{optional_disp32};
use super::{Register, Xmm, BinaryOp, Condition, Segment, Width};

/** A memory operand `[base + disp32]`. */
pub type Address = (Register, i32);

/**
 * An assembler, implementing a regularish subset of IA-32.
 *
 * All memory operands relative to a register use a 32-bit displacement. All
 * operations are 32 bits wide.
 */
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

    // Patterns and constants.

    pub fn write_imm8(&mut self, immediate: i8) {
        self.buffer.write_byte(immediate as u8);
    }

    pub fn write_imm32(&mut self, immediate: i32) {
        self.buffer.write(u64::from(immediate as u32), 4);
    }

    /** Writes a 32-bit displacement from `self.get_pos()+4` to `target`. */
    pub fn write_rel32(&mut self, target: Option<usize>) {
        let pos = self.get_pos();
        self.write_imm32(optional_disp32(pos + 4, target));
    }

    /** Writes a ModR/M byte with `mod` 11, i.e. two register operands. */
    pub fn write_modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buffer.write_byte(0xC0 | reg << 3 | rm);
    }

    /**
     * Writes a ModR/M byte with `mod` 10, followed by a SIB byte if `base` is
     * `ESP`, and a 32-bit displacement.
     */
    pub fn write_modrm_mem(&mut self, reg: u8, address: Address) {
        let (base, disp) = address;
        self.buffer.write_byte(0x80 | reg << 3 | base.code());
        if base == Register::ESP {
            self.buffer.write_byte(0x24);
        }
        self.write_imm32(disp);
    }

    /** Writes a ModR/M byte with `mod` 00 and `rm` 101, i.e. `[disp32]`. */
    pub fn write_modrm_abs(&mut self, reg: u8, disp: i32) {
        self.buffer.write_byte(0x05 | reg << 3);
        self.write_imm32(disp);
    }

    /** Writes an opcode of one or two bytes, least significant byte first. */
    fn write_opcode(&mut self, opcode: u16) {
        if opcode > 0xFF {
            self.buffer.write(u64::from(opcode), 2);
        } else {
            self.buffer.write_byte(opcode as u8);
        }
    }

    // Moves.

    pub fn move_(&mut self, dest: Register, src: Register) {
        self.buffer.write_byte(0x8B);
        self.write_modrm_reg(dest.code(), src.code());
    }

    pub fn load(&mut self, dest: Register, src: Address) {
        self.buffer.write_byte(0x8B);
        self.write_modrm_mem(dest.code(), src);
    }

    pub fn store(&mut self, dest: Address, src: Register) {
        self.buffer.write_byte(0x89);
        self.write_modrm_mem(src.code(), dest);
    }

    pub fn lea(&mut self, dest: Register, src: Address) {
        self.buffer.write_byte(0x8D);
        self.write_modrm_mem(dest.code(), src);
    }

    /**
     * Move constant to register. If `imm` is zero this assembles `xor`,
     * which corrupts the status flags.
     */
    pub fn const_(&mut self, dest: Register, imm: i32) {
        if imm == 0 {
            self.op(BinaryOp::Xor, dest, dest);
        } else {
            self.const_preserving_flags(dest, imm);
        }
    }

    pub fn const_preserving_flags(&mut self, dest: Register, imm: i32) {
        self.buffer.write_byte(0xB8 | dest.code());
        self.write_imm32(imm);
    }

    /** Sign- or zero-extend the low bits of `src`. */
    pub fn extend(&mut self, width: Width, dest: Register, src: Register) {
        let opcode = match width {
            Width::U8 => 0xB60F,
            Width::S8 => 0xBE0F,
            Width::U16 => 0xB70F,
            Width::S16 => 0xBF0F,
        };
        if matches!(width, Width::U8 | Width::S8) {
            assert!(src.has_byte_form(), "{:?} has no byte form", src);
        }
        self.write_opcode(opcode);
        self.write_modrm_reg(dest.code(), src.code());
    }

    // Arithmetic.

    /** Op register to register. */
    pub fn op(&mut self, op: BinaryOp, dest: Register, src: Register) {
        self.buffer.write_byte((op as u8) << 3 | 0x01);
        self.write_modrm_reg(src.code(), dest.code());
    }

    /** Op constant to register. */
    pub fn const_op(&mut self, op: BinaryOp, dest: Register, imm: i32) {
        self.buffer.write_byte(0x81);
        self.write_modrm_reg(op as u8, dest.code());
        self.write_imm32(imm);
    }

    pub fn test(&mut self, src1: Register, src2: Register) {
        self.buffer.write_byte(0x85);
        self.write_modrm_reg(src2.code(), src1.code());
    }

    pub fn const_test(&mut self, src: Register, imm: i32) {
        self.buffer.write_byte(0xF7);
        self.write_modrm_reg(0, src.code());
        self.write_imm32(imm);
    }

    /** Bitwise AND of memory and a register, setting the flags only. */
    pub fn load_test(&mut self, src1: Address, src2: Register) {
        self.buffer.write_byte(0x85);
        self.write_modrm_mem(src2.code(), src1);
    }

    pub fn load_const_test(&mut self, src: Address, imm: i32) {
        self.buffer.write_byte(0xF7);
        self.write_modrm_mem(0, src);
        self.write_imm32(imm);
    }

    /** Compare the byte at absolute address `disp` with a constant. */
    pub fn abs_const_cmp_byte(&mut self, disp: i32, imm: i8) {
        self.buffer.write_byte(0x80);
        self.write_modrm_abs(BinaryOp::Cmp as u8, disp);
        self.write_imm8(imm);
    }

    /** `test eax, [eax]`: the half of the implicit suspend check that faults. */
    pub fn test_ra_indirect(&mut self) {
        self.buffer.write(0x0085, 2);
    }

    // Thread-block accesses.

    pub fn segment_load(&mut self, segment: Segment, dest: Register, disp: i32) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0x8B);
        self.write_modrm_abs(dest.code(), disp);
    }

    pub fn segment_store(&mut self, segment: Segment, disp: i32, src: Register) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0x89);
        self.write_modrm_abs(src.code(), disp);
    }

    pub fn segment_store_const(&mut self, segment: Segment, disp: i32, imm: i32) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0xC7);
        self.write_modrm_abs(0, disp);
        self.write_imm32(imm);
    }

    pub fn segment_const_op(&mut self, segment: Segment, op: BinaryOp, disp: i32, imm: i32) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0x81);
        self.write_modrm_abs(op as u8, disp);
        self.write_imm32(imm);
    }

    pub fn segment_const_test(&mut self, segment: Segment, disp: i32, imm: i32) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0xF7);
        self.write_modrm_abs(0, disp);
        self.write_imm32(imm);
    }

    pub fn segment_call(&mut self, segment: Segment, disp: i32) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0xFF);
        self.write_modrm_abs(2, disp);
    }

    /**
     * `lock cmpxchg segment:[disp], src`. Compares `EAX` with the memory; if
     * equal, stores `src`, otherwise loads the memory into `EAX`. Sets Z on
     * success.
     */
    pub fn segment_lock_cmpxchg(&mut self, segment: Segment, disp: i32, src: Register) {
        self.buffer.write_byte(segment as u8);
        self.buffer.write_byte(0xF0);
        self.write_opcode(0xB10F);
        self.write_modrm_abs(src.code(), disp);
    }

    // Floating point.

    /** Pop `ST0` to memory: `fstp dword` (4 bytes) or `fstp qword` (8 bytes). */
    pub fn x87_store(&mut self, size: usize, dest: Address) {
        self.buffer.write_byte(Self::x87_opcode(size));
        self.write_modrm_mem(3, dest);
    }

    /** Push memory onto the x87 stack: `fld dword` or `fld qword`. */
    pub fn x87_load(&mut self, size: usize, src: Address) {
        self.buffer.write_byte(Self::x87_opcode(size));
        self.write_modrm_mem(0, src);
    }

    fn x87_opcode(size: usize) -> u8 {
        match size {
            4 => 0xD9,
            8 => 0xDD,
            _ => panic!("Bad size {} for an x87 register", size),
        }
    }

    /** `movss` (4 bytes) or `movsd` (8 bytes) from memory. */
    pub fn load_float(&mut self, size: usize, dest: Xmm, src: Address) {
        self.buffer.write_byte(Self::float_prefix(size));
        self.write_opcode(0x100F);
        self.write_modrm_mem(dest.code(), src);
    }

    /** `movss` (4 bytes) or `movsd` (8 bytes) to memory. */
    pub fn store_float(&mut self, size: usize, dest: Address, src: Xmm) {
        self.buffer.write_byte(Self::float_prefix(size));
        self.write_opcode(0x110F);
        self.write_modrm_mem(src.code(), dest);
    }

    /** `movaps`. */
    pub fn move_float(&mut self, dest: Xmm, src: Xmm) {
        self.write_opcode(0x280F);
        self.write_modrm_reg(dest.code(), src.code());
    }

    fn float_prefix(size: usize) -> u8 {
        match size {
            4 => 0xF3,
            8 => 0xF2,
            _ => panic!("Bad size {} for an SSE register", size),
        }
    }

    // Control flow.

    pub fn jump_if(&mut self, cc: Condition, is_true: bool, target: Option<usize>) -> Patch {
        let patch = Patch::new(self.get_pos());
        self.buffer.write(cc.jump_if(is_true), 2);
        self.write_rel32(target);
        patch
    }

    pub fn const_jump(&mut self, target: Option<usize>) -> Patch {
        let patch = Patch::new(self.get_pos());
        self.buffer.write_byte(0xE9);
        self.write_rel32(target);
        patch
    }

    pub fn load_jump(&mut self, target: Address) {
        self.buffer.write_byte(0xFF);
        self.write_modrm_mem(4, target);
    }

    pub fn load_call(&mut self, target: Address) {
        self.buffer.write_byte(0xFF);
        self.write_modrm_mem(2, target);
    }

    /**
     * Change the target of the jump at `patch` from `old_target` to
     * `new_target`, both offsets from the beginning of the buffer.
     */
    pub fn patch(&mut self, patch: Patch, old_target: Option<usize>, new_target: Option<usize>) {
        let pos = patch.address();
        let at = if self.buffer.read_byte(pos) == 0x0F && (self.buffer.read_byte(pos + 1) & 0xF0) == 0x80 {
            pos + 2
        } else if self.buffer.read_byte(pos) == 0xE9 {
            pos + 1
        } else {
            panic!("not a jump instruction");
        };
        let old_disp = self.buffer.read(at, 4) as u32 as i32;
        assert_eq!(old_disp, optional_disp32(at + 4, old_target));
        let new_disp = optional_disp32(at + 4, new_target);
        self.buffer.overwrite(at, u64::from(new_disp as u32), 4);
    }

    pub fn ret(&mut self) {
        self.buffer.write_byte(0xC3);
    }

    pub fn int3(&mut self) {
        self.buffer.write_byte(0xCC);
    }

    pub fn push(&mut self, rd: Register) {
        self.buffer.write_byte(0x50 | rd.code());
    }

    pub fn pop(&mut self, rd: Register) {
        self.buffer.write_byte(0x58 | rd.code());
    }
}

//-----------------------------------------------------------------------------
