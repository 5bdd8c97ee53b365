use super::super::super::cfi::{DwarfReg};

/**
 * The x86_64 general-purpose registers.
 *
 * All register names include a leading `R`, and omit a trailing `X`. This is
 * not intended to imply anything about the operand width, which is specified
 * in another way.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Register {
    RA = 0,
    RC = 1,
    RD = 2,
    RB = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

use Register::*;

pub const ALL_REGISTERS: [Register; 16] = [RA, RC, RD, RB, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15];

/** Returns a bit pattern which includes register number `n` in all useful positions. */
fn mask(n: usize) -> u64 {
    [
        0x0000000000,
        0x0909090900, // 1
        0x1212121200, // 2
        0x1B1B1B1B00,
        0x2424242400, // 4
        0x2D2D2D2D00,
        0x3636363600,
        0x3F3F3F3F00,
        0x0000000007, // 8
        0x0909090907,
        0x1212121207,
        0x1B1B1B1B07,
        0x2424242407,
        0x2D2D2D2D07,
        0x3636363607,
        0x3F3F3F3F07,
    ][n]
}

/** A register that can appear in the `reg` or `rm` field of a ModR/M byte. */
pub trait Operand: Copy {
    /** Returns a bit pattern which includes `self` in all useful positions. */
    fn mask(self) -> u64;
}

impl Operand for Register {
    fn mask(self) -> u64 { mask(self as usize) }
}

impl Register {
    pub fn dwarf(self) -> DwarfReg {
        DwarfReg([0, 2, 1, 3, 7, 6, 4, 5, 8, 9, 10, 11, 12, 13, 14, 15][self as usize])
    }
}

//-----------------------------------------------------------------------------

/** The SSE registers. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Xmm {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

impl Operand for Xmm {
    fn mask(self) -> u64 { mask(self as usize) }
}

impl Xmm {
    pub fn dwarf(self) -> DwarfReg { DwarfReg(17 + self as u16) }
}

//-----------------------------------------------------------------------------

/**
 * Represents the precision of an arithmetic operation.
 * With P32, the arithmetic is performed with 32-bit precision, and written
 * into the bottom 32 bits of the destination. The top 32 bits are 0.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Precision {
    P32 = 0,
    P64 = 1,
}

use Precision::*;

impl Precision {
    pub fn w_bit(self) -> u64 {
        (self as u64) << 3
    }

    /** The precision of a value of `size` bytes, which must be 4 or 8. */
    pub fn of_size(size: usize) -> Self {
        match size {
            4 => P32,
            8 => P64,
            _ => panic!("Bad size {} for a core register", size),
        }
    }
}

//-----------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

use BinaryOp::*;

pub const ALL_BINARY_OPS: [BinaryOp; 8] = [Add, Or, Adc, Sbb, And, Sub, Xor, Cmp];

impl BinaryOp {
    pub fn rm_imm(self, rm_is_reg: bool) -> u64 {
        0x808140 | (rm_is_reg as u64) << 22 | (self as u64) << 19
    }

    pub fn rm_reg(self, rm_is_reg: bool) -> u64 {
        0x800140 | (rm_is_reg as u64) << 22 | (self as u64) << 11
    }
}

//-----------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Condition {
    O  = 0x0,
    NO = 0x1,
    B  = 0x2,
    AE = 0x3,
    Z  = 0x4,
    NZ = 0x5,
    BE = 0x6,
    A  = 0x7,
    S  = 0x8,
    NS = 0x9,
    P  = 0xA,
    NP = 0xB,
    L  = 0xC,
    GE = 0xD,
    LE = 0xE,
    G  = 0xF,
}

use Condition::*;

pub const ALL_CONDITIONS: [Condition; 16] = [O, NO, B, AE, Z, NZ, BE, A, S, NS, P, NP, L, GE, LE, G];

impl Condition {
    pub fn jump_if(self, is_true: bool) -> u64 {
        0x800F | ((!is_true as u64) ^ (self as u64)) << 8
    }
}

//-----------------------------------------------------------------------------

/** A segment-override prefix, used to address the thread block. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Segment {
    FS = 0x64,
    GS = 0x65,
}

/** The width of a value that is sign- or zero-extended into a register. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Width {U8, S8, U16, S16}

impl Width {
    /** The width of a `size`-byte value, which must be 1 or 2. */
    pub fn of_size(size: usize, signed: bool) -> Self {
        match (size, signed) {
            (1, false) => Width::U8,
            (1, true) => Width::S8,
            (2, false) => Width::U16,
            (2, true) => Width::S16,
            _ => panic!("Cannot extend a {}-byte value", size),
        }
    }
}
