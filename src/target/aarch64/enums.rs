use crate::cfi::{DwarfReg};

/// The AArch64 general-purpose registers.
///
/// All register names include a leading `R`. This is not intended to imply
/// anything about the operand width, which is given by a [`Width`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Register {
    R0  = 0x00, R1  = 0x01, R2  = 0x02, R3  = 0x03, R4  = 0x04, R5  = 0x05, R6  = 0x06, R7  = 0x07,
    R8  = 0x08, R9  = 0x09, R10 = 0x0A, R11 = 0x0B, R12 = 0x0C, R13 = 0x0D, R14 = 0x0E, R15 = 0x0F,
    R16 = 0x10, R17 = 0x11, R18 = 0x12, R19 = 0x13, R20 = 0x14, R21 = 0x15, R22 = 0x16, R23 = 0x17,
    R24 = 0x18, R25 = 0x19, R26 = 0x1A, R27 = 0x1B, R28 = 0x1C, RFP = 0x1D, RLR = 0x1E, RZR = 0x1F,
}

/// The stack pointer register `RSP` shares an encoding with the zero register
/// `RZR`. Which one an instruction means depends on the instruction.
pub const RSP: Register = Register::RZR;

/// The first intra-procedure-call scratch register.
pub const IP0: Register = Register::R16;

/// The second intra-procedure-call scratch register.
pub const IP1: Register = Register::R17;

impl Register {
    /// The 5-bit encoding of the register.
    pub fn code(self) -> u32 { self as u32 }

    /// The DWARF register number. `RZR` is taken to mean `RSP`.
    pub fn dwarf(self) -> DwarfReg { DwarfReg(self as u16) }
}

//-----------------------------------------------------------------------------

/// The SIMD and floating-point registers. Only the low 64 bits are used,
/// i.e. the `D` or `S` view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Fp {
    V0  = 0x00, V1  = 0x01, V2  = 0x02, V3  = 0x03, V4  = 0x04, V5  = 0x05, V6  = 0x06, V7  = 0x07,
    V8  = 0x08, V9  = 0x09, V10 = 0x0A, V11 = 0x0B, V12 = 0x0C, V13 = 0x0D, V14 = 0x0E, V15 = 0x0F,
    V16 = 0x10, V17 = 0x11, V18 = 0x12, V19 = 0x13, V20 = 0x14, V21 = 0x15, V22 = 0x16, V23 = 0x17,
    V24 = 0x18, V25 = 0x19, V26 = 0x1A, V27 = 0x1B, V28 = 0x1C, V29 = 0x1D, V30 = 0x1E, V31 = 0x1F,
}

impl Fp {
    pub fn code(self) -> u32 { self as u32 }

    pub fn dwarf(self) -> DwarfReg { DwarfReg(64 + self as u16) }
}

//-----------------------------------------------------------------------------

/// The operand width of an instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Width {
    /// 32 bits: the `W` view of a core register, or the `S` view of an `Fp`.
    W = 0,
    /// 64 bits: the `X` view of a core register, or the `D` view of an `Fp`.
    X = 1,
}

impl Width {
    /// Returns the `Width` of a value of `size` bytes, which must be 4 or 8.
    pub fn of_size(size: usize) -> Self {
        match size {
            4 => Width::W,
            8 => Width::X,
            _ => panic!("Bad size {} for a register", size),
        }
    }

    /// The size in bytes.
    pub fn size(self) -> usize { 4 << (self as usize) }

    /// The `sf` bit of a data-processing instruction.
    pub fn sf(self) -> u32 { (self as u32) << 31 }
}

//-----------------------------------------------------------------------------

/// All AArch64 conditions except `AL` (and `NV`).
/// For `HS`, use `CS`. For `LO`, use `CC`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Condition {
    EQ = 0x0, NE = 0x1,
    CS = 0x2, CC = 0x3,
    MI = 0x4, PL = 0x5,
    VS = 0x6, VC = 0x7,
    HI = 0x8, LS = 0x9,
    GE = 0xA, LT = 0xB,
    GT = 0xC, LE = 0xD,
}

use Condition::*;

/// All `Condition`s.
pub const ALL_CONDITIONS: [Condition; 14] = [EQ, NE, CS, CC, MI, PL, VS, VC, HI, LS, GE, LT, GT, LE];

//-----------------------------------------------------------------------------

/// The addition operations that take a 12-bit immediate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum AddOp {
    /// Add.
    ADD = 0,
    /// Add and set flags.
    ADDS = 1,
    /// Subtract.
    SUB = 2,
    /// Subtract and set the condition flags.
    SUBS = 3,
}

//-----------------------------------------------------------------------------

/// The logic operations that take a bitmask immediate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum LogicOp {
    /// Bitwise AND.
    AND = 0,
    /// Bitwise OR.
    ORR = 1,
    /// Bitwise exclusive OR.
    EOR = 2,
    /// Bitwise AND setting the condition flags.
    ANDS = 3,
}

// ----------------------------------------------------------------------------
