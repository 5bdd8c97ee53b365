use crate::cfi::{DwarfReg};

/**
 * The IA-32 general-purpose registers.
 *
 * There are only eight, and all are 32 bits wide. Only the first four have
 * an addressable low byte.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Register {
    EAX = 0,
    ECX = 1,
    EDX = 2,
    EBX = 3,
    ESP = 4,
    EBP = 5,
    ESI = 6,
    EDI = 7,
}

use Register::*;

pub const ALL_REGISTERS: [Register; 8] = [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI];

impl Register {
    /** The value of the `reg` or `rm` field of a ModR/M byte naming `self`. */
    pub fn code(self) -> u8 { self as u8 }

    /** Tests whether the low byte of `self` can be named, e.g. `AL`. */
    pub fn has_byte_form(self) -> bool { (self as u8) < 4 }

    pub fn dwarf(self) -> DwarfReg { DwarfReg(self as u16) }
}

//-----------------------------------------------------------------------------

/** The SSE registers available in 32-bit mode. */
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
}

impl Xmm {
    pub fn code(self) -> u8 { self as u8 }
}

/**
 * The x87 register stack. Native code returns `float` and `double` in
 * `ST0`.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum X87 {
    ST0 = 0,
    ST1 = 1,
    ST2 = 2,
    ST3 = 3,
    ST4 = 4,
    ST5 = 5,
    ST6 = 6,
    ST7 = 7,
}
