//! AArch64, with the AAPCS64 calling convention.
//!
//! Four general-purpose registers have fixed roles in managed code: [`TR`]
//! holds the thread block, [`MR`] caches the GC-marking flag, and
//! [`SUSPEND`] holds the suspend trigger. [`IP0`] and [`IP1`] are scratch.

use super::super::fault::{FaultHandler};
use super::super::location::{Registers, NoRegister};
use super::super::runtime::{RuntimeConfig};

mod enums;
pub use enums::{Register, RSP, IP0, IP1, Fp, Width, Condition, ALL_CONDITIONS, AddOp, LogicOp};
use Register::*;

mod assembler;
pub use assembler::{Assembler, Address, logic_immediate};

mod macro_assembler;
pub use macro_assembler::{StubAssembler, FLOAT_SCRATCH};

pub mod fault;
pub use fault::{Context};

/** The thread register. */
pub const TR: Register = R19;

/** The marking register: nonzero while the GC is marking. */
pub const MR: Register = R20;

/** The register through which the implicit suspend check loads. */
pub const SUSPEND: Register = R21;

/**
 * In the AArch64 calling convention, these registers must be preserved by
 * subroutines, as must `RFP` and `RSP`.
 */
pub const CALLEE_SAVES: [Register; 10] = [R19, R20, R21, R22, R23, R24, R25, R26, R27, R28];

/**
 * In the AArch64 calling convention, these registers hold the integer-
 * or pointer-type function arguments.
 */
pub const ARGUMENTS: [Register; 8] = [R0, R1, R2, R3, R4, R5, R6, R7];

/** The distance below `SP` that the stack-overflow probe reads. */
pub const STACK_OVERFLOW_RESERVED_BYTES: usize = 8 * 1024;

/** The aarch64/AAPCS64 target. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Target;

impl Registers for Target {
    type Core = Register;
    type Float = Fp;
    type WideFloat = NoRegister;
}

impl super::Target for Target {
    type MacroAssembler = StubAssembler;
    type Context = Context;

    const NAME: &'static str = "aarch64";
    const STACK_OVERFLOW_RESERVED_BYTES: usize = STACK_OVERFLOW_RESERVED_BYTES;

    fn fault_handlers(config: &RuntimeConfig) -> Vec<Box<dyn FaultHandler<Context>>> {
        fault::handlers(config)
    }
}
