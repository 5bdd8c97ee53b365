use super::super::fault::{FaultHandler};
use super::super::location::{Registers, NoRegister};
use super::super::runtime::{RuntimeConfig};

mod enums;
pub use enums::{Register, ALL_REGISTERS, Xmm, Operand, Precision, BinaryOp, ALL_BINARY_OPS, Condition, ALL_CONDITIONS, Segment, Width};
use Register::*;

mod assembler;
pub use assembler::{Assembler, disp32, optional_disp32};

mod macro_assembler;
pub use macro_assembler::{StubAssembler, SCRATCH, FLOAT_SCRATCH, THREAD};

pub mod fault;
pub use fault::{Context};

/**
 * In the System V amd64 calling convention, these registers must be preserved
 * by subroutines, as must `RSP`.
 */
pub const CALLEE_SAVES: [Register; 6] = [RB, RBP, R12, R13, R14, R15];

/**
 * In the System V amd64 calling convention, these registers hold the integer-
 * or pointer-type function arguments.
 */
pub const ARGUMENTS: [Register; 6] = [RDI, RSI, RD, RC, R8, R9];

/** The distance below `RSP` that the stack-overflow probe reads. */
pub const STACK_OVERFLOW_RESERVED_BYTES: usize = 8 * 1024;

/** The x86_64/System V target. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Target;

impl Registers for Target {
    type Core = Register;
    type Float = Xmm;
    type WideFloat = NoRegister;
}

impl super::Target for Target {
    type MacroAssembler = StubAssembler;
    type Context = Context;

    const NAME: &'static str = "x86_64";
    const STACK_OVERFLOW_RESERVED_BYTES: usize = STACK_OVERFLOW_RESERVED_BYTES;

    fn fault_handlers(config: &RuntimeConfig) -> Vec<Box<dyn FaultHandler<Context>>> {
        super::x86::fault::handlers::<Self>(config)
    }
}
