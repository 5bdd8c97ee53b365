//! IA-32, with the System V i386 calling convention.
//!
//! The condition codes, ALU operations and segment prefixes are shared with
//! [`x86_64`](super::x86_64).

use super::super::fault::{FaultHandler};
use super::super::location::{Registers};
use super::super::runtime::{RuntimeConfig};

mod enums;
pub use enums::{Register, ALL_REGISTERS, Xmm, X87};
pub use super::x86_64::{BinaryOp, ALL_BINARY_OPS, Condition, ALL_CONDITIONS, Segment, Width};
use Register::*;

mod assembler;
pub use assembler::{Assembler, Address};

mod macro_assembler;
pub use macro_assembler::{StubAssembler, SCRATCH, THREAD};

pub mod fault;
pub use fault::{Context};

/** These registers must be preserved by subroutines, as must `ESP`. */
pub const CALLEE_SAVES: [Register; 3] = [EBX, ESI, EDI];

/** The distance below `ESP` that the stack-overflow probe reads. */
pub const STACK_OVERFLOW_RESERVED_BYTES: usize = 8 * 1024;

/** The IA-32 target. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Target;

impl Registers for Target {
    type Core = Register;
    type Float = Xmm;
    type WideFloat = X87;
}

impl super::Target for Target {
    type MacroAssembler = StubAssembler;
    type Context = Context;

    const NAME: &'static str = "x86";
    const STACK_OVERFLOW_RESERVED_BYTES: usize = STACK_OVERFLOW_RESERVED_BYTES;

    fn fault_handlers(config: &RuntimeConfig) -> Vec<Box<dyn FaultHandler<Context>>> {
        fault::handlers::<Self>(config)
    }
}
