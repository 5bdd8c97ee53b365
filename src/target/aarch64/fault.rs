//! Fault handlers for AArch64.
//!
//! Every instruction is four bytes long, so the return address of a faulting
//! instruction is always `pc + 4`, and the suspend check can be recognized
//! from a single instruction word.

use crate::fault::{self, Context as _, Condition, FaultHandler, ManagedCode, Redirect, StackWrite, Trap, TrapMemory, Verdict};
use crate::runtime::{RuntimeConfig};
use super::{Register, STACK_OVERFLOW_RESERVED_BYTES};

/** `ldr x21, [x21]`: the implicit suspend check. */
pub const SUSPEND_CHECK: u32 = 0xF94002B5;

const INSTRUCTION_SIZE: usize = 4;

const WORD: usize = 8;

/**
 * Returns the handlers for all synthetic conditions, in the order they must
 * be tried. A suspend check faults at address zero, so its handler must
 * precede the null-pointer handler.
 */
pub fn handlers(config: &RuntimeConfig) -> Vec<Box<dyn FaultHandler<Context>>> {
    vec![
        Box::new(SuspendHandler::new(config)),
        Box::new(StackOverflowHandler::new(config)),
        Box::new(NullPointerHandler::new(config)),
    ]
}

//-----------------------------------------------------------------------------

/**
 * Recognizes an access through a null pointer. The return address is pushed
 * on the stack and the fault address is passed in `LR`.
 */
pub struct NullPointerHandler {
    page_size: usize,
    entry: usize,
}

impl NullPointerHandler {
    pub fn new(config: &RuntimeConfig) -> Self {
        NullPointerHandler {
            page_size: config.page_size,
            entry: config.entry_points.throw_null_pointer_exception,
        }
    }
}

impl FaultHandler<Context> for NullPointerHandler {
    fn name(&self) -> &'static str { "NullPointerHandler" }

    fn classify(&self, trap: &Trap<Context>, memory: &dyn TrapMemory, managed: &dyn ManagedCode) -> Verdict<Context> {
        if trap.fault_address >= self.page_size { return Verdict::Rejected; }
        let sp = trap.context.sp();
        let pc = trap.context.pc();
        match memory.read_word(sp, WORD) {
            Some(method) if managed.is_valid_method(method) => {
                match managed.code_range(method, pc) {
                    Some(code) if pc + INSTRUCTION_SIZE <= code.end => {},
                    _ => {
                        tracing::trace!(target: "crossing::signals", "No method header");
                        return Verdict::Rejected;
                    },
                }
            },
            _ => return Verdict::Rejected,
        }
        let return_pc = pc + INSTRUCTION_SIZE;
        if !managed.is_valid_return_pc(sp, return_pc) { return Verdict::Rejected; }
        let mut context = trap.context.clone();
        context.x[Register::RLR as usize] = trap.fault_address as u64;
        context.set_sp(sp - WORD);
        context.set_pc(self.entry);
        let mut redirect = Redirect::new(Condition::NullPointer, context);
        redirect.stack_writes.push(StackWrite {address: sp - WORD, value: return_pc, size: WORD});
        Verdict::Claimed(redirect)
    }
}

//-----------------------------------------------------------------------------

/**
 * Recognizes an implicit suspend check, and makes the thread call the
 * implicit-suspend entry point with `LR` pointing after the check.
 */
pub struct SuspendHandler {
    entry: usize,
}

impl SuspendHandler {
    pub fn new(config: &RuntimeConfig) -> Self {
        SuspendHandler {entry: config.entry_points.implicit_suspend}
    }
}

impl FaultHandler<Context> for SuspendHandler {
    fn name(&self) -> &'static str { "SuspendHandler" }

    fn classify(&self, trap: &Trap<Context>, memory: &dyn TrapMemory, _: &dyn ManagedCode) -> Verdict<Context> {
        let pc = trap.context.pc();
        if memory.read_u32(pc) != Some(SUSPEND_CHECK) {
            tracing::trace!(target: "crossing::signals", "Not a suspend check match");
            return Verdict::Rejected;
        }
        let mut context = trap.context.clone();
        context.x[Register::RLR as usize] = (pc + INSTRUCTION_SIZE) as u64;
        context.set_pc(self.entry);
        let mut redirect = Redirect::new(Condition::Suspend, context);
        redirect.remove_suspend_trigger = true;
        Verdict::Claimed(redirect)
    }
}

//-----------------------------------------------------------------------------

/**
 * Recognizes the stack probe at the start of a method. `LR` still holds the
 * caller's return address, so the thread can jump straight to the
 * stack-overflow entry point.
 */
pub struct StackOverflowHandler {
    reserved: usize,
    entry: usize,
}

impl StackOverflowHandler {
    pub fn new(config: &RuntimeConfig) -> Self {
        StackOverflowHandler {
            reserved: config.reserved_bytes(STACK_OVERFLOW_RESERVED_BYTES),
            entry: config.entry_points.throw_stack_overflow_error,
        }
    }
}

impl FaultHandler<Context> for StackOverflowHandler {
    fn name(&self) -> &'static str { "StackOverflowHandler" }

    fn classify(&self, trap: &Trap<Context>, _: &dyn TrapMemory, _: &dyn ManagedCode) -> Verdict<Context> {
        if trap.fault_address != trap.context.sp().wrapping_sub(self.reserved) {
            return Verdict::Rejected;
        }
        let mut context = trap.context.clone();
        context.set_pc(self.entry);
        Verdict::Claimed(Redirect::new(Condition::StackOverflow, context))
    }
}

//-----------------------------------------------------------------------------

/** The AArch64 registers saved by the kernel when a thread traps. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /** `x0` to `x30`, indexed by [`Register`]. */
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
}

impl Context {
    pub fn new(pc: u64, sp: u64) -> Self {
        Context {x: [0; 31], sp, pc}
    }
}

impl fault::Context for Context {
    fn pc(&self) -> usize { self.pc as usize }

    fn sp(&self) -> usize { self.sp as usize }

    fn set_pc(&mut self, pc: usize) { self.pc = pc as u64; }

    fn set_sp(&mut self, sp: usize) { self.sp = sp as u64; }
}

//-----------------------------------------------------------------------------
