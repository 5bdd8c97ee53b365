use std::sync::{Arc};

use super::super::fault::{self, FaultHandler, FaultManager, ManagedCode};
use super::super::location::{Registers};
use super::super::macro_assembler::{MacroAssembler};
use super::super::runtime::{RuntimeConfig};

/**
 * An instruction set that can host call-boundary stubs and recognize the
 * faults that managed code raises deliberately.
 *
 * A `Target` names its own register universe (through [`Registers`]), the
 * [`MacroAssembler`] that emits its stubs, and the saved-register
 * [`Context`] of a thread that trapped while running its code. The
 * implementations are zero-sized; all behaviour is in the associated types.
 *
 * [`Context`]: fault::Context
 */
pub trait Target: Registers + Sized {
    type MacroAssembler: MacroAssembler<Registers=Self>;

    type Context: fault::Context;

    /** A short name for the instruction set, for logs. */
    const NAME: &'static str;

    /**
     * The distance below the stack pointer probed by
     * [`MacroAssembler::stack_overflow_check()`], unless the
     * [`RuntimeConfig`] overrides it.
     */
    const STACK_OVERFLOW_RESERVED_BYTES: usize;

    /**
     * Constructs one handler for each condition that this `Target`'s code
     * raises by faulting, in the order they must be tried.
     */
    fn fault_handlers(config: &RuntimeConfig) -> Vec<Box<dyn FaultHandler<Self::Context>>>;

    /** Constructs a [`MacroAssembler`] for this `Target`. */
    fn macro_assembler(config: &RuntimeConfig) -> Self::MacroAssembler {
        Self::MacroAssembler::new(config)
    }

    /**
     * Constructs a [`FaultManager`] with all of [`fault_handlers()`]
     * registered for generated code.
     *
     * [`fault_handlers()`]: Self::fault_handlers
     */
    fn fault_manager(config: &RuntimeConfig, managed: Arc<dyn ManagedCode>) -> FaultManager<Self::Context> {
        let mut manager = FaultManager::new(config, managed);
        for handler in Self::fault_handlers(config) {
            manager.add_handler(handler, true);
        }
        tracing::debug!(target: "crossing::signals", target_arch = Self::NAME, "fault_manager");
        manager
    }
}
