//! Fault handlers for the x86 family.
//!
//! IA-32 and x86_64 recognize the same three patterns. They differ in the
//! word size, the decoder mode, and the encoding of the load of the suspend
//! trigger, which [`Family`] describes.

use std::marker::{PhantomData};

use iced_x86::{Decoder, DecoderOptions};

use crate::fault::{self, Context as _, Condition, FaultHandler, ManagedCode, Redirect, StackWrite, Trap, TrapMemory, Verdict};
use crate::location::{ThreadOffset};
use crate::runtime::{RuntimeConfig};
use crate::target::{Target as Arch};
use super::{Register, Target};

/** The longest x86 instruction, in bytes. */
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/**
 * How far back from the faulting `test` to look for the load of the suspend
 * trigger. A compiler may hoist the load by a few instructions.
 */
pub const SUSPEND_SEARCH_DISTANCE: usize = 100;

/** `test eax, [eax]`: the faulting half of an implicit suspend check. */
pub const SUSPEND_TEST: [u8; 2] = [0x85, 0x00];

/** The differences between the members of the x86 family. */
pub trait Family: Arch {
    /** 32 or 64. */
    const BITNESS: u32;

    /** The encoding of the load of the suspend trigger into the accumulator. */
    fn trigger_load(trigger: ThreadOffset) -> Vec<u8>;
}

fn word<F: Family>() -> usize { F::BITNESS as usize / 8 }

/**
 * Returns the handlers for all synthetic conditions, in the order they must
 * be tried. A suspend check faults at address zero, so its handler must
 * precede the null-pointer handler.
 */
pub fn handlers<F: Family>(config: &RuntimeConfig) -> Vec<Box<dyn FaultHandler<F::Context>>> {
    vec![
        Box::new(SuspendHandler::<F>::new(config)),
        Box::new(StackOverflowHandler::<F>::new(config)),
        Box::new(NullPointerHandler::<F>::new(config)),
    ]
}

//-----------------------------------------------------------------------------

/**
 * Recognizes an access through a null pointer, and makes the thread call
 * the null-pointer entry point as if from the next instruction, with the
 * fault address as a stacked argument.
 */
pub struct NullPointerHandler<F> {
    page_size: usize,
    entry: usize,
    _family: PhantomData<fn() -> F>,
}

impl<F: Family> NullPointerHandler<F> {
    pub fn new(config: &RuntimeConfig) -> Self {
        NullPointerHandler {
            page_size: config.page_size,
            entry: config.entry_points.throw_null_pointer_exception,
            _family: PhantomData,
        }
    }

    /** The length of the instruction at `pc`, which must end by `end`. */
    fn instruction_length(pc: usize, end: usize, memory: &dyn TrapMemory) -> Option<usize> {
        let available = std::cmp::min(MAX_INSTRUCTION_LENGTH, end.checked_sub(pc)?);
        let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
        let bytes = &mut bytes[..available];
        if !memory.read(pc, bytes) { return None; }
        let instruction = Decoder::with_ip(F::BITNESS, bytes, pc as u64, DecoderOptions::NONE).decode();
        if instruction.is_invalid() || instruction.len() == 0 { return None; }
        Some(instruction.len())
    }
}

impl<F: Family> FaultHandler<F::Context> for NullPointerHandler<F> {
    fn name(&self) -> &'static str { "NullPointerHandler" }

    fn classify(&self, trap: &Trap<F::Context>, memory: &dyn TrapMemory, managed: &dyn ManagedCode) -> Verdict<F::Context> {
        if trap.fault_address >= self.page_size { return Verdict::Rejected; }
        let word = word::<F>();
        let sp = trap.context.sp();
        let pc = trap.context.pc();
        let method = match memory.read_word(sp, word) {
            Some(method) if managed.is_valid_method(method) => method,
            _ => return Verdict::Rejected,
        };
        let code = match managed.code_range(method, pc) {
            Some(code) => code,
            None => {
                tracing::trace!(target: "crossing::signals", "No method header");
                return Verdict::Rejected;
            },
        };
        let length = match Self::instruction_length(pc, code.end, memory) {
            Some(length) => length,
            None => {
                tracing::trace!(target: "crossing::signals", pc, "Cannot decode the faulting instruction");
                return Verdict::Rejected;
            },
        };
        let return_pc = pc + length;
        if !managed.is_valid_return_pc(sp, return_pc) { return Verdict::Rejected; }
        let mut context = trap.context.clone();
        context.set_sp(sp - 2 * word);
        context.set_pc(self.entry);
        let mut redirect = Redirect::new(Condition::NullPointer, context);
        redirect.stack_writes.push(StackWrite {address: sp - word, value: return_pc, size: word});
        redirect.stack_writes.push(StackWrite {address: sp - 2 * word, value: trap.fault_address, size: word});
        Verdict::Claimed(redirect)
    }
}

//-----------------------------------------------------------------------------

/**
 * Recognizes an implicit suspend check: a `test eax, [eax]` shortly after a
 * load of the suspend trigger. Makes the thread call the implicit-suspend
 * entry point as if from the next instruction.
 */
pub struct SuspendHandler<F> {
    trigger_load: Vec<u8>,
    entry: usize,
    _family: PhantomData<fn() -> F>,
}

impl<F: Family> SuspendHandler<F> {
    pub fn new(config: &RuntimeConfig) -> Self {
        SuspendHandler {
            trigger_load: F::trigger_load(config.thread.suspend_trigger),
            entry: config.entry_points.implicit_suspend,
            _family: PhantomData,
        }
    }

    /** Searches backwards from `pc` for the load of the suspend trigger. */
    fn find_trigger_load(&self, pc: usize, memory: &dyn TrapMemory) -> bool {
        let pattern = &self.trigger_load[..];
        let mut window = [0u8; 16];
        let window = &mut window[..pattern.len()];
        let limit = pc.saturating_sub(SUSPEND_SEARCH_DISTANCE);
        let Some(mut ptr) = pc.checked_sub(pattern.len()) else { return false };
        while ptr > limit {
            if memory.read(ptr, window) && window == pattern { return true; }
            ptr -= 1;
        }
        false
    }
}

impl<F: Family> FaultHandler<F::Context> for SuspendHandler<F> {
    fn name(&self) -> &'static str { "SuspendHandler" }

    fn classify(&self, trap: &Trap<F::Context>, memory: &dyn TrapMemory, _: &dyn ManagedCode) -> Verdict<F::Context> {
        let pc = trap.context.pc();
        let mut test = [0u8; 2];
        if !memory.read(pc, &mut test) || test != SUSPEND_TEST {
            return Verdict::Rejected;
        }
        if !self.find_trigger_load(pc, memory) {
            tracing::trace!(target: "crossing::signals", "Not a suspend check match, first instruction mismatch");
            return Verdict::Rejected;
        }
        let word = word::<F>();
        let sp = trap.context.sp() - word;
        let mut context = trap.context.clone();
        context.set_sp(sp);
        context.set_pc(self.entry);
        let mut redirect = Redirect::new(Condition::Suspend, context);
        redirect.stack_writes.push(StackWrite {address: sp, value: pc + SUSPEND_TEST.len(), size: word});
        redirect.remove_suspend_trigger = true;
        Verdict::Claimed(redirect)
    }
}

//-----------------------------------------------------------------------------

/**
 * Recognizes the stack probe at the start of a method. The probe precedes
 * the frame, so the thread can jump straight to the stack-overflow entry
 * point.
 */
pub struct StackOverflowHandler<F> {
    reserved: usize,
    entry: usize,
    _family: PhantomData<fn() -> F>,
}

impl<F: Family> StackOverflowHandler<F> {
    pub fn new(config: &RuntimeConfig) -> Self {
        StackOverflowHandler {
            reserved: config.reserved_bytes(F::STACK_OVERFLOW_RESERVED_BYTES),
            entry: config.entry_points.throw_stack_overflow_error,
            _family: PhantomData,
        }
    }
}

impl<F: Family> FaultHandler<F::Context> for StackOverflowHandler<F> {
    fn name(&self) -> &'static str { "StackOverflowHandler" }

    fn classify(&self, trap: &Trap<F::Context>, _: &dyn TrapMemory, _: &dyn ManagedCode) -> Verdict<F::Context> {
        if trap.fault_address != trap.context.sp().wrapping_sub(self.reserved) {
            return Verdict::Rejected;
        }
        let mut context = trap.context.clone();
        context.set_pc(self.entry);
        Verdict::Claimed(Redirect::new(Condition::StackOverflow, context))
    }
}

//-----------------------------------------------------------------------------

/** The IA-32 registers saved by the kernel when a thread traps. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /** Indexed by [`Register`]. */
    pub gregs: [u32; 8],
    pub eip: u32,
}

impl Context {
    pub fn new(eip: u32, esp: u32) -> Self {
        let mut gregs = [0; 8];
        gregs[Register::ESP as usize] = esp;
        Context {gregs, eip}
    }
}

impl fault::Context for Context {
    fn pc(&self) -> usize { self.eip as usize }

    fn sp(&self) -> usize { self.gregs[Register::ESP as usize] as usize }

    fn set_pc(&mut self, pc: usize) { self.eip = pc as u32; }

    fn set_sp(&mut self, sp: usize) { self.gregs[Register::ESP as usize] = sp as u32; }
}

impl Family for Target {
    const BITNESS: u32 = 32;

    /** `mov eax, fs:[trigger]`. */
    fn trigger_load(trigger: ThreadOffset) -> Vec<u8> {
        let mut bytes = vec![0x64, 0x8B, 0x05];
        bytes.extend_from_slice(&trigger.0.to_le_bytes());
        bytes
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{Ordering};

    use crate::buffer::{VecU8};
    use crate::fault::{FaultManager, SIGSEGV, SEGV_MAPERR};
    use crate::fault::tests::{FakeMemory, FakeManaged, config};
    use crate::macro_assembler::{MacroAssembler};
    use super::super::{Assembler, StubAssembler};
    use Register::*;

    const METHOD: usize = 0x5000;
    const CODE: usize = 0x1000;
    const SP: usize = 0x8000;

    fn trap(pc: usize, sp: usize, fault_address: usize) -> Trap<Context> {
        Trap {signal: SIGSEGV, code: SEGV_MAPERR, fault_address, context: Context::new(pc as u32, sp as u32)}
    }

    /** A method whose code loads through `ECX` at `CODE + 0x10`. */
    fn null_check() -> (FakeMemory, FakeManaged) {
        let mut a = Assembler::new(VecU8::new());
        a.load(EAX, (ECX, 8));
        let mut memory = FakeMemory::new();
        let mut code = vec![0x90; 0x10];
        code.extend_from_slice(&a.into_buffer().into_vec());
        code.extend_from_slice(&[0x90; 0x10]);
        memory.insert(CODE, &code);
        memory.insert_word(SP, METHOD, 4);
        (memory, FakeManaged::new(METHOD, CODE..CODE + code.len()))
    }

    #[test]
    fn null_pointer() {
        let (memory, managed) = null_check();
        let handler = NullPointerHandler::<Target>::new(&config());
        let verdict = handler.classify(&trap(CODE + 0x10, SP, 8), &memory, &managed);
        let Verdict::Claimed(redirect) = verdict else { panic!("Not claimed") };
        assert_eq!(redirect.condition, Condition::NullPointer);
        assert_eq!(redirect.context.eip, 0x7000_1000);
        assert_eq!(redirect.context.gregs[ESP as usize] as usize, SP - 8);
        let writes: Vec<StackWrite> = redirect.stack_writes.iter().copied().collect();
        // `mov eax, [ecx+8]` with a 32-bit displacement is 6 bytes long.
        assert_eq!(writes, vec![
            StackWrite {address: SP - 4, value: CODE + 0x16, size: 4},
            StackWrite {address: SP - 8, value: 8, size: 4},
        ]);
        assert!(!redirect.remove_suspend_trigger);
    }

    #[test]
    fn null_pointer_rejections() {
        let (mut memory, managed) = null_check();
        let handler = NullPointerHandler::<Target>::new(&config());
        // Not near null.
        assert!(!handler.classify(&trap(CODE + 0x10, SP, 0x1000), &memory, &managed).is_claimed());
        // Outside the method's code.
        assert!(!handler.classify(&trap(CODE - 0x10, SP, 8), &memory, &managed).is_claimed());
        // An instruction that runs past the end of the method.
        let truncated = FakeManaged::new(METHOD, CODE..CODE + 0x12);
        assert!(!handler.classify(&trap(CODE + 0x10, SP, 8), &memory, &truncated).is_claimed());
        // No method at `[sp]`.
        memory.insert_word(SP, 0x6000, 4);
        assert!(!handler.classify(&trap(CODE + 0x10, SP, 8), &memory, &managed).is_claimed());
    }

    /** A load through a wild pointer is not ours, even in managed code. */
    #[test]
    fn ordinary_fault() {
        let config = config();
        let (memory, managed) = null_check();
        let wild = trap(CODE + 0x10, SP, 0x1234_5678);
        for handler in handlers::<Target>(&config) {
            assert!(!handler.classify(&wild, &memory, &managed).is_claimed());
        }
        let mut manager = FaultManager::new(&config, std::sync::Arc::new(managed));
        for handler in handlers::<Target>(&config) {
            manager.add_handler(handler, true);
        }
        manager.add_generated_code_range(CODE, 0x26).unwrap();
        assert!(!manager.handle(&wild, &memory).is_claimed());
    }

    #[test]
    fn suspend() {
        let config = config();
        let mut m = StubAssembler::new(&config);
        m.implicit_suspend_check();
        let code = m.finalize().bytes;
        let test_pc = CODE + code.len() - 2;
        let mut memory = FakeMemory::new();
        memory.insert(CODE, &code);
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len());
        let handler = SuspendHandler::<Target>::new(&config);
        let Verdict::Claimed(redirect) = handler.classify(&trap(test_pc, SP, 0), &memory, &managed) else {
            panic!("Not claimed");
        };
        assert_eq!(redirect.condition, Condition::Suspend);
        assert_eq!(redirect.context.eip, 0x7000_3000);
        assert_eq!(redirect.context.gregs[ESP as usize] as usize, SP - 4);
        let writes: Vec<StackWrite> = redirect.stack_writes.iter().copied().collect();
        assert_eq!(writes, vec![StackWrite {address: SP - 4, value: test_pc + 2, size: 4}]);
        assert!(redirect.remove_suspend_trigger);
        assert_eq!(managed.removed_triggers.load(Ordering::Relaxed), 0);
        // The faulting instruction must be the `test`.
        assert!(!handler.classify(&trap(CODE, SP, 0), &memory, &managed).is_claimed());
    }

    #[test]
    fn suspend_with_hoisted_load() {
        let config = config();
        let trigger = SuspendHandler::<Target>::new(&config).trigger_load.clone();
        let mut code = trigger.clone();
        code.extend_from_slice(&[0x90; 40]);
        code.extend_from_slice(&SUSPEND_TEST);
        let mut memory = FakeMemory::new();
        memory.insert(CODE, &code);
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len());
        let handler = SuspendHandler::<Target>::new(&config);
        let test_pc = CODE + trigger.len() + 40;
        assert!(handler.classify(&trap(test_pc, SP, 0), &memory, &managed).is_claimed());
        // Too far away.
        let mut far = trigger;
        far.extend_from_slice(&[0x90; SUSPEND_SEARCH_DISTANCE]);
        far.extend_from_slice(&SUSPEND_TEST);
        let mut memory = FakeMemory::new();
        memory.insert(CODE, &far);
        let test_pc = CODE + far.len() - 2;
        assert!(!handler.classify(&trap(test_pc, SP, 0), &memory, &managed).is_claimed());
    }

    #[test]
    fn stack_overflow() {
        let config = config();
        let handler = StackOverflowHandler::<Target>::new(&config);
        let memory = FakeMemory::new();
        let managed = FakeManaged::new(METHOD, CODE..CODE + 0x100);
        let reserved = config.reserved_bytes(Target::STACK_OVERFLOW_RESERVED_BYTES);
        let Verdict::Claimed(redirect) = handler.classify(&trap(CODE, SP, SP - reserved), &memory, &managed) else {
            panic!("Not claimed");
        };
        assert_eq!(redirect.condition, Condition::StackOverflow);
        assert_eq!(redirect.context.eip, 0x7000_2000);
        assert_eq!(redirect.context.gregs[ESP as usize] as usize, SP);
        assert!(redirect.stack_writes.is_empty());
        assert!(!handler.classify(&trap(CODE, SP, SP - reserved - 4), &memory, &managed).is_claimed());
    }

    /**
     * An implicit suspend check is also a plausible null check. The order of
     * the handlers gives it to the suspend handler.
     */
    #[test]
    fn exclusive() {
        let config = config();
        let mut m = StubAssembler::new(&config);
        m.implicit_suspend_check();
        let code = m.finalize().bytes;
        let test_pc = CODE + code.len() - 2;
        let mut memory = FakeMemory::new();
        memory.insert(CODE, &code);
        memory.insert_word(SP, METHOD, 4);
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len());
        let claims = handlers::<Target>(&config).iter()
            .filter(|h| h.classify(&trap(test_pc, SP, 0), &memory, &managed).is_claimed())
            .count();
        // The `test eax, [eax]` is also a plausible null check.
        assert_eq!(claims, 2);
        let mut manager = FaultManager::new(&config, std::sync::Arc::new(managed));
        for handler in handlers::<Target>(&config) {
            manager.add_handler(handler, true);
        }
        manager.add_generated_code_range(CODE, code.len()).unwrap();
        assert_eq!(manager.handle(&trap(test_pc, SP, 0), &memory).condition(), Some(Condition::Suspend));
    }
}
