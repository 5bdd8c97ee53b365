//! The x86_64 member of the x86 fault-handling family.

use crate::fault;
use crate::location::{ThreadOffset};
use super::super::x86::fault::{Family};
use super::{Register, Target};

/** The x86_64 registers saved by the kernel when a thread traps. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /** Indexed by [`Register`]. */
    pub gregs: [u64; 16],
    pub rip: u64,
}

impl Context {
    pub fn new(rip: u64, rsp: u64) -> Self {
        let mut gregs = [0; 16];
        gregs[Register::RSP as usize] = rsp;
        Context {gregs, rip}
    }
}

impl fault::Context for Context {
    fn pc(&self) -> usize { self.rip as usize }

    fn sp(&self) -> usize { self.gregs[Register::RSP as usize] as usize }

    fn set_pc(&mut self, pc: usize) { self.rip = pc as u64; }

    fn set_sp(&mut self, sp: usize) { self.gregs[Register::RSP as usize] = sp as u64; }
}

impl Family for Target {
    const BITNESS: u32 = 64;

    /** `mov rax, gs:[trigger]`, with an absolute 32-bit address. */
    fn trigger_load(trigger: ThreadOffset) -> Vec<u8> {
        let mut bytes = vec![0x65, 0x48, 0x8B, 0x04, 0x25];
        bytes.extend_from_slice(&trigger.0.to_le_bytes());
        bytes
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::buffer::{VecU8};
    use crate::fault::{Condition, FaultHandler, StackWrite, Trap, Verdict, SIGSEGV, SEGV_MAPERR};
    use crate::fault::tests::{FakeMemory, FakeManaged, config};
    use crate::macro_assembler::{MacroAssembler};
    use crate::target::x86::fault::{NullPointerHandler, SuspendHandler, handlers};
    use super::super::{Assembler, Precision, StubAssembler};
    use Register::*;

    const METHOD: usize = 0x5000;
    const CODE: usize = 0x1000;
    const SP: usize = 0x8000;

    fn trap(pc: usize, sp: usize, fault_address: usize) -> Trap<Context> {
        Trap {signal: SIGSEGV, code: SEGV_MAPERR, fault_address, context: Context::new(pc as u64, sp as u64)}
    }

    #[test]
    fn trigger_load_matches_assembler() {
        let config = config();
        let mut m = StubAssembler::new(&config);
        m.implicit_suspend_check();
        let code = m.finalize().bytes;
        let pattern = Target::trigger_load(config.thread.suspend_trigger);
        assert_eq!(&code[..pattern.len()], &pattern[..]);
    }

    #[test]
    fn null_pointer() {
        let mut a = Assembler::new(VecU8::new());
        a.load(Precision::P64, RA, (RC, 8));
        let load = a.into_buffer().into_vec();
        let mut code = vec![0x90; 0x10];
        code.extend_from_slice(&load);
        code.extend_from_slice(&[0x90; 0x10]);
        let mut memory = FakeMemory::new();
        memory.insert(CODE, &code);
        memory.insert_word(SP, METHOD, 8);
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len());
        let handler = NullPointerHandler::<Target>::new(&config());
        let Verdict::Claimed(redirect) = handler.classify(&trap(CODE + 0x10, SP, 8), &memory, &managed) else {
            panic!("Not claimed");
        };
        assert_eq!(redirect.condition, Condition::NullPointer);
        assert_eq!(redirect.context.rip, 0x7000_1000);
        assert_eq!(redirect.context.gregs[RSP as usize] as usize, SP - 16);
        let writes: Vec<StackWrite> = redirect.stack_writes.iter().copied().collect();
        assert_eq!(writes, vec![
            StackWrite {address: SP - 8, value: CODE + 0x10 + load.len(), size: 8},
            StackWrite {address: SP - 16, value: 8, size: 8},
        ]);
    }

    /** A load through a wild pointer is not ours, even in managed code. */
    #[test]
    fn ordinary_fault() {
        let config = config();
        let mut a = Assembler::new(VecU8::new());
        a.load(Precision::P64, RA, (RC, 8));
        let mut code = vec![0x90; 0x10];
        code.extend_from_slice(&a.into_buffer().into_vec());
        let mut memory = FakeMemory::new();
        memory.insert(CODE, &code);
        memory.insert_word(SP, METHOD, 8);
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len() + 0x10);
        let claims: Vec<bool> = handlers::<Target>(&config).iter()
            .map(|h| h.classify(&trap(CODE + 0x10, SP, 0x1234_5678), &memory, &managed).is_claimed())
            .collect();
        assert_eq!(claims, vec![false, false, false]);
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
        memory.insert_word(SP, METHOD, 8);
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len());
        let Verdict::Claimed(redirect) = SuspendHandler::<Target>::new(&config).classify(&trap(test_pc, SP, 0), &memory, &managed) else {
            panic!("Not claimed");
        };
        assert_eq!(redirect.context.rip, 0x7000_3000);
        assert_eq!(redirect.context.gregs[RSP as usize] as usize, SP - 8);
        let writes: Vec<StackWrite> = redirect.stack_writes.iter().copied().collect();
        assert_eq!(writes, vec![StackWrite {address: SP - 8, value: test_pc + 2, size: 8}]);
        assert!(redirect.remove_suspend_trigger);
        // The 32-bit pattern does not match 64-bit code.
        let x86 = SuspendHandler::<crate::target::x86::Target>::new(&config);
        let trap32 = Trap {
            signal: SIGSEGV,
            code: SEGV_MAPERR,
            fault_address: 0,
            context: crate::target::x86::Context::new(test_pc as u32, SP as u32),
        };
        assert!(!x86.classify(&trap32, &memory, &managed).is_claimed());
    }

    #[test]
    fn stack_overflow() {
        let config = config();
        let mut m = StubAssembler::new(&config);
        m.stack_overflow_check();
        let code = m.finalize().bytes;
        let memory = FakeMemory::new();
        let managed = FakeManaged::new(METHOD, CODE..CODE + code.len());
        let verdicts: Vec<bool> = handlers::<Target>(&config).iter()
            .map(|h| h.classify(&trap(CODE, SP, SP - 0x2000), &memory, &managed).is_claimed())
            .collect();
        assert_eq!(verdicts, vec![false, true, false]);
    }
}
