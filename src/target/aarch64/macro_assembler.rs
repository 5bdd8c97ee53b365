use indexmap::{IndexMap};

use crate::buffer::{VecU8};
use crate::cfi::{Cfi};
use crate::label::{Label, define};
use crate::location::{Location, ArgumentLocation, FrameOffset, ThreadOffset};
use crate::macro_assembler::{MacroAssembler, UnaryCondition, Code, check_scratch};
use crate::moves::{moves};
use crate::runtime::{RuntimeConfig, StateAndFlags, ThreadFlags, IndirectRefKind};
use super::{
    Target, Assembler, Address, Register, RSP, IP0, IP1, Fp, Width, Condition, AddOp, LogicOp,
    TR, MR, SUSPEND, STACK_OVERFLOW_RESERVED_BYTES,
};
use Register::*;
use Width::*;

type Loc = Location<Target>;
type Arg = ArgumentLocation<Target>;

/** The floating-point register used to break cycles of moves. */
pub const FLOAT_SCRATCH: Fp = Fp::V31;

/** The size of a stack slot and a pointer. */
const WORD: i32 = 8;

/** Registers that the stub assembler uses internally or that have fixed roles. */
const RESERVED: [Register; 5] = [IP0, IP1, TR, MR, SUSPEND];

fn thread(offset: ThreadOffset) -> Address { (TR, offset.0) }

/** The width of a core register move of `size` bytes. */
fn move_width(size: usize) -> Width {
    if size == 4 { W } else { X }
}

/** Assembles the code of call-boundary stubs for AArch64. */
pub struct StubAssembler {
    a: Assembler<VecU8>,
    cfi: Cfi,
    config: RuntimeConfig,
    /// The number of branches to [`Label`]s that are not yet bound.
    pending: usize,
}

impl StubAssembler {
    fn pc(&self) -> usize { self.a.get_pos() }

    fn adjust_sp(&mut self, delta: i32) {
        if delta > 0 {
            self.a.const_add(AddOp::SUB, X, RSP, RSP, delta as u32);
        } else {
            self.a.const_add(AddOp::ADD, X, RSP, RSP, (-delta) as u32);
        }
        let pc = self.pc();
        self.cfi.adjust_cfa_offset(pc, delta);
    }

    fn count(&mut self, label: &Label) {
        if !label.is_defined() { self.pending += 1; }
    }

    /** Assembles `b.cond label`. */
    fn jump_if(&mut self, cc: Condition, label: &mut Label) {
        self.count(label);
        let a = &mut self.a;
        label.branch(|target| a.jump_if(cc, target));
    }

    /** Assembles `cbz` or `cbnz`. */
    fn compare_and_jump(&mut self, width: Width, rt: Register, if_zero: bool, label: &mut Label) {
        self.count(label);
        let a = &mut self.a;
        label.branch(|target| a.compare_and_jump(width, rt, if_zero, target));
    }

    /** Assembles `tbz` or `tbnz`. */
    fn test_bit_and_jump(&mut self, rt: Register, bit: u32, if_zero: bool, label: &mut Label) {
        self.count(label);
        let a = &mut self.a;
        label.branch(|target| a.test_bit_and_jump(rt, bit, if_zero, target));
    }

    /** Loads `dest` of any kind from memory. */
    fn load_location(&mut self, dest: Loc, src: Address, size: usize) {
        match dest {
            Location::None => assert_eq!(size, 0),
            Location::Core(r) => self.a.load(Width::of_size(size), r, src),
            Location::Float(v) => self.a.load_fp(Width::of_size(size), v, src),
            _ => panic!("Cannot load {:?}", dest),
        }
    }

    /** Stores `src` of any kind to memory. */
    fn store_location(&mut self, dest: Address, src: Loc, size: usize) {
        match src {
            Location::None => assert_eq!(size, 0),
            Location::Core(r) => self.a.store(Width::of_size(size), dest, r),
            Location::Float(v) => self.a.store_fp(Width::of_size(size), dest, v),
            _ => panic!("Cannot store {:?}", src),
        }
    }

    /** Puts the address `sp + offset` into `dest`. */
    fn stack_address(&mut self, dest: Register, offset: FrameOffset) {
        let offset = u32::try_from(offset.0).unwrap_or_else(|_| panic!("Negative frame offset {}", offset.0));
        self.a.const_add(AddOp::ADD, X, dest, RSP, offset);
    }

    /** Separates `spills` into core and floating-point registers. */
    fn split_spills(spills: &[Loc]) -> (Vec<Register>, Vec<Fp>) {
        let mut cores = Vec::new();
        let mut fps = Vec::new();
        for &spill in spills {
            match spill {
                Location::Core(r) => cores.push(r),
                Location::Float(v) => fps.push(v),
                _ => panic!("Cannot spill {:?}", spill),
            }
        }
        (cores, fps)
    }

    /** Returns the register holding the address of the thread's state word. */
    fn state_address(&mut self) -> Register {
        let offset = self.config.thread.state_and_flags.0;
        if offset == 0 {
            TR
        } else {
            self.a.const_add(AddOp::ADD, X, IP1, TR, offset as u32);
            IP1
        }
    }
}

impl MacroAssembler for StubAssembler {
    type Registers = Target;

    const POINTER_SIZE: usize = 8;
    const STACK_ALIGNMENT: usize = 16;

    fn new(config: &RuntimeConfig) -> Self {
        StubAssembler {
            a: Assembler::new(VecU8::new()),
            cfi: Cfi::new(0, -WORD),
            config: *config,
            pending: 0,
        }
    }

    fn here(&self) -> usize { self.pc() }

    fn cfi(&self) -> &Cfi { &self.cfi }

    fn finalize(self) -> Code {
        assert_eq!(self.pending, 0, "A Label was used but never bound");
        Code {bytes: self.a.into_buffer().into_vec(), cfi: self.cfi.into_opcodes()}
    }

    fn bind(&mut self, label: &mut Label) {
        let here = self.pc();
        for patch in define(label, here) {
            self.a.patch(patch, None, Some(here));
            self.pending -= 1;
        }
    }

    fn jump(&mut self, label: &mut Label) {
        self.count(label);
        let a = &mut self.a;
        label.branch(|target| a.const_jump(target));
    }

    fn build_frame(&mut self, frame_size: usize, method_reg: Option<Register>, spills: &[Loc]) {
        assert_eq!(frame_size % Self::STACK_ALIGNMENT, 0, "Misaligned frame size {}", frame_size);
        tracing::trace!(target: "crossing::asm", frame_size, spills = spills.len(), "build_frame");
        let (cores, fps) = Self::split_spills(spills);
        let core_offset = frame_size as i32 - cores.len() as i32 * WORD;
        let fp_offset = core_offset - fps.len() as i32 * WORD;
        assert!(fp_offset >= 0, "Frame size {} is too small", frame_size);
        if method_reg.is_some() {
            assert!(fp_offset >= WORD, "No room for the method in a frame of size {}", frame_size);
        }
        if frame_size != 0 {
            self.adjust_sp(frame_size as i32);
        }
        let mut offset = core_offset;
        for pair in cores.chunks(2) {
            match pair {
                &[r1, r2] => self.a.store_pair((RSP, offset), r1, r2),
                &[r] => self.a.store(X, (RSP, offset), r),
                _ => unreachable!(),
            }
            let pc = self.pc();
            for &r in pair {
                self.cfi.rel_offset(pc, r.dwarf(), offset);
                offset += WORD;
            }
        }
        let mut offset = fp_offset;
        for pair in fps.chunks(2) {
            match pair {
                &[v1, v2] => self.a.store_fp_pair((RSP, offset), v1, v2),
                &[v] => self.a.store_fp(X, (RSP, offset), v),
                _ => unreachable!(),
            }
            let pc = self.pc();
            for &v in pair {
                self.cfi.rel_offset(pc, v.dwarf(), offset);
                offset += WORD;
            }
        }
        if let Some(method_reg) = method_reg {
            self.a.store(X, (RSP, 0), method_reg);
        }
        assert_eq!(self.cfi.current_cfa_offset(), frame_size as i32);
    }

    fn remove_frame(&mut self, frame_size: usize, spills: &[Loc], may_suspend: bool) {
        assert_eq!(frame_size % Self::STACK_ALIGNMENT, 0, "Misaligned frame size {}", frame_size);
        let (cores, fps) = Self::split_spills(spills);
        let pc = self.pc();
        self.cfi.remember_state(pc);
        let mut offset = frame_size as i32 - cores.len() as i32 * WORD;
        for pair in cores.chunks(2) {
            match pair {
                &[r1, r2] => self.a.load_pair(r1, r2, (RSP, offset)),
                &[r] => self.a.load(X, r, (RSP, offset)),
                _ => unreachable!(),
            }
            let pc = self.pc();
            for &r in pair {
                self.cfi.restore(pc, r.dwarf());
            }
            offset += pair.len() as i32 * WORD;
        }
        let mut offset = frame_size as i32 - (cores.len() + fps.len()) as i32 * WORD;
        for pair in fps.chunks(2) {
            match pair {
                &[v1, v2] => self.a.load_fp_pair(v1, v2, (RSP, offset)),
                &[v] => self.a.load_fp(X, v, (RSP, offset)),
                _ => unreachable!(),
            }
            let pc = self.pc();
            for &v in pair {
                self.cfi.restore(pc, v.dwarf());
            }
            offset += pair.len() as i32 * WORD;
        }
        if may_suspend {
            // The GC may have started or stopped marking while we were away.
            self.a.load(W, MR, thread(self.config.thread.is_gc_marking));
        }
        if frame_size != 0 {
            self.adjust_sp(-(frame_size as i32));
        }
        assert_eq!(self.cfi.current_cfa_offset(), 0);
        self.a.ret();
        let pc = self.pc();
        self.cfi.restore_state(pc);
        self.cfi.def_cfa_offset(pc, frame_size as i32);
    }

    fn increase_frame_size(&mut self, adjust: usize) {
        if adjust != 0 {
            assert_eq!(adjust % Self::STACK_ALIGNMENT, 0);
            self.adjust_sp(adjust as i32);
        }
    }

    fn decrease_frame_size(&mut self, adjust: usize) {
        if adjust != 0 {
            assert_eq!(adjust % Self::STACK_ALIGNMENT, 0);
            self.adjust_sp(-(adjust as i32));
        }
    }

    fn store(&mut self, dest: FrameOffset, src: Loc, size: usize) {
        self.store_location((RSP, dest.0), src, size);
    }

    fn store_raw_ptr(&mut self, dest: FrameOffset, src: Register) {
        self.a.store(X, (RSP, dest.0), src);
    }

    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset, tag_sp: bool) {
        self.a.move_sp(IP0, RSP);
        if tag_sp {
            self.a.const_logic(LogicOp::ORR, X, IP0, IP0, 2);
        }
        self.a.store(X, thread(offset), IP0);
    }

    fn load(&mut self, dest: Loc, src: FrameOffset, size: usize) {
        self.load_location(dest, (RSP, src.0), size);
    }

    fn load_from(&mut self, dest: Loc, base: Register, offset: i32, size: usize) {
        self.load_location(dest, (base, offset), size);
    }

    fn load_raw_ptr_from_thread(&mut self, dest: Register, offset: ThreadOffset) {
        self.a.load(X, dest, thread(offset));
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        let width = Width::of_size(size);
        self.a.load(width, IP0, (RSP, src.0));
        self.a.store(width, (RSP, dest.0), IP0);
    }

    fn move_(&mut self, dest: Loc, src: Loc, size: usize) {
        if dest == src { return; }
        match (dest, src) {
            (Location::Core(d), Location::Core(s)) => self.a.move_(move_width(size), d, s),
            (Location::Float(d), Location::Float(s)) => self.a.fmove(Width::of_size(size), d, s),
            (Location::Stack(d), Location::Stack(s)) => self.copy(d, s, size),
            (Location::Stack(d), _) => self.store(d, src, size),
            (_, Location::Stack(s)) => self.load(dest, s, size),
            _ => panic!("Cannot move {:?} to {:?}", src, dest),
        }
    }

    fn move_immediate(&mut self, dest: Register, value: usize) {
        self.a.const_(X, dest, value as u64);
    }

    fn sign_extend(&mut self, reg: Register, size: usize) {
        self.a.extend(true, size, reg, reg);
    }

    fn zero_extend(&mut self, reg: Register, size: usize) {
        self.a.extend(false, size, reg, reg);
    }

    fn get_current_thread(&mut self, dest: Loc) {
        match dest {
            Location::Core(r) => self.a.move_(X, r, TR),
            Location::Stack(offset) => self.a.store(X, (RSP, offset.0), TR),
            _ => panic!("Cannot put the thread in {:?}", dest),
        }
    }

    fn move_arguments(&mut self, dests: &[Arg], srcs: &[Arg], refs: &[Option<FrameOffset>]) {
        assert_eq!(dests.len(), srcs.len());
        assert_eq!(dests.len(), refs.len());
        let mut core_moves: IndexMap<Register, Register> = IndexMap::new();
        let mut float_moves: IndexMap<Fp, Fp> = IndexMap::new();
        // Convert references held in registers, and store all stack
        // arguments, before any register is overwritten.
        for (i, ((dest, src), &r)) in dests.iter().zip(srcs).zip(refs).enumerate() {
            assert_eq!(src.size, dest.size, "Argument {} changes size", i);
            if r.is_some() {
                assert_eq!(src.size, Self::POINTER_SIZE, "Reference argument {} is not pointer-sized", i);
            }
            for location in [dest.location, src.location] {
                assert!(
                    !location.uses_core(IP0) && !location.uses_core(IP1) && location != Location::Float(FLOAT_SCRATCH),
                    "Argument {} uses a scratch register", i,
                );
            }
            let null_allowed = i != 0;
            match (dest.location, src.location) {
                (Location::Stack(_), Location::Stack(_)) => {
                    if let Some(spilled) = r {
                        self.create_jobject(dest.location, spilled, null_allowed);
                    } else {
                        self.move_(dest.location, src.location, src.size);
                    }
                },
                (Location::Stack(d), _) => {
                    if let Some(spilled) = r {
                        self.create_jobject(src.location, spilled, null_allowed);
                    }
                    self.store(d, src.location, src.size);
                },
                (_, Location::Stack(_)) => {},
                (Location::Core(d), Location::Core(s)) => {
                    if let Some(spilled) = r {
                        self.create_jobject(src.location, spilled, null_allowed);
                    }
                    if d != s { core_moves.insert(d, s); }
                },
                (Location::Float(d), Location::Float(s)) => {
                    assert!(r.is_none(), "Reference argument {} is in a float register", i);
                    if d != s { float_moves.insert(d, s); }
                },
                _ => panic!("Cannot pass {:?} in {:?}", src.location, dest.location),
            }
        }
        for (d, s) in moves(core_moves, &IP0) {
            self.a.move_(X, d, s);
        }
        for (d, s) in moves(float_moves, &FLOAT_SCRATCH) {
            self.a.fmove(X, d, s);
        }
        // Fill the remaining registers from the stack.
        for (i, ((dest, src), &r)) in dests.iter().zip(srcs).zip(refs).enumerate() {
            if let (true, Location::Stack(s)) = (dest.is_register(), src.location) {
                if let Some(spilled) = r {
                    self.create_jobject(dest.location, spilled, i != 0);
                } else {
                    self.load(dest.location, s, src.size);
                }
            }
        }
    }

    fn create_jobject(&mut self, dest: Loc, spilled: FrameOffset, null_allowed: bool) {
        let reg = match dest {
            Location::Core(r) => r,
            Location::Stack(_) => IP0,
            _ => panic!("Cannot put a handle in {:?}", dest),
        };
        if null_allowed {
            let mut null = Label::new();
            self.a.load(W, reg, (RSP, spilled.0));
            self.compare_and_jump(W, reg, true, &mut null);
            self.stack_address(reg, spilled);
            self.bind(&mut null);
        } else {
            self.stack_address(reg, spilled);
        }
        if let Location::Stack(offset) = dest {
            self.a.store(X, (RSP, offset.0), reg);
        }
    }

    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: Register,
        slow_path: &mut Label,
        resume: &mut Label,
    ) {
        let global = IndirectRefKind::GLOBAL_OR_WEAK_GLOBAL_MASK.trailing_zeros();
        self.test_bit_and_jump(reg, global, false, slow_path);
        self.a.const_logic(LogicOp::AND, X, reg, reg, !u64::from(IndirectRefKind::MASK));
        self.compare_and_jump(X, reg, true, resume);
        self.a.load(W, reg, (reg, 0));
    }

    fn jump_indirect(&mut self, base: Register, offset: i32) {
        self.a.load(X, IP0, (base, offset));
        self.a.jump(IP0);
    }

    fn call(&mut self, base: Register, offset: i32) {
        self.a.load(X, IP0, (base, offset));
        self.a.call(IP0);
    }

    fn call_from_thread(&mut self, offset: ThreadOffset) {
        self.call(TR, offset.0);
    }

    fn try_to_transition_from_runnable_to_native(&mut self, slow_path: &mut Label, scratch: &[Register]) {
        check_scratch(scratch, &RESERVED);
        assert!(!scratch.is_empty(), "AArch64 needs a scratch register to leave Runnable");
        let native = scratch[0];
        let thread_offsets = self.config.thread;
        let address = self.state_address();
        let mut retry = Label::new();
        self.bind(&mut retry);
        self.a.load_acquire_exclusive(W, IP0, address);
        self.a.const_(W, native, u64::from(StateAndFlags::NATIVE.raw()));
        // Runnable with no flags is zero.
        self.compare_and_jump(W, IP0, false, slow_path);
        self.a.store_release_exclusive(W, IP0, native, address);
        self.compare_and_jump(W, IP0, false, &mut retry);
        self.a.store(X, thread(thread_offsets.held_mutator_lock), RZR);
    }

    fn try_to_transition_from_native_to_runnable(
        &mut self,
        slow_path: &mut Label,
        scratch: &[Register],
        return_reg: Loc,
    ) {
        check_scratch(scratch, &RESERVED);
        for &r in scratch {
            assert!(!return_reg.uses_core(r), "Scratch register {:?} holds the return value", r);
        }
        assert!(!scratch.is_empty(), "AArch64 needs a scratch register to leave Native");
        let native = scratch[0];
        let thread_offsets = self.config.thread;
        let address = self.state_address();
        let mut retry = Label::new();
        self.bind(&mut retry);
        self.a.load_acquire_exclusive(W, IP0, address);
        self.a.const_(W, native, u64::from(StateAndFlags::NATIVE.raw()));
        self.a.cmp(W, IP0, native);
        self.jump_if(Condition::NE, slow_path);
        self.a.store_release_exclusive(W, IP0, RZR, address);
        self.compare_and_jump(W, IP0, false, &mut retry);
        self.a.load(X, native, thread(thread_offsets.mutator_lock));
        self.a.store(X, thread(thread_offsets.held_mutator_lock), native);
    }

    fn suspend_check(&mut self, label: &mut Label) {
        let flags = ThreadFlags::SUSPEND_OR_CHECKPOINT_REQUEST.bits();
        self.a.load(W, IP0, thread(self.config.thread.state_and_flags));
        self.a.const_test(W, IP0, u64::from(flags));
        self.jump_if(Condition::NE, label);
    }

    fn exception_poll(&mut self, label: &mut Label) {
        self.a.load(X, IP0, thread(self.config.thread.exception));
        self.compare_and_jump(X, IP0, false, label);
    }

    fn deliver_pending_exception(&mut self) {
        let thread_offsets = self.config.thread;
        self.a.load(X, R0, thread(thread_offsets.exception));
        self.call_from_thread(thread_offsets.deliver_exception);
        self.a.brk(0);
    }

    fn test_gc_marking(&mut self, label: &mut Label, cond: UnaryCondition) {
        self.compare_and_jump(W, MR, cond == UnaryCondition::Zero, label);
    }

    fn test_mark_bit(&mut self, reference: Register, label: &mut Label, cond: UnaryCondition) {
        let objects = self.config.objects;
        self.a.load(W, IP0, (reference, objects.monitor_offset));
        self.test_bit_and_jump(IP0, objects.mark_bit_shift, cond == UnaryCondition::Zero, label);
    }

    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: &mut Label) {
        self.a.const_(X, IP0, address as u64);
        self.a.load_byte(IP0, (IP0, 0));
        self.compare_and_jump(W, IP0, false, label);
    }

    fn implicit_suspend_check(&mut self) {
        self.a.load(X, SUSPEND, (SUSPEND, 0));
    }

    fn stack_overflow_check(&mut self) {
        let reserved = self.config.reserved_bytes(STACK_OVERFLOW_RESERVED_BYTES);
        self.a.const_add(AddOp::SUB, X, IP0, RSP, reserved as u32);
        self.a.load(W, RZR, (IP0, 0));
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;
    use super::super::assembler::tests::{disassemble, words};
    use crate::fault::tests::{config};
    use Fp::*;

    fn new_masm() -> StubAssembler {
        StubAssembler::new(&config())
    }

    fn core(r: Register) -> Arg { Arg::core(r, 8) }

    #[test]
    fn frame() {
        let mut m = new_masm();
        let spills = [Loc::Core(R19), Loc::Core(R20), Loc::Core(R21), Loc::Float(V8)];
        m.build_frame(64, Some(R0), &spills);
        assert_eq!(m.cfi().current_cfa_offset(), 64);
        m.remove_frame(64, &spills, true);
        assert_eq!(m.cfi().current_cfa_offset(), 64);
        let code = m.finalize();
        disassemble(&code.bytes, vec![
            "sub sp, sp, #0x40",
            "stp x19, x20, [sp, #0x28]",
            "str x21, [sp, #0x38]",
            "str d8, [sp, #0x20]",
            "str x0, [sp]",
            "ldp x19, x20, [sp, #0x28]",
            "ldr x21, [sp, #0x38]",
            "ldr d8, [sp, #0x20]",
            "ldr w20, [x19, #0x10]",
            "add sp, sp, #0x40",
            "ret",
        ]).unwrap();
        assert_eq!(code.cfi, vec![
            0x44, 0x0E, 64, // sub sp, sp, #0x40
            0x44, 0x93, 3, 0x94, 2, // stp x19, x20
            0x44, 0x95, 1, // str x21
            0x44, 0x11, 72, 4, // str d8
            0x44, 0x0A, // str x0, [sp]; remember_state
            0x44, 0xD3, 0xD4, // ldp x19, x20
            0x44, 0xD5, // ldr x21
            0x44, 0x06, 72, // ldr d8
            0x48, 0x0E, 0, // ldr w20; add sp, sp, #0x40
            0x44, 0x0B, // ret; restore_state
        ]);
    }

    #[test]
    fn small_frame() {
        let mut m = new_masm();
        m.build_frame(16, None, &[]);
        m.increase_frame_size(0);
        m.increase_frame_size(32);
        m.decrease_frame_size(32);
        m.remove_frame(16, &[], false);
        disassemble(&m.finalize().bytes, vec![
            "sub sp, sp, #0x10",
            "sub sp, sp, #0x20",
            "add sp, sp, #0x20",
            "add sp, sp, #0x10",
            "ret",
        ]).unwrap();
    }

    #[test]
    #[should_panic(expected = "Misaligned")]
    fn misaligned_frame() {
        new_masm().build_frame(24, None, &[]);
    }

    #[test]
    #[should_panic(expected = "No room for the method")]
    fn no_room_for_method() {
        new_masm().build_frame(16, Some(R0), &[Loc::Core(R19), Loc::Core(R20)]);
    }

    #[test]
    #[should_panic(expected = "never bound")]
    fn unbound_label() {
        let mut m = new_masm();
        let mut label = Label::new();
        m.jump(&mut label);
        m.finalize();
    }

    #[test]
    fn loads_and_stores() {
        let mut m = new_masm();
        m.store(FrameOffset(8), Loc::Float(V2), 4);
        m.store_raw_ptr(FrameOffset(32), R5);
        m.load(Loc::Core(R3), FrameOffset(12), 4);
        m.load_from(Loc::Core(R6), R7, 16, 8);
        m.copy(FrameOffset(16), FrameOffset(24), 8);
        m.move_(Loc::Core(R1), Loc::Core(R1), 8);
        m.move_(Loc::Core(R1), Loc::Core(R2), 4);
        m.move_(Loc::Float(V0), Loc::Float(V1), 8);
        m.move_immediate(R4, 0x1234);
        m.sign_extend(R0, 1);
        m.zero_extend(R1, 2);
        disassemble(&m.finalize().bytes, vec![
            "str s2, [sp, #0x8]",
            "str x5, [sp, #0x20]",
            "ldr w3, [sp, #0xc]",
            "ldr x6, [x7, #0x10]",
            "ldr x16, [sp, #0x18]",
            "str x16, [sp, #0x10]",
            "mov w1, w2",
            "fmov d0, d1",
            "mov x4, #0x1234",
            "sxtb w0, w0",
            "uxth w1, w1",
        ]).unwrap();
    }

    #[test]
    fn thread_accesses() {
        let mut m = new_masm();
        let offsets = config().thread;
        m.store_stack_pointer_to_thread(offsets.top_quick_frame, true);
        m.store_stack_pointer_to_thread(offsets.top_quick_frame, false);
        m.get_current_thread(Loc::Core(R1));
        m.get_current_thread(Loc::Stack(FrameOffset(8)));
        m.load_raw_ptr_from_thread(R2, offsets.self_);
        disassemble(&m.finalize().bytes, vec![
            "mov x16, sp",
            "orr x16, x16, #0x2",
            "str x16, [x19, #0x28]",
            "mov x16, sp",
            "str x16, [x19, #0x28]",
            "mov x1, x19",
            "str x19, [sp, #0x8]",
            "ldr x2, [x19, #0x30]",
        ]).unwrap();
    }

    #[test]
    fn calls() {
        let mut m = new_masm();
        m.call(R1, 0x18);
        m.jump_indirect(R0, 0x20);
        m.call_from_thread(config().thread.deliver_exception);
        disassemble(&m.finalize().bytes, vec![
            "ldr x16, [x1, #0x18]",
            "blr x16",
            "ldr x16, [x0, #0x20]",
            "br x16",
            "ldr x16, [x19, #0x40]",
            "blr x16",
        ]).unwrap();
    }

    #[test]
    fn create_jobject() {
        let mut m = new_masm();
        m.create_jobject(Loc::Core(R1), FrameOffset(8), false);
        m.create_jobject(Loc::Core(R2), FrameOffset(16), true);
        m.create_jobject(Loc::Stack(FrameOffset(24)), FrameOffset(16), true);
        disassemble(&m.finalize().bytes, vec![
            "add x1, sp, #0x8",
            "ldr w2, [sp, #0x10]",
            "cbz w2, 0x10",
            "add x2, sp, #0x10",
            "ldr w16, [sp, #0x10]",
            "cbz w16, 0x1c",
            "add x16, sp, #0x10",
            "str x16, [sp, #0x18]",
        ]).unwrap();
    }

    #[test]
    fn decode_reference() {
        let mut m = new_masm();
        let mut slow = Label::new();
        let mut resume = Label::new();
        m.decode_jni_transition_or_local_jobject(R1, &mut slow, &mut resume);
        m.bind(&mut slow);
        m.bind(&mut resume);
        disassemble(&m.finalize().bytes, vec![
            "tbnz w1, #0x1, 0x10",
            "and x1, x1, #0xfffffffffffffffc",
            "cbz x1, 0x10",
            "ldr w1, [x1]",
        ]).unwrap();
    }

    #[test]
    fn move_arguments() {
        let mut m = new_masm();
        m.move_arguments(
            &[core(R0), core(R1), Arg::stack(0, 8), Arg::stack(8, 8), core(R2), Arg::float(V0, 8)],
            &[core(R1), core(R0), core(R3), Arg::stack(40, 8), Arg::stack(48, 8), Arg::float(V0, 8)],
            &[None, None, Some(FrameOffset(32)), None, Some(FrameOffset(48)), None],
        );
        disassemble(&m.finalize().bytes, vec![
            "ldr w3, [sp, #0x20]",
            "cbz w3, 0xc",
            "add x3, sp, #0x20",
            "str x3, [sp]",
            "ldr x16, [sp, #0x28]",
            "str x16, [sp, #0x8]",
            "mov x16, x0",
            "mov x0, x1",
            "mov x1, x16",
            "ldr w2, [sp, #0x30]",
            "cbz w2, 0x30",
            "add x2, sp, #0x30",
        ]).unwrap();
    }

    #[test]
    fn float_arguments() {
        let mut m = new_masm();
        m.move_arguments(
            &[Arg::float(V0, 8), Arg::float(V1, 8), Arg::float(V2, 4)],
            &[Arg::float(V1, 8), Arg::float(V0, 8), Arg::stack(16, 4)],
            &[None, None, None],
        );
        disassemble(&m.finalize().bytes, vec![
            "fmov d31, d0",
            "fmov d0, d1",
            "fmov d1, d31",
            "ldr s2, [sp, #0x10]",
        ]).unwrap();
    }

    #[test]
    #[should_panic(expected = "scratch register")]
    fn argument_in_scratch() {
        new_masm().move_arguments(&[core(R0)], &[core(IP1)], &[None]);
    }

    #[test]
    #[should_panic(expected = "is reserved")]
    fn transition_scratch_is_checked() {
        let mut slow = Label::new();
        new_masm().try_to_transition_from_runnable_to_native(&mut slow, &[TR]);
    }

    #[test]
    #[should_panic(expected = "holds the return value")]
    fn transition_scratch_overlaps_return() {
        let mut slow = Label::new();
        new_masm().try_to_transition_from_native_to_runnable(&mut slow, &[R0], Loc::Core(R0));
    }

    #[test]
    fn transitions() {
        let mut m = new_masm();
        let mut slow = Label::new();
        m.try_to_transition_from_runnable_to_native(&mut slow, &[R1]);
        m.try_to_transition_from_native_to_runnable(&mut slow, &[R1], Loc::Core(R0));
        m.bind(&mut slow);
        disassemble(&m.finalize().bytes, vec![
            "ldaxr w16, [x19]",
            "mov w1, #0x1000000",
            "cbnz w16, 0x38",
            "stlxr w16, w1, [x19]",
            "cbnz w16, 0x0",
            "str xzr, [x19, #0x18]",
            "ldaxr w16, [x19]",
            "mov w1, #0x1000000",
            "cmp w16, w1",
            "b.ne 0x38",
            "stlxr w16, wzr, [x19]",
            "cbnz w16, 0x18",
            "ldr x1, [x19, #0x20]",
            "str x1, [x19, #0x18]",
        ]).unwrap();
    }

    #[test]
    fn transition_with_state_offset() {
        let mut config = config();
        config.thread.state_and_flags = ThreadOffset(4);
        let mut m = StubAssembler::new(&config);
        let mut slow = Label::new();
        m.try_to_transition_from_runnable_to_native(&mut slow, &[R1]);
        m.bind(&mut slow);
        disassemble(&m.finalize().bytes[..12], vec![
            "add x17, x19, #0x4",
            "ldaxr w16, [x17]",
            "mov w1, #0x1000000",
        ]).unwrap();
    }

    #[test]
    fn polls() {
        let mut m = new_masm();
        let mut label = Label::new();
        m.bind(&mut label);
        m.suspend_check(&mut label);
        m.exception_poll(&mut label);
        m.test_gc_marking(&mut label, UnaryCondition::Zero);
        m.test_mark_bit(R1, &mut label, UnaryCondition::NotZero);
        m.test_byte_and_jump_if_not_zero(0x12345678, &mut label);
        m.deliver_pending_exception();
        disassemble(&m.finalize().bytes, vec![
            "ldr w16, [x19]",
            "tst w16, #0x7",
            "b.ne 0x0",
            "ldr x16, [x19, #0x8]",
            "cbnz x16, 0x0",
            "cbz w20, 0x0",
            "ldr w16, [x1, #0x4]",
            "tbnz w16, #0x1d, 0x0",
            "mov x16, #0x5678",
            "movk x16, #0x1234, lsl #0x10",
            "ldrb w16, [x16]",
            "cbnz w16, 0x0",
            "ldr x0, [x19, #0x8]",
            "ldr x16, [x19, #0x40]",
            "blr x16",
            "brk #0x0",
        ]).unwrap();
    }

    #[test]
    fn implicit_checks() {
        let mut m = new_masm();
        m.stack_overflow_check();
        m.implicit_suspend_check();
        assert_eq!(words(&m.finalize().bytes), vec![0xD1400BF0, 0xB940021F, 0xF94002B5]);
    }
}
