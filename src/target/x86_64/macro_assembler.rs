use indexmap::{IndexMap};

use crate::buffer::{VecU8};
use crate::cfi::{Cfi};
use crate::label::{Label, define};
use crate::location::{Location, ArgumentLocation, FrameOffset, ThreadOffset};
use crate::macro_assembler::{MacroAssembler, UnaryCondition, Code, check_scratch};
use crate::moves::{moves};
use crate::runtime::{RuntimeConfig, StateAndFlags, ThreadFlags, IndirectRefKind};
use super::{
    Target, Assembler, Register, Xmm, Precision, BinaryOp, Condition, Segment, Width,
    STACK_OVERFLOW_RESERVED_BYTES,
};
use Register::*;
use Precision::*;
use BinaryOp::*;
use Condition::*;

type Loc = Location<Target>;
type Arg = ArgumentLocation<Target>;

/**
 * The core register used as temporary workspace. It must not hold an
 * argument, nor be passed as a transition scratch register.
 */
pub const SCRATCH: Register = R11;

/** The SSE register used to break cycles of SSE moves. */
pub const FLOAT_SCRATCH: Xmm = Xmm::XMM15;

/** The segment register that holds the address of the thread block. */
pub const THREAD: Segment = Segment::GS;

/** The size of a stack slot, a pointer and a return address. */
const WORD: i32 = 8;

/** Returns the `(Condition, is_true)` that branches when `cond` holds for ZF. */
fn zero_test(cond: UnaryCondition) -> (Condition, bool) {
    (Z, cond == UnaryCondition::Zero)
}

/** Assembles the code of call-boundary stubs for x86_64. */
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
            self.a.const_op(Sub, P64, RSP, delta);
        } else {
            self.a.const_op(Add, P64, RSP, -delta);
        }
        let pc = self.pc();
        self.cfi.adjust_cfa_offset(pc, delta);
    }

    /** Assembles a conditional branch to `label`. */
    fn jump_if(&mut self, cc: Condition, is_true: bool, label: &mut Label) {
        if !label.is_defined() { self.pending += 1; }
        let a = &mut self.a;
        label.branch(|target| a.jump_if(cc, is_true, target));
    }

    fn load_core(&mut self, dest: Register, src: (Register, i32), size: usize) {
        self.a.load(Precision::of_size(size), dest, src);
    }

    fn store_core(&mut self, dest: (Register, i32), src: Register, size: usize) {
        self.a.store(Precision::of_size(size), dest, src);
    }

    /** Loads `dest` of any kind from memory. */
    fn load_location(&mut self, dest: Loc, src: (Register, i32), size: usize) {
        match dest {
            Location::None => assert_eq!(size, 0),
            Location::Core(r) => self.load_core(r, src, size),
            Location::Float(x) => self.a.load_float(size, x, src),
            _ => panic!("Cannot load {:?}", dest),
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
            cfi: Cfi::new(WORD, -WORD),
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
        if !label.is_defined() { self.pending += 1; }
        let a = &mut self.a;
        label.branch(|target| a.const_jump(target));
    }

    fn build_frame(&mut self, frame_size: usize, method_reg: Option<Register>, spills: &[Loc]) {
        assert_eq!(frame_size % Self::STACK_ALIGNMENT, 0, "Misaligned frame size {}", frame_size);
        tracing::trace!(target: "crossing::asm", frame_size, spills = spills.len(), "build_frame");
        let mut core_count = 0;
        for &spill in spills.iter().rev() {
            if let Location::Core(r) = spill {
                self.a.push(r);
                core_count += 1;
                let pc = self.pc();
                self.cfi.adjust_cfa_offset(pc, WORD);
                self.cfi.rel_offset(pc, r.dwarf(), 0);
            }
        }
        let rest = frame_size as i32 - core_count * WORD - WORD;
        assert!(rest >= 0, "Frame size {} is too small", frame_size);
        if rest != 0 {
            self.adjust_sp(rest);
        }
        let mut offset = rest;
        for &spill in spills.iter().rev() {
            match spill {
                Location::Core(_) => {},
                Location::Float(x) => {
                    offset -= WORD;
                    self.a.store_float(8, (RSP, offset), x);
                    let pc = self.pc();
                    self.cfi.rel_offset(pc, x.dwarf(), offset);
                },
                _ => panic!("Cannot spill {:?}", spill),
            }
        }
        if let Some(method_reg) = method_reg {
            assert!(offset >= WORD, "No room for the method in a frame of size {}", frame_size);
            self.a.store(P64, (RSP, 0), method_reg);
        }
        assert_eq!(self.cfi.current_cfa_offset(), frame_size as i32);
    }

    fn remove_frame(&mut self, frame_size: usize, spills: &[Loc], _may_suspend: bool) {
        assert_eq!(frame_size % Self::STACK_ALIGNMENT, 0, "Misaligned frame size {}", frame_size);
        let pc = self.pc();
        self.cfi.remember_state(pc);
        let mut offset = frame_size as i32 - spills.len() as i32 * WORD - WORD;
        for &spill in spills {
            if let Location::Float(x) = spill {
                self.a.load_float(8, x, (RSP, offset));
                let pc = self.pc();
                self.cfi.restore(pc, x.dwarf());
                offset += WORD;
            }
        }
        if offset != 0 {
            self.adjust_sp(-offset);
        }
        for &spill in spills {
            if let Location::Core(r) = spill {
                self.a.pop(r);
                let pc = self.pc();
                self.cfi.adjust_cfa_offset(pc, -WORD);
                self.cfi.restore(pc, r.dwarf());
            }
        }
        assert_eq!(self.cfi.current_cfa_offset(), WORD);
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
        match src {
            Location::None => assert_eq!(size, 0),
            Location::Core(r) => self.store_core((RSP, dest.0), r, size),
            Location::Float(x) => self.a.store_float(size, (RSP, dest.0), x),
            _ => panic!("Cannot store {:?}", src),
        }
    }

    fn store_raw_ptr(&mut self, dest: FrameOffset, src: Register) {
        self.a.store(P64, (RSP, dest.0), src);
    }

    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset, tag_sp: bool) {
        if tag_sp {
            self.a.move_(P64, SCRATCH, RSP);
            self.a.const_op(Or, P64, SCRATCH, 2);
            self.a.segment_store(THREAD, P64, offset.0, SCRATCH);
        } else {
            self.a.segment_store(THREAD, P64, offset.0, RSP);
        }
    }

    fn load(&mut self, dest: Loc, src: FrameOffset, size: usize) {
        self.load_location(dest, (RSP, src.0), size);
    }

    fn load_from(&mut self, dest: Loc, base: Register, offset: i32, size: usize) {
        self.load_location(dest, (base, offset), size);
    }

    fn load_raw_ptr_from_thread(&mut self, dest: Register, offset: ThreadOffset) {
        self.a.segment_load(THREAD, P64, dest, offset.0);
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        self.load_core(SCRATCH, (RSP, src.0), size);
        self.store_core((RSP, dest.0), SCRATCH, size);
    }

    fn move_(&mut self, dest: Loc, src: Loc, size: usize) {
        if dest == src { return; }
        match (dest, src) {
            (Location::Core(d), Location::Core(s)) => self.a.move_(P64, d, s),
            (Location::Float(d), Location::Float(s)) => self.a.move_float(d, s),
            (Location::Stack(d), Location::Stack(s)) => self.copy(d, s, size),
            (Location::Stack(d), _) => self.store(d, src, size),
            (_, Location::Stack(s)) => self.load(dest, s, size),
            _ => panic!("Cannot move {:?} to {:?}", src, dest),
        }
    }

    fn move_immediate(&mut self, dest: Register, value: usize) {
        self.a.const_(P64, dest, value as i64);
    }

    fn sign_extend(&mut self, reg: Register, size: usize) {
        self.a.extend(Width::of_size(size, true), reg, reg);
    }

    fn zero_extend(&mut self, reg: Register, size: usize) {
        self.a.extend(Width::of_size(size, false), reg, reg);
    }

    fn get_current_thread(&mut self, dest: Loc) {
        let self_ = self.config.thread.self_;
        match dest {
            Location::Core(r) => self.a.segment_load(THREAD, P64, r, self_.0),
            Location::Stack(offset) => {
                self.a.segment_load(THREAD, P64, SCRATCH, self_.0);
                self.a.store(P64, (RSP, offset.0), SCRATCH);
            },
            _ => panic!("Cannot put the thread in {:?}", dest),
        }
    }

    fn move_arguments(&mut self, dests: &[Arg], srcs: &[Arg], refs: &[Option<FrameOffset>]) {
        assert_eq!(dests.len(), srcs.len());
        assert_eq!(dests.len(), refs.len());
        let mut core_moves: IndexMap<Register, Register> = IndexMap::new();
        let mut float_moves: IndexMap<Xmm, Xmm> = IndexMap::new();
        // Convert references held in registers, and store all stack
        // arguments, before any register is overwritten.
        for (i, ((dest, src), &r)) in dests.iter().zip(srcs).zip(refs).enumerate() {
            assert_eq!(src.size, dest.size, "Argument {} changes size", i);
            if r.is_some() {
                assert_eq!(src.size, Self::POINTER_SIZE, "Reference argument {} is not pointer-sized", i);
            }
            for location in [dest.location, src.location] {
                assert!(
                    !location.uses_core(SCRATCH) && location != Location::Float(FLOAT_SCRATCH),
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
        // Shuffle the register arguments.
        for (d, s) in moves(core_moves, &SCRATCH) {
            self.a.move_(P64, d, s);
        }
        for (d, s) in moves(float_moves, &FLOAT_SCRATCH) {
            self.a.move_float(d, s);
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
            Location::Stack(_) => SCRATCH,
            _ => panic!("Cannot put a handle in {:?}", dest),
        };
        if null_allowed {
            let mut null = Label::new();
            self.a.load(P32, reg, (RSP, spilled.0));
            self.a.test(P32, reg, reg);
            self.jump_if(Z, true, &mut null);
            self.a.lea(reg, (RSP, spilled.0));
            self.bind(&mut null);
        } else {
            self.a.lea(reg, (RSP, spilled.0));
        }
        if let Location::Stack(offset) = dest {
            self.a.store(P64, (RSP, offset.0), reg);
        }
    }

    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: Register,
        slow_path: &mut Label,
        resume: &mut Label,
    ) {
        self.a.const_test(P32, reg, IndirectRefKind::GLOBAL_OR_WEAK_GLOBAL_MASK as i32);
        self.jump_if(Z, false, slow_path);
        self.a.const_op(And, P64, reg, !IndirectRefKind::MASK as i32);
        self.jump_if(Z, true, resume);
        self.a.load(P32, reg, (reg, 0));
    }

    fn jump_indirect(&mut self, base: Register, offset: i32) {
        self.a.load_jump((base, offset));
    }

    fn call(&mut self, base: Register, offset: i32) {
        self.a.load_call((base, offset));
    }

    fn call_from_thread(&mut self, offset: ThreadOffset) {
        self.a.segment_call(THREAD, offset.0);
    }

    fn try_to_transition_from_runnable_to_native(&mut self, slow_path: &mut Label, scratch: &[Register]) {
        check_scratch(scratch, &[RA, SCRATCH]);
        assert!(!scratch.is_empty(), "x86_64 needs a scratch register to leave Runnable");
        let scratch = scratch[0];
        let thread = self.config.thread;
        self.a.const_(P32, RA, i64::from(StateAndFlags::RUNNABLE.raw()));
        self.a.const_preserving_flags(P32, scratch, i64::from(StateAndFlags::NATIVE.raw()));
        self.a.segment_lock_cmpxchg(THREAD, thread.state_and_flags.0, scratch);
        self.jump_if(Z, false, slow_path);
        self.a.segment_store_const(THREAD, P64, thread.held_mutator_lock.0, 0);
    }

    fn try_to_transition_from_native_to_runnable(
        &mut self,
        slow_path: &mut Label,
        scratch: &[Register],
        return_reg: Loc,
    ) {
        check_scratch(scratch, &[RA, SCRATCH]);
        for &r in scratch {
            assert!(!return_reg.uses_core(r), "Scratch register {:?} holds the return value", r);
        }
        assert!(!scratch.is_empty(), "x86_64 needs a scratch register to leave Native");
        let saved_ra = if return_reg.uses_core(RA) {
            assert!(scratch.len() >= 2, "RA holds the return value, and there is nowhere to save it");
            Some(scratch[1])
        } else {
            None
        };
        let scratch = scratch[0];
        let thread = self.config.thread;
        if let Some(saved_ra) = saved_ra {
            self.a.move_(P64, saved_ra, RA);
        }
        self.a.const_preserving_flags(P32, RA, i64::from(StateAndFlags::NATIVE.raw()));
        self.a.const_(P32, scratch, i64::from(StateAndFlags::RUNNABLE.raw()));
        self.a.segment_lock_cmpxchg(THREAD, thread.state_and_flags.0, scratch);
        if let Some(saved_ra) = saved_ra {
            self.a.move_(P64, RA, saved_ra);
        }
        self.jump_if(Z, false, slow_path);
        self.a.segment_load(THREAD, P64, scratch, thread.mutator_lock.0);
        self.a.segment_store(THREAD, P64, thread.held_mutator_lock.0, scratch);
    }

    fn suspend_check(&mut self, label: &mut Label) {
        let flags = ThreadFlags::SUSPEND_OR_CHECKPOINT_REQUEST.bits() as i32;
        self.a.segment_const_test(THREAD, P32, self.config.thread.state_and_flags.0, flags);
        self.jump_if(Z, false, label);
    }

    fn exception_poll(&mut self, label: &mut Label) {
        self.a.segment_const_op(THREAD, Cmp, P32, self.config.thread.exception.0, 0);
        self.jump_if(Z, false, label);
    }

    fn deliver_pending_exception(&mut self) {
        let thread = self.config.thread;
        self.a.segment_load(THREAD, P64, RDI, thread.exception.0);
        self.a.segment_call(THREAD, thread.deliver_exception.0);
        self.a.int3();
    }

    fn test_gc_marking(&mut self, label: &mut Label, cond: UnaryCondition) {
        self.a.segment_const_op(THREAD, Cmp, P32, self.config.thread.is_gc_marking.0, 0);
        let (cc, is_true) = zero_test(cond);
        self.jump_if(cc, is_true, label);
    }

    fn test_mark_bit(&mut self, reference: Register, label: &mut Label, cond: UnaryCondition) {
        let objects = self.config.objects;
        self.a.load_const_test(P32, (reference, objects.monitor_offset), objects.mark_bit_mask() as i32);
        let (cc, is_true) = zero_test(cond);
        self.jump_if(cc, is_true, label);
    }

    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: &mut Label) {
        self.a.const_(P64, SCRATCH, address as i64);
        self.a.load_const_cmp_byte((SCRATCH, 0), 0);
        self.jump_if(Z, false, label);
    }

    fn implicit_suspend_check(&mut self) {
        self.a.segment_load(THREAD, P64, RA, self.config.thread.suspend_trigger.0);
        self.a.test_ra_indirect();
    }

    fn stack_overflow_check(&mut self) {
        let reserved = self.config.reserved_bytes(STACK_OVERFLOW_RESERVED_BYTES);
        self.a.load_test(P64, (RSP, -(reserved as i32)), RA);
    }
}

//-----------------------------------------------------------------------------
