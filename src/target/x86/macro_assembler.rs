use indexmap::{IndexMap};

use crate::buffer::{VecU8};
use crate::cfi::{Cfi};
use crate::label::{Label, define};
use crate::location::{Location, ArgumentLocation, FrameOffset, ThreadOffset};
use crate::macro_assembler::{MacroAssembler, UnaryCondition, Code, check_scratch};
use crate::moves::{moves};
use crate::runtime::{RuntimeConfig, StateAndFlags, ThreadFlags, IndirectRefKind};
use super::{
    Target, Assembler, Address, Register, X87, BinaryOp, Condition, Segment, Width,
    STACK_OVERFLOW_RESERVED_BYTES,
};
use Register::*;
use BinaryOp::*;
use Condition::*;

type Loc = Location<Target>;
type Arg = ArgumentLocation<Target>;

/**
 * The core register used as temporary workspace. It must not hold an
 * argument, nor be passed as a transition scratch register.
 */
pub const SCRATCH: Register = ECX;

/** The segment register that holds the address of the thread block. */
pub const THREAD: Segment = Segment::FS;

/** The size of a stack slot, a pointer and a return address. */
const WORD: i32 = 4;

/** The stack space borrowed to move a value from `ST0` to an SSE register. */
const X87_TEMPORARY: usize = 16;

/** The offset below `ESP` at which `SCRATCH` is saved while tagging `ESP`. */
const SAVED_SCRATCH: i32 = -32;

fn zero_test(cond: UnaryCondition) -> (Condition, bool) {
    (Z, cond == UnaryCondition::Zero)
}

/** Assembles the code of call-boundary stubs for IA-32. */
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
            self.a.const_op(Sub, ESP, delta);
        } else {
            self.a.const_op(Add, ESP, -delta);
        }
        let pc = self.pc();
        self.cfi.adjust_cfa_offset(pc, delta);
    }

    fn jump_if(&mut self, cc: Condition, is_true: bool, label: &mut Label) {
        if !label.is_defined() { self.pending += 1; }
        let a = &mut self.a;
        label.branch(|target| a.jump_if(cc, is_true, target));
    }

    fn check_core_size(size: usize) {
        assert_eq!(size, WORD as usize, "Bad size {} for a core register", size);
    }

    /** Stores `src` of any kind to memory. An x87 `src` is popped. */
    fn store_location(&mut self, dest: Address, src: Loc, size: usize) {
        match src {
            Location::None => assert_eq!(size, 0),
            Location::Core(r) => {
                Self::check_core_size(size);
                self.a.store(dest, r);
            },
            Location::Pair(low, high) => {
                assert_eq!(size, 8, "Bad size {} for a register pair", size);
                self.a.store(dest, low);
                self.a.store((dest.0, dest.1 + WORD), high);
            },
            Location::Float(x) => self.a.store_float(size, dest, x),
            Location::WideFloat(st) => {
                assert_eq!(st, X87::ST0, "Only ST0 can be stored");
                self.a.x87_store(size, dest);
            },
            Location::Stack(_) => panic!("Cannot store {:?}", src),
        }
    }

    /** Loads `dest` of any kind from memory. An x87 `dest` is pushed. */
    fn load_location(&mut self, dest: Loc, src: Address, size: usize) {
        match dest {
            Location::None => assert_eq!(size, 0),
            Location::Core(r) => {
                Self::check_core_size(size);
                self.a.load(r, src);
            },
            Location::Pair(low, high) => {
                assert_eq!(size, 8, "Bad size {} for a register pair", size);
                assert!(low != src.0 || high != src.0, "Cannot load a pair over its own base");
                let high_src = (src.0, src.1 + WORD);
                if low == src.0 {
                    self.a.load(high, high_src);
                    self.a.load(low, src);
                } else {
                    self.a.load(low, src);
                    self.a.load(high, high_src);
                }
            },
            Location::Float(x) => self.a.load_float(size, x, src),
            Location::WideFloat(st) => {
                assert_eq!(st, X87::ST0, "Only ST0 can be loaded");
                self.a.x87_load(size, src);
            },
            Location::Stack(_) => panic!("Cannot load {:?}", dest),
        }
    }
}

impl MacroAssembler for StubAssembler {
    type Registers = Target;

    const POINTER_SIZE: usize = 4;
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

    /**
     * A `frame_size` of one word is the frame of a tail call, which holds
     * only the return address. Any other frame is aligned.
     */
    fn build_frame(&mut self, frame_size: usize, method_reg: Option<Register>, spills: &[Loc]) {
        if frame_size == WORD as usize {
            assert!(method_reg.is_none() && spills.is_empty(), "A tail-call frame holds only the return address");
        } else {
            assert_eq!(frame_size % Self::STACK_ALIGNMENT, 0, "Misaligned frame size {}", frame_size);
        }
        tracing::trace!(target: "crossing::asm", frame_size, spills = spills.len(), "build_frame");
        for &spill in spills.iter().rev() {
            let Location::Core(r) = spill else { panic!("Cannot spill {:?}", spill) };
            self.a.push(r);
            let pc = self.pc();
            self.cfi.adjust_cfa_offset(pc, WORD);
            self.cfi.rel_offset(pc, r.dwarf(), 0);
        }
        let method_size = if method_reg.is_some() { WORD } else { 0 };
        let adjust = frame_size as i32 - spills.len() as i32 * WORD - WORD - method_size;
        assert!(adjust >= 0, "Frame size {} is too small", frame_size);
        if adjust != 0 {
            self.adjust_sp(adjust);
        }
        if let Some(method_reg) = method_reg {
            self.a.push(method_reg);
            let pc = self.pc();
            self.cfi.adjust_cfa_offset(pc, WORD);
        }
        assert_eq!(self.cfi.current_cfa_offset(), frame_size as i32);
    }

    fn remove_frame(&mut self, frame_size: usize, spills: &[Loc], _may_suspend: bool) {
        assert_eq!(frame_size % Self::STACK_ALIGNMENT, 0, "Misaligned frame size {}", frame_size);
        let pc = self.pc();
        self.cfi.remember_state(pc);
        let adjust = frame_size as i32 - spills.len() as i32 * WORD - WORD;
        if adjust != 0 {
            self.adjust_sp(-adjust);
        }
        for &spill in spills {
            let Location::Core(r) = spill else { panic!("Cannot spill {:?}", spill) };
            self.a.pop(r);
            let pc = self.pc();
            self.cfi.adjust_cfa_offset(pc, -WORD);
            self.cfi.restore(pc, r.dwarf());
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
        self.store_location((ESP, dest.0), src, size);
    }

    fn store_raw_ptr(&mut self, dest: FrameOffset, src: Register) {
        self.a.store((ESP, dest.0), src);
    }

    /** Tagging `ESP` borrows `SCRATCH`, and leaves it unchanged. */
    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset, tag_sp: bool) {
        if tag_sp {
            self.a.store((ESP, SAVED_SCRATCH), SCRATCH);
            self.a.move_(SCRATCH, ESP);
            self.a.const_op(Or, SCRATCH, 2);
            self.a.segment_store(THREAD, offset.0, SCRATCH);
            self.a.load(SCRATCH, (ESP, SAVED_SCRATCH));
        } else {
            self.a.segment_store(THREAD, offset.0, ESP);
        }
    }

    fn load(&mut self, dest: Loc, src: FrameOffset, size: usize) {
        self.load_location(dest, (ESP, src.0), size);
    }

    fn load_from(&mut self, dest: Loc, base: Register, offset: i32, size: usize) {
        self.load_location(dest, (base, offset), size);
    }

    fn load_raw_ptr_from_thread(&mut self, dest: Register, offset: ThreadOffset) {
        self.a.segment_load(THREAD, dest, offset.0);
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        assert!(size == 4 || size == 8, "Bad size {} for a copy", size);
        for delta in (0..size as i32).step_by(WORD as usize) {
            self.a.load(SCRATCH, (ESP, src.0 + delta));
            self.a.store((ESP, dest.0 + delta), SCRATCH);
        }
    }

    fn move_(&mut self, dest: Loc, src: Loc, size: usize) {
        if dest == src { return; }
        match (dest, src) {
            (Location::Core(d), Location::Core(s)) => self.a.move_(d, s),
            (Location::Pair(dl, dh), Location::Pair(sl, sh)) => {
                for r in [dl, dh, sl, sh] {
                    assert_ne!(r, SCRATCH, "Cannot move a pair through the scratch register");
                }
                let mut pair_moves = IndexMap::new();
                for (d, s) in [(dl, sl), (dh, sh)] {
                    if d != s { pair_moves.insert(d, s); }
                }
                for (d, s) in moves(pair_moves, &SCRATCH) {
                    self.a.move_(d, s);
                }
            },
            (Location::Float(d), Location::WideFloat(s)) => {
                assert_eq!(s, X87::ST0, "Only ST0 can be moved to an SSE register");
                self.increase_frame_size(X87_TEMPORARY);
                self.a.x87_store(size, (ESP, 0));
                self.a.load_float(size, d, (ESP, 0));
                self.decrease_frame_size(X87_TEMPORARY);
            },
            (Location::Float(d), Location::Float(s)) => self.a.move_float(d, s),
            (Location::Stack(d), Location::Stack(s)) => self.copy(d, s, size),
            (Location::Stack(d), _) => self.store(d, src, size),
            (_, Location::Stack(s)) => self.load(dest, s, size),
            _ => panic!("Cannot move {:?} to {:?}", src, dest),
        }
    }

    fn move_immediate(&mut self, dest: Register, value: usize) {
        let value = u32::try_from(value).unwrap_or_else(|_| panic!("Immediate {:#x} is too wide", value));
        self.a.const_(dest, value as i32);
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
            Location::Core(r) => self.a.segment_load(THREAD, r, self_.0),
            Location::Stack(offset) => {
                self.a.segment_load(THREAD, SCRATCH, self_.0);
                self.a.store((ESP, offset.0), SCRATCH);
            },
            _ => panic!("Cannot put the thread in {:?}", dest),
        }
    }

    /**
     * Native arguments are all on the stack, except for at most one hidden
     * argument in a register. Register sources, `SCRATCH` included, are all
     * stored before the hidden argument moves and before `SCRATCH` is used to
     * copy the stack arguments, so only the hidden destination may not be
     * `SCRATCH`.
     */
    fn move_arguments(&mut self, dests: &[Arg], srcs: &[Arg], refs: &[Option<FrameOffset>]) {
        assert_eq!(dests.len(), srcs.len());
        assert_eq!(dests.len(), refs.len());
        let mut hidden: Option<(Register, Register)> = None;
        // Store the register arguments, converting references in place.
        for (i, ((dest, src), &r)) in dests.iter().zip(srcs).zip(refs).enumerate() {
            assert_eq!(src.size, dest.size, "Argument {} changes size", i);
            if r.is_some() {
                assert_eq!(src.size, Self::POINTER_SIZE, "Reference argument {} is not pointer-sized", i);
            }
            match (dest.location, src.location) {
                (Location::Core(d), Location::Core(s)) => {
                    assert!(r.is_none(), "Hidden argument {} is a reference", i);
                    assert_ne!(d, SCRATCH, "Hidden argument {} is passed in the scratch register", i);
                    assert!(hidden.is_none(), "Argument {} is a second hidden argument", i);
                    hidden = Some((d, s));
                },
                (Location::Stack(_), Location::Stack(_)) => {},
                (Location::Stack(d), _) => {
                    if let Some(spilled) = r {
                        self.create_jobject(src.location, spilled, i != 0);
                    }
                    self.store(d, src.location, src.size);
                },
                _ => panic!("Cannot pass {:?} in {:?}", src.location, dest.location),
            }
        }
        if let Some((d, s)) = hidden {
            tracing::trace!(target: "crossing::asm", dest = ?d, src = ?s, "hidden argument");
            if d != s { self.a.move_(d, s); }
        }
        // Copy the stack arguments through `SCRATCH`.
        for (i, ((dest, src), &r)) in dests.iter().zip(srcs).zip(refs).enumerate() {
            if let (Location::Stack(d), Location::Stack(s)) = (dest.location, src.location) {
                if let Some(spilled) = r {
                    self.create_jobject(dest.location, spilled, i != 0);
                } else {
                    self.copy(d, s, src.size);
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
            self.a.load(reg, (ESP, spilled.0));
            self.a.test(reg, reg);
            self.jump_if(Z, true, &mut null);
            self.a.lea(reg, (ESP, spilled.0));
            self.bind(&mut null);
        } else {
            self.a.lea(reg, (ESP, spilled.0));
        }
        if let Location::Stack(offset) = dest {
            self.a.store((ESP, offset.0), reg);
        }
    }

    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: Register,
        slow_path: &mut Label,
        resume: &mut Label,
    ) {
        self.a.const_test(reg, IndirectRefKind::GLOBAL_OR_WEAK_GLOBAL_MASK as i32);
        self.jump_if(Z, false, slow_path);
        self.a.const_op(And, reg, !IndirectRefKind::MASK as i32);
        self.jump_if(Z, true, resume);
        self.a.load(reg, (reg, 0));
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

    /** `EAX` may hold an argument, so it is saved in the second `scratch`. */
    fn try_to_transition_from_runnable_to_native(&mut self, slow_path: &mut Label, scratch: &[Register]) {
        check_scratch(scratch, &[EAX, SCRATCH]);
        assert!(scratch.len() >= 2, "IA-32 needs two scratch registers to leave Runnable");
        let (scratch, saved_eax) = (scratch[0], scratch[1]);
        let thread = self.config.thread;
        self.a.move_(saved_eax, EAX);
        self.a.const_(EAX, StateAndFlags::RUNNABLE.raw() as i32);
        self.a.const_preserving_flags(scratch, StateAndFlags::NATIVE.raw() as i32);
        self.a.segment_lock_cmpxchg(THREAD, thread.state_and_flags.0, scratch);
        self.a.move_(EAX, saved_eax);
        self.jump_if(Z, false, slow_path);
        self.a.segment_store_const(THREAD, thread.held_mutator_lock.0, 0);
    }

    fn try_to_transition_from_native_to_runnable(
        &mut self,
        slow_path: &mut Label,
        scratch: &[Register],
        return_reg: Loc,
    ) {
        check_scratch(scratch, &[EAX, SCRATCH]);
        for &r in scratch {
            assert!(!return_reg.uses_core(r), "Scratch register {:?} holds the return value", r);
        }
        let saved_eax = if return_reg.uses_core(EAX) {
            assert!(scratch.len() >= 2, "EAX holds the return value, and there is nowhere to save it");
            Some(scratch[1])
        } else {
            None
        };
        let scratch = scratch[0];
        let thread = self.config.thread;
        if let Some(saved_eax) = saved_eax {
            self.a.move_(saved_eax, EAX);
        }
        self.a.const_preserving_flags(EAX, StateAndFlags::NATIVE.raw() as i32);
        self.a.const_(scratch, StateAndFlags::RUNNABLE.raw() as i32);
        self.a.segment_lock_cmpxchg(THREAD, thread.state_and_flags.0, scratch);
        if let Some(saved_eax) = saved_eax {
            self.a.move_(EAX, saved_eax);
        }
        self.jump_if(Z, false, slow_path);
        self.a.segment_load(THREAD, scratch, thread.mutator_lock.0);
        self.a.segment_store(THREAD, thread.held_mutator_lock.0, scratch);
    }

    fn suspend_check(&mut self, label: &mut Label) {
        let flags = ThreadFlags::SUSPEND_OR_CHECKPOINT_REQUEST.bits() as i32;
        self.a.segment_const_test(THREAD, self.config.thread.state_and_flags.0, flags);
        self.jump_if(Z, false, label);
    }

    fn exception_poll(&mut self, label: &mut Label) {
        self.a.segment_const_op(THREAD, Cmp, self.config.thread.exception.0, 0);
        self.jump_if(Z, false, label);
    }

    /** The exception is passed in `EAX`. */
    fn deliver_pending_exception(&mut self) {
        let thread = self.config.thread;
        self.a.segment_load(THREAD, EAX, thread.exception.0);
        self.a.segment_call(THREAD, thread.deliver_exception.0);
        self.a.int3();
    }

    fn test_gc_marking(&mut self, label: &mut Label, cond: UnaryCondition) {
        self.a.segment_const_op(THREAD, Cmp, self.config.thread.is_gc_marking.0, 0);
        let (cc, is_true) = zero_test(cond);
        self.jump_if(cc, is_true, label);
    }

    fn test_mark_bit(&mut self, reference: Register, label: &mut Label, cond: UnaryCondition) {
        let objects = self.config.objects;
        self.a.load_const_test((reference, objects.monitor_offset), objects.mark_bit_mask() as i32);
        let (cc, is_true) = zero_test(cond);
        self.jump_if(cc, is_true, label);
    }

    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: &mut Label) {
        let address = u32::try_from(address).unwrap_or_else(|_| panic!("Address {:#x} is too wide", address));
        self.a.abs_const_cmp_byte(address as i32, 0);
        self.jump_if(Z, false, label);
    }

    fn implicit_suspend_check(&mut self) {
        self.a.segment_load(THREAD, EAX, self.config.thread.suspend_trigger.0);
        self.a.test_ra_indirect();
    }

    fn stack_overflow_check(&mut self) {
        let reserved = self.config.reserved_bytes(STACK_OVERFLOW_RESERVED_BYTES);
        self.a.load_test((ESP, -(reserved as i32)), EAX);
    }
}

//-----------------------------------------------------------------------------
