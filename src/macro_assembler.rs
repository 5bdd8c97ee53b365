//! The architecture-neutral interface of the code that crosses between
//! managed and native code.
//!
//! A call-boundary stub is generated by a single [`MacroAssembler`], from
//! [`build_frame()`] to [`remove_frame()`] and any slow paths after it. Each
//! target implements the trait with its own register types; callers that
//! only know the abstract interface use [`CoreOf`] to name them.
//!
//! [`build_frame()`]: MacroAssembler::build_frame
//! [`remove_frame()`]: MacroAssembler::remove_frame

use super::cfi::{Cfi};
use super::label::{Label};
use super::location::{Registers, Location, ArgumentLocation, FrameOffset, ThreadOffset};
use super::runtime::{RuntimeConfig};

/** The polarity of a test-and-branch operation. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnaryCondition {
    Zero,
    NotZero,
}

/** The finished output of a [`MacroAssembler`]. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    /** The machine code. */
    pub bytes: Vec<u8>,
    /** DWARF call-frame instructions describing `bytes`. */
    pub cfi: Vec<u8>,
}

/** The core register type of `M`. */
pub type CoreOf<M> = <<M as MacroAssembler>::Registers as Registers>::Core;

/** A storage location on the target of `M`. */
pub type LocationOf<M> = Location<<M as MacroAssembler>::Registers>;

/** An argument location on the target of `M`. */
pub type ArgumentOf<M> = ArgumentLocation<<M as MacroAssembler>::Registers>;

/**
 * Emits the code that runs while crossing between managed and native code.
 *
 * Every method appends machine code and keeps the [`Cfi`] in step with the
 * stack pointer. Precondition violations are bugs in the caller, and panic.
 */
pub trait MacroAssembler: Sized {
    type Registers: Registers;

    /** The size in bytes of a pointer, a stack slot and a return address. */
    const POINTER_SIZE: usize;

    /** The native stack alignment. Frame sizes must be multiples of it. */
    const STACK_ALIGNMENT: usize;

    /** Constructs a `MacroAssembler` for code running in a runtime shaped like `config`. */
    fn new(config: &RuntimeConfig) -> Self;

    /** The current assembly position, as a byte offset into the code. */
    fn here(&self) -> usize;

    /** The unwind information so far. */
    fn cfi(&self) -> &Cfi;

    /**
     * Returns the code and its unwind information. Panics if any [`Label`]
     * used by the code was never bound.
     */
    fn finalize(self) -> Code;

    // Labels.

    /** Binds `label` to the current position, and patches branches to it. */
    fn bind(&mut self, label: &mut Label);

    /** Unconditionally jumps to `label`. */
    fn jump(&mut self, label: &mut Label);

    // Frames.

    /**
     * Sets up a native frame of `frame_size` bytes, including the return
     * address. The registers in `spills` are saved, and `method_reg`, if
     * supplied, is stored at `[sp]`. Must be the first thing emitted.
     */
    fn build_frame(
        &mut self,
        frame_size: usize,
        method_reg: Option<CoreOf<Self>>,
        spills: &[LocationOf<Self>],
    );

    /**
     * Tears down the frame built by `build_frame()` and returns. The unwind
     * information afterwards still describes the frame.
     */
    fn remove_frame(&mut self, frame_size: usize, spills: &[LocationOf<Self>], may_suspend: bool);

    fn increase_frame_size(&mut self, adjust: usize);

    fn decrease_frame_size(&mut self, adjust: usize);

    // Loads and stores.

    /** Stores `size` bytes from `src` into the stack slot `dest`. */
    fn store(&mut self, dest: FrameOffset, src: LocationOf<Self>, size: usize);

    /** Stores a pointer-sized register into the stack slot `dest`. */
    fn store_raw_ptr(&mut self, dest: FrameOffset, src: CoreOf<Self>);

    /**
     * Stores the stack pointer into the thread block. With `tag_sp`, the
     * stored value has bit 1 set, marking a native-call frame.
     */
    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset, tag_sp: bool);

    /** Loads `size` bytes from the stack slot `src` into `dest`. */
    fn load(&mut self, dest: LocationOf<Self>, src: FrameOffset, size: usize);

    /** Loads `size` bytes from `[base + offset]` into `dest`. */
    fn load_from(&mut self, dest: LocationOf<Self>, base: CoreOf<Self>, offset: i32, size: usize);

    fn load_raw_ptr_from_thread(&mut self, dest: CoreOf<Self>, offset: ThreadOffset);

    /** Copies `size` bytes between stack slots, using a scratch register. */
    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize);

    /** Moves the value `src` to `dest`. Does nothing if they are the same. */
    fn move_(&mut self, dest: LocationOf<Self>, src: LocationOf<Self>, size: usize);

    fn move_immediate(&mut self, dest: CoreOf<Self>, value: usize);

    /** Sign-extends the low `size` bytes of `reg`; `size` is 1 or 2. */
    fn sign_extend(&mut self, reg: CoreOf<Self>, size: usize);

    /** Zero-extends the low `size` bytes of `reg`; `size` is 1 or 2. */
    fn zero_extend(&mut self, reg: CoreOf<Self>, size: usize);

    /** Loads the address of the thread block into a register or stack slot. */
    fn get_current_thread(&mut self, dest: LocationOf<Self>);

    // Arguments and references.

    /**
     * Moves the managed arguments `srcs` to the native argument positions
     * `dests`. Where `refs[i]` is `Some`, argument `i` is a reference
     * spilled at that offset, and is passed as a handle to the spill slot.
     * Only argument 0 may not be null.
     */
    fn move_arguments(
        &mut self,
        dests: &[ArgumentOf<Self>],
        srcs: &[ArgumentOf<Self>],
        refs: &[Option<FrameOffset>],
    );

    /**
     * Puts into `dest` (a core register or a stack slot) a handle for the
     * reference spilled at `spilled`. With `null_allowed`, a null reference
     * gives a null handle.
     */
    fn create_jobject(&mut self, dest: LocationOf<Self>, spilled: FrameOffset, null_allowed: bool);

    /**
     * Decodes the handle in `reg` if it is a local or transition-frame
     * handle, leaving the reference in `reg`. Global and weak-global handles
     * branch to `slow_path`; null handles branch to `resume`.
     */
    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: CoreOf<Self>,
        slow_path: &mut Label,
        resume: &mut Label,
    );

    // Calls.

    /** Jumps to the address stored at `[base + offset]`. */
    fn jump_indirect(&mut self, base: CoreOf<Self>, offset: i32);

    /** Calls the address stored at `[base + offset]`. */
    fn call(&mut self, base: CoreOf<Self>, offset: i32);

    /** Calls the entry point stored in the thread block at `offset`. */
    fn call_from_thread(&mut self, offset: ThreadOffset);

    // Thread state.

    /**
     * Atomically changes the thread state from Runnable to Native, or
     * branches to `slow_path` if any flag is set. Uses up to two `scratch`
     * registers.
     */
    fn try_to_transition_from_runnable_to_native(
        &mut self,
        slow_path: &mut Label,
        scratch: &[CoreOf<Self>],
    );

    /**
     * Atomically changes the thread state from Native to Runnable, or
     * branches to `slow_path` if any flag is set. Uses up to two `scratch`
     * registers, which must not overlap `return_reg`, and preserves
     * `return_reg`.
     */
    fn try_to_transition_from_native_to_runnable(
        &mut self,
        slow_path: &mut Label,
        scratch: &[CoreOf<Self>],
        return_reg: LocationOf<Self>,
    );

    /** Branches to `label` if a suspend or checkpoint is requested. */
    fn suspend_check(&mut self, label: &mut Label);

    /** Branches to `label` if an exception is pending. */
    fn exception_poll(&mut self, label: &mut Label);

    /** Passes the pending exception to the runtime. Never returns. */
    fn deliver_pending_exception(&mut self);

    // Read barriers.

    /** Tests the thread's GC-marking flag. */
    fn test_gc_marking(&mut self, label: &mut Label, cond: UnaryCondition);

    /** Tests the mark bit in the lock word of the object in `reference`. */
    fn test_mark_bit(&mut self, reference: CoreOf<Self>, label: &mut Label, cond: UnaryCondition);

    /** Branches to `label` if the byte at absolute `address` is nonzero. */
    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: &mut Label);

    // Implicit checks.

    /**
     * Emits the suspend check that faults when the runtime clears the
     * suspend trigger. It is recognized by the suspend fault handler.
     */
    fn implicit_suspend_check(&mut self);

    /**
     * Emits a probe of the address a reserved distance below the stack
     * pointer, which faults if the stack is about to overflow. It is
     * recognized by the stack-overflow fault handler, and must precede
     * `build_frame()`'s stack adjustments.
     */
    fn stack_overflow_check(&mut self);
}

//-----------------------------------------------------------------------------

/**
 * Panics unless the transition `scratch` registers are pairwise distinct and
 * distinct from `reserved`, the registers the macro assembler uses
 * internally.
 */
pub fn check_scratch<C: std::fmt::Debug + Eq>(scratch: &[C], reserved: &[C]) {
    for (i, r) in scratch.iter().enumerate() {
        assert!(!reserved.contains(r), "Scratch register {:?} is reserved", r);
        assert!(!scratch[..i].contains(r), "Scratch register {:?} appears twice", r);
    }
}

//-----------------------------------------------------------------------------
