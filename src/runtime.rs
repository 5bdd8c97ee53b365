//! The parts of the managed runtime that generated code and fault handlers
//! depend on: the encoding of the thread-state word, the layout of the
//! per-thread control block, the few object-layout constants used by
//! read barriers, and the addresses of runtime entry points.
//!
//! All of this is plain data, collected into a [`RuntimeConfig`] that is
//! built once by the embedding runtime and never changes afterwards.

use bitflags::{bitflags};

use super::location::{ThreadOffset};

/** The execution state of a managed thread. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /** Running managed code. Must be zero. */
    Runnable = 0,
    /** Running native code, not touching managed objects. */
    Native = 1,
    /** Suspended by a suspend request. */
    Suspended = 2,
    /** Blocked on a monitor or other runtime lock. */
    Blocked = 3,
}

use ThreadState::*;

pub const ALL_THREAD_STATES: [ThreadState; 4] = [Runnable, Native, Suspended, Blocked];

bitflags! {
    /** Requests that other threads can raise against a thread. */
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ThreadFlags: u32 {
        const SUSPEND_REQUEST = 1 << 0;
        const CHECKPOINT_REQUEST = 1 << 1;
        const EMPTY_CHECKPOINT_REQUEST = 1 << 2;
        const ACTIVE_SUSPEND_BARRIER = 1 << 3;
    }
}

impl ThreadFlags {
    /** The flags that a suspend check polls. */
    pub const SUSPEND_OR_CHECKPOINT_REQUEST: Self = Self::SUSPEND_REQUEST
        .union(Self::CHECKPOINT_REQUEST)
        .union(Self::EMPTY_CHECKPOINT_REQUEST);
}

/** The bit position of the state within the thread-state word. */
pub const STATE_SHIFT: u32 = 24;

/**
 * The thread-state word: a [`ThreadState`] in the top byte and
 * [`ThreadFlags`] in the low bits.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StateAndFlags(u32);

impl StateAndFlags {
    /** The encoding of "runnable, no flags". */
    pub const RUNNABLE: Self = StateAndFlags((Runnable as u32) << STATE_SHIFT);

    /** The encoding of "native, no flags". */
    pub const NATIVE: Self = StateAndFlags((Native as u32) << STATE_SHIFT);

    pub fn new(state: ThreadState, flags: ThreadFlags) -> Self {
        StateAndFlags((state as u32) << STATE_SHIFT | flags.bits())
    }

    pub fn raw(self) -> u32 { self.0 }
}

//-----------------------------------------------------------------------------

/**
 * The kind of an opaque native-side reference, encoded in its low
 * [`IndirectRefKind::BITS`] bits.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IndirectRefKind {
    /** The address of a reference spilled in a native transition frame. */
    JniTransition = 0,
    Local = 1,
    Global = 2,
    WeakGlobal = 3,
}

impl IndirectRefKind {
    pub const BITS: u32 = 2;

    /** Masks the kind bits. */
    pub const MASK: u32 = (1 << Self::BITS) - 1;

    /** Set for `Global` and `WeakGlobal`, clear for the other kinds. */
    pub const GLOBAL_OR_WEAK_GLOBAL_MASK: u32 = 2;

    pub fn of(reference: usize) -> Self {
        match reference as u32 & Self::MASK {
            0 => IndirectRefKind::JniTransition,
            1 => IndirectRefKind::Local,
            2 => IndirectRefKind::Global,
            _ => IndirectRefKind::WeakGlobal,
        }
    }
}

//-----------------------------------------------------------------------------

/**
 * Byte offsets of the thread-control-block fields that generated code
 * touches. On x86 and x86_64 they are relative to the thread segment; on
 * AArch64 they are relative to the thread register.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadOffsets {
    /** The 32-bit [`StateAndFlags`] word. */
    pub state_and_flags: ThreadOffset,
    /** The pending exception, or null. */
    pub exception: ThreadOffset,
    /** A 32-bit flag which is nonzero while the GC is marking. */
    pub is_gc_marking: ThreadOffset,
    /** The held-lock record for the mutator lock. */
    pub held_mutator_lock: ThreadOffset,
    /** A pointer to the mutator lock itself. */
    pub mutator_lock: ThreadOffset,
    /** Where native transitions save the managed stack pointer. */
    pub top_quick_frame: ThreadOffset,
    /** A pointer to the thread block itself. */
    pub self_: ThreadOffset,
    /**
     * A pointer which the implicit suspend check dereferences. The runtime
     * sets it to null to request a suspension.
     */
    pub suspend_trigger: ThreadOffset,
    /** The entry point that delivers the pending exception. */
    pub deliver_exception: ThreadOffset,
}

/** Object-layout constants used by read barriers. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectLayout {
    /** The offset of the 32-bit lock word within an object. */
    pub monitor_offset: i32,
    /** The position of the mark bit within the lock word. */
    pub mark_bit_shift: u32,
}

impl ObjectLayout {
    pub fn mark_bit_mask(&self) -> u32 { 1 << self.mark_bit_shift }
}

impl Default for ObjectLayout {
    fn default() -> Self {
        ObjectLayout {monitor_offset: 4, mark_bit_shift: 29}
    }
}

/**
 * Absolute addresses of the runtime code that fault handlers redirect to.
 * Each follows the native calling convention of its architecture.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EntryPoints {
    pub throw_null_pointer_exception: usize,
    pub throw_stack_overflow_error: usize,
    pub implicit_suspend: usize,
}

/** Everything the crate needs to know about the runtime that embeds it. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub thread: ThreadOffsets,
    pub objects: ObjectLayout,
    pub entry_points: EntryPoints,
    /**
     * The gap between the stack limit and the guard page, or `None` for the
     * default of the target architecture.
     */
    pub stack_overflow_reserved_bytes: Option<usize>,
    pub page_size: usize,
}

impl RuntimeConfig {
    pub fn new(thread: ThreadOffsets, entry_points: EntryPoints) -> Self {
        RuntimeConfig {
            thread,
            objects: ObjectLayout::default(),
            entry_points,
            stack_overflow_reserved_bytes: None,
            page_size: 4096,
        }
    }

    /** The reserved stack gap, falling back to `default`. */
    pub fn reserved_bytes(&self, default: usize) -> usize {
        self.stack_overflow_reserved_bytes.unwrap_or(default)
    }
}

//-----------------------------------------------------------------------------
