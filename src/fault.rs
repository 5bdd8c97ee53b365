//! Recognizes the hardware traps that generated code raises on purpose, and
//! turns them into calls to the runtime.
//!
//! Classification is a pure function from a [`Trap`] to a [`Verdict`]. A
//! [`FaultHandler`] never touches the trapped thread directly: it reads
//! memory through a [`TrapMemory`], asks the runtime questions through a
//! [`ManagedCode`], and describes what should change in a [`Redirect`]. The
//! OS adapter in [`signal`] applies the `Redirect`.
//!
//! Classification runs inside a signal handler, and logs through `tracing`
//! under the target `crossing::signals`. A subscriber that sees those events
//! must not allocate or take locks, or it may deadlock a thread that trapped
//! while holding the allocator's lock. Either filter `crossing::signals` out
//! of ordinary subscribers, or compile the events out with one of `tracing`'s
//! `max_level_*` features.

use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Range};
use std::sync::{Arc};

use crate::error::{CodeRangeError};
use crate::runtime::{RuntimeConfig};

mod ranges;
pub use ranges::{CodeRanges, CAPACITY};

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"),
))]
pub mod signal;

// Signal codes, as defined by Linux for all the supported architectures.
pub const SIGILL: i32 = 4;
pub const SIGBUS: i32 = 7;
pub const SIGSEGV: i32 = 11;
pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;
pub const SEGV_MTEAERR: i32 = 8;
pub const SEGV_MTESERR: i32 = 9;
pub const BUS_ADRALN: i32 = 1;
pub const BUS_ADRERR: i32 = 2;
pub const BUS_OBJERR: i32 = 3;

/** Returns the symbolic name of a `si_code`, for logging. */
pub fn signal_code_name(signal: i32, code: i32) -> &'static str {
    match signal {
        SIGSEGV => match code {
            SEGV_MAPERR => "SEGV_MAPERR",
            SEGV_ACCERR => "SEGV_ACCERR",
            SEGV_MTEAERR => "SEGV_MTEAERR",
            SEGV_MTESERR => "SEGV_MTESERR",
            _ => "SEGV_UNKNOWN",
        },
        SIGBUS => match code {
            BUS_ADRALN => "BUS_ADRALN",
            BUS_ADRERR => "BUS_ADRERR",
            BUS_OBJERR => "BUS_OBJERR",
            _ => "BUS_UNKNOWN",
        },
        _ => "UNKNOWN",
    }
}

//-----------------------------------------------------------------------------

/** The saved registers of a trapped thread, for one architecture. */
pub trait Context: Debug + Clone + Send + 'static {
    /** The address of the instruction that trapped. */
    fn pc(&self) -> usize;

    fn sp(&self) -> usize;

    fn set_pc(&mut self, pc: usize);

    fn set_sp(&mut self, sp: usize);
}

/**
 * Read access to the memory of the trapped thread. Reads must not fault:
 * an unreadable address gives `false` or `None`.
 */
pub trait TrapMemory {
    /** Fills `buffer` from `address` onwards. Returns `false` on failure. */
    fn read(&self, address: usize, buffer: &mut [u8]) -> bool;

    fn read_u32(&self, address: usize) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes).then(|| u32::from_le_bytes(bytes))
    }

    fn read_u64(&self, address: usize) -> Option<u64> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes).then(|| u64::from_le_bytes(bytes))
    }

    /** Reads a pointer of `size` bytes, which must be 4 or 8. */
    fn read_word(&self, address: usize, size: usize) -> Option<usize> {
        match size {
            4 => self.read_u32(address).map(|w| w as usize),
            8 => self.read_u64(address).map(|w| w as usize),
            _ => panic!("Bad word size {}", size),
        }
    }
}

/** The questions a [`FaultHandler`] asks the runtime about managed code. */
pub trait ManagedCode: Send + Sync {
    /** Tests whether `method` looks like a method descriptor. */
    fn is_valid_method(&self, method: usize) -> bool;

    /**
     * Tests whether `return_pc` is a plausible return address for the
     * method whose descriptor is at `[sp]`.
     */
    fn is_valid_return_pc(&self, sp: usize, return_pc: usize) -> bool;

    /** The range of compiled code of `method` that contains `pc`. */
    fn code_range(&self, method: usize, pc: usize) -> Option<Range<usize>>;

    /**
     * Stops the implicit suspend check of the current thread from faulting
     * again. Called on the trapped thread, after its context is restored.
     */
    fn remove_suspend_trigger(&self);
}

//-----------------------------------------------------------------------------

/** The runtime-synthesized conditions that a trap can represent. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    NullPointer,
    Suspend,
    StackOverflow,
}

/** A trap delivered to the fault manager. */
#[derive(Debug, Clone)]
pub struct Trap<C> {
    pub signal: i32,
    pub code: i32,
    pub fault_address: usize,
    pub context: C,
}

impl<C: Context> Display for Trap<C> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f, "signal {} ({}) at {:#x}, pc {:#x}, sp {:#x}",
            self.signal,
            signal_code_name(self.signal, self.code),
            self.fault_address,
            self.context.pc(),
            self.context.sp(),
        )
    }
}

/** A write of `size` bytes to the stack of the trapped thread. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackWrite {
    pub address: usize,
    pub value: usize,
    pub size: usize,
}

/** At most two [`StackWrite`]s, stored without allocating. */
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StackWrites {
    writes: [Option<StackWrite>; 2],
}

impl StackWrites {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, write: StackWrite) {
        let slot = self.writes.iter_mut().find(|w| w.is_none()).expect("Too many stack writes");
        *slot = Some(write);
    }

    pub fn iter(&self) -> impl Iterator<Item=&StackWrite> {
        self.writes.iter().flatten()
    }

    pub fn is_empty(&self) -> bool { self.writes[0].is_none() }
}

/** The effects of claiming a trap. */
#[derive(Debug, Clone)]
pub struct Redirect<C> {
    pub condition: Condition,
    /** The context with which the trapped thread resumes. */
    pub context: C,
    /** Memory writes to perform before resuming. */
    pub stack_writes: StackWrites,
    /** Whether to call [`ManagedCode::remove_suspend_trigger()`]. */
    pub remove_suspend_trigger: bool,
}

impl<C> Redirect<C> {
    pub fn new(condition: Condition, context: C) -> Self {
        Redirect {condition, context, stack_writes: StackWrites::new(), remove_suspend_trigger: false}
    }
}

#[derive(Debug, Clone)]
pub enum Verdict<C> {
    Rejected,
    Claimed(Redirect<C>),
}

impl<C> Verdict<C> {
    pub fn is_claimed(&self) -> bool { matches!(self, Verdict::Claimed(_)) }

    pub fn condition(&self) -> Option<Condition> {
        match self {
            Verdict::Rejected => None,
            Verdict::Claimed(redirect) => Some(redirect.condition),
        }
    }
}

/** Claims or rejects a trap. */
pub trait FaultHandler<C>: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, trap: &Trap<C>, memory: &dyn TrapMemory, managed: &dyn ManagedCode) -> Verdict<C>;
}

//-----------------------------------------------------------------------------

/** Identifies a [`FaultHandler`] added to a [`FaultManager`]. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

type Handlers<C> = Vec<(HandlerId, Box<dyn FaultHandler<C>>)>;

/**
 * An ordered registry of [`FaultHandler`]s.
 *
 * Handlers for generated code are tried, in the order they were added, for
 * traps whose pc is inside a registered range of generated code. Other
 * handlers are tried afterwards for any trap; they are for diagnostics.
 */
pub struct FaultManager<C> {
    config: RuntimeConfig,
    managed: Arc<dyn ManagedCode>,
    generated_code_handlers: Handlers<C>,
    other_handlers: Handlers<C>,
    next_id: usize,
    code_ranges: CodeRanges,
}

impl<C: Context> FaultManager<C> {
    pub fn new(config: &RuntimeConfig, managed: Arc<dyn ManagedCode>) -> Self {
        FaultManager {
            config: *config,
            managed,
            generated_code_handlers: Vec::new(),
            other_handlers: Vec::new(),
            next_id: 0,
            code_ranges: CodeRanges::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig { &self.config }

    pub fn managed(&self) -> &dyn ManagedCode { &*self.managed }

    /** Appends `handler` to one of the handler lists. */
    pub fn add_handler(&mut self, handler: Box<dyn FaultHandler<C>>, generated_code: bool) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        tracing::debug!(target: "crossing::signals", handler = handler.name(), generated_code, "add_handler");
        if generated_code {
            self.generated_code_handlers.push((id, handler));
        } else {
            self.other_handlers.push((id, handler));
        }
        id
    }

    /** Removes a handler. Panics if `id` is not registered. */
    pub fn remove_handler(&mut self, id: HandlerId) {
        for handlers in [&mut self.generated_code_handlers, &mut self.other_handlers] {
            if let Some(index) = handlers.iter().position(|(i, _)| *i == id) {
                handlers.remove(index);
                return;
            }
        }
        panic!("Fault handler {:?} is not registered", id);
    }

    pub fn add_generated_code_range(&self, start: usize, size: usize) -> Result<(), CodeRangeError> {
        self.code_ranges.add(start, size)
    }

    /** Panics if the range was never added. */
    pub fn remove_generated_code_range(&self, start: usize, size: usize) {
        self.code_ranges.remove(start, size);
    }

    pub fn is_in_generated_code(&self, pc: usize) -> bool {
        self.code_ranges.contains(pc)
    }

    fn try_handlers(&self, handlers: &Handlers<C>, trap: &Trap<C>, memory: &dyn TrapMemory) -> Verdict<C> {
        for (_, handler) in handlers {
            let verdict = handler.classify(trap, memory, &*self.managed);
            if verdict.is_claimed() {
                tracing::debug!(target: "crossing::signals", handler = handler.name(), %trap, "claimed");
                return verdict;
            }
            tracing::trace!(target: "crossing::signals", handler = handler.name(), "rejected");
        }
        Verdict::Rejected
    }

    /**
     * Classifies `trap`. At most one handler claims it.
     *
     * This runs in signal context. It does not allocate, but the `tracing`
     * events it emits reach whatever subscriber is installed; see the
     * [module documentation](self).
     */
    pub fn handle(&self, trap: &Trap<C>, memory: &dyn TrapMemory) -> Verdict<C> {
        tracing::trace!(target: "crossing::signals", %trap, "handle");
        if trap.context.sp() == 0 {
            tracing::debug!(target: "crossing::signals", "Missing SP");
            return Verdict::Rejected;
        }
        if trap.signal == SIGSEGV && trap.code == SEGV_MTEAERR {
            // Asynchronous tag-check faults do not identify an instruction.
            return Verdict::Rejected;
        }
        if self.is_in_generated_code(trap.context.pc()) {
            let verdict = self.try_handlers(&self.generated_code_handlers, trap, memory);
            if verdict.is_claimed() { return verdict; }
        }
        let verdict = self.try_handlers(&self.other_handlers, trap, memory);
        if !verdict.is_claimed() {
            tracing::debug!(target: "crossing::signals", %trap, "unclaimed");
        }
        verdict
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::{HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::location::{ThreadOffset};
    use crate::runtime::{ThreadOffsets, EntryPoints};

    /** A [`TrapMemory`] made of a few byte strings. */
    #[derive(Debug, Default)]
    pub struct FakeMemory {
        pub chunks: HashMap<usize, Vec<u8>>,
    }

    impl FakeMemory {
        pub fn new() -> Self { Self::default() }

        pub fn insert(&mut self, address: usize, bytes: &[u8]) {
            self.chunks.insert(address, bytes.to_vec());
        }

        pub fn insert_word(&mut self, address: usize, value: usize, size: usize) {
            self.insert(address, &value.to_le_bytes()[..size]);
        }
    }

    impl TrapMemory for FakeMemory {
        fn read(&self, address: usize, buffer: &mut [u8]) -> bool {
            for (&start, bytes) in &self.chunks {
                if start <= address && address + buffer.len() <= start + bytes.len() {
                    let offset = address - start;
                    buffer.copy_from_slice(&bytes[offset..][..buffer.len()]);
                    return true;
                }
            }
            false
        }
    }

    /** A [`ManagedCode`] with one method, whose code is `code`. */
    #[derive(Debug)]
    pub struct FakeManaged {
        pub method: usize,
        pub code: Range<usize>,
        pub removed_triggers: AtomicUsize,
    }

    impl FakeManaged {
        pub fn new(method: usize, code: Range<usize>) -> Self {
            FakeManaged {method, code, removed_triggers: AtomicUsize::new(0)}
        }
    }

    impl ManagedCode for FakeManaged {
        fn is_valid_method(&self, method: usize) -> bool { method == self.method }

        fn is_valid_return_pc(&self, _sp: usize, return_pc: usize) -> bool {
            self.code.start < return_pc && return_pc <= self.code.end
        }

        fn code_range(&self, method: usize, pc: usize) -> Option<Range<usize>> {
            (method == self.method && self.code.contains(&pc)).then(|| self.code.clone())
        }

        fn remove_suspend_trigger(&self) {
            self.removed_triggers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn config() -> RuntimeConfig {
        let thread = ThreadOffsets {
            state_and_flags: ThreadOffset(0),
            exception: ThreadOffset(8),
            is_gc_marking: ThreadOffset(16),
            held_mutator_lock: ThreadOffset(24),
            mutator_lock: ThreadOffset(32),
            top_quick_frame: ThreadOffset(40),
            self_: ThreadOffset(48),
            suspend_trigger: ThreadOffset(56),
            deliver_exception: ThreadOffset(64),
        };
        let entry_points = EntryPoints {
            throw_null_pointer_exception: 0x7000_1000,
            throw_stack_overflow_error: 0x7000_2000,
            implicit_suspend: 0x7000_3000,
        };
        RuntimeConfig::new(thread, entry_points)
    }

    #[derive(Debug, Clone, PartialEq)]
    struct ToyContext { pc: usize, sp: usize }

    impl Context for ToyContext {
        fn pc(&self) -> usize { self.pc }
        fn sp(&self) -> usize { self.sp }
        fn set_pc(&mut self, pc: usize) { self.pc = pc; }
        fn set_sp(&mut self, sp: usize) { self.sp = sp; }
    }

    /** Claims every trap at a particular address. */
    struct AddressHandler(usize, Condition);

    impl FaultHandler<ToyContext> for AddressHandler {
        fn name(&self) -> &'static str { "address" }

        fn classify(&self, trap: &Trap<ToyContext>, _: &dyn TrapMemory, _: &dyn ManagedCode) -> Verdict<ToyContext> {
            if trap.fault_address != self.0 { return Verdict::Rejected; }
            let mut context = trap.context.clone();
            context.set_pc(0);
            Verdict::Claimed(Redirect::new(self.1, context))
        }
    }

    fn manager() -> FaultManager<ToyContext> {
        FaultManager::new(&config(), Arc::new(FakeManaged::new(0x100, 0x1000..0x2000)))
    }

    fn trap(pc: usize, sp: usize, fault_address: usize) -> Trap<ToyContext> {
        Trap {signal: SIGSEGV, code: SEGV_MAPERR, fault_address, context: ToyContext {pc, sp}}
    }

    #[test]
    fn names() {
        assert_eq!(signal_code_name(SIGSEGV, SEGV_ACCERR), "SEGV_ACCERR");
        assert_eq!(signal_code_name(SIGSEGV, SEGV_MTESERR), "SEGV_MTESERR");
        assert_eq!(signal_code_name(SIGSEGV, 77), "SEGV_UNKNOWN");
        assert_eq!(signal_code_name(SIGBUS, BUS_OBJERR), "BUS_OBJERR");
        assert_eq!(signal_code_name(SIGBUS, 0), "BUS_UNKNOWN");
        assert_eq!(signal_code_name(SIGILL, 1), "UNKNOWN");
        assert_eq!(
            trap(0x1234, 0x8000, 0x10).to_string(),
            "signal 11 (SEGV_MAPERR) at 0x10, pc 0x1234, sp 0x8000",
        );
    }

    #[test]
    fn stack_writes() {
        let mut writes = StackWrites::new();
        assert!(writes.is_empty());
        writes.push(StackWrite {address: 8, value: 1, size: 8});
        writes.push(StackWrite {address: 16, value: 2, size: 8});
        let values: Vec<usize> = writes.iter().map(|w| w.value).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "Too many")]
    fn too_many_stack_writes() {
        let mut writes = StackWrites::new();
        for _ in 0..3 {
            writes.push(StackWrite {address: 8, value: 1, size: 8});
        }
    }

    #[test]
    fn generated_code_only() {
        let mut m = manager();
        m.add_handler(Box::new(AddressHandler(0x10, Condition::NullPointer)), true);
        let memory = FakeMemory::new();
        // Not in generated code.
        assert!(!m.handle(&trap(0x1234, 0x8000, 0x10), &memory).is_claimed());
        m.add_generated_code_range(0x1000, 0x1000).unwrap();
        let verdict = m.handle(&trap(0x1234, 0x8000, 0x10), &memory);
        assert_eq!(verdict.condition(), Some(Condition::NullPointer));
        assert!(!m.handle(&trap(0x1234, 0x8000, 0x18), &memory).is_claimed());
        m.remove_generated_code_range(0x1000, 0x1000);
        assert!(!m.handle(&trap(0x1234, 0x8000, 0x10), &memory).is_claimed());
    }

    #[test]
    fn order() {
        let mut m = manager();
        m.add_generated_code_range(0x1000, 0x1000).unwrap();
        m.add_handler(Box::new(AddressHandler(0x10, Condition::Suspend)), true);
        let second = m.add_handler(Box::new(AddressHandler(0x10, Condition::NullPointer)), true);
        m.add_handler(Box::new(AddressHandler(0x10, Condition::StackOverflow)), false);
        let memory = FakeMemory::new();
        let in_code = trap(0x1800, 0x8000, 0x10);
        let elsewhere = trap(0x3000, 0x8000, 0x10);
        assert_eq!(m.handle(&in_code, &memory).condition(), Some(Condition::Suspend));
        assert_eq!(m.handle(&elsewhere, &memory).condition(), Some(Condition::StackOverflow));
        m.remove_handler(second);
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn remove_twice() {
        let mut m = manager();
        let id = m.add_handler(Box::new(AddressHandler(0x10, Condition::Suspend)), false);
        m.remove_handler(id);
        m.remove_handler(id);
    }

    #[test]
    fn rejects_without_sp() {
        let mut m = manager();
        m.add_generated_code_range(0x1000, 0x1000).unwrap();
        m.add_handler(Box::new(AddressHandler(0x10, Condition::NullPointer)), true);
        let memory = FakeMemory::new();
        assert!(!m.handle(&trap(0x1800, 0, 0x10), &memory).is_claimed());
        let mut mte = trap(0x1800, 0x8000, 0x10);
        mte.code = SEGV_MTEAERR;
        assert!(!m.handle(&mte, &memory).is_claimed());
    }

    #[test]
    fn fake_memory() {
        let mut memory = FakeMemory::new();
        memory.insert_word(0x100, 0x1234_5678, 4);
        memory.insert(0x200, &[1, 2, 3]);
        assert_eq!(memory.read_u32(0x100), Some(0x1234_5678));
        assert_eq!(memory.read_word(0x100, 4), Some(0x1234_5678));
        assert_eq!(memory.read_u64(0x100), None);
        let mut buffer = [0u8; 2];
        assert!(memory.read(0x201, &mut buffer));
        assert_eq!(buffer, [2, 3]);
        assert!(!memory.read(0x202, &mut buffer));
    }
}
