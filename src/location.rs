//! Architecture-neutral descriptions of where a value lives.
//!
//! A [`Location`] is a small tagged value. Each target defines its own
//! register types through [`Registers`], and every byte offset is explicit:
//! stack slots are [`FrameOffset`]s from the stack pointer, and thread-block
//! fields are [`ThreadOffset`]s from the thread base.

use std::fmt::{Debug};
use std::hash::{Hash};

/** The register universe of one target. */
pub trait Registers: Debug + Copy + Eq + 'static {
    /** General-purpose registers. */
    type Core: Debug + Copy + Eq + Hash;

    /** Floating-point registers that can be loaded and stored directly. */
    type Float: Debug + Copy + Eq + Hash;

    /**
     * Floating-point registers that cannot be moved directly to or from a
     * `Float` register. Targets without such registers use an uninhabited
     * type.
     */
    type WideFloat: Debug + Copy + Eq + Hash;
}

/** The register type of a kind that a target does not have. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NoRegister {}

//-----------------------------------------------------------------------------

/** A byte offset from the current stack pointer. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameOffset(pub i32);

impl FrameOffset {
    pub fn plus(self, delta: i32) -> Self { FrameOffset(self.0 + delta) }
}

/** A byte offset from the base of the per-thread control block. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadOffset(pub i32);

impl ThreadOffset {
    pub fn plus(self, delta: i32) -> Self { ThreadOffset(self.0 + delta) }
}

//-----------------------------------------------------------------------------

/**
 * An abstract storage location.
 *
 * The tag determines which accessor is valid. Calling the wrong accessor is
 * a bug in the code generator, and panics.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Location<R: Registers> {
    /** No location, e.g. the return value of a `void` function. */
    None,
    Core(R::Core),
    /** Two core registers holding the low and high halves of a value. */
    Pair(R::Core, R::Core),
    Float(R::Float),
    WideFloat(R::WideFloat),
    Stack(FrameOffset),
}

impl<R: Registers> Location<R> {
    pub fn is_none(&self) -> bool { matches!(self, Location::None) }

    pub fn is_stack(&self) -> bool { matches!(self, Location::Stack(_)) }

    /** Tests whether `self` is any kind of register. */
    pub fn is_register(&self) -> bool {
        !matches!(self, Location::None | Location::Stack(_))
    }

    pub fn core(self) -> R::Core {
        match self {
            Location::Core(r) => r,
            _ => panic!("{:?} is not a core register", self),
        }
    }

    pub fn pair(self) -> (R::Core, R::Core) {
        match self {
            Location::Pair(low, high) => (low, high),
            _ => panic!("{:?} is not a register pair", self),
        }
    }

    pub fn float(self) -> R::Float {
        match self {
            Location::Float(r) => r,
            _ => panic!("{:?} is not a float register", self),
        }
    }

    pub fn wide_float(self) -> R::WideFloat {
        match self {
            Location::WideFloat(r) => r,
            _ => panic!("{:?} is not a wide float register", self),
        }
    }

    pub fn stack(self) -> FrameOffset {
        match self {
            Location::Stack(offset) => offset,
            _ => panic!("{:?} is not a stack slot", self),
        }
    }

    /** Tests whether `self` uses the core register `r`. */
    pub fn uses_core(self, r: R::Core) -> bool {
        match self {
            Location::Core(x) => x == r,
            Location::Pair(low, high) => low == r || high == r,
            _ => false,
        }
    }

    /** Tests whether `self` and `other` share any register. */
    pub fn overlaps(self, other: Self) -> bool {
        match other {
            Location::Core(r) => self.uses_core(r),
            Location::Pair(low, high) => self.uses_core(low) || self.uses_core(high),
            Location::Float(_) | Location::WideFloat(_) => self == other,
            Location::None | Location::Stack(_) => false,
        }
    }
}

//-----------------------------------------------------------------------------

/** A [`Location`] together with the size in bytes of the value it holds. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArgumentLocation<R: Registers> {
    pub location: Location<R>,
    pub size: usize,
}

impl<R: Registers> ArgumentLocation<R> {
    pub fn new(location: Location<R>, size: usize) -> Self {
        ArgumentLocation {location, size}
    }

    pub fn core(r: R::Core, size: usize) -> Self {
        Self::new(Location::Core(r), size)
    }

    pub fn float(r: R::Float, size: usize) -> Self {
        Self::new(Location::Float(r), size)
    }

    pub fn stack(offset: i32, size: usize) -> Self {
        Self::new(Location::Stack(FrameOffset(offset)), size)
    }

    pub fn is_register(&self) -> bool { self.location.is_register() }
}

//-----------------------------------------------------------------------------
