/** Represents the address of an instruction that jumps to a [`Label`]. */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Patch(usize);

impl Patch {
    /** The address is expressed as a byte offset into the compiled code. */
    pub fn new(address: usize) -> Self { Patch(address) }

    pub fn address(&self) -> usize { self.0 }
}

//-----------------------------------------------------------------------------

/**
 * Represents a possibly unknown control-flow target, and accumulates the
 * instructions that jump to it while it is unknown.
 *
 * A `Label` is created by the caller of a macro assembler, passed to the
 * operations that branch to slow paths, and eventually bound to a code
 * position with `MacroAssembler::bind()`. Branches emitted after binding
 * are assembled with the correct displacement straight away; branches
 * emitted before binding are remembered as [`Patch`]es and fixed up when the
 * `Label` is bound.
 */
#[derive(Debug)]
pub struct Label {
    target: Option<usize>,
    patches: Vec<Patch>,
}

impl Label {
    /** Constructs an unused `Label` with an unknown target address. */
    pub fn new() -> Self {
        Label {target: None, patches: Vec::new()}
    }

    /**
     * Returns the target address of this `Label`, if known. The address is
     * expressed as a byte offset into the compiled code.
     */
    pub fn target(&self) -> Option<usize> { self.target }

    /** Tests whether `self` has a known target address. */
    pub fn is_defined(&self) -> bool {
        self.target().is_some()
    }

    /**
     * Calls `emit` to assemble a control-flow instruction targeting `self`.
     * `emit` receives the target address, if known, and returns the
     * [`Patch`] of the instruction it assembled. The `Patch` is remembered
     * if the target is not yet known.
     */
    pub fn branch(&mut self, emit: impl FnOnce(Option<usize>) -> Patch) {
        let patch = emit(self.target);
        if !self.is_defined() {
            self.patches.push(patch);
        }
    }

    /** Returns and forgets all the instructions that jump to `self`. */
    pub fn drain(&mut self) -> impl Iterator<Item=Patch> + '_ {
        self.patches.drain(..)
    }
}

impl Default for Label {
    fn default() -> Self { Label::new() }
}

/**
 * Defines `label`, which must not previously have been defined, and returns
 * the instructions that need to be patched to jump to `target`.
 */
pub fn define(label: &mut Label, target: usize) -> Vec<Patch> {
    assert!(!label.is_defined(), "Label bound twice");
    label.target = Some(target);
    label.drain().collect()
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn forward() {
        let mut label = Label::new();
        label.branch(|target| { assert_eq!(target, None); Patch::new(4) });
        label.branch(|target| { assert_eq!(target, None); Patch::new(12) });
        assert_eq!(label.patches.len(), 2);
        let patches = define(&mut label, 20);
        assert_eq!(patches, vec![Patch::new(4), Patch::new(12)]);
        assert!(label.patches.is_empty());
        assert_eq!(label.target(), Some(20));
    }

    #[test]
    fn backward() {
        let mut label = Label::new();
        assert!(define(&mut label, 8).is_empty());
        label.branch(|target| { assert_eq!(target, Some(8)); Patch::new(16) });
        assert!(label.patches.is_empty());
    }

    #[test]
    #[should_panic]
    fn twice() {
        let mut label = Label::new();
        define(&mut label, 0);
        define(&mut label, 4);
    }
}
