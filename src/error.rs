//! Errors that a caller can recover from.
//!
//! Mistakes in the use of a macro assembler are not errors: they are bugs in
//! the code generator, and they panic.

use std::{io};

use thiserror::{Error};

/** Failure to install the process-wide fault manager. */
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("a fault manager is already installed")]
    AlreadyInstalled,
    #[error("sigaction({signal}) failed: {source}")]
    Sigaction { signal: i32, #[source] source: io::Error },
}

/** Failure to register a range of generated code. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum CodeRangeError {
    #[error("the generated-code range table is full ({capacity} entries)")]
    Full { capacity: usize },
    #[error("empty generated-code range at {start:#x}")]
    Empty { start: usize },
}

impl From<CodeRangeError> for io::Error {
    fn from(e: CodeRangeError) -> Self {
        io::Error::new(io::ErrorKind::OutOfMemory, e)
    }
}
