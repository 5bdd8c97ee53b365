//! Generates the machine-code stubs that sit on the boundary between managed
//! code and native code, and recognizes the hardware traps that managed code
//! raises on purpose.

pub mod error;

pub mod buffer;

pub mod label;

pub mod cfi;

pub mod location;

pub mod runtime;

pub mod moves;

pub mod macro_assembler;

pub mod target;

pub mod fault;
