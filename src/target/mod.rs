//! The instruction sets for which call-boundary stubs can be generated.
//!
//! Every target is compiled on every host, so that stubs can be generated
//! and tested anywhere. [`Native`] is the one the host runs.

mod traits;
pub use traits::{Target};

pub mod x86;
pub mod x86_64;
pub mod aarch64;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type Native = x86_64::Target;
    } else if #[cfg(target_arch = "x86")] {
        pub type Native = x86::Target;
    } else if #[cfg(target_arch = "aarch64")] {
        pub type Native = aarch64::Target;
    }
}

//-----------------------------------------------------------------------------
