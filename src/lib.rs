//! Structured exception handling for guest Windows code: CPU context capture and
//! restore, the x86-64 unwind-info interpreter, function-table lookup, the two
//! frame walkers (table driven on x86-64, registration chain on i386), the
//! language-handler dispatcher and the raise/unwind entry points.
//!
//! The core never touches memory or calls guest code directly. Everything goes
//! through the collaborator traits in [`env`], implemented for real execution in
//! `native` and for a simulated guest in `sim`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

use core::fmt;

mod cursor;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86")))]
mod stdext;

pub mod error;
pub mod record;
pub mod stack;
pub mod status;

pub mod context;
pub mod env;

pub mod amd64;
pub mod dwarf;
pub mod i386;

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86")))]
pub mod native;

#[cfg(any(test, feature = "std"))]
pub mod sim;

#[cfg(test)]
mod testing;

pub use context::{Context32, Context64, CpuContext};
pub use error::{Error, Result};
pub use record::{ExceptionFlags, ExceptionPointers, ExceptionRecord};
pub use stack::StackLimits;
pub use status::{ExceptionDisposition, FilterVerdict, NtStatus};

/// A guest address. Only exists to print as hex in traces.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
