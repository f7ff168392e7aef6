use alloc::string::String;
use core::fmt;

use crate::Addr;

/// Decoding or memory access failed. Protocol violations during a walk are not
/// reported through this type, they are flagged on the exception record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Nothing is mapped at the address.
    Unmapped(Addr),
    /// A record ended before all of its declared contents.
    Truncated { what: &'static str, needed: usize, available: usize },
    /// Only version 1 unwind info is understood.
    UnsupportedVersion { version: u8, at: Addr },
    /// A loaded image has unusable headers.
    InvalidImage(String),
    /// A handler returned something that is not an `EXCEPTION_DISPOSITION`.
    InvalidDisposition(u32),
    /// Call frame information or a DWARF expression we cannot interpret.
    Dwarf(String),
    /// A host call the native platform depends on failed.
    Os(String),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unmapped(addr) => write!(f, "no memory mapped at {addr}"),
            Error::Truncated {
                what,
                needed,
                available,
            } => write!(
                f,
                "{what} truncated, needed {needed} bytes but only {available} are there"
            ),
            Error::UnsupportedVersion { version, at } => {
                write!(f, "unknown unwind info version {version} at {at}")
            }
            Error::InvalidImage(msg) => write!(f, "invalid image: {msg}"),
            Error::InvalidDisposition(raw) => write!(f, "invalid handler disposition {raw}"),
            Error::Dwarf(msg) => write!(f, "invalid DWARF: {msg}"),
            Error::Os(msg) => write!(f, "host call failed: {msg}"),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for Error {}
