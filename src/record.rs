//! The exception record handed to every handler.

use core::fmt;

use crate::context::Context64;
use crate::status::{NtStatus, EXCEPTION_MAXIMUM_PARAMETERS, STATUS_UNWIND};
use crate::Addr;

bitflags::bitflags! {
    /// `ExceptionFlags`. Bits only ever accumulate during a pass, the one
    /// exception being [`ExceptionFlags::COLLIDED_UNWIND`].
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExceptionFlags: u32 {
        const NONCONTINUABLE = 0x01;
        const UNWINDING = 0x02;
        const EXIT_UNWIND = 0x04;
        const STACK_INVALID = 0x08;
        const NESTED_CALL = 0x10;
        const TARGET_UNWIND = 0x20;
        const COLLIDED_UNWIND = 0x40;
    }
}

impl ExceptionFlags {
    /// Set while handlers are being called for cleanup rather than for a search.
    pub fn is_unwinding(self) -> bool {
        self.intersects(ExceptionFlags::UNWINDING | ExceptionFlags::EXIT_UNWIND)
    }
}

/// `EXCEPTION_RECORD64`. The same layout is used for 32-bit guests, the native
/// i386 glue narrows it at the call boundary.
#[derive(Clone, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionRecord {
    pub code: NtStatus,
    pub flags: ExceptionFlags,
    /// Guest address of the record this one was raised from, or zero.
    pub nested: u64,
    pub address: u64,
    pub parameter_count: u32,
    pub information: [u64; EXCEPTION_MAXIMUM_PARAMETERS],
}

impl ExceptionRecord {
    pub fn new(code: NtStatus, flags: ExceptionFlags, address: u64) -> Self {
        Self {
            code,
            flags,
            nested: 0,
            address,
            parameter_count: 0,
            information: [0; EXCEPTION_MAXIMUM_PARAMETERS],
        }
    }

    /// The record an unwind builds when it was not given one.
    pub fn unwind(address: u64) -> Self {
        Self::new(STATUS_UNWIND, ExceptionFlags::empty(), address)
    }

    pub fn with_parameters(mut self, parameters: &[u64]) -> Self {
        let n = parameters.len().min(EXCEPTION_MAXIMUM_PARAMETERS);
        self.information[..n].copy_from_slice(&parameters[..n]);
        self.parameter_count = n as u32;
        self
    }

    pub fn parameters(&self) -> &[u64] {
        let n = (self.parameter_count as usize).min(EXCEPTION_MAXIMUM_PARAMETERS);
        &self.information[..n]
    }

    /// The first parameter, when there is one.
    pub fn first_parameter(&self) -> Option<u64> {
        self.parameters().first().copied()
    }
}

impl fmt::Debug for ExceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionRecord")
            .field("code", &format_args!("{:#010x}", self.code))
            .field("flags", &self.flags)
            .field("nested", &Addr(self.nested))
            .field("address", &Addr(self.address))
            .field("parameters", &self.parameters())
            .finish()
    }
}

/// `EXCEPTION_POINTERS`, what a filter expression gets to look at.
#[derive(Debug)]
pub struct ExceptionPointers<'a> {
    pub record: &'a mut ExceptionRecord,
    pub context: &'a mut Context64,
}
