#![allow(nonstandard_style)] // Closely follow the NT headers here

use crate::error::Error;

pub type NtStatus = u32;

pub const STATUS_SUCCESS: NtStatus = 0x0000_0000;
/// A long jump is in progress. `ExceptionInformation[0]` points at the jump buffer.
pub const STATUS_LONGJUMP: NtStatus = 0x8000_0026;
/// The unwind target wants a consolidation callback. `ExceptionInformation[0]`
/// is the callback.
pub const STATUS_UNWIND_CONSOLIDATE: NtStatus = 0x8000_0029;
pub const STATUS_BREAKPOINT: NtStatus = 0x8000_0003;
pub const STATUS_SINGLE_STEP: NtStatus = 0x8000_0004;
pub const STATUS_NOT_IMPLEMENTED: NtStatus = 0xC000_0002;
pub const STATUS_ACCESS_VIOLATION: NtStatus = 0xC000_0005;
pub const STATUS_INVALID_HANDLE: NtStatus = 0xC000_0008;
pub const STATUS_NONCONTINUABLE_EXCEPTION: NtStatus = 0xC000_0025;
/// A handler returned a disposition that is not legal at that point.
pub const STATUS_INVALID_DISPOSITION: NtStatus = 0xC000_0026;
/// Exception code used for unwinds that were not started by an exception.
pub const STATUS_UNWIND: NtStatus = 0xC000_0027;
/// An establisher frame was outside the stack or misaligned.
pub const STATUS_BAD_STACK: NtStatus = 0xC000_0028;
/// The walk passed the requested end frame without reaching it.
pub const STATUS_INVALID_UNWIND_TARGET: NtStatus = 0xC000_0029;
pub const STATUS_UNHANDLED_EXCEPTION: NtStatus = 0xC000_0144;

pub const EXCEPTION_BREAKPOINT: NtStatus = STATUS_BREAKPOINT;
pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// What a language handler tells the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionDisposition {
    /// Resume at the faulting context. Not legal for noncontinuable exceptions
    /// or while unwinding.
    ContinueExecution = 0,
    /// Not interested, go on with the next frame.
    ContinueSearch = 1,
    /// The handler ran into an exception raised by a handler further down.
    NestedException = 2,
    /// A nested unwind went past the frame the outer walk is standing on. The
    /// dispatcher context has been updated with the state to continue from.
    CollidedUnwind = 3,
}

impl TryFrom<u32> for ExceptionDisposition {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self, Error> {
        Ok(match raw {
            0 => ExceptionDisposition::ContinueExecution,
            1 => ExceptionDisposition::ContinueSearch,
            2 => ExceptionDisposition::NestedException,
            3 => ExceptionDisposition::CollidedUnwind,
            _ => return Err(Error::InvalidDisposition(raw)),
        })
    }
}

/// `HandlerAddress` value in a scope record that means "no filter, always handle".
pub const EXCEPTION_EXECUTE_HANDLER: i32 = 1;
pub const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
pub const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;

/// The verdict of an `__except` filter expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FilterVerdict {
    /// Accept: unwind to this frame and run the `__except` block.
    ExecuteHandler = EXCEPTION_EXECUTE_HANDLER,
    /// Reject: try the next scope or frame.
    ContinueSearch = EXCEPTION_CONTINUE_SEARCH,
    /// Resume at the faulting context without unwinding.
    ContinueExecution = EXCEPTION_CONTINUE_EXECUTION,
}

impl FilterVerdict {
    /// Anything that is neither "continue search" nor "continue execution"
    /// accepts the exception.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            EXCEPTION_CONTINUE_SEARCH => FilterVerdict::ContinueSearch,
            EXCEPTION_CONTINUE_EXECUTION => FilterVerdict::ContinueExecution,
            _ => FilterVerdict::ExecuteHandler,
        }
    }
}

/// Handler-type selection for `virtual_unwind`, matched against the unwind
/// info flags.
pub const UNW_FLAG_NHANDLER: u8 = 0x0;
pub const UNW_FLAG_EHANDLER: u8 = 0x1;
pub const UNW_FLAG_UHANDLER: u8 = 0x2;
pub const UNW_FLAG_CHAININFO: u8 = 0x4;
