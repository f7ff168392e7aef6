//! Calls into i386 guest code running in this process.

use core::mem;

use super::NativePlatform;
use crate::context::{Context32, NativeContext};
use crate::env::{Dispatch32, ThreadControl, ThreadHandle};
use crate::i386::chain::RegistrationChain;
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::status::{NtStatus, EXCEPTION_MAXIMUM_PARAMETERS, STATUS_NOT_IMPLEMENTED};
use crate::Addr;

/// `EXCEPTION_RECORD` of a 32-bit guest.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionRecord32 {
    pub code: u32,
    pub flags: u32,
    pub nested: u32,
    pub address: u32,
    pub parameter_count: u32,
    pub information: [u32; EXCEPTION_MAXIMUM_PARAMETERS],
}

const _: () = assert!(mem::size_of::<ExceptionRecord32>() == 0x50);

impl From<&ExceptionRecord> for ExceptionRecord32 {
    fn from(record: &ExceptionRecord) -> Self {
        let mut information = [0; EXCEPTION_MAXIMUM_PARAMETERS];
        for (narrow, &wide) in information.iter_mut().zip(&record.information) {
            *narrow = wide as u32;
        }
        Self {
            code: record.code,
            flags: record.flags.bits(),
            nested: record.nested as u32,
            address: record.address as u32,
            parameter_count: record.parameter_count,
            information,
        }
    }
}

impl ExceptionRecord32 {
    /// Copies back what a routine may change: the flags and the parameters.
    fn write_back(&self, record: &mut ExceptionRecord) {
        record.flags = ExceptionFlags::from_bits_retain(self.flags);
        record.parameter_count = self.parameter_count;
        for (wide, &narrow) in record.information.iter_mut().zip(&self.information) {
            *wide = u64::from(narrow);
        }
    }
}

type ExceptionRoutineFn =
    unsafe extern "stdcall" fn(*mut ExceptionRecord32, u32, *mut Context32, *mut u32) -> u32;

impl ThreadControl<Context32> for NativePlatform {
    #[inline(always)]
    fn capture(&mut self) -> Context32 {
        Context32::capture()
    }

    fn restore(&mut self, context: &Context32) -> ! {
        debug!(eip = ?Addr(u64::from(context.eip)), esp = ?Addr(u64::from(context.esp)), "all done, jumping to");
        // SAFETY: The walkers only restore contexts of frames that are still
        // live on this stack.
        unsafe { context.restore() }
    }

    fn set_remote_context(&mut self, thread: ThreadHandle, context: &Context32) -> NtStatus {
        warn!(?thread, eip = ?Addr(u64::from(context.eip)), "setting the context of another thread is not supported");
        STATUS_NOT_IMPLEMENTED
    }
}

impl Dispatch32 for NativePlatform {
    /// Routines see the record narrowed to the 32-bit layout. Nested
    /// exceptions they raise natively go through their own `fs:[0]` chain,
    /// not through `chain`.
    fn call_exception_routine(
        &mut self,
        routine: u32,
        record: &mut ExceptionRecord,
        frame: u32,
        context: &mut Context32,
        dispatcher: &mut u32,
        chain: &mut RegistrationChain,
    ) -> u32 {
        trace!(depth = chain.len(), "calling exception routine");
        let mut narrow = ExceptionRecord32::from(&*record);
        // SAFETY: `routine` was registered in the chain by guest code.
        let ret = unsafe {
            let routine: ExceptionRoutineFn = mem::transmute(routine as usize);
            routine(&mut narrow, frame, context, dispatcher)
        };
        narrow.write_back(record);
        ret
    }
}
