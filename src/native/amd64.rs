//! Calls into x64 guest code running in this process.

use core::arch::global_asm;
use core::{mem, ptr};

use super::NativePlatform;
use crate::amd64::dispatcher::DispatcherContext;
use crate::amd64::function_table::{FunctionEntry, RuntimeFunction};
use crate::context::{Context64, NativeContext};
use crate::env::{Dispatch64, Memory, ThreadControl, ThreadEnvironment, ThreadHandle};
use crate::record::{ExceptionPointers, ExceptionRecord};
use crate::status::{NtStatus, STATUS_NOT_IMPLEMENTED};
use crate::Addr;

/// `DISPATCHER_CONTEXT` as guest handlers see it.
#[derive(Debug)]
#[repr(C)]
pub struct RawDispatcherContext {
    pub control_pc: u64,
    pub image_base: u64,
    pub function_entry: *const RuntimeFunction,
    pub establisher_frame: u64,
    pub target_ip: u64,
    pub context_record: *mut Context64,
    pub language_handler: u64,
    pub handler_data: u64,
    /// We never hand out a history table.
    pub history_table: *mut core::ffi::c_void,
    pub scope_index: u32,
    pub fill0: u32,
}

const _: () = assert!(mem::size_of::<RawDispatcherContext>() == 0x50);

impl RawDispatcherContext {
    fn new(dispatch: &mut DispatcherContext) -> Self {
        Self {
            control_pc: dispatch.control_pc,
            image_base: dispatch.image_base,
            function_entry: dispatch
                .function_entry
                .map_or(ptr::null(), |entry| entry.address as usize as *const RuntimeFunction),
            establisher_frame: dispatch.establisher_frame,
            target_ip: dispatch.target_ip,
            context_record: &mut dispatch.context,
            language_handler: dispatch.language_handler,
            handler_data: dispatch.handler_data,
            history_table: ptr::null_mut(),
            scope_index: dispatch.scope_index,
            fill0: 0,
        }
    }

    /// The dispatcher context a guest handed to one of our handlers.
    ///
    /// # Safety
    /// `context_record` must point to a live [`Context64`].
    #[cfg(feature = "exports")]
    pub(crate) unsafe fn load<M: Memory + ?Sized>(&self, mem: &M) -> DispatcherContext {
        let address = self.function_entry as usize as u64;
        DispatcherContext {
            control_pc: self.control_pc,
            image_base: self.image_base,
            function_entry: entry_at(mem, self.image_base, address),
            establisher_frame: self.establisher_frame,
            target_ip: self.target_ip,
            // SAFETY: Forwarded to the caller.
            context: unsafe { (*self.context_record).clone() },
            language_handler: self.language_handler,
            handler_data: self.handler_data,
            scope_index: self.scope_index,
        }
    }

    /// Copies back what the handler changed. A handler reporting a collided
    /// unwind replaces everything with the state of the frame to continue
    /// from.
    fn write_back<M: Memory + ?Sized>(&self, mem: &M, dispatch: &mut DispatcherContext) {
        dispatch.control_pc = self.control_pc;
        dispatch.image_base = self.image_base;
        dispatch.establisher_frame = self.establisher_frame;
        dispatch.target_ip = self.target_ip;
        dispatch.language_handler = self.language_handler;
        dispatch.handler_data = self.handler_data;
        dispatch.scope_index = self.scope_index;

        let address = self.function_entry as usize as u64;
        if dispatch.function_entry.map(|entry| entry.address) != Some(address) {
            dispatch.function_entry = entry_at(mem, self.image_base, address);
        }
        if !ptr::eq(self.context_record, &dispatch.context) && !self.context_record.is_null() {
            // SAFETY: The handler points us at a context record it owns.
            dispatch.context = unsafe { (*self.context_record).clone() };
        }
    }
}

fn entry_at<M: Memory + ?Sized>(mem: &M, image_base: u64, address: u64) -> Option<FunctionEntry> {
    if address == 0 {
        return None;
    }
    let function = RuntimeFunction::read(mem, address).ok()?;
    Some(FunctionEntry {
        image_base,
        address,
        function,
    })
}

type LanguageHandlerFn = unsafe extern "win64" fn(
    *mut ExceptionRecord,
    u64,
    *mut Context64,
    *mut RawDispatcherContext,
) -> u32;

/// `EXCEPTION_POINTERS`.
#[repr(C)]
struct RawExceptionPointers {
    record: *mut ExceptionRecord,
    context: *mut Context64,
}

type FilterFn = unsafe extern "win64" fn(*mut RawExceptionPointers, u64) -> i32;
type TerminationHandlerFn = unsafe extern "win64" fn(u8, u64);

unsafe extern "win64" {
    /// Calls `callback(record)` on a frame whose CFI unwinds into `context`,
    /// see [`crate::dwarf`]. Returns what the callback returns.
    #[link_name = "sehwind_call_consolidate_callback"]
    pub fn call_consolidate_callback(
        context: *const Context64,
        callback: u64,
        record: *mut ExceptionRecord,
    ) -> u64;
}

// The home slot of the first argument, 0x10(%rbp), keeps the context pointer
// for the escapes.
global_asm!(
    ".pushsection .text.sehwind_call_consolidate_callback,\"ax\",@progbits",
    ".globl sehwind_call_consolidate_callback",
    ".type sehwind_call_consolidate_callback,@function",
    ".p2align 4",
    "sehwind_call_consolidate_callback:",
    ".cfi_startproc",
    "push rbp",
    ".cfi_adjust_cfa_offset 8",
    ".cfi_rel_offset rbp, 0",
    "mov rbp, rsp",
    ".cfi_def_cfa_register rbp",
    "sub rsp, 0x20",
    "mov [rbp+0x10], rcx",
    ".cfi_remember_state",
    ".cfi_escape 0x0f,0x07,0x76,0x10,0x06,0x23,0x98,0x01,0x06",
    ".cfi_escape 0x10,0x03,0x06,0x76,0x10,0x06,0x23,0x90,0x01",
    ".cfi_escape 0x10,0x04,0x06,0x76,0x10,0x06,0x23,0xa8,0x01",
    ".cfi_escape 0x10,0x05,0x06,0x76,0x10,0x06,0x23,0xb0,0x01",
    ".cfi_escape 0x10,0x06,0x06,0x76,0x10,0x06,0x23,0xa0,0x01",
    ".cfi_escape 0x10,0x0c,0x06,0x76,0x10,0x06,0x23,0xd8,0x01",
    ".cfi_escape 0x10,0x0d,0x06,0x76,0x10,0x06,0x23,0xe0,0x01",
    ".cfi_escape 0x10,0x0e,0x06,0x76,0x10,0x06,0x23,0xe8,0x01",
    ".cfi_escape 0x10,0x0f,0x06,0x76,0x10,0x06,0x23,0xf0,0x01",
    ".cfi_escape 0x10,0x10,0x06,0x76,0x10,0x06,0x23,0xf8,0x01",
    ".cfi_escape 0x10,0x17,0x06,0x76,0x10,0x06,0x23,0x80,0x04",
    ".cfi_escape 0x10,0x18,0x06,0x76,0x10,0x06,0x23,0x90,0x04",
    ".cfi_escape 0x10,0x19,0x06,0x76,0x10,0x06,0x23,0xa0,0x04",
    ".cfi_escape 0x10,0x1a,0x06,0x76,0x10,0x06,0x23,0xb0,0x04",
    ".cfi_escape 0x10,0x1b,0x06,0x76,0x10,0x06,0x23,0xc0,0x04",
    ".cfi_escape 0x10,0x1c,0x06,0x76,0x10,0x06,0x23,0xd0,0x04",
    ".cfi_escape 0x10,0x1d,0x06,0x76,0x10,0x06,0x23,0xe0,0x04",
    ".cfi_escape 0x10,0x1e,0x06,0x76,0x10,0x06,0x23,0xf0,0x04",
    ".cfi_escape 0x10,0x1f,0x06,0x76,0x10,0x06,0x23,0x80,0x05",
    ".cfi_escape 0x10,0x20,0x06,0x76,0x10,0x06,0x23,0x90,0x05",
    "mov rcx, r8",
    "call rdx",
    ".cfi_restore_state",
    "mov rsp, rbp",
    ".cfi_def_cfa_register rsp",
    "pop rbp",
    ".cfi_adjust_cfa_offset -8",
    ".cfi_same_value rbp",
    "ret",
    ".cfi_endproc",
    ".size sehwind_call_consolidate_callback, .-sehwind_call_consolidate_callback",
    ".popsection",
);

impl ThreadControl<Context64> for NativePlatform {
    #[inline(always)]
    fn capture(&mut self) -> Context64 {
        Context64::capture()
    }

    fn restore(&mut self, context: &Context64) -> ! {
        debug!(rip = ?Addr(context.rip), rsp = ?Addr(context.rsp()), "all done, jumping to");
        // SAFETY: The walkers only restore contexts of frames that are still
        // live on this stack.
        unsafe { context.restore() }
    }

    fn set_remote_context(&mut self, thread: ThreadHandle, context: &Context64) -> NtStatus {
        warn!(?thread, rip = ?Addr(context.rip), "setting the context of another thread is not supported");
        STATUS_NOT_IMPLEMENTED
    }
}

impl Dispatch64 for NativePlatform {
    fn call_language_handler(
        &mut self,
        handler: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &mut Context64,
        dispatch: &mut DispatcherContext,
    ) -> u32 {
        let mut raw = RawDispatcherContext::new(dispatch);
        // SAFETY: `handler` is a language handler named by the image's
        // unwind info, every pointer lives until it returns.
        let ret = unsafe {
            let handler: LanguageHandlerFn = mem::transmute(handler as usize);
            handler(record, frame, context, &mut raw)
        };
        raw.write_back(&*self, dispatch);
        ret
    }

    fn call_filter(&mut self, filter: u64, pointers: ExceptionPointers<'_>, frame: u64) -> i32 {
        let mut raw = RawExceptionPointers {
            record: pointers.record,
            context: pointers.context,
        };
        // SAFETY: `filter` comes from a scope table of the image.
        unsafe {
            let filter: FilterFn = mem::transmute(filter as usize);
            filter(&mut raw, frame)
        }
    }

    fn call_termination_handler(&mut self, handler: u64, abnormal: bool, frame: u64) {
        // SAFETY: `handler` comes from a scope table of the image.
        unsafe {
            let handler: TerminationHandlerFn = mem::transmute(handler as usize);
            handler(u8::from(abnormal), frame)
        }
    }

    fn call_consolidate_callback(
        &mut self,
        context: &Context64,
        callback: u64,
        record: &mut ExceptionRecord,
    ) -> u64 {
        if !self.stack_limits().contains(context.rsp()) {
            warn!(rsp = ?Addr(context.rsp()), "consolidating to a frame off the stack");
        }
        // SAFETY: `callback` is the consolidation routine the unwind was
        // asked to call, it runs on top of the current stack.
        unsafe { call_consolidate_callback(context, callback, record) }
    }
}
