//! The ntdll entry points, for guest code running in this process.
//!
//! Images have to be registered with [`sehwind_register_image`] once they are
//! mapped, otherwise their frames look like leaf functions.
#![allow(nonstandard_style)]

use std::sync::{PoisonError, RwLock};

use super::{thread_stack_limits, ImageRegistry, NativePlatform, RawDispatcherContext, RawMemory};
use crate::amd64::function_table::{lookup_function_entry, RuntimeFunction};
use crate::amd64::{self, NonvolatilePointers};
use crate::context::{Context64, M128};
use crate::record::ExceptionRecord;
use crate::stack::StackLimits;
use crate::status::{ExceptionDisposition, NtStatus};
use crate::Addr;

static IMAGES: RwLock<ImageRegistry> = RwLock::new(ImageRegistry::new());

/// The calling thread with the images registered so far.
///
/// Entry points that may not return only hold their span while setting up,
/// a guard on an abandoned stack would never exit it.
fn platform() -> NativePlatform {
    let images = IMAGES.read().unwrap_or_else(PoisonError::into_inner).clone();
    let limits = thread_stack_limits().unwrap_or_else(|err| {
        warn!(%err, "cannot get the stack bounds, not validating frames");
        StackLimits {
            base: u64::MAX,
            limit: 0,
        }
    });
    NativePlatform::with_limits(images, limits)
}

/// Registers the image mapped at `base`. Fails if its headers are unusable.
#[unsafe(no_mangle)]
pub extern "C" fn sehwind_register_image(base: u64) -> bool {
    let mut images = IMAGES.write().unwrap_or_else(PoisonError::into_inner);
    match images.register(&RawMemory, base) {
        Ok(_) => true,
        Err(err) => {
            warn!(%err, base = ?Addr(base), "cannot register image");
            false
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn sehwind_unregister_image(base: u64) -> bool {
    let mut images = IMAGES.write().unwrap_or_else(PoisonError::into_inner);
    images.unregister(base).is_some()
}

/// # Safety
/// `record` must be valid or null, `context` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlRestoreContext(context: *mut Context64, record: *mut ExceptionRecord) -> ! {
    let mut platform = info_span!("RtlRestoreContext", ?context, ?record).in_scope(platform);
    // SAFETY: Forwarded to the caller.
    let (context, record) = unsafe { (&mut *context, record.as_mut()) };
    amd64::restore_context(&mut platform, context, record)
}

/// # Safety
/// `record` must be valid or null.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlUnwindEx(
    end_frame: u64,
    target_ip: u64,
    record: *mut ExceptionRecord,
    retval: u64,
    _context: *mut Context64,
    _history: *mut core::ffi::c_void,
) -> ! {
    let mut platform =
        info_span!("RtlUnwindEx", end_frame = ?Addr(end_frame), target_ip = ?Addr(target_ip)).in_scope(platform);
    // SAFETY: Forwarded to the caller.
    let record = unsafe { record.as_mut() };
    amd64::unwind_ex(&mut platform, end_frame, target_ip, record, retval, None)
}

/// # Safety
/// `record` must be valid or null.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlUnwind(
    end_frame: u64,
    target_ip: u64,
    record: *mut ExceptionRecord,
    retval: u64,
) -> ! {
    let mut platform =
        info_span!("RtlUnwind", end_frame = ?Addr(end_frame), target_ip = ?Addr(target_ip)).in_scope(platform);
    // SAFETY: Forwarded to the caller.
    let record = unsafe { record.as_mut() };
    amd64::unwind(&mut platform, end_frame, target_ip, record, retval)
}

#[unsafe(no_mangle)]
pub extern "win64" fn _local_unwind(frame: u64, target_ip: u64) -> ! {
    let mut platform =
        info_span!("_local_unwind", frame = ?Addr(frame), target_ip = ?Addr(target_ip)).in_scope(platform);
    amd64::local_unwind(&mut platform, frame, target_ip)
}

/// `KNONVOLATILE_CONTEXT_POINTERS`.
#[repr(C)]
pub struct RawNonvolatilePointers {
    pub xmm: [*mut M128; 16],
    pub integer: [*mut u64; 16],
}

impl RawNonvolatilePointers {
    fn fill(&mut self, pointers: &NonvolatilePointers) {
        for (raw, slot) in self.integer.iter_mut().zip(pointers.integer) {
            if let Some(slot) = slot {
                *raw = slot as usize as *mut u64;
            }
        }
        for (raw, slot) in self.xmm.iter_mut().zip(pointers.xmm) {
            if let Some(slot) = slot {
                *raw = slot as usize as *mut M128;
            }
        }
    }
}

/// Returns the handler of the requested type, or null.
///
/// # Safety
/// Every pointer must be valid, `pointers` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlVirtualUnwind(
    handler_type: u32,
    image_base: u64,
    pc: u64,
    function: *const RuntimeFunction,
    context: *mut Context64,
    handler_data: *mut u64,
    establisher_frame: *mut u64,
    pointers: *mut RawNonvolatilePointers,
) -> u64 {
    let _span = info_span!("RtlVirtualUnwind", pc = ?Addr(pc)).entered();
    // SAFETY: Forwarded to the caller.
    let (function, context, raw_pointers) = unsafe { (&*function, &mut *context, pointers.as_mut()) };
    let mut recorded = NonvolatilePointers::default();
    let platform = platform();
    let unwound = amd64::virtual_unwind(
        &platform,
        handler_type as u8,
        image_base,
        pc,
        function,
        context,
        Some(&mut recorded),
    );
    if let Some(raw) = raw_pointers {
        raw.fill(&recorded);
    }
    match unwound {
        Ok(unwound) => {
            // SAFETY: Forwarded to the caller.
            unsafe {
                *establisher_frame = unwound.establisher_frame;
                *handler_data = unwound.handler.map_or(0, |handler| handler.data);
            }
            unwound.handler.map_or(0, |handler| handler.address)
        }
        Err(err) => {
            warn!(%err, "virtual unwind failed");
            0
        }
    }
}

/// # Safety
/// `image_base` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlLookupFunctionEntry(
    pc: u64,
    image_base: *mut u64,
    _history: *mut core::ffi::c_void,
) -> u64 {
    let platform = platform();
    match lookup_function_entry(&platform, pc, None) {
        Some(entry) => {
            // SAFETY: Forwarded to the caller.
            unsafe { *image_base = entry.image_base };
            entry.address
        }
        None => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "win64" fn RtlAddFunctionTable(functions: u64, count: u32, base: u64) -> bool {
    amd64::add_function_table(functions, count, base)
}

/// # Safety
/// `record` and `context` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn NtRaiseException(
    record: *mut ExceptionRecord,
    context: *mut Context64,
    first_chance: bool,
) -> NtStatus {
    let mut platform = info_span!("NtRaiseException", ?record, first_chance).in_scope(platform);
    // SAFETY: Forwarded to the caller.
    let (record, context) = unsafe { (&mut *record, &mut *context) };
    amd64::raise_exception(&mut platform, record, context, first_chance)
}

/// # Safety
/// `record` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlRaiseException(record: *mut ExceptionRecord) {
    let mut platform = info_span!("RtlRaiseException", ?record).in_scope(platform);
    // SAFETY: Forwarded to the caller.
    amd64::rtl_raise_exception(&mut platform, unsafe { &mut *record })
}

/// # Safety
/// Every pointer must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn __C_specific_handler(
    record: *mut ExceptionRecord,
    frame: u64,
    context: *mut Context64,
    dispatch: *mut RawDispatcherContext,
) -> ExceptionDisposition {
    let mut platform = platform();
    // SAFETY: Forwarded to the caller.
    let (record, context, raw) = unsafe { (&mut *record, &mut *context, &mut *dispatch) };
    // SAFETY: The dispatcher context comes from a walker, its context record
    // is live.
    let mut loaded = unsafe { raw.load(&platform) };
    let disposition = amd64::c_specific_handler(&mut platform, record, frame, context, &mut loaded);
    raw.scope_index = loaded.scope_index;
    disposition
}

/// Returns how many frames were stored.
///
/// # Safety
/// `buffer` must have room for `count` entries, `hash` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "win64" fn RtlCaptureStackBackTrace(
    skip: u32,
    count: u32,
    buffer: *mut u64,
    hash: *mut u32,
) -> u16 {
    // one more for this function, at most u16::MAX frames come back
    let trace = amd64::capture_stack_back_trace(&mut platform(), skip.saturating_add(1), count);
    // SAFETY: Forwarded to the caller.
    unsafe {
        for (i, &frame) in trace.frames.iter().enumerate() {
            *buffer.add(i) = frame;
        }
        if let Some(hash) = hash.as_mut() {
            *hash = trace.hash;
        }
    }
    trace.frames.len() as u16
}
