//! `NtRaiseException` and the search phase.

use alloc::string::String;

use super::dispatcher::{call_handler, lookup_frame, resync_collided, DispatcherContext};
use super::function_table::UnwindHistoryTable;
use crate::context::Context64;
use crate::env::{Platform64, ThreadHandle};
use crate::i386::raise::set_context_thread;
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::stack::FrameCheck;
use crate::status::{
    ExceptionDisposition, NtStatus, EXCEPTION_BREAKPOINT, STATUS_INVALID_DISPOSITION,
    STATUS_NONCONTINUABLE_EXCEPTION, STATUS_SUCCESS, STATUS_UNHANDLED_EXCEPTION,
    UNW_FLAG_EHANDLER,
};
use crate::Addr;

/// Walks the stack from `orig`, offering the exception to every frame's
/// exception handler.
///
/// Handlers see `orig` as their context record, so a handler continuing
/// execution can change where it continues. Returns `STATUS_SUCCESS` if one
/// did, `STATUS_UNHANDLED_EXCEPTION` if the walk ran off the stack.
///
/// Handlers run outside of the walk's span, they may never come back.
pub fn call_stack_handlers<E: Platform64 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    orig: &mut Context64,
) -> NtStatus {
    let span = debug_span!("call_stack_handlers", code = ?Addr(u64::from(record.code)));
    let mut entered = span.enter();
    let limits = env.stack_limits();
    let signal_stack = env.signal_stack();
    let mut history = UnwindHistoryTable::new();
    let mut context = orig.clone();
    let mut dispatch = DispatcherContext::new(0, &context);

    'walk: loop {
        if let Err(err) = lookup_frame(
            &*env,
            UNW_FLAG_EHANDLER,
            &mut dispatch,
            &mut context,
            Some(&mut history),
        ) {
            debug!(%err, pc = ?Addr(dispatch.control_pc), "cannot unwind frame");
            record.flags |= ExceptionFlags::STACK_INVALID;
            break;
        }

        loop {
            let frame = dispatch.establisher_frame;
            if frame == 0 {
                break 'walk;
            }
            match limits.check_frame64(frame, signal_stack) {
                FrameCheck::Valid => {}
                FrameCheck::OnSignalStack => continue 'walk,
                FrameCheck::Invalid => {
                    record.flags |= ExceptionFlags::STACK_INVALID;
                    break 'walk;
                }
            }

            if dispatch.handler().is_some() {
                dispatch.context = context.clone();
                drop(entered);
                let ret = call_handler(env, record, &mut dispatch, orig);
                entered = span.enter();
                match ExceptionDisposition::try_from(ret) {
                    Ok(ExceptionDisposition::ContinueExecution) => {
                        if record.flags.contains(ExceptionFlags::NONCONTINUABLE) {
                            return STATUS_NONCONTINUABLE_EXCEPTION;
                        }
                        return STATUS_SUCCESS;
                    }
                    Ok(ExceptionDisposition::ContinueSearch) => {}
                    Ok(ExceptionDisposition::NestedException) => {
                        debug!("nested exception");
                    }
                    Ok(ExceptionDisposition::CollidedUnwind) => {
                        match resync_collided(&*env, &dispatch) {
                            Ok(resynced) => context = resynced,
                            Err(err) => {
                                debug!(%err, "cannot unwind collided frame");
                                record.flags |= ExceptionFlags::STACK_INVALID;
                                break 'walk;
                            }
                        }
                        continue;
                    }
                    Err(err) => {
                        warn!(%err, "handler returned an invalid disposition");
                        return STATUS_INVALID_DISPOSITION;
                    }
                }
            }

            if context.rsp() == limits.base {
                break 'walk;
            }
            break;
        }
    }
    STATUS_UNHANDLED_EXCEPTION
}

/// `NtRaiseException`.
///
/// Only returns if the search failed with a status other than "unhandled",
/// or if the context to continue at cannot be installed. Unhandled
/// exceptions terminate the process with the exception code.
pub fn raise_exception<E: Platform64 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    context: &mut Context64,
    first_chance: bool,
) -> NtStatus {
    debug!(
        code = ?Addr(u64::from(record.code)),
        address = ?Addr(record.address),
        first_chance,
        "raising exception"
    );
    if first_chance {
        if record.code == EXCEPTION_BREAKPOINT {
            context.rip = context.rip.wrapping_sub(1);
        }

        match call_stack_handlers(env, record, context) {
            STATUS_SUCCESS => return set_context_thread(env, ThreadHandle::CURRENT, context),
            STATUS_UNHANDLED_EXCEPTION => {}
            status => return status,
        }
    }

    report_last_chance(record, env.symbolize(record.address));
    env.terminate(record.code)
}

/// The diagnostic printed before an unhandled exception ends the process.
pub(crate) fn report_last_chance(record: &ExceptionRecord, symbol: Option<String>) {
    if record.flags.contains(ExceptionFlags::STACK_INVALID) {
        error!("exception frame is not in stack limits, unable to dispatch exception");
    } else if record.code == STATUS_NONCONTINUABLE_EXCEPTION {
        error!("process attempted to continue execution after noncontinuable exception");
    } else {
        error!(
            code = ?Addr(u64::from(record.code)),
            flags = ?record.flags,
            address = ?Addr(record.address),
            symbol = symbol.as_deref().unwrap_or("?"),
            "unhandled exception"
        );
    }
}

/// `RtlRaiseException`: raises `record` from the caller's context.
pub fn rtl_raise_exception<E: Platform64 + ?Sized>(env: &mut E, record: &mut ExceptionRecord) -> ! {
    let mut context = env.capture();
    record.address = context.rip;
    let status = raise_exception(env, record, &mut context, true);
    raise_status(env, status, None)
}

/// `RtlRaiseStatus`: raises a noncontinuable exception with code `status`.
///
/// If the raise comes back the process terminates with the returned status.
pub fn raise_status<E: Platform64 + ?Sized>(
    env: &mut E,
    status: NtStatus,
    nested: Option<u64>,
) -> ! {
    let mut context = env.capture();
    let mut record = ExceptionRecord::new(status, ExceptionFlags::NONCONTINUABLE, context.rip);
    record.nested = nested.unwrap_or(0);
    debug!(status = ?Addr(u64::from(status)), "raising status");

    let ret = raise_exception(env, &mut record, &mut context, true);
    error!(status = ?Addr(u64::from(ret)), "raised status came back");
    env.terminate(ret)
}

/// Entry for faults delivered by the host: dispatches a copy of `record` and
/// `context` first chance.
pub fn dispatch_fault<E: Platform64 + ?Sized>(
    env: &mut E,
    record: &ExceptionRecord,
    context: &Context64,
) -> NtStatus {
    let mut record = record.clone();
    let mut context = context.clone();
    raise_exception(env, &mut record, &mut context, true)
}
