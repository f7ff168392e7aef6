//! The i386 search phase and `NtRaiseException`.

use super::chain::{Phase, RegistrationChain, RegistrationRecord};
use crate::amd64::raise::report_last_chance;
use crate::context::{Context32, CpuContext};
use crate::env::{Platform32, ThreadControl, ThreadEnvironment, ThreadHandle};
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::status::{
    ExceptionDisposition, NtStatus, EXCEPTION_BREAKPOINT, STATUS_INVALID_DISPOSITION,
    STATUS_NONCONTINUABLE_EXCEPTION, STATUS_SUCCESS, STATUS_UNHANDLED_EXCEPTION,
};
use crate::Addr;

/// What the routine of a nested record answers. A search walk reaching the
/// record of an outer search is a nested exception, an unwind reaching the
/// record of an outer unwind collides with it. Both report the frame whose
/// handler was running in `dispatcher`.
pub(crate) fn nested_disposition(
    during: Phase,
    flags: ExceptionFlags,
    prev: u32,
    dispatcher: &mut u32,
) -> ExceptionDisposition {
    match (during, flags.is_unwinding()) {
        (Phase::Search, false) => {
            *dispatcher = prev;
            ExceptionDisposition::NestedException
        }
        (Phase::Unwind, true) => {
            *dispatcher = prev;
            ExceptionDisposition::CollidedUnwind
        }
        _ => ExceptionDisposition::ContinueSearch,
    }
}

/// Offers the exception to every routine on `chain`, innermost first.
///
/// Each routine runs with a nested record pushed on top of the chain, so an
/// exception it raises is recognized as nested when its walk gets back here.
/// Routines run outside of the walk's span, they may never come back.
pub fn call_stack_handlers<E: Platform32 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    context: &mut Context32,
    chain: &mut RegistrationChain,
) -> NtStatus {
    let span = debug_span!("call_stack_handlers", code = ?Addr(u64::from(record.code)));
    let mut entered = span.enter();
    let limits = env.stack_limits();
    let mut nested_frame = 0u32;
    let mut index = chain.len();

    while index > 0 {
        index -= 1;
        let Some(entry) = chain.get(index) else {
            break;
        };

        let mut dispatcher = 0u32;
        let (frame, ret) = match entry {
            RegistrationRecord::Guest { frame, routine } => {
                if !limits.is_valid_frame32(frame) {
                    debug!(
                        frame = ?Addr(u64::from(frame)),
                        limit = ?Addr(limits.limit),
                        base = ?Addr(limits.base),
                        "invalid frame"
                    );
                    record.flags |= ExceptionFlags::STACK_INVALID;
                    break;
                }
                debug!(routine = ?Addr(u64::from(routine)), frame = ?Addr(u64::from(frame)), "calling handler");
                let ret = {
                    let mut guard = chain.push(RegistrationRecord::Nested {
                        during: Phase::Search,
                        prev: frame,
                    });
                    drop(entered);
                    let ret = env.call_exception_routine(routine, record, frame, context, &mut dispatcher, &mut guard);
                    entered = span.enter();
                    ret
                };
                debug!(ret, "handler returned");
                (Some(frame), ret)
            }
            RegistrationRecord::Nested { during, prev } => {
                let disposition = nested_disposition(during, record.flags, prev, &mut dispatcher);
                trace!(?during, prev = ?Addr(u64::from(prev)), ?disposition, "nested record");
                (None, disposition as u32)
            }
        };

        if frame.is_some_and(|frame| frame == nested_frame) {
            // leaving the frame that raised the nested exception
            nested_frame = 0;
            record.flags.remove(ExceptionFlags::NESTED_CALL);
        }

        match ExceptionDisposition::try_from(ret) {
            Ok(ExceptionDisposition::ContinueExecution) => {
                if record.flags.contains(ExceptionFlags::NONCONTINUABLE) {
                    return STATUS_NONCONTINUABLE_EXCEPTION;
                }
                return STATUS_SUCCESS;
            }
            Ok(ExceptionDisposition::ContinueSearch) => {}
            Ok(ExceptionDisposition::NestedException) => {
                if nested_frame < dispatcher {
                    nested_frame = dispatcher;
                }
                record.flags |= ExceptionFlags::NESTED_CALL;
            }
            Ok(ExceptionDisposition::CollidedUnwind) | Err(_) => {
                warn!(ret, "handler returned an invalid disposition");
                return STATUS_INVALID_DISPOSITION;
            }
        }
        index = index.min(chain.len());
    }
    STATUS_UNHANDLED_EXCEPTION
}

/// First and last chance dispatch. Returns the status of the search unless
/// nothing handled the exception, in which case the process terminates.
pub fn raise_exception<E: Platform32 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    context: &mut Context32,
    first_chance: bool,
    chain: &mut RegistrationChain,
) -> NtStatus {
    debug!(
        code = ?Addr(u64::from(record.code)),
        address = ?Addr(record.address),
        first_chance,
        "raising exception"
    );
    if first_chance {
        if record.code == EXCEPTION_BREAKPOINT {
            context.eip = context.eip.wrapping_sub(1);
        }

        let status = call_stack_handlers(env, record, context, chain);
        if status != STATUS_UNHANDLED_EXCEPTION {
            return status;
        }
    }

    report_last_chance(record, None);
    env.terminate(record.code)
}

/// `NtRaiseException`: continues at `context` if a handler asked for it,
/// otherwise hands back the failed status.
pub fn nt_raise_exception<E: Platform32 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    context: &mut Context32,
    first_chance: bool,
    chain: &mut RegistrationChain,
) -> NtStatus {
    let status = raise_exception(env, record, context, first_chance, chain);
    if status == STATUS_SUCCESS {
        return set_context_thread(env, ThreadHandle::CURRENT, context);
    }
    status
}

/// Raises a noncontinuable exception with code `status`. If the raise comes
/// back the process terminates with the returned status.
pub fn raise_status<E: Platform32 + ?Sized>(
    env: &mut E,
    status: NtStatus,
    chain: &mut RegistrationChain,
) -> ! {
    let mut context = env.capture();
    let mut record = ExceptionRecord::new(
        status,
        ExceptionFlags::NONCONTINUABLE,
        u64::from(context.eip),
    );
    debug!(status = ?Addr(u64::from(status)), "raising status");

    let ret = raise_exception(env, &mut record, &mut context, true, chain);
    error!(status = ?Addr(u64::from(ret)), "raised status came back");
    env.terminate(ret)
}

/// `NtSetContextThread`. On the calling thread this does not return, unless
/// the context lacks the control registers. Other threads are handed to the
/// thread control collaborator.
pub fn set_context_thread<C, E>(env: &mut E, thread: ThreadHandle, context: &C) -> NtStatus
where
    C: CpuContext,
    E: ThreadEnvironment + ThreadControl<C> + ?Sized,
{
    if !env.is_current_thread(thread) {
        debug!(?thread, "setting remote context");
        return env.set_remote_context(thread, context);
    }
    if !context.has_control() {
        warn!(
            flags = ?Addr(u64::from(context.context_flags())),
            "setting a partial context is not supported"
        );
        return STATUS_SUCCESS;
    }
    env.restore(context)
}
