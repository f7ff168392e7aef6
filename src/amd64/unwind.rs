//! `RtlUnwindEx` and its wrappers.

use super::dispatcher::{call_handler, lookup_frame, resync_collided, DispatcherContext};
use super::function_table::UnwindHistoryTable;
use super::raise::raise_status;
use super::restore::restore_context;
use crate::context::CpuContext;
use crate::env::Platform64;
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::stack::FrameCheck;
use crate::status::{
    ExceptionDisposition, STATUS_BAD_STACK, STATUS_INVALID_DISPOSITION, UNW_FLAG_UHANDLER,
};
use crate::Addr;

/// Unwinds the caller's stack up to and including the frame `end_frame`,
/// running every termination handler on the way, then continues at
/// `target_ip` with `retval` in `rax`.
///
/// An `end_frame` of zero is an exit unwind, it runs the handlers of the
/// whole stack.
pub fn unwind_ex<E: Platform64 + ?Sized>(
    env: &mut E,
    end_frame: u64,
    target_ip: u64,
    record: Option<&mut ExceptionRecord>,
    retval: u64,
    mut history: Option<&mut UnwindHistoryTable>,
) -> ! {
    let span = debug_span!("unwind_ex", end_frame = ?Addr(end_frame), target_ip = ?Addr(target_ip));
    let mut entered = span.enter();
    let mut context = env.capture();
    let mut new_context = context.clone();

    let mut own_record;
    let record = match record {
        Some(record) => record,
        None => {
            own_record = ExceptionRecord::unwind(context.rip);
            &mut own_record
        }
    };
    record.flags |= ExceptionFlags::UNWINDING;
    if end_frame == 0 {
        record.flags |= ExceptionFlags::EXIT_UNWIND;
    }
    debug!(code = ?Addr(u64::from(record.code)), flags = ?record.flags, rip = ?Addr(context.rip), "unwinding");

    let limits = env.stack_limits();
    let signal_stack = env.signal_stack();
    let mut dispatch = DispatcherContext::new(target_ip, &context);
    let mut invalid = false;

    'walk: loop {
        if let Err(err) = lookup_frame(
            &*env,
            UNW_FLAG_UHANDLER,
            &mut dispatch,
            &mut new_context,
            history.as_deref_mut(),
        ) {
            debug!(%err, pc = ?Addr(dispatch.control_pc), "cannot unwind frame");
            invalid = true;
            break;
        }

        loop {
            let frame = dispatch.establisher_frame;
            if frame == 0 {
                break 'walk;
            }
            match limits.check_frame64(frame, signal_stack) {
                FrameCheck::Valid => {}
                FrameCheck::OnSignalStack => {
                    context = new_context.clone();
                    continue 'walk;
                }
                FrameCheck::Invalid => {
                    invalid = true;
                    break 'walk;
                }
            }

            if dispatch.handler().is_some() {
                if end_frame != 0 && frame > end_frame {
                    warn!(frame = ?Addr(frame), end_frame = ?Addr(end_frame), "invalid end frame");
                }
                if frame == end_frame {
                    record.flags |= ExceptionFlags::TARGET_UNWIND;
                }

                dispatch.context = context.clone();
                let mut handler_context = context.clone();
                drop(entered);
                let ret = call_handler(env, record, &mut dispatch, &mut handler_context);
                entered = span.enter();
                match ExceptionDisposition::try_from(ret) {
                    Ok(ExceptionDisposition::ContinueSearch) => {}
                    Ok(ExceptionDisposition::CollidedUnwind) => {
                        context = dispatch.context.clone();
                        match resync_collided(&*env, &dispatch) {
                            Ok(resynced) => new_context = resynced,
                            Err(err) => {
                                debug!(%err, "cannot unwind collided frame");
                                invalid = true;
                                break 'walk;
                            }
                        }
                        record.flags |= ExceptionFlags::COLLIDED_UNWIND;
                        continue;
                    }
                    _ => {
                        warn!(ret, "unwind handler returned an invalid disposition");
                        drop(entered);
                        raise_status(env, STATUS_INVALID_DISPOSITION, None);
                    }
                }
                record.flags.remove(ExceptionFlags::COLLIDED_UNWIND);
            }

            trace!(frame = ?Addr(frame), end_frame = ?Addr(end_frame), "searching for end frame");
            if frame == end_frame {
                break 'walk;
            }
            context = new_context.clone();
            break;
        }
    }

    // a walk that hit an unusable frame cannot reach its end frame, exit
    // unwinds have no end frame and go on to the target anyway
    if invalid {
        record.flags |= ExceptionFlags::STACK_INVALID;
    }
    if invalid && end_frame != 0 {
        drop(entered);
        raise_status(env, STATUS_BAD_STACK, None);
    }

    debug!(target_ip = ?Addr(target_ip), "all done, jumping to target");
    context.set_return_value(retval);
    context.set_instruction_pointer(target_ip);
    // the restore never returns, the guard would never exit the span
    drop(entered);
    restore_context(env, &mut context, Some(record))
}

/// `RtlUnwind`.
pub fn unwind<E: Platform64 + ?Sized>(
    env: &mut E,
    end_frame: u64,
    target_ip: u64,
    record: Option<&mut ExceptionRecord>,
    retval: u64,
) -> ! {
    unwind_ex(env, end_frame, target_ip, record, retval, None)
}

/// `_local_unwind`: runs the termination handlers of the frames up to
/// `frame` and continues at `target_ip`.
pub fn local_unwind<E: Platform64 + ?Sized>(env: &mut E, frame: u64, target_ip: u64) -> ! {
    unwind_ex(env, frame, target_ip, None, 0, None)
}
