//! The i386 `RtlUnwind`.

use super::chain::{Phase, RegistrationChain, RegistrationRecord};
use super::raise::{nested_disposition, raise_status};
use crate::env::Platform32;
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::status::{
    ExceptionDisposition, STATUS_BAD_STACK, STATUS_INVALID_DISPOSITION,
    STATUS_INVALID_UNWIND_TARGET,
};
use crate::Addr;

/// Calls the routine of every record above `end_frame` with the unwinding
/// flag set and unlinks it, then continues the caller with `retval` in
/// `eax`.
///
/// An `end_frame` of zero unwinds the whole chain. A `target_ip` of zero
/// continues right after the call, as `RtlUnwind` does.
pub fn rtl_unwind<E: Platform32 + ?Sized>(
    env: &mut E,
    end_frame: u32,
    target_ip: u32,
    record: Option<&mut ExceptionRecord>,
    retval: u32,
    chain: &mut RegistrationChain,
) -> ! {
    let span = debug_span!(
        "rtl_unwind",
        end_frame = ?Addr(u64::from(end_frame)),
        target_ip = ?Addr(u64::from(target_ip))
    );
    let mut entered = span.enter();
    let mut context = env.capture();
    context.eax = retval;

    let mut own_record;
    let record = match record {
        Some(record) => record,
        None => {
            own_record = ExceptionRecord::unwind(u64::from(context.eip));
            &mut own_record
        }
    };
    record.flags |= ExceptionFlags::UNWINDING;
    if end_frame == 0 {
        record.flags |= ExceptionFlags::EXIT_UNWIND;
    }
    debug!(code = ?Addr(u64::from(record.code)), flags = ?record.flags, "unwinding");

    let limits = env.stack_limits();

    while let Some(index) = chain.len().checked_sub(1) {
        let Some(entry) = chain.get(index) else {
            break;
        };

        let mut dispatcher = 0u32;
        let ret = match entry {
            RegistrationRecord::Guest { frame, routine } => {
                if frame == end_frame {
                    break;
                }
                if end_frame != 0 && frame > end_frame {
                    warn!(frame = ?Addr(u64::from(frame)), "end frame is not on the chain");
                    drop(entered);
                    raise_status(env, STATUS_INVALID_UNWIND_TARGET, chain);
                }
                if !limits.is_valid_frame32(frame) {
                    debug!(frame = ?Addr(u64::from(frame)), "invalid frame");
                    drop(entered);
                    raise_status(env, STATUS_BAD_STACK, chain);
                }

                debug!(routine = ?Addr(u64::from(routine)), frame = ?Addr(u64::from(frame)), "calling handler");
                let ret = {
                    let mut guard = chain.push(RegistrationRecord::Nested {
                        during: Phase::Unwind,
                        prev: frame,
                    });
                    drop(entered);
                    let ret = env.call_exception_routine(
                        routine,
                        record,
                        frame,
                        &mut context,
                        &mut dispatcher,
                        &mut guard,
                    );
                    entered = span.enter();
                    ret
                };
                debug!(ret, "handler returned");
                ret
            }
            RegistrationRecord::Nested { during, prev } => {
                nested_disposition(during, record.flags, prev, &mut dispatcher) as u32
            }
        };

        match ExceptionDisposition::try_from(ret) {
            Ok(ExceptionDisposition::ContinueSearch) => chain.unlink(index),
            Ok(ExceptionDisposition::CollidedUnwind) => match chain.position(dispatcher) {
                // the outer unwind already runs that frame's handler, skip past it
                Some(outer) => {
                    trace!(frame = ?Addr(u64::from(dispatcher)), "collided unwind");
                    chain.unlink(outer);
                }
                None => {
                    warn!(frame = ?Addr(u64::from(dispatcher)), "collided with a frame not on the chain");
                    chain.unlink(index);
                }
            },
            _ => {
                warn!(ret, "unwind handler returned an invalid disposition");
                drop(entered);
                raise_status(env, STATUS_INVALID_DISPOSITION, chain);
            }
        }
    }

    if target_ip != 0 {
        context.eip = target_ip;
    }
    debug!(eip = ?Addr(u64::from(context.eip)), "all done, continuing");
    // the restore never returns, the guard would never exit the span
    drop(entered);
    env.restore(&context)
}
