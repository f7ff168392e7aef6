//! `RtlCaptureStackBackTrace`.

use alloc::vec::Vec;

use super::dispatcher::{lookup_frame, DispatcherContext};
use super::function_table::UnwindHistoryTable;
use crate::context::Context64;
use crate::env::{Memory, ModuleRegistry, ThreadControl, ThreadEnvironment};
use crate::status::UNW_FLAG_NHANDLER;
use crate::Addr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackTrace {
    /// Return addresses, innermost first.
    pub frames: Vec<u64>,
    /// Sum of the addresses, truncated. Identical traces hash identically.
    pub hash: u32,
}

/// Collects up to `count` return addresses of the calling thread, after
/// skipping the innermost `skip`. Callers count frames in a `u16`, so never
/// more than `u16::MAX` are collected.
#[instrument(level = "debug", skip(env))]
pub fn capture_stack_back_trace<E>(env: &mut E, skip: u32, count: u32) -> BackTrace
where
    E: Memory + ModuleRegistry + ThreadEnvironment + ThreadControl<Context64> + ?Sized,
{
    let count = count.min(u32::from(u16::MAX));
    let limits = env.stack_limits();
    let mut context = env.capture();
    let mut dispatch = DispatcherContext::new(0, &context);
    let mut history = UnwindHistoryTable::new();
    let mut back_trace = BackTrace::default();
    let mut seen = 0u32;

    while back_trace.frames.len() < count as usize {
        let pc = context.rip;
        if pc == 0 {
            break;
        }
        if seen >= skip {
            back_trace.frames.push(pc);
            back_trace.hash = back_trace.hash.wrapping_add(pc as u32);
        }
        seen += 1;

        if !limits.contains(context.rsp()) || context.rsp() == limits.base {
            break;
        }
        if let Err(err) = lookup_frame(
            &*env,
            UNW_FLAG_NHANDLER,
            &mut dispatch,
            &mut context,
            Some(&mut history),
        ) {
            trace!(%err, pc = ?Addr(pc), "stopping back trace");
            break;
        }
    }
    back_trace
}
