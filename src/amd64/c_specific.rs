//! `__C_specific_handler`, the language handler of `__try` blocks.

use alloc::vec::Vec;

use super::dispatcher::DispatcherContext;
use super::unwind::unwind_ex;
use crate::context::Context64;
use crate::cursor::Cursor;
use crate::env::{Memory, Platform64};
use crate::error::{Error, Result};
use crate::record::{ExceptionFlags, ExceptionPointers, ExceptionRecord};
use crate::status::{ExceptionDisposition, FilterVerdict, EXCEPTION_EXECUTE_HANDLER};
use crate::Addr;

/// One `__try` region. All fields are image relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScopeRecord {
    pub begin: u32,
    pub end: u32,
    /// The filter, `EXCEPTION_EXECUTE_HANDLER` for `__except(1)`, or the
    /// `__finally` block if `jump_target` is zero.
    pub handler: u32,
    /// The `__except` block, zero for `__finally`.
    pub jump_target: u32,
}

impl ScopeRecord {
    pub const SIZE: usize = 16;

    pub fn covers(&self, image_base: u64, pc: u64) -> bool {
        pc >= image_base + u64::from(self.begin) && pc < image_base + u64::from(self.end)
    }

    pub fn is_termination(&self) -> bool {
        self.jump_target == 0
    }
}

/// More than any compiler emits for a single function.
const MAX_SCOPES: u32 = 0x1_0000;

/// `SCOPE_TABLE`: a count followed by that many [`ScopeRecord`]s, innermost
/// regions first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeTable {
    pub records: Vec<ScopeRecord>,
}

impl ScopeTable {
    pub fn read<M: Memory + ?Sized>(mem: &M, addr: u64) -> Result<Self> {
        let count = mem.read_u32(addr)?;
        if count > MAX_SCOPES {
            return Err(Error::InvalidImage(alloc::format!(
                "scope table at {} has {count} entries",
                Addr(addr)
            )));
        }
        let mut bytes = alloc::vec![0; 4 + count as usize * ScopeRecord::SIZE];
        mem.read_bytes(addr, &mut bytes)?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes, "SCOPE_TABLE");
        let count = cursor.read_u32()?;
        let records = (0..count)
            .map(|_| {
                Ok(ScopeRecord {
                    begin: cursor.read_u32()?,
                    end: cursor.read_u32()?,
                    handler: cursor.read_u32()?,
                    jump_target: cursor.read_u32()?,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { records })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.records.len() * ScopeRecord::SIZE);
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for scope in &self.records {
            for field in [scope.begin, scope.end, scope.handler, scope.jump_target] {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        out
    }
}

/// Runs the `__finally` blocks covering the pc while unwinding, evaluates
/// `__except` filters while searching.
///
/// A filter accepting the exception unwinds to its frame and never returns.
/// Filters and `__finally` blocks run outside of the handler's span.
pub fn c_specific_handler<E: Platform64 + ?Sized>(
    env: &mut E,
    record: &mut ExceptionRecord,
    frame: u64,
    context: &mut Context64,
    dispatch: &mut DispatcherContext,
) -> ExceptionDisposition {
    let span = debug_span!("c_specific_handler", frame = ?Addr(frame), pc = ?Addr(dispatch.control_pc));
    let mut entered = span.enter();
    let table = match ScopeTable::read(&*env, dispatch.handler_data) {
        Ok(table) => table,
        Err(err) => {
            warn!(%err, data = ?Addr(dispatch.handler_data), "unreadable scope table");
            return ExceptionDisposition::ContinueSearch;
        }
    };
    let base = dispatch.image_base;
    let pc = dispatch.control_pc;
    let start = dispatch.scope_index as usize;

    if record.flags.is_unwinding() {
        trace!("unwinding");
        for (i, scope) in table.records.iter().enumerate().skip(start) {
            if !scope.covers(base, pc) || !scope.is_termination() {
                continue;
            }
            if record.flags.contains(ExceptionFlags::TARGET_UNWIND)
                && scope.covers(base, dispatch.target_ip)
            {
                break;
            }

            let handler = base + u64::from(scope.handler);
            dispatch.scope_index = i as u32 + 1;
            debug!(handler = ?Addr(handler), frame = ?Addr(frame), "calling __finally");
            drop(entered);
            env.call_termination_handler(handler, true, frame);
            entered = span.enter();
        }
        return ExceptionDisposition::ContinueSearch;
    }

    for scope in table.records.iter().skip(start) {
        if !scope.covers(base, pc) || scope.is_termination() {
            continue;
        }
        if scope.handler != EXCEPTION_EXECUTE_HANDLER as u32 {
            let filter = base + u64::from(scope.handler);
            debug!(filter = ?Addr(filter), frame = ?Addr(frame), "calling filter");
            let pointers = ExceptionPointers {
                record: &mut *record,
                context: &mut *context,
            };
            drop(entered);
            let verdict = FilterVerdict::from_raw(env.call_filter(filter, pointers, frame));
            entered = span.enter();
            debug!(?verdict, "filter returned");
            match verdict {
                FilterVerdict::ExecuteHandler => {}
                FilterVerdict::ContinueSearch => continue,
                FilterVerdict::ContinueExecution => {
                    return ExceptionDisposition::ContinueExecution
                }
            }
        }

        let target = base + u64::from(scope.jump_target);
        debug!(target_ip = ?Addr(target), end_frame = ?Addr(frame), "unwinding to target");
        // the __except block reads the exception code from rax
        let code = u64::from(record.code);
        drop(entered);
        unwind_ex(env, frame, target, Some(record), code, None);
    }
    ExceptionDisposition::ContinueSearch
}

#[cfg(test)]
mod tests;
