//! `RtlRestoreContext`, the last step of every unwind.

use core::mem::size_of;

use super::raise::raise_status;
use crate::context::{Context64, CpuContext, M128, R12, R13, R14, R15, RBP, RBX, RDI, RSI, RSP};
use crate::cursor::Cursor;
use crate::env::{Memory, Platform64};
use crate::error::Result;
use crate::record::ExceptionRecord;
use crate::status::{STATUS_ACCESS_VIOLATION, STATUS_LONGJUMP, STATUS_UNWIND_CONSOLIDATE};
use crate::Addr;

/// `_JUMP_BUFFER` as filled by `setjmp`: the callee saved registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct JumpBuffer {
    pub frame: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub mx_csr: u32,
    pub fp_csr: u16,
    pub spare: u16,
    /// `xmm6` to `xmm15`.
    pub xmm: [M128; 10],
}

const _: () = assert!(size_of::<JumpBuffer>() == 0x100);

impl JumpBuffer {
    pub const SIZE: usize = size_of::<JumpBuffer>();

    pub fn read<M: Memory + ?Sized>(mem: &M, addr: u64) -> Result<Self> {
        let mut bytes = [0; Self::SIZE];
        mem.read_bytes(addr, &mut bytes)?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes, "_JUMP_BUFFER");
        let mut buf = JumpBuffer {
            frame: cursor.read_u64()?,
            rbx: cursor.read_u64()?,
            rsp: cursor.read_u64()?,
            rbp: cursor.read_u64()?,
            rsi: cursor.read_u64()?,
            rdi: cursor.read_u64()?,
            r12: cursor.read_u64()?,
            r13: cursor.read_u64()?,
            r14: cursor.read_u64()?,
            r15: cursor.read_u64()?,
            rip: cursor.read_u64()?,
            mx_csr: cursor.read_u32()?,
            fp_csr: cursor.read_u16()?,
            spare: cursor.read_u16()?,
            xmm: [M128::default(); 10],
        };
        for xmm in &mut buf.xmm {
            xmm.low = cursor.read_u64()?;
            xmm.high = cursor.read_u64()?;
        }
        Ok(buf)
    }

    /// Overwrites the registers `setjmp` saved. Everything else in `context`
    /// is left alone.
    pub fn apply(&self, context: &mut Context64) {
        context.gpr[RBX] = self.rbx;
        context.gpr[RSP] = self.rsp;
        context.gpr[RBP] = self.rbp;
        context.gpr[RSI] = self.rsi;
        context.gpr[RDI] = self.rdi;
        context.gpr[R12] = self.r12;
        context.gpr[R13] = self.r13;
        context.gpr[R14] = self.r14;
        context.gpr[R15] = self.r15;
        context.rip = self.rip;
        for (n, xmm) in self.xmm.iter().enumerate() {
            context.set_xmm(6 + n, *xmm);
        }
    }
}

/// Continues execution at `context`.
///
/// With a `STATUS_LONGJUMP` record the registers come from the jump buffer
/// in the first parameter instead. With `STATUS_UNWIND_CONSOLIDATE` the
/// callback in the first parameter runs first, on a frame that unwinds to
/// `context`, and returns where to continue.
pub fn restore_context<E: Platform64 + ?Sized>(
    env: &mut E,
    context: &mut Context64,
    record: Option<&mut ExceptionRecord>,
) -> ! {
    let span = debug_span!("restore_context", rip = ?Addr(context.rip), rsp = ?Addr(context.rsp()));
    let mut entered = span.enter();
    if let Some(record) = record {
        match (record.code, record.first_parameter()) {
            (STATUS_LONGJUMP, Some(buffer)) => match JumpBuffer::read(&*env, buffer) {
                Ok(jump) => {
                    debug!(buffer = ?Addr(buffer), rip = ?Addr(jump.rip), "long jump");
                    jump.apply(context);
                }
                Err(err) => {
                    error!(%err, buffer = ?Addr(buffer), "unreadable jump buffer");
                    drop(entered);
                    raise_status(env, STATUS_ACCESS_VIOLATION, None);
                }
            },
            (STATUS_UNWIND_CONSOLIDATE, Some(callback)) => {
                debug!(callback = ?Addr(callback), "calling consolidate callback");
                drop(entered);
                let target = env.call_consolidate_callback(context, callback, record);
                entered = span.enter();
                debug!(continue_at = ?Addr(target), "consolidate callback returned");
                context.rip = target;
            }
            _ => {}
        }
    }

    if !context.has_control() {
        warn!(
            flags = ?Addr(u64::from(context.context_flags)),
            "restoring a context without control registers"
        );
    }
    // the restore never returns, the guard would never exit the span
    drop(entered);
    env.restore(context)
}
