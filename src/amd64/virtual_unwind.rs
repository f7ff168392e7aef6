//! `RtlVirtualUnwind`: pops one frame off a context.

use super::dispatcher::LanguageHandler;
use super::epilog;
use super::function_table::{RuntimeFunction, MAX_CHAIN_LINKS};
use super::unwind_info::{Trailer, UnwindInfo, UnwindOp};
use crate::context::{Context64, REGISTER_NAMES};
use crate::env::Memory;
use crate::error::{Error, Result};
use crate::Addr;

/// `KNONVOLATILE_CONTEXT_POINTERS`: where each register was reloaded from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonvolatilePointers {
    pub integer: [Option<u64>; 16],
    pub xmm: [Option<u64>; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualUnwind {
    pub establisher_frame: u64,
    /// The handler of the requested type, unless the pc was in the prologue
    /// or an epilogue.
    pub handler: Option<LanguageHandler>,
}

fn restore_integer<M: Memory + ?Sized>(
    mem: &M,
    context: &mut Context64,
    pointers: Option<&mut NonvolatilePointers>,
    reg: u8,
    slot: u64,
) -> Result<()> {
    let reg = usize::from(reg);
    context.gpr[reg] = mem.read_u64(slot)?;
    if let Some(pointers) = pointers {
        pointers.integer[reg] = Some(slot);
    }
    trace!(reg = REGISTER_NAMES[reg], slot = ?Addr(slot), value = ?Addr(context.gpr[reg]), "restored");
    Ok(())
}

fn restore_xmm<M: Memory + ?Sized>(
    mem: &M,
    context: &mut Context64,
    pointers: Option<&mut NonvolatilePointers>,
    reg: u8,
    slot: u64,
) -> Result<()> {
    let reg = usize::from(reg);
    context.set_xmm(reg, mem.read_m128(slot)?);
    if let Some(pointers) = pointers {
        pointers.xmm[reg] = Some(slot);
    }
    Ok(())
}

/// Undoes the effects of `function` on `context` as of `pc`, leaving the
/// caller's state in `context`.
///
/// `handler_type` is one of the `UNW_FLAG_*HANDLER` values and selects which
/// handler is reported.
#[instrument(
    level = "trace",
    skip(mem, function, context, pointers),
    fields(pc = ?Addr(pc), rsp = ?Addr(context.rsp()))
)]
pub fn virtual_unwind<M: Memory + ?Sized>(
    mem: &M,
    handler_type: u8,
    image_base: u64,
    pc: u64,
    function: &RuntimeFunction,
    context: &mut Context64,
    mut pointers: Option<&mut NonvolatilePointers>,
) -> Result<VirtualUnwind> {
    let mut frame = context.rsp();
    let mut establisher_frame = frame;
    let mut function = *function;

    let mut links = 0;
    let (info, prolog_offset) = loop {
        let info = UnwindInfo::read(mem, image_base + u64::from(function.unwind_data))?;

        if info.has_frame_register() {
            frame = context.gpr[usize::from(info.frame_register)]
                .wrapping_sub(u64::from(info.frame_offset) * 16);
        }

        let begin = image_base + u64::from(function.begin);
        let prolog_offset = if pc >= begin && pc < begin + u64::from(info.prolog_size) {
            Some(pc - begin)
        } else {
            if let Some(insns) = epilog::decode(mem, pc, image_base, &function) {
                trace!(?insns, "inside epilog");
                epilog::execute(mem, &insns, context, pointers.as_deref_mut())?;
                return Ok(VirtualUnwind {
                    establisher_frame: frame,
                    handler: None,
                });
            }
            None
        };

        for code in &info.codes {
            if prolog_offset.is_some_and(|offset| offset < u64::from(code.prolog_offset)) {
                continue;
            }
            match code.op {
                UnwindOp::PushNonvol { reg } => {
                    let slot = context.rsp();
                    restore_integer(mem, context, pointers.as_deref_mut(), reg, slot)?;
                    context.set_rsp(slot.wrapping_add(8));
                }
                UnwindOp::Alloc { size } => {
                    context.set_rsp(context.rsp().wrapping_add(u64::from(size)));
                }
                UnwindOp::SetFpreg => {
                    context.set_rsp(frame);
                    establisher_frame = frame;
                }
                UnwindOp::SaveNonvol { reg, offset } => {
                    let slot = frame.wrapping_add(u64::from(offset));
                    restore_integer(mem, context, pointers.as_deref_mut(), reg, slot)?;
                }
                UnwindOp::SaveXmm128 { reg, offset } => {
                    let slot = frame.wrapping_add(u64::from(offset));
                    restore_xmm(mem, context, pointers.as_deref_mut(), reg, slot)?;
                }
                UnwindOp::PushMachframe { error_code } => {
                    warn!(error_code, "PUSH_MACHFRAME is not supported, ignoring");
                }
                UnwindOp::Unknown { code, .. } => {
                    debug!(code, "unknown unwind code, ignoring");
                }
            }
        }

        match info.trailer {
            Trailer::Chained(next) => {
                links += 1;
                if links > MAX_CHAIN_LINKS {
                    return Err(Error::InvalidImage("unwind info chain does not end".into()));
                }
                trace!(begin = ?Addr(image_base + u64::from(next.begin)), "continuing with chained info");
                function = next;
            }
            _ => break (info, prolog_offset),
        }
    };

    // now the return address
    context.rip = mem.read_u64(context.rsp())?;
    context.set_rsp(context.rsp().wrapping_add(8));

    if info.flags & handler_type == 0 {
        trace!("no matching handler");
        return Ok(VirtualUnwind {
            establisher_frame,
            handler: None,
        });
    }
    if prolog_offset.is_some() {
        trace!("in prolog");
        return Ok(VirtualUnwind {
            establisher_frame,
            handler: None,
        });
    }

    let handler = match info.trailer {
        Trailer::Handler { rva, data } => Some(LanguageHandler {
            address: image_base + u64::from(rva),
            data,
        }),
        _ => None,
    };
    if let Some(handler) = handler {
        trace!(
            handler = ?Addr(handler.address),
            frame = ?Addr(establisher_frame),
            "found handler"
        );
    }
    Ok(VirtualUnwind {
        establisher_frame,
        handler,
    })
}
