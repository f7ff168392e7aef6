//! DWARF call frame information of the consolidation trampoline.
//!
//! The consolidate callback of an unwind runs on a host frame whose CFI does
//! not describe the trampoline itself but the guest context it was handed:
//! the CFA is the context's `rsp` and every non-volatile register lives in
//! the context record. A host unwinder started from inside the callback (a
//! C++ runtime rethrowing, for example) therefore continues in the frame
//! being consolidated instead of in the frames the unwind already removed.
//!
//! All rules are `DW_CFA_def_cfa_expression` or `DW_CFA_expression`, and the
//! expressions have the following format:
//!
//! ```text
//! DW_OP_breg6; sleb128 0x10            | Load %rbp + 0x10
//! DW_OP_deref                          | Get *(%rbp + 0x10) == context
//! DW_OP_plus_uconst; uleb128 <OFFSET>  | Add offset to get struct member
//! [DW_OP_deref]                        | Dereference, only for CFA
//! ```
//!
//! Source: <https://dwarfstd.org/doc/DWARF5.pdf> §6.4 Call Frame Information
//! and §2.5 DWARF Expressions.
#![allow(non_upper_case_globals)]

mod cfi;
mod expr;

#[cfg(test)]
mod tests;

use alloc::vec::Vec;

pub use cfi::{CallFrameInstruction, CfaRule, Instructions, RegisterRule, UnwindRow};
pub use expr::Expression;

use crate::context::{
    gpr_offset, xmm_offset, Context64, R12, R13, R14, R15, R8, R9, R10, R11, RAX, RBP, RBX,
    RCX, RDI, RDX, RIP_OFFSET, RSI, RSP,
};
use crate::env::Memory;
use crate::error::Result;
use crate::Addr;

/// x86-64 psABI register numbering, figure 3.36.
pub mod register {
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    /// The return address column.
    pub const RIP: u16 = 16;
    pub const XMM0: u16 = 17;
    pub const XMM15: u16 = 32;
}

/// `Context64::gpr` index of each DWARF register number below 16.
const GPR_ORDER: [usize; 16] = [
    RAX, RDX, RCX, RBX, RSI, RDI, RBP, RSP, R8, R9, R10, R11, R12, R13, R14, R15,
];

/// Index into `Context64::gpr` of a DWARF integer register.
pub fn gpr_index(register: u16) -> Option<usize> {
    GPR_ORDER.get(usize::from(register)).copied()
}

/// Current value of a DWARF register that fits in 64 bits.
pub fn register_value(context: &Context64, register: u16) -> Option<u64> {
    match register {
        register::RIP => Some(context.rip),
        _ => gpr_index(register).map(|index| context.gpr[index]),
    }
}

/// Where the trampoline keeps the context pointer, relative to its `rbp`.
pub const CONTEXT_SLOT: i64 = 0x10;

const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_OP_deref: u8 = 0x06;
const DW_OP_plus_uconst: u8 = 0x23;
const DW_OP_breg0: u8 = 0x70;

/// Registers the trampoline describes, with their offset in [`Context64`].
pub fn consolidate_locations() -> impl Iterator<Item = (u16, usize)> {
    let gprs = [
        (3, RBX),
        (4, RSI),
        (5, RDI),
        (register::RBP, RBP),
        (12, R12),
        (13, R13),
        (14, R14),
        (15, R15),
    ]
    .into_iter()
    .map(|(dwarf, gpr)| (dwarf, gpr_offset(gpr)));
    let xmms = (6..16).map(|n| (register::XMM0 + n as u16, xmm_offset(n)));
    gprs.chain([(register::RIP, RIP_OFFSET)]).chain(xmms)
}

/// The CFI program the trampoline carries while the callback runs: the bytes
/// of its `.cfi_escape` directives, in order.
pub fn consolidate_cfi() -> Vec<u8> {
    let mut program = Vec::new();

    program.push(DW_CFA_def_cfa_expression);
    push_block(&mut program, &context_member(gpr_offset(RSP), true));

    for (register, offset) in consolidate_locations() {
        program.push(DW_CFA_expression);
        push_uleb128(&mut program, u64::from(register));
        push_block(&mut program, &context_member(offset, false));
    }
    program
}

fn context_member(offset: usize, deref: bool) -> Vec<u8> {
    let mut expr = alloc::vec![DW_OP_breg0 + register::RBP as u8];
    push_sleb128(&mut expr, CONTEXT_SLOT);
    expr.push(DW_OP_deref);
    expr.push(DW_OP_plus_uconst);
    push_uleb128(&mut expr, offset as u64);
    if deref {
        expr.push(DW_OP_deref);
    }
    expr
}

fn push_block(out: &mut Vec<u8>, block: &[u8]) {
    push_uleb128(out, block.len() as u64);
    out.extend_from_slice(block);
}

fn push_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn push_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Unwinds a trampoline frame the way a host unwinder would, by running its
/// CFI. `frame` holds the registers inside the trampoline, only `rbp` is
/// looked at. Registers without a rule keep their value.
#[instrument(level = "debug", skip_all, fields(rbp = ?Addr(frame.gpr[RBP])))]
pub fn unwind_consolidate_frame<M: Memory + ?Sized>(mem: &M, frame: &Context64) -> Result<Context64> {
    let program = consolidate_cfi();
    let row = UnwindRow::execute(
        UnwindRow::new(0, CfaRule::RegisterOffset {
            register: register::RSP,
            offset: 8,
        }),
        Instructions::new(&program),
        1,
        -8,
        u64::MAX,
    )?;
    row.apply(mem, frame)
}
