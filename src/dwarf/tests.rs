use super::{consolidate_cfi, unwind_consolidate_frame, Expression, CONTEXT_SLOT};
use crate::context::{gpr_offset, xmm_offset, Context64, M128, RBP, RBX, RIP_OFFSET, RSP};
use crate::error::Error;
use crate::sim::SimMemory;

/// The `.cfi_escape` directives of the trampoline, one per line.
#[rustfmt::skip]
const TRAMPOLINE_ESCAPES: &[&[u8]] = &[
    &[0x0f, 0x07, 0x76, 0x10, 0x06, 0x23, 0x98, 0x01, 0x06], // CFA
    &[0x10, 0x03, 0x06, 0x76, 0x10, 0x06, 0x23, 0x90, 0x01], // %rbx
    &[0x10, 0x04, 0x06, 0x76, 0x10, 0x06, 0x23, 0xa8, 0x01], // %rsi
    &[0x10, 0x05, 0x06, 0x76, 0x10, 0x06, 0x23, 0xb0, 0x01], // %rdi
    &[0x10, 0x06, 0x06, 0x76, 0x10, 0x06, 0x23, 0xa0, 0x01], // %rbp
    &[0x10, 0x0c, 0x06, 0x76, 0x10, 0x06, 0x23, 0xd8, 0x01], // %r12
    &[0x10, 0x0d, 0x06, 0x76, 0x10, 0x06, 0x23, 0xe0, 0x01], // %r13
    &[0x10, 0x0e, 0x06, 0x76, 0x10, 0x06, 0x23, 0xe8, 0x01], // %r14
    &[0x10, 0x0f, 0x06, 0x76, 0x10, 0x06, 0x23, 0xf0, 0x01], // %r15
    &[0x10, 0x10, 0x06, 0x76, 0x10, 0x06, 0x23, 0xf8, 0x01], // %rip
    &[0x10, 0x17, 0x06, 0x76, 0x10, 0x06, 0x23, 0x80, 0x04], // %xmm6
    &[0x10, 0x18, 0x06, 0x76, 0x10, 0x06, 0x23, 0x90, 0x04], // %xmm7
    &[0x10, 0x19, 0x06, 0x76, 0x10, 0x06, 0x23, 0xa0, 0x04], // %xmm8
    &[0x10, 0x1a, 0x06, 0x76, 0x10, 0x06, 0x23, 0xb0, 0x04], // %xmm9
    &[0x10, 0x1b, 0x06, 0x76, 0x10, 0x06, 0x23, 0xc0, 0x04], // %xmm10
    &[0x10, 0x1c, 0x06, 0x76, 0x10, 0x06, 0x23, 0xd0, 0x04], // %xmm11
    &[0x10, 0x1d, 0x06, 0x76, 0x10, 0x06, 0x23, 0xe0, 0x04], // %xmm12
    &[0x10, 0x1e, 0x06, 0x76, 0x10, 0x06, 0x23, 0xf0, 0x04], // %xmm13
    &[0x10, 0x1f, 0x06, 0x76, 0x10, 0x06, 0x23, 0x80, 0x05], // %xmm14
    &[0x10, 0x20, 0x06, 0x76, 0x10, 0x06, 0x23, 0x90, 0x05], // %xmm15
];

#[test]
fn trampoline_cfi_matches_context_layout() {
    assert_eq!(consolidate_cfi(), TRAMPOLINE_ESCAPES.concat());
}

const STACK: u64 = 0x7fff_0000;
const TRAMPOLINE_RBP: u64 = STACK + 0x100;
const CONTEXT: u64 = STACK + 0x400;

fn guest_context() -> Context64 {
    let mut context = Context64::default();
    for (i, gpr) in context.gpr.iter_mut().enumerate() {
        *gpr = 0x1000 + i as u64;
    }
    context.gpr[RSP] = 0x6000_0000;
    context.rip = 0x1_4000_2345;
    for n in 0..16 {
        context.set_xmm(
            n,
            M128 {
                low: n as u64,
                high: 0xff00 + n as u64,
            },
        );
    }
    context
}

fn stack_with(context: &Context64) -> SimMemory {
    let mut mem = SimMemory::new();
    mem.map(STACK, 0x1000);
    mem.write_u64(TRAMPOLINE_RBP.wrapping_add_signed(CONTEXT_SLOT), CONTEXT)
        .unwrap();
    for (i, &value) in context.gpr.iter().enumerate() {
        mem.write_u64(CONTEXT + gpr_offset(i) as u64, value).unwrap();
    }
    mem.write_u64(CONTEXT + RIP_OFFSET as u64, context.rip).unwrap();
    for n in 0..16 {
        mem.write_bytes(CONTEXT + xmm_offset(n) as u64, &context.xmm(n).to_le_bytes())
            .unwrap();
    }
    mem
}

#[test]
fn trampoline_frame_unwinds_into_the_consolidated_context() {
    let guest = guest_context();
    let mem = stack_with(&guest);

    let mut trampoline = Context64::default();
    trampoline.gpr = [0xdead; 16];
    trampoline.gpr[RBP] = TRAMPOLINE_RBP;
    trampoline.gpr[RSP] = TRAMPOLINE_RBP - 0x20;
    trampoline.rip = 0x5555_0000;

    let caller = unwind_consolidate_frame(&mem, &trampoline).unwrap();

    assert_eq!(caller.rsp(), guest.rsp());
    assert_eq!(caller.rip, guest.rip);
    for reg in [RBX, RBP, 6, 7, 12, 13, 14, 15] {
        assert_eq!(caller.gpr[reg], guest.gpr[reg], "gpr {reg}");
    }
    // volatile registers have no rule
    for reg in [0, 1, 2, 8, 9, 10, 11] {
        assert_eq!(caller.gpr[reg], 0xdead, "gpr {reg}");
    }
    for n in 0..6 {
        assert_eq!(caller.xmm(n), M128::default(), "xmm{n}");
    }
    for n in 6..16 {
        assert_eq!(caller.xmm(n), guest.xmm(n), "xmm{n}");
    }
}

#[test]
fn trampoline_frame_without_context_pointer() {
    let mem = SimMemory::new();
    let mut trampoline = Context64::default();
    trampoline.gpr[RBP] = TRAMPOLINE_RBP;
    assert_eq!(
        unwind_consolidate_frame(&mem, &trampoline),
        Err(Error::Unmapped(crate::Addr(TRAMPOLINE_RBP + 0x10)))
    );
}

fn eval(ops: &[u8], initial: Option<u64>) -> Result<u64, Error> {
    let mut registers = Context64::default();
    registers.gpr[RBP] = 0x100;
    Expression(ops).evaluate(&SimMemory::new(), &registers, initial)
}

#[test]
fn expression_arithmetic() {
    // DW_OP_lit5 DW_OP_const1s -2 DW_OP_plus
    assert_eq!(eval(&[0x35, 0x09, 0xfe, 0x22], None), Ok(3));
    // DW_OP_constu 300 DW_OP_lit1 DW_OP_minus
    assert_eq!(eval(&[0x10, 0xac, 0x02, 0x31, 0x1c], None), Ok(299));
    // DW_OP_lit1 DW_OP_lit5 DW_OP_swap DW_OP_minus
    assert_eq!(eval(&[0x31, 0x35, 0x16, 0x1c], None), Ok(4));
    // DW_OP_lit7 DW_OP_dup DW_OP_plus DW_OP_lit1 DW_OP_over DW_OP_drop DW_OP_drop
    assert_eq!(eval(&[0x37, 0x12, 0x22, 0x31, 0x14, 0x13, 0x13], None), Ok(14));
}

#[test]
fn expression_starts_from_the_cfa() {
    // DW_OP_plus_uconst 8
    assert_eq!(eval(&[0x23, 0x08], Some(0x2000)), Ok(0x2008));
    assert_eq!(eval(&[], Some(0x2000)), Ok(0x2000));
}

#[test]
fn expression_reads_registers() {
    // DW_OP_breg6 -16 (rbp)
    assert_eq!(eval(&[0x76, 0x70], None), Ok(0xf0));
    // DW_OP_breg17 is xmm0, no integer value
    assert!(matches!(eval(&[0x81, 0x00], None), Err(Error::Dwarf(_))));
}

#[test]
fn malformed_expressions() {
    assert!(matches!(eval(&[], None), Err(Error::Dwarf(_))));
    assert!(matches!(eval(&[0x22], None), Err(Error::Dwarf(_))));
    assert!(matches!(eval(&[0xe0], None), Err(Error::Dwarf(_))));
    assert!(matches!(eval(&[0x12; 2], Some(1)), Ok(1)));
    assert!(matches!(eval(&[0x12; 80], Some(1)), Err(Error::Dwarf(_))));
    // DW_OP_deref of unmapped memory
    assert!(matches!(eval(&[0x30, 0x06], None), Err(Error::Unmapped(_))));
}
