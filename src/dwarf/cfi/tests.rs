use super::{CallFrameInstruction, CfaRule, Instructions, RegisterRule, UnwindRow};
use crate::context::{Context64, RBX, RSP};
use crate::dwarf::{register, Expression};
use crate::error::Error;
use crate::sim::SimMemory;

fn decode(data: &[u8]) -> Vec<CallFrameInstruction<'_>> {
    Instructions::new(data).collect::<Result<_, _>>().unwrap()
}

fn cie_row() -> UnwindRow<'static> {
    UnwindRow::new(
        0,
        CfaRule::RegisterOffset {
            register: register::RSP,
            offset: 8,
        },
    )
}

#[test]
fn decodes_cie_initial_instructions() {
    // DW_CFA_def_cfa: RSP +8
    // DW_CFA_offset: RIP -8
    // DW_CFA_nop
    assert_eq!(
        decode(&[0x0c, 7, 8, 0x90, 1, 0]),
        [
            CallFrameInstruction::DefCfa {
                register: 7,
                offset: 8
            },
            CallFrameInstruction::Offset {
                register: 16,
                factored_offset: 1
            },
            CallFrameInstruction::Nop,
        ]
    );
}

#[test]
fn decodes_expressions_and_signed_operands() {
    assert_eq!(
        decode(&[0x10, 3, 2, 0x76, 0x10, 0x11, 6, 0x7f, 0x41, 0x0f, 1, 0x30]),
        [
            CallFrameInstruction::Expression {
                register: 3,
                expr: Expression(&[0x76, 0x10])
            },
            CallFrameInstruction::OffsetExtendedSf {
                register: 6,
                factored_offset: -1
            },
            CallFrameInstruction::AdvanceLoc(1),
            CallFrameInstruction::DefCfaExpression(Expression(&[0x30])),
        ]
    );
}

#[test]
fn unknown_opcode_ends_the_stream() {
    let mut instructions = Instructions::new(&[0x0a, 0x3f, 0x0a]);
    assert_eq!(
        instructions.next(),
        Some(Ok(CallFrameInstruction::RememberState))
    );
    assert!(matches!(instructions.next(), Some(Err(Error::Dwarf(_)))));
    assert_eq!(instructions.next(), None);
}

#[test]
fn truncated_operand() {
    assert!(matches!(
        Instructions::new(&[0x0c, 7]).next(),
        Some(Err(Error::Truncated { .. }))
    ));
}

#[test]
fn register_number_out_of_range() {
    assert!(matches!(
        Instructions::new(&[0x07, 0x80, 0x80, 0x04]).next(),
        Some(Err(Error::Dwarf(_)))
    ));
}

/// push rbp; mov rbp, rsp; ... ; mov rsp, rbp; pop rbp; ret; ...
#[rustfmt::skip]
fn prolog() -> Vec<u8> {
    vec![
        0x41,             // DW_CFA_advance_loc: 1
        0x0e, 0x10,       // DW_CFA_def_cfa_offset: +16
        0x86, 0x02,       // DW_CFA_offset: RBP -16
        0x43,             // DW_CFA_advance_loc: 3
        0x0d, 0x06,       // DW_CFA_def_cfa_register: RBP
        0x0a,             // DW_CFA_remember_state
        0x4a,             // DW_CFA_advance_loc: 10
        0x0c, 0x07, 0x08, // DW_CFA_def_cfa: RSP +8
        0xc6,             // DW_CFA_restore: RBP
        0x41,             // DW_CFA_advance_loc: 1
        0x0b,             // DW_CFA_restore_state
    ]
}

#[test]
fn rows_follow_the_location() {
    let program = prolog();
    let row_at = |target| {
        UnwindRow::execute(cie_row(), Instructions::new(&program), 1, -8, target).unwrap()
    };

    let entry = row_at(0);
    assert_eq!(entry.location, 0);
    assert_eq!(entry.cfa, cie_row().cfa);
    assert_eq!(entry.rule(register::RBP), None);

    let pushed = row_at(2);
    assert_eq!(pushed.location, 1);
    assert_eq!(
        pushed.cfa,
        CfaRule::RegisterOffset {
            register: register::RSP,
            offset: 16
        }
    );
    assert_eq!(pushed.rule(register::RBP), Some(RegisterRule::Offset(-16)));

    let body = row_at(4);
    assert_eq!(
        body.cfa,
        CfaRule::RegisterOffset {
            register: register::RBP,
            offset: 16
        }
    );

    let epilog = row_at(14);
    assert_eq!(epilog.location, 14);
    assert_eq!(epilog.cfa, cie_row().cfa);
    assert_eq!(epilog.rule(register::RBP), None);

    let after = row_at(100);
    assert_eq!(after.location, 15);
    assert_eq!(after.cfa, body.cfa);
    assert_eq!(after.rule(register::RBP), Some(RegisterRule::Offset(-16)));
}

#[test]
fn restore_state_needs_remember_state() {
    assert!(matches!(
        UnwindRow::execute(cie_row(), Instructions::new(&[0x0b]), 1, -8, 0),
        Err(Error::Dwarf(_))
    ));
}

#[test]
fn apply_recovers_the_caller() {
    const RBP: u64 = 0x7000_0f00;
    let mut mem = SimMemory::new();
    mem.map(0x7000_0000, 0x1000);
    mem.write_u64(RBP, 0x7000_0ff0).unwrap();
    mem.write_u64(RBP + 8, 0x1_4000_1234).unwrap();

    let program = prolog();
    let row = UnwindRow::execute(cie_row(), Instructions::new(&program), 1, -8, 4).unwrap();

    let mut frame = Context64::default();
    frame.gpr[crate::context::RBP] = RBP;
    frame.gpr[RSP] = RBP - 0x40;
    frame.gpr[RBX] = 0xb;
    let caller = row.apply(&mem, &frame).unwrap();

    assert_eq!(caller.gpr[RSP], RBP + 16);
    assert_eq!(caller.gpr[crate::context::RBP], 0x7000_0ff0);
    assert_eq!(caller.gpr[RBX], 0xb);
    // no rule for the return address column, it keeps the callee's value
    assert_eq!(caller.rip, 0);
}

#[test]
fn apply_reports_unmapped_slots() {
    let program = prolog();
    let row = UnwindRow::execute(cie_row(), Instructions::new(&program), 1, -8, 4).unwrap();
    let mut frame = Context64::default();
    frame.gpr[crate::context::RBP] = 0x10;
    assert!(matches!(
        row.apply(&SimMemory::new(), &frame),
        Err(Error::Unmapped(_))
    ));
}
