//! Implements decoding and execution of DWARF call frame instructions.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.2 Call Frame Instructions
//!
//! The instructions describe one column of a large table per instruction:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The CFA column defines the rule which computes the Canonical Frame Address
//! value; it may be either a register and a signed offset that are added
//! together, or a DWARF expression that is evaluated. The remaining columns
//! describe how to find the value each register had in the previous frame.
#![allow(non_upper_case_globals)]

#[cfg(test)]
mod tests;

use alloc::{format, vec::Vec};

use super::expr::Expression;
use super::{gpr_index, register, register_value};
use crate::context::{Context64, RSP};
use crate::cursor::Cursor;
use crate::env::Memory;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFrameInstruction<'a> {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// Creates a new row at the given address.
    SetLoc(u64),
    /// Creates a new row `delta * code_alignment_factor` bytes further. The
    /// delta is encoded in the opcode.
    AdvanceLoc(u8),
    AdvanceLoc1(u8),
    AdvanceLoc2(u16),
    AdvanceLoc4(u32),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// CFA = register + offset.
    DefCfa { register: u16, offset: u64 },
    /// Like [`CallFrameInstruction::DefCfa`] with a signed, factored offset.
    DefCfaSf { register: u16, factored_offset: i64 },
    /// Keeps the old offset. Only valid if the CFA rule is register + offset.
    DefCfaRegister(u16),
    /// Keeps the old register. Only valid if the CFA rule is register + offset.
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    DefCfaExpression(Expression<'a>),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    Undefined(u16),
    SameValue(u16),
    /// Saved at CFA + `factored_offset * data_alignment_factor`. The register
    /// is encoded in the opcode.
    Offset { register: u16, factored_offset: u64 },
    OffsetExtended { register: u16, factored_offset: u64 },
    OffsetExtendedSf { register: u16, factored_offset: i64 },
    /// The value is CFA + `factored_offset * data_alignment_factor`.
    ValOffset { register: u16, factored_offset: u64 },
    ValOffsetSf { register: u16, factored_offset: i64 },
    /// Saved in another register.
    Register { register: u16, from: u16 },
    /// Saved at the address the expression computes. The CFA is pushed
    /// before it runs.
    Expression { register: u16, expr: Expression<'a> },
    /// The value is what the expression computes.
    ValExpression { register: u16, expr: Expression<'a> },
    /// Back to the rule the initial instructions assigned.
    Restore(u16),
    RestoreExtended(u16),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    RememberState,
    RestoreState,
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
}

const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;
const DW_CFA_restore_hi: u8 = 0x03;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;

/// Decodes an instruction stream, an FDE's or a CIE's initial instructions.
/// Stops after the first error.
pub struct Instructions<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Instructions<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data, "call frame instructions"),
        }
    }

    fn register(&mut self) -> Result<u16> {
        let register = self.cursor.read_uleb128()?;
        u16::try_from(register).map_err(|_| Error::Dwarf(format!("register {register} out of range")))
    }

    fn expression(&mut self) -> Result<Expression<'a>> {
        let len = self.cursor.read_uleb128()?;
        Ok(Expression(self.cursor.read_bytes(len as usize)?))
    }

    fn decode(&mut self, b: u8) -> Result<CallFrameInstruction<'a>> {
        let low_6 = b & (u8::MAX >> 2);
        Ok(match b >> 6 {
            DW_CFA_advance_loc_hi => CallFrameInstruction::AdvanceLoc(low_6),
            DW_CFA_offset_hi => CallFrameInstruction::Offset {
                register: u16::from(low_6),
                factored_offset: self.cursor.read_uleb128()?,
            },
            DW_CFA_restore_hi => CallFrameInstruction::Restore(u16::from(low_6)),
            _ => match b {
                DW_CFA_nop => CallFrameInstruction::Nop,
                DW_CFA_set_loc => CallFrameInstruction::SetLoc(self.cursor.read_u64()?),
                DW_CFA_advance_loc1 => CallFrameInstruction::AdvanceLoc1(self.cursor.read_u8()?),
                DW_CFA_advance_loc2 => CallFrameInstruction::AdvanceLoc2(self.cursor.read_u16()?),
                DW_CFA_advance_loc4 => CallFrameInstruction::AdvanceLoc4(self.cursor.read_u32()?),
                DW_CFA_offset_extended => CallFrameInstruction::OffsetExtended {
                    register: self.register()?,
                    factored_offset: self.cursor.read_uleb128()?,
                },
                DW_CFA_restore_extended => CallFrameInstruction::RestoreExtended(self.register()?),
                DW_CFA_undefined => CallFrameInstruction::Undefined(self.register()?),
                DW_CFA_same_value => CallFrameInstruction::SameValue(self.register()?),
                DW_CFA_register => CallFrameInstruction::Register {
                    register: self.register()?,
                    from: self.register()?,
                },
                DW_CFA_remember_state => CallFrameInstruction::RememberState,
                DW_CFA_restore_state => CallFrameInstruction::RestoreState,
                DW_CFA_def_cfa => CallFrameInstruction::DefCfa {
                    register: self.register()?,
                    offset: self.cursor.read_uleb128()?,
                },
                DW_CFA_def_cfa_register => CallFrameInstruction::DefCfaRegister(self.register()?),
                DW_CFA_def_cfa_offset => {
                    CallFrameInstruction::DefCfaOffset(self.cursor.read_uleb128()?)
                }
                DW_CFA_def_cfa_expression => {
                    CallFrameInstruction::DefCfaExpression(self.expression()?)
                }
                DW_CFA_expression => CallFrameInstruction::Expression {
                    register: self.register()?,
                    expr: self.expression()?,
                },
                DW_CFA_offset_extended_sf => CallFrameInstruction::OffsetExtendedSf {
                    register: self.register()?,
                    factored_offset: self.cursor.read_ileb128()?,
                },
                DW_CFA_def_cfa_sf => CallFrameInstruction::DefCfaSf {
                    register: self.register()?,
                    factored_offset: self.cursor.read_ileb128()?,
                },
                DW_CFA_def_cfa_offset_sf => {
                    CallFrameInstruction::DefCfaOffsetSf(self.cursor.read_ileb128()?)
                }
                DW_CFA_val_offset => CallFrameInstruction::ValOffset {
                    register: self.register()?,
                    factored_offset: self.cursor.read_uleb128()?,
                },
                DW_CFA_val_offset_sf => CallFrameInstruction::ValOffsetSf {
                    register: self.register()?,
                    factored_offset: self.cursor.read_ileb128()?,
                },
                DW_CFA_val_expression => CallFrameInstruction::ValExpression {
                    register: self.register()?,
                    expr: self.expression()?,
                },
                _ => return Err(Error::Dwarf(format!("unknown call frame instruction {b:#x}"))),
            },
        })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<CallFrameInstruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_empty() {
            return None;
        }
        let result = self.cursor.read_u8().and_then(|b| self.decode(b));
        if result.is_err() {
            self.cursor = Cursor::new(&[], "call frame instructions");
        }
        Some(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule<'a> {
    RegisterOffset { register: u16, offset: i64 },
    Expression(Expression<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRule<'a> {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    SameValue,
    /// The previous value of this register is saved at the address CFA+N.
    Offset(i64),
    /// The previous value of this register is the value CFA+N.
    ValOffset(i64),
    /// The previous value of this register is stored in another register.
    Register(u16),
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression.
    Expression(Expression<'a>),
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression.
    ValExpression(Expression<'a>),
}

/// One row of the table: the rules in effect from `location` on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow<'a> {
    pub location: u64,
    pub cfa: CfaRule<'a>,
    registers: Vec<(u16, RegisterRule<'a>)>,
}

impl<'a> UnwindRow<'a> {
    pub fn new(location: u64, cfa: CfaRule<'a>) -> Self {
        Self {
            location,
            cfa,
            registers: Vec::new(),
        }
    }

    /// The rule of `register`, `None` if no instruction mentioned it.
    pub fn rule(&self, register: u16) -> Option<RegisterRule<'a>> {
        self.registers
            .iter()
            .find(|(r, _)| *r == register)
            .map(|&(_, rule)| rule)
    }

    pub fn registers(&self) -> impl Iterator<Item = (u16, RegisterRule<'a>)> + '_ {
        self.registers.iter().copied()
    }

    fn set(&mut self, register: u16, rule: RegisterRule<'a>) {
        match self.registers.iter_mut().find(|(r, _)| *r == register) {
            Some(slot) => slot.1 = rule,
            None => self.registers.push((register, rule)),
        }
    }

    fn unset(&mut self, register: u16) {
        self.registers.retain(|(r, _)| *r != register);
    }

    /// Runs `instructions` on top of `initial` (the state the CIE's initial
    /// instructions produce) and returns the row that covers `target`.
    pub fn execute(
        initial: UnwindRow<'a>,
        instructions: Instructions<'a>,
        code_alignment: u64,
        data_alignment: i64,
        target: u64,
    ) -> Result<UnwindRow<'a>> {
        let mut row = initial.clone();
        let mut remembered = Vec::new();
        let factored = |offset: i64| offset.wrapping_mul(data_alignment);

        for instruction in instructions {
            let instruction = instruction?;
            trace!(?instruction, location = row.location, "cfi");

            let advance = match instruction {
                CallFrameInstruction::SetLoc(location) => Some(location),
                CallFrameInstruction::AdvanceLoc(delta) | CallFrameInstruction::AdvanceLoc1(delta) => {
                    Some(row.location + u64::from(delta) * code_alignment)
                }
                CallFrameInstruction::AdvanceLoc2(delta) => {
                    Some(row.location + u64::from(delta) * code_alignment)
                }
                CallFrameInstruction::AdvanceLoc4(delta) => {
                    Some(row.location + u64::from(delta) * code_alignment)
                }
                _ => None,
            };
            if let Some(location) = advance {
                if location > target {
                    break;
                }
                row.location = location;
                continue;
            }

            match instruction {
                CallFrameInstruction::DefCfa { register, offset } => {
                    row.cfa = CfaRule::RegisterOffset {
                        register,
                        offset: offset as i64,
                    };
                }
                CallFrameInstruction::DefCfaSf {
                    register,
                    factored_offset,
                } => {
                    row.cfa = CfaRule::RegisterOffset {
                        register,
                        offset: factored(factored_offset),
                    };
                }
                CallFrameInstruction::DefCfaRegister(new) => match &mut row.cfa {
                    CfaRule::RegisterOffset { register, .. } => *register = new,
                    CfaRule::Expression(_) => {
                        return Err(Error::Dwarf("DW_CFA_def_cfa_register with an expression CFA".into()))
                    }
                },
                CallFrameInstruction::DefCfaOffset(new) => {
                    row.set_cfa_offset(new as i64)?;
                }
                CallFrameInstruction::DefCfaOffsetSf(new) => {
                    row.set_cfa_offset(factored(new))?;
                }
                CallFrameInstruction::DefCfaExpression(expr) => row.cfa = CfaRule::Expression(expr),
                CallFrameInstruction::Undefined(register) => {
                    row.set(register, RegisterRule::Undefined)
                }
                CallFrameInstruction::SameValue(register) => {
                    row.set(register, RegisterRule::SameValue)
                }
                CallFrameInstruction::Offset {
                    register,
                    factored_offset,
                }
                | CallFrameInstruction::OffsetExtended {
                    register,
                    factored_offset,
                } => row.set(register, RegisterRule::Offset(factored(factored_offset as i64))),
                CallFrameInstruction::OffsetExtendedSf {
                    register,
                    factored_offset,
                } => row.set(register, RegisterRule::Offset(factored(factored_offset))),
                CallFrameInstruction::ValOffset {
                    register,
                    factored_offset,
                } => row.set(
                    register,
                    RegisterRule::ValOffset(factored(factored_offset as i64)),
                ),
                CallFrameInstruction::ValOffsetSf {
                    register,
                    factored_offset,
                } => row.set(register, RegisterRule::ValOffset(factored(factored_offset))),
                CallFrameInstruction::Register { register, from } => {
                    row.set(register, RegisterRule::Register(from))
                }
                CallFrameInstruction::Expression { register, expr } => {
                    row.set(register, RegisterRule::Expression(expr))
                }
                CallFrameInstruction::ValExpression { register, expr } => {
                    row.set(register, RegisterRule::ValExpression(expr))
                }
                CallFrameInstruction::Restore(register)
                | CallFrameInstruction::RestoreExtended(register) => {
                    match initial.rule(register) {
                        Some(rule) => row.set(register, rule),
                        None => row.unset(register),
                    }
                }
                CallFrameInstruction::RememberState => {
                    remembered.push((row.cfa, row.registers.clone()));
                }
                CallFrameInstruction::RestoreState => {
                    let (cfa, registers) = remembered.pop().ok_or_else(|| {
                        Error::Dwarf("DW_CFA_restore_state without remembered state".into())
                    })?;
                    row.cfa = cfa;
                    row.registers = registers;
                }
                CallFrameInstruction::Nop
                | CallFrameInstruction::SetLoc(_)
                | CallFrameInstruction::AdvanceLoc(_)
                | CallFrameInstruction::AdvanceLoc1(_)
                | CallFrameInstruction::AdvanceLoc2(_)
                | CallFrameInstruction::AdvanceLoc4(_) => {}
            }
        }
        Ok(row)
    }

    fn set_cfa_offset(&mut self, new: i64) -> Result<()> {
        match &mut self.cfa {
            CfaRule::RegisterOffset { offset, .. } => {
                *offset = new;
                Ok(())
            }
            CfaRule::Expression(_) => Err(Error::Dwarf("DW_CFA_def_cfa_offset with an expression CFA".into())),
        }
    }

    /// Computes the CFA of the frame `frame` describes.
    pub fn cfa<M: Memory + ?Sized>(&self, mem: &M, frame: &Context64) -> Result<u64> {
        match self.cfa {
            CfaRule::RegisterOffset { register, offset } => register_value(frame, register)
                .map(|value| value.wrapping_add_signed(offset))
                .ok_or_else(|| Error::Dwarf(format!("CFA based on register {register}"))),
            CfaRule::Expression(expr) => expr.evaluate(mem, frame, None),
        }
    }

    /// The caller of the frame `frame` describes: `rsp` is the CFA and every
    /// register with a rule is recovered. Registers without one, and
    /// undefined ones, keep their value.
    pub fn apply<M: Memory + ?Sized>(&self, mem: &M, frame: &Context64) -> Result<Context64> {
        let cfa = self.cfa(mem, frame)?;
        let mut caller = frame.clone();
        caller.gpr[RSP] = cfa;

        for (register, rule) in self.registers() {
            let location = match rule {
                RegisterRule::Undefined | RegisterRule::SameValue => continue,
                RegisterRule::Offset(offset) => Location::Address(cfa.wrapping_add_signed(offset)),
                RegisterRule::ValOffset(offset) => Location::Value(cfa.wrapping_add_signed(offset)),
                RegisterRule::Register(from) => match register_value(frame, from) {
                    Some(value) => Location::Value(value),
                    None => return Err(Error::Dwarf(format!("register rule from {from}"))),
                },
                RegisterRule::Expression(expr) => Location::Address(expr.evaluate(mem, frame, Some(cfa))?),
                RegisterRule::ValExpression(expr) => {
                    Location::Value(expr.evaluate(mem, frame, Some(cfa))?)
                }
            };
            recover(mem, &mut caller, register, location)?;
        }
        Ok(caller)
    }
}

enum Location {
    Address(u64),
    Value(u64),
}

fn recover<M: Memory + ?Sized>(
    mem: &M,
    caller: &mut Context64,
    register: u16,
    location: Location,
) -> Result<()> {
    if (register::XMM0..=register::XMM15).contains(&register) {
        let Location::Address(address) = location else {
            return Err(Error::Dwarf(format!("value rule for xmm register {register}")));
        };
        caller.set_xmm(usize::from(register - register::XMM0), mem.read_m128(address)?);
        return Ok(());
    }

    let value = match location {
        Location::Address(address) => mem.read_u64(address)?,
        Location::Value(value) => value,
    };
    match register {
        register::RIP => caller.rip = value,
        _ => match gpr_index(register) {
            Some(index) => caller.gpr[index] = value,
            None => return Err(Error::Dwarf(format!("unknown register {register}"))),
        },
    }
    Ok(())
}
