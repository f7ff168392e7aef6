//! A DWARF expression stack machine, the subset CFI uses to locate registers.
//!
//! Source: <https://dwarfstd.org/doc/DWARF5.pdf> §2.5 DWARF Expressions
#![allow(non_upper_case_globals)]

use alloc::{format, vec::Vec};

use super::register_value;
use crate::context::Context64;
use crate::cursor::Cursor;
use crate::env::Memory;
use crate::error::{Error, Result};

const DW_OP_deref: u8 = 0x06;
const DW_OP_const1u: u8 = 0x08;
const DW_OP_const1s: u8 = 0x09;
const DW_OP_const2u: u8 = 0x0a;
const DW_OP_const2s: u8 = 0x0b;
const DW_OP_const4u: u8 = 0x0c;
const DW_OP_const4s: u8 = 0x0d;
const DW_OP_const8u: u8 = 0x0e;
const DW_OP_const8s: u8 = 0x0f;
const DW_OP_constu: u8 = 0x10;
const DW_OP_consts: u8 = 0x11;
const DW_OP_dup: u8 = 0x12;
const DW_OP_drop: u8 = 0x13;
const DW_OP_over: u8 = 0x14;
const DW_OP_swap: u8 = 0x16;
const DW_OP_minus: u8 = 0x1c;
const DW_OP_plus: u8 = 0x22;
const DW_OP_plus_uconst: u8 = 0x23;
const DW_OP_lit0: u8 = 0x30;
const DW_OP_lit31: u8 = 0x4f;
const DW_OP_breg0: u8 = 0x70;
const DW_OP_breg31: u8 = 0x8f;

/// Deeper than any location expression a compiler emits.
const MAX_DEPTH: usize = 64;

/// The encoded operations of one expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expression<'a>(pub &'a [u8]);

impl Expression<'_> {
    /// Runs the expression against the registers of `registers`, with
    /// `initial` pushed first if given, and returns the top of the stack.
    pub fn evaluate<M: Memory + ?Sized>(
        &self,
        mem: &M,
        registers: &Context64,
        initial: Option<u64>,
    ) -> Result<u64> {
        let mut cursor = Cursor::new(self.0, "DWARF expression");
        let mut stack = Stack(Vec::new());
        if let Some(value) = initial {
            stack.push(value)?;
        }

        while !cursor.is_empty() {
            let op = cursor.read_u8()?;
            match op {
                DW_OP_deref => {
                    let addr = stack.pop()?;
                    stack.push(mem.read_u64(addr)?)?;
                }
                DW_OP_const1u => stack.push(u64::from(cursor.read_u8()?))?,
                DW_OP_const1s => stack.push(cursor.read_u8()? as i8 as u64)?,
                DW_OP_const2u => stack.push(u64::from(cursor.read_u16()?))?,
                DW_OP_const2s => stack.push(cursor.read_u16()? as i16 as u64)?,
                DW_OP_const4u => stack.push(u64::from(cursor.read_u32()?))?,
                DW_OP_const4s => stack.push(cursor.read_u32()? as i32 as u64)?,
                DW_OP_const8u | DW_OP_const8s => stack.push(cursor.read_u64()?)?,
                DW_OP_constu => stack.push(cursor.read_uleb128()?)?,
                DW_OP_consts => stack.push(cursor.read_ileb128()? as u64)?,
                DW_OP_dup => {
                    let top = stack.peek(0)?;
                    stack.push(top)?;
                }
                DW_OP_drop => {
                    stack.pop()?;
                }
                DW_OP_over => {
                    let second = stack.peek(1)?;
                    stack.push(second)?;
                }
                DW_OP_swap => {
                    let a = stack.pop()?;
                    let b = stack.pop()?;
                    stack.push(a)?;
                    stack.push(b)?;
                }
                DW_OP_minus => {
                    let a = stack.pop()?;
                    let b = stack.pop()?;
                    stack.push(b.wrapping_sub(a))?;
                }
                DW_OP_plus => {
                    let a = stack.pop()?;
                    let b = stack.pop()?;
                    stack.push(b.wrapping_add(a))?;
                }
                DW_OP_plus_uconst => {
                    let a = stack.pop()?;
                    stack.push(a.wrapping_add(cursor.read_uleb128()?))?;
                }
                DW_OP_lit0..=DW_OP_lit31 => stack.push(u64::from(op - DW_OP_lit0))?,
                DW_OP_breg0..=DW_OP_breg31 => {
                    let register = u16::from(op - DW_OP_breg0);
                    let base = register_value(registers, register).ok_or_else(|| {
                        Error::Dwarf(format!("DW_OP_breg of register {register}"))
                    })?;
                    stack.push(base.wrapping_add_signed(cursor.read_ileb128()?))?;
                }
                _ => return Err(Error::Dwarf(format!("unsupported DWARF operation {op:#x}"))),
            }
        }
        stack.pop()
    }
}

struct Stack(Vec<u64>);

impl Stack {
    fn push(&mut self, value: u64) -> Result<()> {
        if self.0.len() >= MAX_DEPTH {
            return Err(Error::Dwarf("expression stack overflow".into()));
        }
        self.0.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<u64> {
        self.0
            .pop()
            .ok_or_else(|| Error::Dwarf("expression stack underflow".into()))
    }

    fn peek(&self, depth: usize) -> Result<u64> {
        self.0
            .len()
            .checked_sub(depth + 1)
            .map(|i| self.0[i])
            .ok_or_else(|| Error::Dwarf("expression stack underflow".into()))
    }
}
