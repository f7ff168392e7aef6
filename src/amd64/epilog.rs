//! Epilogue recognition.
//!
//! Unwind codes describe the prologue only. When the pc is already inside the
//! epilogue some of the prologue has been undone, so instead of applying the
//! codes the remaining epilogue instructions are decoded from the code bytes
//! and simulated.
//!
//! Recognized sequences, in this order:
//!
//! * optionally one stack adjustment, which needs a `REX.W` prefix:
//!   `48 81 c4 imm32` (`add rsp, imm32`), `48 83 c4 imm8` (`add rsp, imm8`),
//!   `lea rsp, [reg + disp8/disp32]` (`8d` with mod 1 or 2, no SIB, `REX.R`
//!   and `REX.X` clear);
//! * any number of `pop reg` (`58`-`5f`, with an optional REX prefix selecting
//!   `r8`-`r15`);
//! * `jmp rel8` / `jmp rel32` are followed as long as they stay inside the
//!   function;
//! * terminated by `ret` (`c3`), `ret imm16` (`c2`) or `rep ret` (`f3 c3`).
//!
//! Anything else, including a jump leaving the function, means the pc is not
//! inside an epilogue. NOP padding in debug builds is not recognized.

use alloc::vec::Vec;

use super::function_table::RuntimeFunction;
use super::virtual_unwind::NonvolatilePointers;
use crate::context::{Context64, RSP};
use crate::env::Memory;
use crate::error::Result;
use crate::Addr;

/// Upper bound on decoded bytes, `jmp` loops inside the function would
/// otherwise never end.
const MAX_STEPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpilogInsn {
    /// `add rsp, imm`
    AddRsp(i32),
    /// `lea rsp, [base + disp]`
    LeaRsp { base: usize, disp: i32 },
    /// `pop reg`, register number as in the unwind codes.
    Pop(usize),
    /// `ret` / `ret imm16`
    Ret { pop: u16 },
}

/// Reads code bytes one at a time, unmapped bytes end the match.
struct Code<'m, M: ?Sized> {
    mem: &'m M,
    pc: u64,
}

impl<M: Memory + ?Sized> Code<'_, M> {
    fn at(&self, offset: u64) -> Option<u8> {
        self.mem.read_u8(self.pc.wrapping_add(offset)).ok()
    }

    fn i8_at(&self, offset: u64) -> Option<i32> {
        self.at(offset).map(|b| i32::from(b as i8))
    }

    fn i32_at(&self, offset: u64) -> Option<i32> {
        self.mem
            .read_u32(self.pc.wrapping_add(offset))
            .ok()
            .map(|v| v as i32)
    }

    fn u16_at(&self, offset: u64) -> Option<u16> {
        self.mem.read_u16(self.pc.wrapping_add(offset)).ok()
    }

    fn advance(&mut self, amount: u64) {
        self.pc = self.pc.wrapping_add(amount);
    }
}

/// Decodes the epilogue starting at `pc`. `None` if `pc` is not inside one.
pub fn decode<M: Memory + ?Sized>(
    mem: &M,
    pc: u64,
    image_base: u64,
    function: &RuntimeFunction,
) -> Option<Vec<EpilogInsn>> {
    let mut code = Code { mem, pc };
    let mut insns = Vec::new();

    let rex = code.at(0)?;
    if rex & 0xf8 == 0x48 {
        match code.at(1)? {
            0x81 => {
                if rex != 0x48 || code.at(2)? != 0xc4 {
                    return None;
                }
                insns.push(EpilogInsn::AddRsp(code.i32_at(3)?));
                code.advance(7);
            }
            0x83 => {
                if rex != 0x48 || code.at(2)? != 0xc4 {
                    return None;
                }
                insns.push(EpilogInsn::AddRsp(code.i8_at(3)?));
                code.advance(4);
            }
            0x8d => {
                let modrm = code.at(2)?;
                // REX.R and REX.X must be clear, the destination must be rsp
                // and there must not be a SIB byte
                if rex & 0x06 != 0 || (modrm >> 3) & 7 != RSP as u8 || modrm & 7 == 4 {
                    return None;
                }
                let base = usize::from(modrm & 7) + usize::from(rex & 1) * 8;
                match modrm >> 6 {
                    1 => {
                        insns.push(EpilogInsn::LeaRsp {
                            base,
                            disp: code.i8_at(3)?,
                        });
                        code.advance(4);
                    }
                    2 => {
                        insns.push(EpilogInsn::LeaRsp {
                            base,
                            disp: code.i32_at(3)?,
                        });
                        code.advance(7);
                    }
                    _ => return None,
                }
            }
            _ => {}
        }
    }

    let inside = |target: u64| {
        let rva = target.wrapping_sub(image_base);
        function.contains_rva(rva)
    };

    for _ in 0..MAX_STEPS {
        let mut rex = 0;
        if code.at(0)? & 0xf0 == 0x40 {
            rex = code.at(0)? & 0x0f;
            code.advance(1);
        }

        match code.at(0)? {
            op @ 0x58..=0x5f => {
                insns.push(EpilogInsn::Pop(
                    usize::from(op - 0x58) + usize::from(rex & 1) * 8,
                ));
                code.advance(1);
            }
            0xc2 => {
                insns.push(EpilogInsn::Ret {
                    pop: code.u16_at(1)?,
                });
                return Some(insns);
            }
            0xc3 => {
                insns.push(EpilogInsn::Ret { pop: 0 });
                return Some(insns);
            }
            0xf3 => {
                if code.at(1)? != 0xc3 {
                    return None;
                }
                insns.push(EpilogInsn::Ret { pop: 0 });
                return Some(insns);
            }
            0xe9 => {
                let rel = i64::from(code.i32_at(1)?);
                code.advance(5u64.wrapping_add(rel as u64));
                if !inside(code.pc) {
                    return None;
                }
            }
            0xeb => {
                let rel = i64::from(code.i8_at(1)?);
                code.advance(2u64.wrapping_add(rel as u64));
                if !inside(code.pc) {
                    return None;
                }
            }
            _ => return None,
        }
    }
    trace!(pc = ?Addr(pc), "epilog did not terminate");
    None
}

/// Whether `pc` points into an epilogue of `function`.
pub fn is_inside_epilog<M: Memory + ?Sized>(
    mem: &M,
    pc: u64,
    image_base: u64,
    function: &RuntimeFunction,
) -> bool {
    decode(mem, pc, image_base, function).is_some()
}

/// Runs decoded epilogue instructions against `context`, ending with the
/// return address in `rip`.
pub fn execute<M: Memory + ?Sized>(
    mem: &M,
    insns: &[EpilogInsn],
    context: &mut Context64,
    mut pointers: Option<&mut NonvolatilePointers>,
) -> Result<()> {
    for insn in insns {
        match *insn {
            EpilogInsn::AddRsp(amount) => {
                context.set_rsp(context.rsp().wrapping_add(amount as i64 as u64));
            }
            EpilogInsn::LeaRsp { base, disp } => {
                context.set_rsp(context.gpr[base].wrapping_add(disp as i64 as u64));
            }
            EpilogInsn::Pop(reg) => {
                let slot = context.rsp();
                context.gpr[reg] = mem.read_u64(slot)?;
                if let Some(pointers) = pointers.as_deref_mut() {
                    pointers.integer[reg] = Some(slot);
                }
                context.set_rsp(context.rsp().wrapping_add(8));
            }
            EpilogInsn::Ret { pop } => {
                context.rip = mem.read_u64(context.rsp())?;
                context.set_rsp(context.rsp().wrapping_add(8 + u64::from(pop)));
            }
        }
    }
    Ok(())
}
