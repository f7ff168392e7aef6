//! Encodings of the handful of instructions prologues and epilogues are
//! made of. Register numbers are the ones the unwind codes use.

use crate::context::RSP;

fn rex_b(reg: usize) -> Option<u8> {
    (reg >= 8).then_some(0x41)
}

pub fn push(reg: usize) -> Vec<u8> {
    rex_b(reg)
        .into_iter()
        .chain([0x50 + (reg & 7) as u8])
        .collect()
}

pub fn pop(reg: usize) -> Vec<u8> {
    rex_b(reg)
        .into_iter()
        .chain([0x58 + (reg & 7) as u8])
        .collect()
}

/// `sub rsp, imm` (`/5`) or `add rsp, imm` (`/0`).
fn rsp_arith(ext: u8, amount: u32) -> Vec<u8> {
    let modrm = 0xc0 | (ext << 3) | RSP as u8;
    if amount <= 0x7f {
        vec![0x48, 0x83, modrm, amount as u8]
    } else {
        let mut out = vec![0x48, 0x81, modrm];
        out.extend_from_slice(&amount.to_le_bytes());
        out
    }
}

pub fn sub_rsp(amount: u32) -> Vec<u8> {
    rsp_arith(5, amount)
}

pub fn add_rsp(amount: u32) -> Vec<u8> {
    rsp_arith(0, amount)
}

fn with_disp(mut out: Vec<u8>, modrm_reg: u8, rm: u8, disp: i32) -> Vec<u8> {
    let small = i8::try_from(disp).is_ok();
    let mode = if small { 0x40 } else { 0x80 };
    out.push(mode | (modrm_reg << 3) | rm);
    if rm == 4 {
        out.push(0x24);
    }
    if small {
        out.push(disp as i8 as u8);
    } else {
        out.extend_from_slice(&disp.to_le_bytes());
    }
    out
}

/// `lea reg, [rsp + disp]`
pub fn lea_from_rsp(reg: usize, disp: i32) -> Vec<u8> {
    let rex = 0x48 | (((reg >> 3) as u8) << 2);
    with_disp(vec![rex, 0x8d], (reg & 7) as u8, 4, disp)
}

/// `lea rsp, [base + disp]`. `base` must not be `rsp` or `r12`.
pub fn lea_rsp(base: usize, disp: i32) -> Vec<u8> {
    let rex = 0x48 | (base >> 3) as u8;
    with_disp(vec![rex, 0x8d], RSP as u8, (base & 7) as u8, disp)
}

/// `mov [rsp + offset], reg`
pub fn save(reg: usize, offset: u32) -> Vec<u8> {
    let rex = 0x48 | (((reg >> 3) as u8) << 2);
    with_disp(vec![rex, 0x89], (reg & 7) as u8, 4, offset as i32)
}

/// `movaps [rsp + offset], xmm{reg}`
pub fn save_xmm(reg: usize, offset: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if reg >= 8 {
        out.push(0x44);
    }
    out.extend_from_slice(&[0x0f, 0x29]);
    with_disp(out, (reg & 7) as u8, 4, offset as i32)
}

pub fn ret() -> Vec<u8> {
    vec![0xc3]
}

/// `jmp rel32`, relative to the end of the instruction.
pub fn jmp(rel: i32) -> Vec<u8> {
    let mut out = vec![0xe9];
    out.extend_from_slice(&rel.to_le_bytes());
    out
}

/// Filler for function bodies, never part of an epilogue.
pub const INT3: u8 = 0xcc;
