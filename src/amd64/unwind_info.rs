//! Decoder for the `UNWIND_INFO` record the compiler emits for every x64
//! function with a prologue.
//!
//! ```text
//! byte 0      version (bits 0-2), flags (bits 3-7)
//! byte 1      size of the prologue in bytes
//! byte 2      number of 2-byte unwind code slots
//! byte 3      frame register (bits 0-3), scaled frame offset (bits 4-7)
//! 4..         unwind code slots, padded to an even count
//! trailer     chained RUNTIME_FUNCTION, or handler rva + handler data
//! ```
//!
//! Decoding happens once per function, [`super::virtual_unwind`] interprets the
//! result against a context.

use alloc::vec::Vec;

use super::function_table::RuntimeFunction;
use crate::cursor::Cursor;
use crate::env::Memory;
use crate::error::{Error, Result};
use crate::status::{UNW_FLAG_CHAININFO, UNW_FLAG_EHANDLER, UNW_FLAG_UHANDLER};
use crate::Addr;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

const HEADER_SIZE: usize = 4;

/// One decoded prologue operation. Offsets are in bytes from the establisher
/// frame, already scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    /// `push reg`
    PushNonvol { reg: u8 },
    /// `sub rsp, size`, both the small and the large encodings.
    Alloc { size: u32 },
    /// `lea frame_reg, [rsp + frame_offset * 16]`
    SetFpreg,
    /// `mov [rsp + offset], reg`
    SaveNonvol { reg: u8, offset: u32 },
    /// `movaps [rsp + offset], xmm{reg}`
    SaveXmm128 { reg: u8, offset: u32 },
    /// The hardware pushed an interrupt frame.
    PushMachframe { error_code: bool },
    /// Codes this decoder does not know are carried along and skipped.
    Unknown { code: u8, info: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    /// Offset of the end of the instruction inside the prologue.
    pub prolog_offset: u8,
    pub op: UnwindOp,
}

/// What follows the unwind codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    None,
    /// `UNW_FLAG_CHAININFO`: continue with the info of this function.
    Chained(RuntimeFunction),
    /// `UNW_FLAG_EHANDLER` / `UNW_FLAG_UHANDLER`.
    Handler {
        rva: u32,
        /// Guest address of the language specific data after the rva.
        data: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    /// Zero when the function does not use a frame pointer.
    pub frame_register: u8,
    /// In units of 16 bytes.
    pub frame_offset: u8,
    /// In the order they are stored, which is reverse prologue order.
    pub codes: Vec<UnwindCode>,
    pub trailer: Trailer,
}

/// Offset of the trailer from the start of the record.
fn trailer_offset(count: u8) -> usize {
    HEADER_SIZE + ((usize::from(count) + 1) & !1) * 2
}

fn trailer_size(flags: u8) -> usize {
    if flags & UNW_FLAG_CHAININFO != 0 {
        RuntimeFunction::SIZE as usize
    } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
        4
    } else {
        0
    }
}

impl UnwindInfo {
    pub fn has_frame_register(&self) -> bool {
        self.frame_register != 0
    }

    /// The chained function, if this info continues in another one.
    pub fn chained(&self) -> Option<RuntimeFunction> {
        match self.trailer {
            Trailer::Chained(function) => Some(function),
            _ => None,
        }
    }

    /// Reads the record at `at` from guest memory.
    pub fn read<M: Memory + ?Sized>(mem: &M, at: u64) -> Result<Self> {
        let mut header = [0; HEADER_SIZE];
        mem.read_bytes(at, &mut header)?;
        let version = header[0] & 0x7;
        if version != 1 {
            return Err(Error::UnsupportedVersion {
                version,
                at: Addr(at),
            });
        }
        let flags = header[0] >> 3;
        let len = trailer_offset(header[2]) + trailer_size(flags);

        let mut bytes = alloc::vec![0; len];
        mem.read_bytes(at, &mut bytes)?;
        Self::parse(&bytes, at)
    }

    /// Decodes a record. `at` is where `bytes` lives in the guest, it is only
    /// used to locate the handler data.
    pub fn parse(bytes: &[u8], at: u64) -> Result<Self> {
        let mut header = Cursor::new(bytes, "UNWIND_INFO header");
        let b0 = header.read_u8()?;
        let prolog_size = header.read_u8()?;
        let count = header.read_u8()?;
        let frame = header.read_u8()?;

        let version = b0 & 0x7;
        if version != 1 {
            return Err(Error::UnsupportedVersion {
                version,
                at: Addr(at),
            });
        }
        let flags = b0 >> 3;

        let slots = bytes
            .get(HEADER_SIZE..HEADER_SIZE + usize::from(count) * 2)
            .ok_or(Error::Truncated {
                what: "unwind codes",
                needed: HEADER_SIZE + usize::from(count) * 2,
                available: bytes.len(),
            })?;
        let codes = parse_codes(slots)?;

        let start = trailer_offset(count);
        let mut trailer = Cursor::new(bytes.get(start..).unwrap_or_default(), "UNWIND_INFO trailer");
        let trailer = if flags & UNW_FLAG_CHAININFO != 0 {
            Trailer::Chained(RuntimeFunction {
                begin: trailer.read_u32()?,
                end: trailer.read_u32()?,
                unwind_data: trailer.read_u32()?,
            })
        } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
            Trailer::Handler {
                rva: trailer.read_u32()?,
                data: at + start as u64 + 4,
            }
        } else {
            Trailer::None
        };

        Ok(Self {
            version,
            flags,
            prolog_size,
            frame_register: frame & 0xf,
            frame_offset: frame >> 4,
            codes,
            trailer,
        })
    }

    /// Encodes the record up to and including the handler rva. Handler data
    /// goes right after it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut slots = Vec::new();
        for code in &self.codes {
            code.op.encode(code.prolog_offset, &mut slots);
        }
        let count = slots.len() / 2;
        if count % 2 == 1 {
            slots.extend_from_slice(&[0, 0]);
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + slots.len() + 12);
        out.push((self.version & 0x7) | (self.flags << 3));
        out.push(self.prolog_size);
        out.push(count as u8);
        out.push((self.frame_register & 0xf) | (self.frame_offset << 4));
        out.extend_from_slice(&slots);
        match self.trailer {
            Trailer::None => {}
            Trailer::Chained(function) => {
                for field in [function.begin, function.end, function.unwind_data] {
                    out.extend_from_slice(&field.to_le_bytes());
                }
            }
            Trailer::Handler { rva, .. } => out.extend_from_slice(&rva.to_le_bytes()),
        }
        out
    }
}

fn parse_codes(slots: &[u8]) -> Result<Vec<UnwindCode>> {
    let mut cursor = Cursor::new(slots, "unwind code");
    let mut codes = Vec::new();

    while !cursor.is_empty() {
        let prolog_offset = cursor.read_u8()?;
        let op_info = cursor.read_u8()?;
        let (code, info) = (op_info & 0xf, op_info >> 4);

        let op = match code {
            UWOP_PUSH_NONVOL => UnwindOp::PushNonvol { reg: info },
            UWOP_ALLOC_LARGE if info == 0 => UnwindOp::Alloc {
                size: u32::from(cursor.read_u16()?) * 8,
            },
            UWOP_ALLOC_LARGE => UnwindOp::Alloc {
                size: cursor.read_u32()?,
            },
            UWOP_ALLOC_SMALL => UnwindOp::Alloc {
                size: (u32::from(info) + 1) * 8,
            },
            UWOP_SET_FPREG => UnwindOp::SetFpreg,
            UWOP_SAVE_NONVOL => UnwindOp::SaveNonvol {
                reg: info,
                offset: u32::from(cursor.read_u16()?) * 8,
            },
            UWOP_SAVE_NONVOL_FAR => UnwindOp::SaveNonvol {
                reg: info,
                offset: cursor.read_u32()?,
            },
            UWOP_SAVE_XMM128 => UnwindOp::SaveXmm128 {
                reg: info,
                offset: u32::from(cursor.read_u16()?) * 16,
            },
            UWOP_SAVE_XMM128_FAR => UnwindOp::SaveXmm128 {
                reg: info,
                offset: cursor.read_u32()?,
            },
            UWOP_PUSH_MACHFRAME => UnwindOp::PushMachframe {
                error_code: info != 0,
            },
            // everything else, including the obsolete codes 6 and 7, is one slot
            _ => UnwindOp::Unknown { code, info },
        };
        codes.push(UnwindCode { prolog_offset, op });
    }
    Ok(codes)
}

fn push_slot(out: &mut Vec<u8>, prolog_offset: u8, code: u8, info: u8) {
    out.push(prolog_offset);
    out.push(code | (info << 4));
}

/// Encoding side, for building images.
impl UnwindOp {
    /// Appends the slots of this operation, picking the shortest encoding.
    pub fn encode(self, prolog_offset: u8, out: &mut Vec<u8>) {
        match self {
            UnwindOp::PushNonvol { reg } => push_slot(out, prolog_offset, UWOP_PUSH_NONVOL, reg),
            UnwindOp::Alloc { size } if (8..=128).contains(&size) && size % 8 == 0 => {
                push_slot(out, prolog_offset, UWOP_ALLOC_SMALL, (size / 8 - 1) as u8)
            }
            UnwindOp::Alloc { size } if size % 8 == 0 && size / 8 <= 0xffff => {
                push_slot(out, prolog_offset, UWOP_ALLOC_LARGE, 0);
                out.extend_from_slice(&((size / 8) as u16).to_le_bytes());
            }
            UnwindOp::Alloc { size } => {
                push_slot(out, prolog_offset, UWOP_ALLOC_LARGE, 1);
                out.extend_from_slice(&size.to_le_bytes());
            }
            UnwindOp::SetFpreg => push_slot(out, prolog_offset, UWOP_SET_FPREG, 0),
            UnwindOp::SaveNonvol { reg, offset } if offset % 8 == 0 && offset / 8 <= 0xffff => {
                push_slot(out, prolog_offset, UWOP_SAVE_NONVOL, reg);
                out.extend_from_slice(&((offset / 8) as u16).to_le_bytes());
            }
            UnwindOp::SaveNonvol { reg, offset } => {
                push_slot(out, prolog_offset, UWOP_SAVE_NONVOL_FAR, reg);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            UnwindOp::SaveXmm128 { reg, offset } if offset % 16 == 0 && offset / 16 <= 0xffff => {
                push_slot(out, prolog_offset, UWOP_SAVE_XMM128, reg);
                out.extend_from_slice(&((offset / 16) as u16).to_le_bytes());
            }
            UnwindOp::SaveXmm128 { reg, offset } => {
                push_slot(out, prolog_offset, UWOP_SAVE_XMM128_FAR, reg);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            UnwindOp::PushMachframe { error_code } => {
                push_slot(out, prolog_offset, UWOP_PUSH_MACHFRAME, u8::from(error_code))
            }
            UnwindOp::Unknown { code, info } => push_slot(out, prolog_offset, code, info),
        }
    }
}
