//! Builds images the way a linker would lay out the parts exception
//! dispatch reads: code, `UNWIND_INFO` records with their handler data, and
//! a sorted exception directory. Headers are left out, the module registry
//! is told where the directory is.

use super::asm;
use super::memory::SimMemory;
use crate::amd64::function_table::RuntimeFunction;
use crate::amd64::unwind_info::{Trailer, UnwindCode, UnwindInfo, UnwindOp};
use crate::context::Context64;
use crate::env::Module;
use crate::error::Result;

/// Code starts after the (absent) headers, like `.text` does.
pub const TEXT_RVA: u32 = 0x1000;

/// A function under construction. The prologue is emitted as real
/// instructions so the unwind codes carry the offsets a compiler would
/// record.
#[derive(Debug, Clone, Default)]
pub struct FunctionBuilder {
    code: Vec<u8>,
    /// Execution order.
    prolog: Vec<UnwindCode>,
    prolog_size: u8,
    frame_register: u8,
    frame_offset: u8,
    body: Option<u32>,
    epilog: Option<u32>,
    parent: Option<usize>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(mut self, insn: Vec<u8>, op: UnwindOp) -> Self {
        self.code.extend_from_slice(&insn);
        self.prolog.push(UnwindCode {
            prolog_offset: self.code.len() as u8,
            op,
        });
        self.prolog_size = self.code.len() as u8;
        self
    }

    pub fn push(self, reg: usize) -> Self {
        self.op(asm::push(reg), UnwindOp::PushNonvol { reg: reg as u8 })
    }

    pub fn alloc(self, size: u32) -> Self {
        self.op(asm::sub_rsp(size), UnwindOp::Alloc { size })
    }

    /// `lea reg, [rsp + offset * 16]`, making `reg` the frame pointer.
    pub fn set_frame(mut self, reg: usize, offset: u8) -> Self {
        self.frame_register = reg as u8;
        self.frame_offset = offset;
        self.op(asm::lea_from_rsp(reg, i32::from(offset) * 16), UnwindOp::SetFpreg)
    }

    pub fn save(self, reg: usize, offset: u32) -> Self {
        self.op(
            asm::save(reg, offset),
            UnwindOp::SaveNonvol {
                reg: reg as u8,
                offset,
            },
        )
    }

    pub fn save_xmm(self, reg: usize, offset: u32) -> Self {
        self.op(
            asm::save_xmm(reg, offset),
            UnwindOp::SaveXmm128 {
                reg: reg as u8,
                offset,
            },
        )
    }

    /// `len` bytes of function body after the prologue.
    pub fn body(mut self, len: usize) -> Self {
        self.body.get_or_insert(self.code.len() as u32);
        self.code.resize(self.code.len() + len, asm::INT3);
        self
    }

    /// The epilogue undoing the prologue: release the frame, pop the pushed
    /// registers, return.
    pub fn epilog(mut self) -> Self {
        self.epilog = Some(self.code.len() as u32);
        let mut insns = Vec::new();
        if self.frame_register != 0 {
            // rsp = frame pointer - offset, then drop whatever was allocated
            // before the frame pointer was set
            let mut allocated_after = 0;
            for code in self.prolog.iter().rev() {
                match code.op {
                    UnwindOp::SetFpreg => break,
                    UnwindOp::Alloc { size } => allocated_after += size,
                    _ => {}
                }
            }
            let before: u32 = self.allocated() - allocated_after;
            let disp = i32::from(self.frame_offset) * -16 + before as i32;
            insns.push(asm::lea_rsp(usize::from(self.frame_register), disp));
        } else if self.allocated() != 0 {
            insns.push(asm::add_rsp(self.allocated()));
        }
        for code in self.prolog.iter().rev() {
            if let UnwindOp::PushNonvol { reg } = code.op {
                insns.push(asm::pop(usize::from(reg)));
            }
        }
        insns.push(asm::ret());
        for insn in insns {
            self.code.extend_from_slice(&insn);
        }
        self
    }

    /// Raw code bytes, for epilogue variants the builder does not emit.
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.code.extend_from_slice(bytes);
        self
    }

    /// Makes this a fragment whose unwind info chains to `parent`.
    pub fn chained_to(mut self, parent: &PlacedFunction) -> Self {
        self.parent = Some(parent.index);
        self
    }

    fn allocated(&self) -> u32 {
        self.prolog
            .iter()
            .map(|code| match code.op {
                UnwindOp::Alloc { size } => size,
                _ => 0,
            })
            .sum()
    }
}

/// Where a function ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedFunction {
    index: usize,
    pub image_base: u64,
    pub begin: u32,
    pub end: u32,
    pub body: Option<u32>,
    pub epilog: Option<u32>,
    pub prolog: Vec<UnwindCode>,
    pub frame_register: u8,
    pub frame_offset: u8,
}

impl PlacedFunction {
    pub fn begin_address(&self) -> u64 {
        self.image_base + u64::from(self.begin)
    }

    /// Address `offset` bytes into the body.
    pub fn body_address(&self, offset: u32) -> u64 {
        self.begin_address() + u64::from(self.body.unwrap_or(0) + offset)
    }

    pub fn epilog_address(&self) -> Option<u64> {
        self.epilog.map(|e| self.begin_address() + u64::from(e))
    }

    /// Image relative `[begin, end)` of `len` body bytes starting `offset`
    /// bytes into the body, for scope tables.
    pub fn body_range(&self, offset: u32, len: u32) -> (u32, u32) {
        let begin = self.begin + self.body.unwrap_or(0) + offset;
        (begin, begin + len)
    }

    /// Simulates a call of this function from `context`: pushes the return
    /// address `context.rip`, runs the whole prologue and leaves `rip` at
    /// the start of the body.
    pub fn enter(&self, mem: &mut SimMemory, context: &mut Context64) -> Result<()> {
        self.enter_partial(mem, context, u8::MAX)?;
        context.rip = self.body_address(0);
        Ok(())
    }

    /// Like [`PlacedFunction::enter`], but stops inside the prologue after
    /// the instructions ending at or before `prolog_offset`.
    pub fn enter_partial(
        &self,
        mem: &mut SimMemory,
        context: &mut Context64,
        prolog_offset: u8,
    ) -> Result<()> {
        let return_address = context.rip;
        push_u64(mem, context, return_address)?;
        let mut pc_offset = 0;

        for code in &self.prolog {
            if code.prolog_offset > prolog_offset {
                break;
            }
            pc_offset = code.prolog_offset;
            match code.op {
                UnwindOp::PushNonvol { reg } => {
                    let value = context.gpr[usize::from(reg)];
                    push_u64(mem, context, value)?;
                }
                UnwindOp::Alloc { size } => {
                    context.set_rsp(context.rsp() - u64::from(size));
                }
                UnwindOp::SetFpreg => {
                    context.gpr[usize::from(self.frame_register)] =
                        context.rsp() + u64::from(self.frame_offset) * 16;
                }
                UnwindOp::SaveNonvol { reg, offset } => {
                    let value = context.gpr[usize::from(reg)];
                    mem.write_u64(context.rsp() + u64::from(offset), value)?;
                }
                UnwindOp::SaveXmm128 { reg, offset } => {
                    let value = context.xmm(usize::from(reg));
                    mem.write_bytes(context.rsp() + u64::from(offset), &value.to_le_bytes())?;
                }
                UnwindOp::PushMachframe { .. } | UnwindOp::Unknown { .. } => {}
            }
        }
        context.rip = self.begin_address() + u64::from(pc_offset);
        Ok(())
    }
}

fn push_u64(mem: &mut SimMemory, context: &mut Context64, value: u64) -> Result<()> {
    context.set_rsp(context.rsp() - 8);
    mem.write_u64(context.rsp(), value)
}

#[derive(Debug, Clone)]
struct Pending {
    placed: PlacedFunction,
    prolog_size: u8,
    parent: Option<usize>,
    handler: Option<(u8, u32, Vec<u8>)>,
}

#[derive(Debug, Clone)]
struct ChainLink {
    begin: u32,
    end: u32,
    target: usize,
}

/// A finished image, ready to be mapped.
#[derive(Debug, Clone)]
pub struct Image {
    pub module: Module,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    base: u64,
    bytes: Vec<u8>,
    functions: Vec<Pending>,
    links: Vec<ChainLink>,
}

impl ImageBuilder {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            bytes: vec![0; TEXT_RVA as usize],
            functions: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    fn append(&mut self, bytes: &[u8], align: usize, fill: u8) -> u32 {
        let padded = self.bytes.len().next_multiple_of(align);
        self.bytes.resize(padded, fill);
        let rva = self.bytes.len() as u32;
        self.bytes.extend_from_slice(bytes);
        rva
    }

    /// Reserves a few bytes of code that never run, to give a callback
    /// registered with the simulator a guest address inside the image.
    pub fn stub(&mut self) -> u64 {
        self.base + u64::from(self.append(&[asm::INT3; 16], 16, asm::INT3))
    }

    /// Places the code of `function` and registers it in the exception
    /// directory.
    pub fn add_function(&mut self, function: FunctionBuilder) -> PlacedFunction {
        let begin = self.append(&function.code, 16, asm::INT3);
        let placed = PlacedFunction {
            index: self.functions.len(),
            image_base: self.base,
            begin,
            end: begin + function.code.len() as u32,
            body: function.body,
            epilog: function.epilog,
            prolog: function.prolog,
            frame_register: function.frame_register,
            frame_offset: function.frame_offset,
        };
        self.functions.push(Pending {
            placed: placed.clone(),
            prolog_size: function.prolog_size,
            parent: function.parent,
            handler: None,
        });
        placed
    }

    /// Gives `function` a language handler at guest address `handler`,
    /// followed by `data` (a scope table for `__C_specific_handler`).
    pub fn set_handler(&mut self, function: &PlacedFunction, flags: u8, handler: u64, data: Vec<u8>) {
        let rva = (handler - self.base) as u32;
        self.functions[function.index].handler = Some((flags, rva, data));
    }

    /// An exception directory entry for `[begin, end)` that only points at
    /// the entry of `target`.
    pub fn add_chain_link(&mut self, begin: u32, end: u32, target: &PlacedFunction) {
        self.links.push(ChainLink {
            begin,
            end,
            target: target.index,
        });
    }

    pub fn build(mut self) -> Image {
        let mut entries: Vec<RuntimeFunction> = Vec::new();
        let functions = std::mem::take(&mut self.functions);

        for pending in &functions {
            let (flags, trailer, data) = match (&pending.handler, pending.parent) {
                (_, Some(parent)) => (
                    crate::status::UNW_FLAG_CHAININFO,
                    Trailer::Chained(entries[parent]),
                    Vec::new(),
                ),
                (Some((flags, rva, data)), None) => (
                    *flags,
                    Trailer::Handler { rva: *rva, data: 0 },
                    data.clone(),
                ),
                (None, None) => (0, Trailer::None, Vec::new()),
            };
            let info = UnwindInfo {
                version: 1,
                flags,
                prolog_size: pending.prolog_size,
                frame_register: pending.placed.frame_register,
                frame_offset: pending.placed.frame_offset,
                codes: pending.placed.prolog.iter().rev().copied().collect(),
                trailer,
            };
            let mut bytes = info.to_bytes();
            bytes.extend_from_slice(&data);
            let unwind_data = self.append(&bytes, 4, 0);
            entries.push(RuntimeFunction {
                begin: pending.placed.begin,
                end: pending.placed.end,
                unwind_data,
            });
        }

        let mut table = entries.clone();
        for link in std::mem::take(&mut self.links) {
            let target = entries[link.target];
            let mut copy = Vec::new();
            for field in [target.begin, target.end, target.unwind_data] {
                copy.extend_from_slice(&field.to_le_bytes());
            }
            let rva = self.append(&copy, 4, 0);
            table.push(RuntimeFunction {
                begin: link.begin,
                end: link.end,
                unwind_data: rva | 1,
            });
        }
        table.sort_by_key(|function| function.begin);

        let mut directory = Vec::new();
        for function in &table {
            for field in [function.begin, function.end, function.unwind_data] {
                directory.extend_from_slice(&field.to_le_bytes());
            }
        }
        let directory_rva = self.append(&directory, 4, 0);

        Image {
            module: Module {
                base: self.base,
                size: self.bytes.len() as u64,
                exception_directory: Some((directory_rva, directory.len() as u32)),
            },
            bytes: self.bytes,
        }
    }
}
