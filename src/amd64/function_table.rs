//! `RtlLookupFunctionEntry`: pc to `RUNTIME_FUNCTION`.

use crate::env::{Memory, ModuleRegistry};
use crate::error::Result;
use crate::Addr;

/// One entry of an image's exception directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    /// Rva of the `UNWIND_INFO`, or with bit 0 set, of another entry this
    /// one is an alias for.
    pub unwind_data: u32,
}

impl RuntimeFunction {
    pub const SIZE: u64 = 12;

    pub fn read<M: Memory + ?Sized>(mem: &M, addr: u64) -> Result<Self> {
        Ok(Self {
            begin: mem.read_u32(addr)?,
            end: mem.read_u32(addr + 4)?,
            unwind_data: mem.read_u32(addr + 8)?,
        })
    }

    pub fn contains_rva(&self, rva: u64) -> bool {
        rva >= u64::from(self.begin) && rva < u64::from(self.end)
    }

    pub fn is_chain_link(&self) -> bool {
        self.unwind_data & 1 != 0
    }
}

/// A resolved function entry, after chain links have been followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    pub image_base: u64,
    /// Where the entry lives, what `RtlLookupFunctionEntry` would return.
    pub address: u64,
    pub function: RuntimeFunction,
}

/// Chains are only ever one or two links deep, anything longer is a cycle.
pub(crate) const MAX_CHAIN_LINKS: usize = 32;

/// `UNWIND_HISTORY_TABLE_SIZE`.
const HISTORY_SIZE: usize = 12;

/// Remembers the last few lookups of a walk. Frames of recursive code and
/// repeated walks over the same stack hit the same functions over and over.
#[derive(Debug, Clone, Default)]
pub struct UnwindHistoryTable {
    /// Absolute `[begin, end)` of the entry that matched, and what it resolved to.
    entries: [Option<(u64, u64, FunctionEntry)>; HISTORY_SIZE],
    next: usize,
}

impl UnwindHistoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, pc: u64) -> Option<FunctionEntry> {
        self.entries
            .iter()
            .flatten()
            .find(|(begin, end, _)| pc >= *begin && pc < *end)
            .map(|(_, _, entry)| *entry)
    }

    fn insert(&mut self, begin: u64, end: u64, entry: FunctionEntry) {
        self.entries[self.next] = Some((begin, end, entry));
        self.next = (self.next + 1) % HISTORY_SIZE;
    }
}

/// Finds the function entry covering `pc`.
///
/// `None` means the frame has no unwind data and is treated as a leaf.
#[instrument(level = "trace", skip(env, history), fields(pc = ?Addr(pc)))]
pub fn lookup_function_entry<E: Memory + ModuleRegistry + ?Sized>(
    env: &E,
    pc: u64,
    history: Option<&mut UnwindHistoryTable>,
) -> Option<FunctionEntry> {
    if let Some(entry) = history.as_ref().and_then(|h| h.lookup(pc)) {
        trace!(entry = ?Addr(entry.address), "found in history table");
        return Some(entry);
    }

    let Some(module) = env.find_module(pc) else {
        // dynamically registered function tables would be consulted here
        trace!("no module");
        return None;
    };
    let (rva, size) = module.exception_directory?;

    let found = match find_function_info(env, pc, module.base, rva, size) {
        Ok(found) => found,
        Err(err) => {
            warn!(%err, base = ?Addr(module.base), "broken exception directory");
            return None;
        }
    };
    let (matched, entry) = found?;

    if let Some(history) = history {
        history.insert(
            module.base + u64::from(matched.begin),
            module.base + u64::from(matched.end),
            entry,
        );
    }
    Some(entry)
}

/// Binary search over the sorted table, then chain links are followed to the
/// canonical entry. Returns the matching entry and what it resolved to.
fn find_function_info<M: Memory + ?Sized>(
    mem: &M,
    pc: u64,
    base: u64,
    table_rva: u32,
    table_size: u32,
) -> Result<Option<(RuntimeFunction, FunctionEntry)>> {
    let table = base + u64::from(table_rva);
    let count = u64::from(table_size) / RuntimeFunction::SIZE;
    let rva = pc.wrapping_sub(base);

    let (mut min, mut max) = (0u64, count);
    while min < max {
        let pos = min + (max - min) / 2;
        let address = table + pos * RuntimeFunction::SIZE;
        let func = RuntimeFunction::read(mem, address)?;

        if rva < u64::from(func.begin) {
            max = pos;
        } else if rva >= u64::from(func.end) {
            min = pos + 1;
        } else {
            let mut address = address;
            let mut resolved = func;
            for _ in 0..MAX_CHAIN_LINKS {
                if !resolved.is_chain_link() {
                    trace!(
                        begin = ?Addr(base + u64::from(resolved.begin)),
                        end = ?Addr(base + u64::from(resolved.end)),
                        "found function entry"
                    );
                    return Ok(Some((
                        func,
                        FunctionEntry {
                            image_base: base,
                            address,
                            function: resolved,
                        },
                    )));
                }
                address = base + u64::from(resolved.unwind_data & !1);
                trace!(link = ?Addr(address), "following chained entry");
                resolved = RuntimeFunction::read(mem, address)?;
            }
            warn!(entry = ?Addr(address), "chained function entries form a cycle");
            return Ok(None);
        }
    }
    Ok(None)
}

/// `RtlAddFunctionTable`. Accepted so guests that register JIT code keep
/// running, but the lookup never consults these tables.
pub fn add_function_table(functions: u64, count: u32, base: u64) -> bool {
    warn!(
        functions = ?Addr(functions),
        count,
        base = ?Addr(base),
        "dynamic function tables are not supported, ignoring"
    );
    true
}

#[cfg(test)]
mod tests;
