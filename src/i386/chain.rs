//! `EXCEPTION_REGISTRATION_RECORD` chains as an owned stack.
//!
//! The head of the chain is the last element. Records pushed by the walkers
//! around handler calls live only here, they are never written to guest
//! memory.

use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use crate::env::Memory;
use crate::error::Result;
use crate::stack::StackLimits;
use crate::Addr;

/// The `prev` link of the last record.
pub const CHAIN_END: u32 = 0xffff_ffff;

/// Longer chains than this are treated as corrupt (a cycle, usually).
const MAX_RECORDS: usize = 0x1000;

/// Which walk a nested record guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Search,
    Unwind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationRecord {
    /// A record on the guest stack at `frame`.
    Guest { frame: u32, routine: u32 },
    /// Sits on top of the chain while the handler of `prev` runs, so a walk
    /// started by that handler can tell it reached the outer walk.
    Nested { during: Phase, prev: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationChain {
    records: Vec<RegistrationRecord>,
}

impl RegistrationChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follows the linked list starting at `head` (`NtCurrentTeb()->Tib.ExceptionList`).
    ///
    /// Stops after the first record outside `limits`, which is kept so the
    /// walkers can report it.
    pub fn load<M: Memory + ?Sized>(mem: &M, head: u32, limits: StackLimits) -> Result<Self> {
        let mut records = Vec::new();
        let mut frame = head;
        while frame != CHAIN_END && records.len() < MAX_RECORDS {
            if !limits.is_valid_frame32(frame) {
                trace!(frame = ?Addr(u64::from(frame)), "chain leaves the stack");
                records.push(RegistrationRecord::Guest { frame, routine: 0 });
                break;
            }
            let prev = mem.read_u32(u64::from(frame))?;
            let routine = mem.read_u32(u64::from(frame) + 4)?;
            records.push(RegistrationRecord::Guest { frame, routine });
            frame = prev;
        }
        records.reverse();
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<RegistrationRecord> {
        self.records.get(index).copied()
    }

    /// Innermost record first.
    pub fn iter(&self) -> impl Iterator<Item = &RegistrationRecord> {
        self.records.iter().rev()
    }

    /// The frame of the innermost guest record, what `ExceptionList` points to.
    pub fn head(&self) -> u32 {
        self.iter()
            .find_map(|record| match *record {
                RegistrationRecord::Guest { frame, .. } => Some(frame),
                RegistrationRecord::Nested { .. } => None,
            })
            .unwrap_or(CHAIN_END)
    }

    /// Registers `record` until the returned guard is dropped.
    pub fn push(&mut self, record: RegistrationRecord) -> ChainGuard<'_> {
        let depth = self.records.len();
        self.records.push(record);
        ChainGuard { chain: self, depth }
    }

    /// `__wine_push_frame`: registers the guest record at `frame` as the new
    /// head.
    pub fn push_frame(&mut self, frame: u32, routine: u32) {
        self.records.push(RegistrationRecord::Guest { frame, routine });
    }

    /// `__wine_pop_frame`: removes the innermost record.
    pub fn pop(&mut self) -> Option<RegistrationRecord> {
        self.records.pop()
    }

    /// Removes the record at `index` and everything pushed after it.
    pub fn unlink(&mut self, index: usize) {
        self.records.truncate(index);
    }

    /// Index of the guest record at `frame`.
    pub fn position(&self, frame: u32) -> Option<usize> {
        self.records.iter().rposition(|record| {
            matches!(*record, RegistrationRecord::Guest { frame: f, .. } if f == frame)
        })
    }
}

/// A pushed record. Dropping it unregisters the record and anything pushed
/// on top of it.
#[derive(Debug)]
pub struct ChainGuard<'a> {
    chain: &'a mut RegistrationChain,
    depth: usize,
}

impl Deref for ChainGuard<'_> {
    type Target = RegistrationChain;

    fn deref(&self) -> &RegistrationChain {
        self.chain
    }
}

impl DerefMut for ChainGuard<'_> {
    fn deref_mut(&mut self) -> &mut RegistrationChain {
        self.chain
    }
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        self.chain.records.truncate(self.depth);
    }
}
