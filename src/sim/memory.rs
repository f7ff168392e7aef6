//! Sparse guest memory made of independently mapped regions.

use std::collections::BTreeMap;

use crate::env::Memory;
use crate::error::{Error, Result};
use crate::Addr;

#[derive(Debug, Clone, Default)]
pub struct SimMemory {
    /// Start address to contents. Regions never overlap.
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `size` zero bytes at `base`.
    pub fn map(&mut self, base: u64, size: usize) {
        self.map_bytes(base, vec![0; size]);
    }

    /// Maps `bytes` at `base`, replacing any region starting there.
    pub fn map_bytes(&mut self, base: u64, bytes: Vec<u8>) {
        debug_assert!(
            self.regions
                .range(..base.saturating_add(bytes.len() as u64))
                .next_back()
                .map_or(true, |(&start, region)| start == base
                    || start + region.len() as u64 <= base),
            "overlapping mapping at {:#x}",
            base
        );
        self.regions.insert(base, bytes);
    }

    fn slice(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let (&start, region) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(Error::Unmapped(Addr(addr)))?;
        let offset = (addr - start) as usize;
        region
            .get(offset..offset.checked_add(len).ok_or(Error::Unmapped(Addr(addr)))?)
            .ok_or(Error::Unmapped(Addr(addr)))
    }

    fn slice_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8]> {
        let (&start, region) = self
            .regions
            .range_mut(..=addr)
            .next_back()
            .ok_or(Error::Unmapped(Addr(addr)))?;
        let offset = (addr - start) as usize;
        region
            .get_mut(offset..offset.checked_add(len).ok_or(Error::Unmapped(Addr(addr)))?)
            .ok_or(Error::Unmapped(Addr(addr)))
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }
}

impl Memory for SimMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.slice(addr, buf.len())?);
        Ok(())
    }
}
