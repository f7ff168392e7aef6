//! Bounds checked little-endian reads over a byte slice.

use crate::error::{Error, Result};

pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    /// Names the record being decoded in truncation errors.
    what: &'static str,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, what }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn read_bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        if self.data.len() < amount {
            return Err(Error::Truncated {
                what: self.what,
                needed: amount,
                available: self.data.len(),
            });
        }
        let (result, rest) = self.data.split_at(amount);
        self.data = rest;
        Ok(result)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub(crate) fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0b0111_1111) << shift;
            }
            if (byte >> 7) == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    pub(crate) fn read_ileb128(&mut self) -> Result<i64> {
        let mut result = 0i64;
        let mut shift = 0;

        let sign_bit_set = loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break ((byte >> 6) & 1) == 1;
            }
        };
        if shift < 64 && sign_bit_set {
            result |= -1i64 << shift;
        }
        Ok(result)
    }
}
