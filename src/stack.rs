//! Thread stack bounds and establisher frame validation.

use crate::Addr;

/// `NT_TIB.StackBase` / `StackLimit`. The stack grows down from `base`
/// towards `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLimits {
    pub base: u64,
    pub limit: u64,
}

/// The per-thread stack host faults are delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStack {
    pub start: u64,
    pub size: u64,
}

impl SignalStack {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

/// What a walker may do with an establisher frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    Valid,
    /// Belongs to the fault delivery machinery, skip it and keep walking.
    OnSignalStack,
    /// Misaligned or outside the thread stack. Never dereferenced.
    Invalid,
}

impl StackLimits {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.limit && addr <= self.base
    }

    /// x64 rule: 8-byte aligned and within `limit..=base`.
    pub fn check_frame64(&self, frame: u64, signal_stack: Option<SignalStack>) -> FrameCheck {
        if signal_stack.is_some_and(|s| s.contains(frame)) {
            trace!(frame = ?Addr(frame), "frame is inside signal stack");
            return FrameCheck::OnSignalStack;
        }
        if frame & 7 != 0 || !self.contains(frame) {
            debug!(
                frame = ?Addr(frame),
                limit = ?Addr(self.limit),
                base = ?Addr(self.base),
                "invalid frame"
            );
            return FrameCheck::Invalid;
        }
        FrameCheck::Valid
    }

    /// i386 rule: 4-byte aligned, at or above `limit` and below the last
    /// pointer slot of the stack.
    pub fn is_valid_frame32(&self, frame: u32) -> bool {
        let frame = u64::from(frame);
        frame & 3 == 0 && frame >= self.limit && frame < self.base.saturating_sub(4)
    }
}

#[cfg(test)]
mod tests;
