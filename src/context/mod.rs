//! CPU register snapshots for both guest architectures.
//!
//! The layouts are the ones Windows hands to handlers, so the structs can be
//! passed to guest code as they are. Capturing and restoring the live register
//! file is architecture specific and lives behind [`NativeContext`].

mod amd64;
mod i386;

pub use amd64::*;
pub use i386::*;

use core::fmt::Debug;

/// The part of a register snapshot the architecture independent code needs.
pub trait CpuContext: Clone + Debug {
    fn instruction_pointer(&self) -> u64;
    fn set_instruction_pointer(&mut self, ip: u64);
    fn stack_pointer(&self) -> u64;
    fn set_stack_pointer(&mut self, sp: u64);
    /// Writes the register a resumed function sees as its return value.
    fn set_return_value(&mut self, value: u64);
    /// `ContextFlags`, which parts of the snapshot are valid.
    fn context_flags(&self) -> u32;
    /// Whether the control registers (ip, sp, flags, segments) are present.
    fn has_control(&self) -> bool;
}

/// Capture and restore of the live register file of the running thread.
///
/// Only implemented for the context type that matches the host architecture.
pub trait NativeContext: CpuContext {
    /// Snapshot of the caller. The instruction pointer is the return address of
    /// the capturing call and the stack pointer is the one the caller sees
    /// after it returns.
    ///
    /// Must be inlined into the function whose frame should stay live.
    fn capture() -> Self;

    /// Loads every register from `self` and jumps to its instruction pointer.
    ///
    /// # Safety
    /// The target stack pointer must not be below the caller's, and the
    /// snapshot must describe a state that is safe to continue at.
    unsafe fn restore(&self) -> !;
}
