//! Everything the exception core needs from the outside world.
//!
//! The walkers never dereference guest pointers or call guest code directly.
//! `native` implements these traits for the thread the code runs on, `sim`
//! for a simulated guest.

use alloc::string::String;

use crate::amd64::dispatcher::DispatcherContext;
use crate::context::{Context32, Context64, CpuContext, M128};
use crate::error::{Error, Result};
use crate::i386::chain::RegistrationChain;
use crate::record::{ExceptionPointers, ExceptionRecord};
use crate::stack::{SignalStack, StackLimits};
use crate::status::NtStatus;
use crate::Addr;

/// Read access to guest memory.
pub trait Memory {
    /// Fills `buf` from `addr`, failing with [`Error::Unmapped`] if any byte is
    /// not mapped.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_m128(&self, addr: u64) -> Result<M128> {
        let mut buf = [0; 16];
        self.read_bytes(addr, &mut buf)?;
        Ok(M128::from_le_bytes(buf))
    }
}

/// A loaded image, as far as exception dispatch cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Module {
    pub base: u64,
    pub size: u64,
    /// `IMAGE_DIRECTORY_ENTRY_EXCEPTION`: rva and size of the `RUNTIME_FUNCTION` table.
    pub exception_directory: Option<(u32, u32)>,
}

impl Module {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc - self.base < self.size
    }
}

/// `LdrFindEntryForAddress`.
pub trait ModuleRegistry {
    fn find_module(&self, pc: u64) -> Option<Module>;

    /// Best effort name for diagnostics.
    fn symbolize(&self, _pc: u64) -> Option<String> {
        None
    }
}

/// A thread handle as NT APIs take them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(pub u64);

impl ThreadHandle {
    /// `GetCurrentThread()`.
    pub const CURRENT: ThreadHandle = ThreadHandle(!1);
}

/// Per-thread configuration of the calling thread.
pub trait ThreadEnvironment {
    fn stack_limits(&self) -> StackLimits;

    fn signal_stack(&self) -> Option<SignalStack> {
        None
    }

    fn is_current_thread(&self, thread: ThreadHandle) -> bool {
        thread == ThreadHandle::CURRENT
    }
}

/// Register state transfer for context type `C`.
pub trait ThreadControl<C: CpuContext> {
    /// Register state of the calling thread. Walks started from it see the
    /// caller of the function asking.
    fn capture(&mut self) -> C;

    /// Continues the calling thread at `context`.
    fn restore(&mut self, context: &C) -> !;

    /// Installs `context` on another thread. Returns once the request has
    /// been handed over, the target observes it by resuming at the new
    /// instruction pointer.
    fn set_remote_context(&mut self, thread: ThreadHandle, context: &C) -> NtStatus;
}

/// `NtTerminateProcess(NtCurrentProcess(), status)`.
pub trait Process {
    fn terminate(&mut self, status: NtStatus) -> !;
}

/// Calls into x64 guest code.
pub trait Dispatch64 {
    /// Calls a language specific handler. The raw return value is handed back
    /// so the walkers can reject values outside `EXCEPTION_DISPOSITION`.
    ///
    /// A handler that reports a collided unwind leaves the state to continue
    /// from in `dispatch`.
    fn call_language_handler(
        &mut self,
        handler: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &mut Context64,
        dispatch: &mut DispatcherContext,
    ) -> u32;

    /// Evaluates an `__except` filter expression.
    fn call_filter(&mut self, filter: u64, pointers: ExceptionPointers<'_>, frame: u64) -> i32;

    /// Runs a `__finally` block.
    fn call_termination_handler(&mut self, handler: u64, abnormal: bool, frame: u64);

    /// Calls an unwind consolidation callback on a frame that looks like it
    /// was called from `context`. Returns where execution continues.
    fn call_consolidate_callback(
        &mut self,
        context: &Context64,
        callback: u64,
        record: &mut ExceptionRecord,
    ) -> u64;
}

/// Calls into i386 guest code.
pub trait Dispatch32 {
    /// Calls the routine of a registration record. The routine may raise
    /// nested exceptions, which walk `chain` including the nested record the
    /// caller pushed for it.
    fn call_exception_routine(
        &mut self,
        routine: u32,
        record: &mut ExceptionRecord,
        frame: u32,
        context: &mut Context32,
        dispatcher: &mut u32,
        chain: &mut RegistrationChain,
    ) -> u32;
}

/// Everything the x64 walkers use.
pub trait Platform64:
    Memory + ModuleRegistry + ThreadEnvironment + ThreadControl<Context64> + Process + Dispatch64
{
}

impl<T> Platform64 for T where
    T: Memory
        + ModuleRegistry
        + ThreadEnvironment
        + ThreadControl<Context64>
        + Process
        + Dispatch64
{
}

/// Everything the i386 walkers use.
pub trait Platform32:
    Memory + ThreadEnvironment + ThreadControl<Context32> + Process + Dispatch32
{
}

impl<T> Platform32 for T where
    T: Memory + ThreadEnvironment + ThreadControl<Context32> + Process + Dispatch32
{
}

/// Memory that is a plain byte slice mapped at `base`.
#[derive(Debug, Clone, Copy)]
pub struct SliceMemory<'a> {
    pub base: u64,
    pub bytes: &'a [u8],
}

impl Memory for SliceMemory<'_> {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = addr
            .checked_sub(self.base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or(Error::Unmapped(Addr(addr)))?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.bytes.get(start..end))
            .ok_or(Error::Unmapped(Addr(addr)))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}
