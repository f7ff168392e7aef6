//! The real platform: guest code runs in this process, on this thread.
//!
//! Memory is read in place, images are registered by the loader once they
//! are mapped, stack limits come from the host thread unless the caller
//! knows better (a TEB), and guest callbacks are called through their ABI.

#[cfg(target_arch = "x86_64")]
mod amd64;
#[cfg(target_arch = "x86")]
mod i386;

#[cfg(all(feature = "exports", target_arch = "x86_64"))]
pub mod exports;

#[cfg(test)]
mod tests;

#[cfg(target_arch = "x86_64")]
pub use amd64::{call_consolidate_callback, RawDispatcherContext};
#[cfg(target_arch = "x86")]
pub use i386::ExceptionRecord32;

use alloc::{format, string::String, vec::Vec};
use core::{ffi, mem, ptr};

use goblin::pe::header::Header;

use crate::env::{Memory, Module, ModuleRegistry, Process, ThreadEnvironment};
use crate::error::{Error, Result};
use crate::stack::{SignalStack, StackLimits};
use crate::status::NtStatus;
use crate::stdext;
use crate::Addr;

/// The memory of this process. Unmapped addresses are reported, not faulted
/// on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMemory;

impl Memory for RawMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut ffi::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: `local` covers `buf` exactly. The kernel checks `remote`.
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read == buf.len() as isize {
            return Ok(());
        }
        if read < 0 {
            stdext::with_last_os_error_str(|err| trace!(addr = ?Addr(addr), err, "read failed"));
        }
        Err(Error::Unmapped(Addr(addr)))
    }
}

/// Enough of an image to get through the optional header with its data
/// directories.
const HEADER_BYTES: usize = 0x400;

/// `IMAGE_DIRECTORY_ENTRY_EXCEPTION`.
fn exception_directory(header: &Header) -> Option<(u32, u32)> {
    header
        .optional_header
        .as_ref()?
        .data_directories
        .get_exception_table()
        .as_ref()
        .map(|dir| (dir.virtual_address, dir.size))
        .filter(|&(_, size)| size != 0)
}

/// The loaded images, as `LdrFindEntryForAddress` sees them.
#[derive(Debug, Clone, Default)]
pub struct ImageRegistry {
    modules: Vec<Module>,
}

impl ImageRegistry {
    pub const fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Parses the PE headers of the image mapped at `base` and registers it.
    #[instrument(level = "debug", skip(self, mem), fields(base = ?Addr(base)))]
    pub fn register<M: Memory + ?Sized>(&mut self, mem: &M, base: u64) -> Result<Module> {
        let mut headers = alloc::vec![0; HEADER_BYTES];
        mem.read_bytes(base, &mut headers)?;
        let module = Self::parse(base, &headers)?;
        debug!(size = module.size, exception_directory = ?module.exception_directory, "registered image");
        self.unregister(base);
        self.modules.push(module);
        Ok(module)
    }

    /// Builds the registry entry of an image from its headers.
    pub fn parse(base: u64, headers: &[u8]) -> Result<Module> {
        let header = Header::parse(headers)
            .map_err(|err| Error::InvalidImage(format!("image at {}: {err}", Addr(base))))?;
        let optional = header.optional_header.as_ref().ok_or_else(|| {
            Error::InvalidImage(format!("image at {} has no optional header", Addr(base)))
        })?;
        Ok(Module {
            base,
            size: u64::from(optional.windows_fields.size_of_image),
            exception_directory: exception_directory(&header),
        })
    }

    pub fn unregister(&mut self, base: u64) -> Option<Module> {
        let index = self.modules.iter().position(|module| module.base == base)?;
        Some(self.modules.swap_remove(index))
    }

    pub fn find(&self, pc: u64) -> Option<Module> {
        self.modules.iter().find(|module| module.contains(pc)).copied()
    }
}

/// Stack bounds of the calling host thread.
pub fn thread_stack_limits() -> Result<StackLimits> {
    // SAFETY: `attr` is initialized by pthread_getattr_np before it is read
    // and destroyed after.
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        let err = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if err != 0 {
            return Err(stdext::with_os_error_str(err, |msg| {
                Error::Os(format!("pthread_getattr_np: {msg}"))
            }));
        }
        let mut stack = ptr::null_mut();
        let mut size = 0;
        let err = libc::pthread_attr_getstack(&attr, &mut stack, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if err != 0 {
            return Err(stdext::with_os_error_str(err, |msg| {
                Error::Os(format!("pthread_attr_getstack: {msg}"))
            }));
        }
        let limit = stack as usize as u64;
        Ok(StackLimits {
            base: limit + size as u64,
            limit,
        })
    }
}

/// The alternate signal stack of the calling thread, if one is installed.
pub fn thread_signal_stack() -> Option<SignalStack> {
    // SAFETY: Only queries, `old` is plain data.
    let old = unsafe {
        let mut old: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old) != 0 {
            stdext::with_last_os_error_str(|err| debug!(err, "sigaltstack failed"));
            return None;
        }
        old
    };
    (old.ss_flags & libc::SS_DISABLE == 0 && old.ss_size != 0).then_some(SignalStack {
        start: old.ss_sp as usize as u64,
        size: old.ss_size as u64,
    })
}

/// Name of the host symbol containing `pc`, for diagnostics.
pub fn symbolize(pc: u64) -> Option<String> {
    // SAFETY: dladdr only looks the address up, `info` is plain data.
    unsafe {
        let mut info: libc::Dl_info = mem::zeroed();
        if libc::dladdr(pc as usize as *const ffi::c_void, &mut info) == 0 {
            return None;
        }
        let name = if !info.dli_sname.is_null() {
            ffi::CStr::from_ptr(info.dli_sname)
        } else if !info.dli_fname.is_null() {
            ffi::CStr::from_ptr(info.dli_fname)
        } else {
            return None;
        };
        let offset = pc.wrapping_sub(if info.dli_sname.is_null() {
            info.dli_fbase as usize as u64
        } else {
            info.dli_saddr as usize as u64
        });
        Some(format!("{}+{offset:#x}", name.to_string_lossy()))
    }
}

/// The calling thread of this process as the exception core's platform.
#[derive(Debug, Clone)]
pub struct NativePlatform {
    pub memory: RawMemory,
    pub images: ImageRegistry,
    pub limits: StackLimits,
    pub signal_stack: Option<SignalStack>,
}

impl NativePlatform {
    /// A platform for the calling thread with the host's stack bounds.
    pub fn current(images: ImageRegistry) -> Result<Self> {
        Ok(Self::with_limits(images, thread_stack_limits()?))
    }

    /// A platform for the calling thread with limits from a TEB.
    pub fn with_limits(images: ImageRegistry, limits: StackLimits) -> Self {
        Self {
            memory: RawMemory,
            images,
            limits,
            signal_stack: thread_signal_stack(),
        }
    }
}

impl Memory for NativePlatform {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read_bytes(addr, buf)
    }
}

impl ModuleRegistry for NativePlatform {
    fn find_module(&self, pc: u64) -> Option<Module> {
        self.images.find(pc)
    }

    fn symbolize(&self, pc: u64) -> Option<String> {
        symbolize(pc)
    }
}

impl ThreadEnvironment for NativePlatform {
    fn stack_limits(&self) -> StackLimits {
        self.limits
    }

    fn signal_stack(&self) -> Option<SignalStack> {
        self.signal_stack
    }
}

impl Process for NativePlatform {
    fn terminate(&mut self, status: NtStatus) -> ! {
        debug!(status = ?Addr(u64::from(status)), "terminating process");
        stdext::exit_process(status)
    }
}
