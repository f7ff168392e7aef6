use core::fmt;
use core::mem::{offset_of, size_of};

use super::CpuContext;

pub const CONTEXT_I386: u32 = 0x0001_0000;
pub const CONTEXT_I386_CONTROL: u32 = CONTEXT_I386 | 0x01;
pub const CONTEXT_I386_INTEGER: u32 = CONTEXT_I386 | 0x02;
pub const CONTEXT_I386_SEGMENTS: u32 = CONTEXT_I386 | 0x04;
pub const CONTEXT_I386_FLOATING_POINT: u32 = CONTEXT_I386 | 0x08;
pub const CONTEXT_I386_DEBUG_REGISTERS: u32 = CONTEXT_I386 | 0x10;
pub const CONTEXT_I386_EXTENDED_REGISTERS: u32 = CONTEXT_I386 | 0x20;
pub const CONTEXT_I386_FULL: u32 =
    CONTEXT_I386_CONTROL | CONTEXT_I386_INTEGER | CONTEXT_I386_SEGMENTS;

/// `FLOATING_SAVE_AREA`, the `fnsave` image.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FloatingSaveArea {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

/// The i386 `CONTEXT` record.
#[derive(Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Context32 {
    pub context_flags: u32,
    /// Dr0 to Dr3, Dr6 and Dr7.
    pub debug: [u32; 6],
    pub float_save: FloatingSaveArea,
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    /// `fxsave` image, only valid with [`CONTEXT_I386_EXTENDED_REGISTERS`].
    pub extended_registers: [u8; 512],
}

const _: () = {
    assert!(size_of::<FloatingSaveArea>() == 112);
    assert!(size_of::<Context32>() == 0x2cc);
    assert!(offset_of!(Context32, float_save) == 0x1c);
    assert!(offset_of!(Context32, seg_gs) == 0x8c);
    assert!(offset_of!(Context32, edi) == 0x9c);
    assert!(offset_of!(Context32, eax) == 0xb0);
    assert!(offset_of!(Context32, eip) == 0xb8);
    assert!(offset_of!(Context32, eflags) == 0xc0);
    assert!(offset_of!(Context32, esp) == 0xc4);
    assert!(offset_of!(Context32, extended_registers) == 0xcc);
};

impl Default for Context32 {
    fn default() -> Self {
        // SAFETY: Plain integers and byte arrays, all zeroes is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

impl fmt::Debug for Context32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the register areas are noise in traces
        f.debug_struct("Context32")
            .field("context_flags", &format_args!("{:#x}", self.context_flags))
            .field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("eflags", &format_args!("{:#x}", self.eflags))
            .finish_non_exhaustive()
    }
}

impl CpuContext for Context32 {
    fn instruction_pointer(&self) -> u64 {
        self.eip.into()
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.eip = ip as u32;
    }

    fn stack_pointer(&self) -> u64 {
        self.esp.into()
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.esp = sp as u32;
    }

    fn set_return_value(&mut self, value: u64) {
        self.eax = value as u32;
    }

    fn context_flags(&self) -> u32 {
        self.context_flags
    }

    fn has_control(&self) -> bool {
        self.context_flags & CONTEXT_I386_CONTROL & !CONTEXT_I386 != 0
    }
}

#[cfg(target_arch = "x86")]
pub use native::{capture_context, restore_context};

#[cfg(target_arch = "x86")]
mod native {
    use super::Context32;
    use crate::context::NativeContext;

    /// `RtlCaptureContext`, cdecl.
    ///
    /// # Safety
    /// `context` must point to a writable [`Context32`].
    #[unsafe(naked)]
    pub unsafe extern "C" fn capture_context(_context: *mut Context32) {
        core::arch::naked_asm!(
            "push eax",
            "mov eax, [esp+8]",
            "mov [eax+0x9c], edi",
            "mov [eax+0xa0], esi",
            "mov [eax+0xa4], ebx",
            "mov [eax+0xa8], edx",
            "mov [eax+0xac], ecx",
            "pop ecx",
            "mov [eax+0xb0], ecx",
            "mov [eax+0xb4], ebp",
            "mov ecx, [esp]",
            "mov [eax+0xb8], ecx",
            // esp as the caller will see it once we returned
            "lea ecx, [esp+4]",
            "mov [eax+0xc4], ecx",
            "pushfd",
            "pop ecx",
            "mov [eax+0xc0], ecx",
            "xor ecx, ecx",
            "mov cx, gs",
            "mov [eax+0x8c], ecx",
            "mov cx, fs",
            "mov [eax+0x90], ecx",
            "mov cx, es",
            "mov [eax+0x94], ecx",
            "mov cx, ds",
            "mov [eax+0x98], ecx",
            "mov cx, cs",
            "mov [eax+0xbc], ecx",
            "mov cx, ss",
            "mov [eax+0xc8], ecx",
            // fnsave reinitializes the fpu, load the state right back
            "fnsave [eax+0x1c]",
            "frstor [eax+0x1c]",
            // CONTROL | INTEGER | SEGMENTS | FLOATING_POINT
            "mov dword ptr [eax], 0x1000f",
            "mov ecx, [eax+0xac]",
            "mov eax, [eax+0xb0]",
            "ret",
        )
    }

    /// Loads every register from `context` and continues at its `eip`.
    ///
    /// `eip`, `eflags`, `eax` and `ecx` travel through the 16 bytes below the
    /// target stack pointer.
    ///
    /// # Safety
    /// See [`NativeContext::restore`].
    #[unsafe(naked)]
    pub unsafe extern "C" fn restore_context(_context: *const Context32) -> ! {
        core::arch::naked_asm!(
            "mov ecx, [esp+4]",
            "test dword ptr [ecx], 0x8",
            "jz 2f",
            "frstor [ecx+0x1c]",
            "2:",
            "push dword ptr [ecx+0xac]",
            "push dword ptr [ecx+0xb0]",
            "push dword ptr [ecx+0xc0]",
            "push dword ptr [ecx+0xb8]",
            "mov edi, [ecx+0x9c]",
            "mov esi, [ecx+0xa0]",
            "mov ebx, [ecx+0xa4]",
            "mov edx, [ecx+0xa8]",
            "mov ebp, [ecx+0xb4]",
            "mov eax, [ecx+0xc4]",
            "pop ecx",
            "mov [eax-4], ecx",
            "pop ecx",
            "mov [eax-8], ecx",
            "pop ecx",
            "mov [eax-12], ecx",
            "pop ecx",
            "mov [eax-16], ecx",
            "lea esp, [eax-16]",
            "pop ecx",
            "pop eax",
            "popfd",
            "ret",
        )
    }

    impl NativeContext for Context32 {
        #[inline(always)]
        fn capture() -> Self {
            let mut context = Context32::default();
            // SAFETY: `context` is a writable context.
            unsafe { capture_context(&mut context) };
            context
        }

        unsafe fn restore(&self) -> ! {
            // SAFETY: Forwarded to the caller.
            unsafe { restore_context(self) }
        }
    }
}
