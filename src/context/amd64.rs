use core::mem::{offset_of, size_of};

use super::CpuContext;

pub const CONTEXT_AMD64: u32 = 0x0010_0000;
pub const CONTEXT_AMD64_CONTROL: u32 = CONTEXT_AMD64 | 0x01;
pub const CONTEXT_AMD64_INTEGER: u32 = CONTEXT_AMD64 | 0x02;
pub const CONTEXT_AMD64_SEGMENTS: u32 = CONTEXT_AMD64 | 0x04;
pub const CONTEXT_AMD64_FLOATING_POINT: u32 = CONTEXT_AMD64 | 0x08;
pub const CONTEXT_AMD64_DEBUG_REGISTERS: u32 = CONTEXT_AMD64 | 0x10;
pub const CONTEXT_AMD64_FULL: u32 =
    CONTEXT_AMD64_CONTROL | CONTEXT_AMD64_INTEGER | CONTEXT_AMD64_FLOATING_POINT;

// Integer register numbers as used by the unwind opcodes, which is also the
// order of the registers in the context.
pub const RAX: usize = 0;
pub const RCX: usize = 1;
pub const RDX: usize = 2;
pub const RBX: usize = 3;
pub const RSP: usize = 4;
pub const RBP: usize = 5;
pub const RSI: usize = 6;
pub const RDI: usize = 7;
pub const R8: usize = 8;
pub const R9: usize = 9;
pub const R10: usize = 10;
pub const R11: usize = 11;
pub const R12: usize = 12;
pub const R13: usize = 13;
pub const R14: usize = 14;
pub const R15: usize = 15;

pub const REGISTER_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

/// `M128A`, one vector register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct M128 {
    pub low: u64,
    pub high: u64,
}

impl M128 {
    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        let (low, high) = bytes.split_at(8);
        let mut l = [0; 8];
        let mut h = [0; 8];
        l.copy_from_slice(low);
        h.copy_from_slice(high);
        Self {
            low: u64::from_le_bytes(l),
            high: u64::from_le_bytes(h),
        }
    }

    pub fn to_le_bytes(self) -> [u8; 16] {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&self.low.to_le_bytes());
        bytes[8..].copy_from_slice(&self.high.to_le_bytes());
        bytes
    }
}

/// `XMM_SAVE_AREA32`, the `fxsave` image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct XmmSaveArea32 {
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u8,
    pub reserved1: u8,
    pub error_opcode: u16,
    pub error_offset: u32,
    pub error_selector: u16,
    pub reserved2: u16,
    pub data_offset: u32,
    pub data_selector: u16,
    pub reserved3: u16,
    pub mx_csr: u32,
    pub mx_csr_mask: u32,
    pub float_registers: [M128; 8],
    pub xmm_registers: [M128; 16],
    pub reserved4: [u64; 12],
}

/// The AMD64 `CONTEXT` record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Context64 {
    pub home: [u64; 6],
    pub context_flags: u32,
    pub mx_csr: u32,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,
    /// Dr0 to Dr3, Dr6 and Dr7.
    pub debug: [u64; 6],
    /// Indexed by [`RAX`] ..= [`R15`].
    pub gpr: [u64; 16],
    pub rip: u64,
    pub flt_save: XmmSaveArea32,
    pub vector_register: [M128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

const _: () = {
    assert!(size_of::<Context64>() == 0x4d0);
    assert!(offset_of!(Context64, context_flags) == 0x30);
    assert!(offset_of!(Context64, mx_csr) == 0x34);
    assert!(offset_of!(Context64, seg_cs) == 0x38);
    assert!(offset_of!(Context64, seg_ss) == 0x42);
    assert!(offset_of!(Context64, eflags) == 0x44);
    assert!(offset_of!(Context64, gpr) == 0x78);
    assert!(offset_of!(Context64, rip) == 0xf8);
    assert!(offset_of!(Context64, flt_save) == 0x100);
    assert!(offset_of!(Context64, flt_save) + offset_of!(XmmSaveArea32, xmm_registers) == 0x1a0);
    assert!(offset_of!(Context64, vector_register) == 0x300);
    assert!(offset_of!(Context64, vector_control) == 0x4a0);
};

/// Byte offset of integer register `reg` inside [`Context64`].
pub const fn gpr_offset(reg: usize) -> usize {
    offset_of!(Context64, gpr) + reg * 8
}

/// Byte offset of `xmm{n}` inside [`Context64`].
pub const fn xmm_offset(n: usize) -> usize {
    offset_of!(Context64, flt_save) + offset_of!(XmmSaveArea32, xmm_registers) + n * 16
}

pub const RIP_OFFSET: usize = offset_of!(Context64, rip);

impl Context64 {
    pub fn rsp(&self) -> u64 {
        self.gpr[RSP]
    }

    pub fn set_rsp(&mut self, value: u64) {
        self.gpr[RSP] = value;
    }

    pub fn xmm(&self, n: usize) -> M128 {
        self.flt_save.xmm_registers[n]
    }

    pub fn set_xmm(&mut self, n: usize, value: M128) {
        self.flt_save.xmm_registers[n] = value;
    }
}

impl CpuContext for Context64 {
    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.rip = ip;
    }

    fn stack_pointer(&self) -> u64 {
        self.gpr[RSP]
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.gpr[RSP] = sp;
    }

    fn set_return_value(&mut self, value: u64) {
        self.gpr[RAX] = value;
    }

    fn context_flags(&self) -> u32 {
        self.context_flags
    }

    fn has_control(&self) -> bool {
        self.context_flags & CONTEXT_AMD64_CONTROL & !CONTEXT_AMD64 != 0
    }
}

#[cfg(target_arch = "x86_64")]
pub use native::{capture_context, restore_context};

#[cfg(target_arch = "x86_64")]
mod native {
    use super::Context64;
    use crate::context::NativeContext;

    /// `RtlCaptureContext`.
    ///
    /// # Safety
    /// `context` must point to a writable, 16-byte aligned [`Context64`].
    #[unsafe(naked)]
    #[cfg_attr(feature = "exports", unsafe(export_name = "RtlCaptureContext"))]
    pub unsafe extern "win64" fn capture_context(_context: *mut Context64) {
        core::arch::naked_asm!(
            "mov [rcx+0x78], rax",
            "mov [rcx+0x80], rcx",
            "mov [rcx+0x88], rdx",
            "mov [rcx+0x90], rbx",
            // rsp as the caller will see it once we returned
            "lea rax, [rsp+8]",
            "mov [rcx+0x98], rax",
            "mov [rcx+0xa0], rbp",
            "mov [rcx+0xa8], rsi",
            "mov [rcx+0xb0], rdi",
            "mov [rcx+0xb8], r8",
            "mov [rcx+0xc0], r9",
            "mov [rcx+0xc8], r10",
            "mov [rcx+0xd0], r11",
            "mov [rcx+0xd8], r12",
            "mov [rcx+0xe0], r13",
            "mov [rcx+0xe8], r14",
            "mov [rcx+0xf0], r15",
            "mov rax, [rsp]",
            "mov [rcx+0xf8], rax",
            "pushfq",
            "pop rax",
            "mov [rcx+0x44], eax",
            "mov word ptr [rcx+0x38], cs",
            "mov word ptr [rcx+0x3a], ds",
            "mov word ptr [rcx+0x3c], es",
            "mov word ptr [rcx+0x3e], fs",
            "mov word ptr [rcx+0x40], gs",
            "mov word ptr [rcx+0x42], ss",
            "fxsave [rcx+0x100]",
            "stmxcsr [rcx+0x34]",
            // CONTROL | INTEGER | SEGMENTS | FLOATING_POINT
            "mov dword ptr [rcx+0x30], 0x10000f",
            "mov rax, [rcx+0x78]",
            "ret",
        )
    }

    /// Loads every register from `context` and continues at its `rip`.
    ///
    /// The return frame for `iretq` is built on the current stack, so the
    /// target stack pointer must not be below it.
    ///
    /// # Safety
    /// See [`NativeContext::restore`].
    #[unsafe(naked)]
    pub unsafe extern "win64" fn restore_context(_context: *const Context64) -> ! {
        core::arch::naked_asm!(
            "fxrstor [rcx+0x100]",
            "ldmxcsr [rcx+0x34]",
            "movzx eax, word ptr [rcx+0x42]",
            "push rax",
            "push qword ptr [rcx+0x98]",
            "mov eax, [rcx+0x44]",
            "push rax",
            "movzx eax, word ptr [rcx+0x38]",
            "push rax",
            "push qword ptr [rcx+0xf8]",
            "mov rax, [rcx+0x78]",
            "mov rdx, [rcx+0x88]",
            "mov rbx, [rcx+0x90]",
            "mov rbp, [rcx+0xa0]",
            "mov rsi, [rcx+0xa8]",
            "mov rdi, [rcx+0xb0]",
            "mov r8, [rcx+0xb8]",
            "mov r9, [rcx+0xc0]",
            "mov r10, [rcx+0xc8]",
            "mov r11, [rcx+0xd0]",
            "mov r12, [rcx+0xd8]",
            "mov r13, [rcx+0xe0]",
            "mov r14, [rcx+0xe8]",
            "mov r15, [rcx+0xf0]",
            "mov rcx, [rcx+0x80]",
            "iretq",
        )
    }

    impl NativeContext for Context64 {
        #[inline(always)]
        fn capture() -> Self {
            let mut context = Context64::default();
            // SAFETY: `context` is a properly aligned, writable context.
            unsafe { capture_context(&mut context) };
            context
        }

        unsafe fn restore(&self) -> ! {
            // SAFETY: Forwarded to the caller.
            unsafe { restore_context(self) }
        }
    }
}
