use super::{thread_stack_limits, ImageRegistry, RawMemory};
use crate::env::Memory;
use crate::error::Error;

#[test]
fn raw_memory_reads_this_process() {
    let data = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    let addr = data.as_ptr() as usize as u64;
    assert_eq!(RawMemory.read_u64(addr).unwrap(), 0x8877_6655_4433_2211);
    assert_eq!(RawMemory.read_u16(addr + 6).unwrap(), 0x8877);
}

#[test]
fn raw_memory_reports_unmapped_addresses() {
    assert!(matches!(RawMemory.read_u32(0x10), Err(Error::Unmapped(_))));
}

#[test]
fn stack_limits_contain_locals() {
    let local = 0u64;
    let addr = &local as *const u64 as usize as u64;
    let limits = thread_stack_limits().unwrap();
    assert!(limits.limit < limits.base);
    assert!(limits.contains(addr), "{limits:?} {addr:#x}");
}

/// DOS header, PE signature, a COFF header and a PE32+ optional header with
/// all sixteen data directories, no sections.
fn pe_headers(size_of_image: u32, exception_directory: (u32, u32)) -> Vec<u8> {
    const PE: usize = 0x80;
    const OPTIONAL: usize = PE + 4 + 20;
    let mut headers = vec![0u8; 0x400];
    headers[..2].copy_from_slice(b"MZ");
    headers[0x3c..0x40].copy_from_slice(&(PE as u32).to_le_bytes());
    headers[PE..PE + 4].copy_from_slice(b"PE\0\0");

    let coff = PE + 4;
    headers[coff..coff + 2].copy_from_slice(&0x8664u16.to_le_bytes());
    headers[coff + 16..coff + 18].copy_from_slice(&0xf0u16.to_le_bytes());
    headers[coff + 18..coff + 20].copy_from_slice(&0x22u16.to_le_bytes());

    headers[OPTIONAL..OPTIONAL + 2].copy_from_slice(&0x20bu16.to_le_bytes());
    let windows = OPTIONAL + 24;
    headers[windows..windows + 8].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
    headers[windows + 8..windows + 12].copy_from_slice(&0x1000u32.to_le_bytes());
    headers[windows + 12..windows + 16].copy_from_slice(&0x200u32.to_le_bytes());
    headers[windows + 32..windows + 36].copy_from_slice(&size_of_image.to_le_bytes());
    headers[windows + 36..windows + 40].copy_from_slice(&0x400u32.to_le_bytes());
    headers[windows + 44..windows + 46].copy_from_slice(&3u16.to_le_bytes());
    headers[windows + 84..windows + 88].copy_from_slice(&16u32.to_le_bytes());

    let exception = OPTIONAL + 24 + 88 + 3 * 8;
    headers[exception..exception + 4].copy_from_slice(&exception_directory.0.to_le_bytes());
    headers[exception + 4..exception + 8].copy_from_slice(&exception_directory.1.to_le_bytes());
    headers
}

#[test]
fn registers_images_from_their_headers() {
    let headers = pe_headers(0x5000, (0x3000, 0x24));
    let base = headers.as_ptr() as usize as u64;

    let mut images = ImageRegistry::new();
    let module = images.register(&RawMemory, base).unwrap();
    assert_eq!(module.base, base);
    assert_eq!(module.size, 0x5000);
    assert_eq!(module.exception_directory, Some((0x3000, 0x24)));

    assert_eq!(images.find(base + 0x4fff), Some(module));
    assert_eq!(images.find(base + 0x5000), None);
    assert_eq!(images.unregister(base), Some(module));
    assert_eq!(images.find(base), None);
}

#[test]
fn image_without_exception_directory() {
    let module = ImageRegistry::parse(0x1000_0000, &pe_headers(0x2000, (0, 0))).unwrap();
    assert_eq!(module.exception_directory, None);
}

#[test]
fn garbage_is_not_an_image() {
    assert!(matches!(
        ImageRegistry::parse(0x1000_0000, &[0x90; 0x400]),
        Err(Error::InvalidImage(_))
    ));
}

#[cfg(target_arch = "x86_64")]
mod amd64 {
    use core::sync::atomic::{AtomicU32, Ordering};

    use crate::amd64::restore_context;
    use crate::context::{Context64, NativeContext, RSP};
    use crate::native::{call_consolidate_callback, ImageRegistry, NativePlatform};
    use crate::record::{ExceptionFlags, ExceptionRecord};
    use crate::status::STATUS_UNWIND_CONSOLIDATE;
    use crate::testing::SpanCounter;

    #[test]
    fn capture_then_restore_resumes_after_the_capture() {
        static PASSES: AtomicU32 = AtomicU32::new(0);

        let context = Context64::capture();
        if PASSES.fetch_add(1, Ordering::SeqCst) == 0 {
            assert_ne!(context.rip, 0);
            assert_eq!(context.rsp() % 16, 0);
            // SAFETY: Continues right after the capture above, in this frame.
            unsafe { context.restore() }
        }
        assert_eq!(PASSES.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn restore_exits_its_span_before_jumping() {
        static PASSES: AtomicU32 = AtomicU32::new(0);

        let counter = SpanCounter::default();
        tracing::subscriber::with_default(counter.clone(), || {
            let mut context = Context64::capture();
            if PASSES.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut platform = NativePlatform::current(ImageRegistry::new()).unwrap();
                restore_context(&mut platform, &mut context, None);
            }
        });
        assert_eq!(PASSES.load(Ordering::SeqCst), 2);
        assert!(counter.enters() > 0);
        assert_eq!(counter.depth(), 0);
    }

    #[test]
    fn capture_sees_the_caller_stack() {
        let local = 0u64;
        let context = Context64::capture();
        let addr = &local as *const u64 as usize as u64;
        assert!(context.gpr[RSP] <= addr);
        assert!(addr - context.gpr[RSP] < 0x1000);
    }

    type Callback = extern "win64" fn(*mut ExceptionRecord) -> u64;

    extern "win64" fn callback(record: *mut ExceptionRecord) -> u64 {
        // SAFETY: The test passes a live record.
        let record = unsafe { &mut *record };
        record.information[1] = 0x1234;
        record.address + 1
    }

    #[test]
    fn consolidate_trampoline_calls_back() {
        let address = callback as Callback as usize as u64;
        let mut record = ExceptionRecord::new(
            STATUS_UNWIND_CONSOLIDATE,
            ExceptionFlags::empty(),
            0x4000,
        )
        .with_parameters(&[address, 0]);
        let context = Context64::capture();

        // SAFETY: `context` and `record` outlive the call.
        let next = unsafe { call_consolidate_callback(&context, address, &mut record) };
        assert_eq!(next, 0x4001);
        assert_eq!(record.information[1], 0x1234);
    }
}
