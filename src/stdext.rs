use core::ffi;

/// `NtTerminateProcess` on the host: ends the process without running any
/// more guest or host cleanup.
pub(crate) fn exit_process(status: u32) -> ! {
    // SAFETY: We exit.
    unsafe { libc::_exit(status as ffi::c_int) }
}

pub(crate) fn errno() -> i32 {
    // SAFETY: Surely errno_location would be valid, right?
    unsafe { *libc::__errno_location() }
}

pub(crate) fn with_last_os_error_str<R>(f: impl FnOnce(&str) -> R) -> R {
    with_os_error_str(errno(), f)
}

pub(crate) fn with_os_error_str<R>(errnum: i32, f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 512] = [0; 512];

    // SAFETY: Our buffer length is passed correctly
    let error = unsafe { libc::strerror_r(errnum, buf.as_mut_ptr().cast(), buf.len()) };
    if error != 0 {
        return f("<strerror_r returned an error>");
    }
    // SAFETY: strerror_r writes the string to buf, even if it didnt write anything, we did zero init it.
    let cstr = unsafe { ffi::CStr::from_ptr(buf.as_ptr().cast()) };
    f(cstr
        .to_str()
        .unwrap_or("<error message contained invalid utf8>"))
}
