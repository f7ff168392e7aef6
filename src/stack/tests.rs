use super::{FrameCheck, SignalStack, StackLimits};

const LIMITS: StackLimits = StackLimits {
    base: 0x10_0000,
    limit: 0xf_0000,
};

#[test]
fn aligned_frame_inside_stack() {
    assert_eq!(LIMITS.check_frame64(0xf_8000, None), FrameCheck::Valid);
    // the base itself is still accepted on x64
    assert_eq!(LIMITS.check_frame64(0x10_0000, None), FrameCheck::Valid);
    assert_eq!(LIMITS.check_frame64(0xf_0000, None), FrameCheck::Valid);
}

#[test]
fn odd_frame_is_invalid() {
    assert_eq!(LIMITS.check_frame64(0xf_8001, None), FrameCheck::Invalid);
    assert_eq!(LIMITS.check_frame64(0xf_8004, None), FrameCheck::Invalid);
}

#[test]
fn frame_outside_stack_is_invalid() {
    assert_eq!(LIMITS.check_frame64(0xe_fff8, None), FrameCheck::Invalid);
    assert_eq!(LIMITS.check_frame64(0x10_0008, None), FrameCheck::Invalid);
    assert_eq!(LIMITS.check_frame64(0, None), FrameCheck::Invalid);
}

#[test]
fn signal_stack_wins_over_bounds() {
    let signal = SignalStack {
        start: 0x20_0000,
        size: 0x1000,
    };
    assert_eq!(
        LIMITS.check_frame64(0x20_0010, Some(signal)),
        FrameCheck::OnSignalStack
    );
    // even misaligned
    assert_eq!(
        LIMITS.check_frame64(0x20_0013, Some(signal)),
        FrameCheck::OnSignalStack
    );
    assert_eq!(
        LIMITS.check_frame64(0x20_1000, Some(signal)),
        FrameCheck::Invalid
    );
}

#[test]
fn i386_frames() {
    assert!(LIMITS.is_valid_frame32(0xf_0000));
    assert!(LIMITS.is_valid_frame32(0xf_fff8));
    assert!(!LIMITS.is_valid_frame32(0xf_fffc));
    assert!(!LIMITS.is_valid_frame32(0xf_8002));
    assert!(!LIMITS.is_valid_frame32(0xe_fffc));
}
