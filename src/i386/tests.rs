//! Registration chain walks over a simulated 32-bit stack with three
//! records, `inner` registered last.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::{
    call_stack_handlers, nt_raise_exception, rtl_unwind, set_context_thread, RegistrationChain,
};
use crate::context::{Context32, CONTEXT_I386_FULL, CONTEXT_I386_INTEGER};
use crate::env::ThreadHandle;
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::sim::{Event, Outcome, SimPlatform};
use crate::stack::StackLimits;
use crate::testing::SpanCounter;
use crate::status::{
    ExceptionDisposition, EXCEPTION_BREAKPOINT, STATUS_BAD_STACK, STATUS_INVALID_DISPOSITION,
    STATUS_INVALID_UNWIND_TARGET, STATUS_NONCONTINUABLE_EXCEPTION, STATUS_SUCCESS,
    STATUS_UNHANDLED_EXCEPTION, STATUS_UNWIND,
};

const LIMITS: StackLimits = StackLimits {
    base: 0x30_0000,
    limit: 0x2f_0000,
};
const OUTER: u32 = 0x2f_f800;
const MID: u32 = 0x2f_f400;
const INNER: u32 = 0x2f_f000;
const OUTER_ROUTINE: u32 = 0x40_3000;
const MID_ROUTINE: u32 = 0x40_2000;
const INNER_ROUTINE: u32 = 0x40_1000;
const CODE: u32 = 0xe000_0032;
const RAISE_EIP: u32 = 0x40_5555;

const SEARCH: u32 = ExceptionDisposition::ContinueSearch as u32;
const EXECUTE: u32 = ExceptionDisposition::ContinueExecution as u32;

fn chain() -> RegistrationChain {
    let mut chain = RegistrationChain::new();
    chain.push_frame(OUTER, OUTER_ROUTINE);
    chain.push_frame(MID, MID_ROUTINE);
    chain.push_frame(INNER, INNER_ROUTINE);
    chain
}

fn sim() -> SimPlatform {
    let mut sim = SimPlatform::new(LIMITS);
    sim.context32.eip = RAISE_EIP;
    sim.context32.esp = INNER - 0x40;
    sim
}

fn context() -> Context32 {
    Context32 {
        context_flags: CONTEXT_I386_FULL,
        eip: RAISE_EIP,
        esp: INNER - 0x40,
        ..Default::default()
    }
}

/// Every routine answers `disposition`.
fn answer_all(sim: &mut SimPlatform, disposition: u32) {
    for routine in [OUTER_ROUTINE, MID_ROUTINE, INNER_ROUTINE] {
        sim.exception_routine(routine, move |_, _, _, _, _, _| disposition);
    }
}

fn routine_event(routine: u32, frame: u32, flags: ExceptionFlags) -> Event {
    Event::Routine {
        routine,
        frame,
        flags,
    }
}

fn routines_called(sim: &SimPlatform) -> Vec<u32> {
    sim.log
        .iter()
        .filter_map(|event| match *event {
            Event::Routine { routine, .. } => Some(routine),
            _ => None,
        })
        .collect()
}

#[test]
fn routine_continuing_execution_ends_the_search() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    sim.exception_routine(MID_ROUTINE, |_, record, frame, context, _, chain| {
        assert_eq!(record.code, CODE);
        assert_eq!(frame, MID);
        // the routine runs with a record guarding its frame on top
        assert_eq!(chain.len(), 4);
        context.eip = 0x40_6000;
        EXECUTE
    });
    let mut chain = chain();

    let outcome = sim.run(|sim| {
        let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), u64::from(RAISE_EIP));
        nt_raise_exception(sim, &mut record, &mut context(), true, &mut chain)
    });
    assert_eq!(outcome.resumed32().expect("resumed").eip, 0x40_6000);
    assert_eq!(
        sim.log,
        [
            routine_event(INNER_ROUTINE, INNER, ExceptionFlags::empty()),
            routine_event(MID_ROUTINE, MID, ExceptionFlags::empty()),
        ]
    );
    assert_eq!(chain.len(), 3);
}

#[test]
fn unhandled_exception_terminates_with_its_code() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    let mut chain = chain();

    let outcome = sim.run(|sim| {
        let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), u64::from(RAISE_EIP));
        nt_raise_exception(sim, &mut record, &mut context(), true, &mut chain)
    });
    assert_eq!(outcome.terminated(), Some(CODE));
    assert_eq!(
        routines_called(&sim),
        [INNER_ROUTINE, MID_ROUTINE, OUTER_ROUTINE]
    );
}

#[test]
fn noncontinuable_exception_cannot_be_continued() {
    let mut sim = sim();
    answer_all(&mut sim, EXECUTE);
    let mut record = ExceptionRecord::new(CODE, ExceptionFlags::NONCONTINUABLE, 0);

    let status = call_stack_handlers(&mut sim, &mut record, &mut context(), &mut chain());
    assert_eq!(status, STATUS_NONCONTINUABLE_EXCEPTION);
}

#[test]
fn invalid_disposition_is_reported() {
    let mut sim = sim();
    answer_all(&mut sim, 9);
    let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), 0);

    let status = call_stack_handlers(&mut sim, &mut record, &mut context(), &mut chain());
    assert_eq!(status, STATUS_INVALID_DISPOSITION);
    assert_eq!(routines_called(&sim), [INNER_ROUTINE]);
}

#[test]
fn collided_disposition_is_invalid_during_search() {
    let mut sim = sim();
    answer_all(&mut sim, ExceptionDisposition::CollidedUnwind as u32);
    let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), 0);

    let status = call_stack_handlers(&mut sim, &mut record, &mut context(), &mut chain());
    assert_eq!(status, STATUS_INVALID_DISPOSITION);
}

#[test]
fn frame_off_the_stack_stops_the_search() {
    let mut sim = sim();
    answer_all(&mut sim, EXECUTE);
    let mut chain = RegistrationChain::new();
    chain.push_frame(OUTER, OUTER_ROUTINE);
    // misaligned
    chain.push_frame(MID + 2, MID_ROUTINE);
    let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), 0);

    let status = call_stack_handlers(&mut sim, &mut record, &mut context(), &mut chain);
    assert_eq!(status, STATUS_UNHANDLED_EXCEPTION);
    assert!(record.flags.contains(ExceptionFlags::STACK_INVALID));
    assert!(sim.log.is_empty());
}

const NESTED_CODE: u32 = 0xe000_0064;

#[test]
fn exception_raised_by_a_routine_is_nested() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    let nested_status = Rc::new(Cell::new(None));
    let seen = nested_status.clone();
    sim.exception_routine(INNER_ROUTINE, move |sim, record, _, context, _, chain| {
        if record.code == CODE {
            let mut nested = ExceptionRecord::new(NESTED_CODE, ExceptionFlags::empty(), 0);
            seen.set(Some(call_stack_handlers(sim, &mut nested, context, chain)));
        }
        SEARCH
    });
    sim.exception_routine(MID_ROUTINE, |_, _, _, _, _, _| EXECUTE);
    let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), 0);

    let status = call_stack_handlers(&mut sim, &mut record, &mut context(), &mut chain());
    assert_eq!(status, STATUS_SUCCESS);
    assert_eq!(nested_status.get(), Some(STATUS_SUCCESS));
    assert_eq!(
        sim.log,
        [
            routine_event(INNER_ROUTINE, INNER, ExceptionFlags::empty()),
            // the nested walk passes the outer walk's record and gets back
            // to the routine that raised
            routine_event(INNER_ROUTINE, INNER, ExceptionFlags::NESTED_CALL),
            // past that frame the exception is no longer nested
            routine_event(MID_ROUTINE, MID, ExceptionFlags::empty()),
            routine_event(MID_ROUTINE, MID, ExceptionFlags::empty()),
        ]
    );
}

#[test]
fn breakpoint_resumes_at_the_int3() {
    let mut sim = sim();
    answer_all(&mut sim, EXECUTE);
    let mut chain = chain();

    let outcome = sim.run(|sim| {
        let mut record =
            ExceptionRecord::new(EXCEPTION_BREAKPOINT, ExceptionFlags::empty(), u64::from(RAISE_EIP));
        nt_raise_exception(sim, &mut record, &mut context(), true, &mut chain)
    });
    assert_eq!(outcome.resumed32().expect("resumed").eip, RAISE_EIP - 1);
}

#[test]
fn unwind_calls_routines_above_end_frame() {
    let mut sim = sim();
    let flags = Rc::new(RefCell::new(Vec::new()));
    for routine in [OUTER_ROUTINE, MID_ROUTINE, INNER_ROUTINE] {
        let flags = flags.clone();
        sim.exception_routine(routine, move |_, record, _, _, _, _| {
            flags.borrow_mut().push((record.code, record.flags));
            SEARCH
        });
    }
    let mut chain = chain();

    let resumed = sim
        .run(|sim| rtl_unwind(sim, OUTER, 0x40_7000, None, 0x55, &mut chain))
        .resumed32()
        .expect("resumed");
    assert_eq!(resumed.eip, 0x40_7000);
    assert_eq!(resumed.eax, 0x55);
    assert_eq!(routines_called(&sim), [INNER_ROUTINE, MID_ROUTINE]);
    assert_eq!(
        *flags.borrow(),
        [(STATUS_UNWIND, ExceptionFlags::UNWINDING); 2]
    );
    assert_eq!(chain.len(), 1);
    assert_eq!(chain.head(), OUTER);
}

#[test]
fn exit_unwind_empties_the_chain() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    let mut chain = chain();

    let resumed = sim
        .run(|sim| rtl_unwind(sim, 0, 0, None, 0, &mut chain))
        .resumed32()
        .expect("resumed");
    // no target, continue after the call
    assert_eq!(resumed.eip, RAISE_EIP);
    assert!(chain.is_empty());
    let unwinding = ExceptionFlags::UNWINDING | ExceptionFlags::EXIT_UNWIND;
    assert_eq!(
        sim.log,
        [
            routine_event(INNER_ROUTINE, INNER, unwinding),
            routine_event(MID_ROUTINE, MID, unwinding),
            routine_event(OUTER_ROUTINE, OUTER, unwinding),
        ]
    );
}

#[test]
fn end_frame_below_the_chain_is_an_invalid_target() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    let mut chain = chain();

    let outcome = sim.run(|sim| rtl_unwind(sim, INNER - 0x100, 0x40_7000, None, 0, &mut chain));
    assert_eq!(outcome.terminated(), Some(STATUS_INVALID_UNWIND_TARGET));
}

#[test]
fn unwinding_into_a_frame_off_the_stack_is_bad_stack() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    let mut chain = RegistrationChain::new();
    chain.push_frame(0x10, OUTER_ROUTINE);
    chain.push_frame(INNER, INNER_ROUTINE);

    let outcome = sim.run(|sim| rtl_unwind(sim, 0, 0x40_7000, None, 0, &mut chain));
    assert_eq!(outcome.terminated(), Some(STATUS_BAD_STACK));
    // inner was unwound before the walk hit the bad record
    assert_eq!(
        sim.log[0],
        routine_event(
            INNER_ROUTINE,
            INNER,
            ExceptionFlags::UNWINDING | ExceptionFlags::EXIT_UNWIND
        )
    );
}

#[test]
fn invalid_unwind_disposition_raises() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    sim.exception_routine(INNER_ROUTINE, |_, record, _, _, _, _| {
        if record.flags.is_unwinding() {
            EXECUTE
        } else {
            SEARCH
        }
    });
    let mut chain = chain();

    let outcome = sim.run(|sim| rtl_unwind(sim, OUTER, 0x40_7000, None, 0, &mut chain));
    assert_eq!(outcome.terminated(), Some(STATUS_INVALID_DISPOSITION));
}

#[test]
fn unwind_started_by_a_routine_skips_its_frame() {
    let mut sim = sim();
    answer_all(&mut sim, SEARCH);
    sim.exception_routine(INNER_ROUTINE, |sim, record, _, _, _, chain| {
        if record.code == STATUS_UNWIND {
            // a second unwind from inside the first one's call
            rtl_unwind(sim, OUTER, 0x40_8000, None, 0, chain);
        }
        SEARCH
    });
    let mut chain = chain();

    let outcome = sim.run(|sim| rtl_unwind(sim, OUTER, 0x40_7000, None, 0, &mut chain));
    assert_eq!(outcome.resumed32().expect("resumed").eip, 0x40_8000);
    // the inner routine is not run again by the colliding unwind
    assert_eq!(routines_called(&sim), [INNER_ROUTINE, MID_ROUTINE]);
    assert_eq!(chain.head(), OUTER);
}

#[test]
fn routines_run_outside_of_every_span() {
    let mut sim = sim();
    let counter = SpanCounter::default();
    let depths = Rc::new(RefCell::new(Vec::new()));
    for routine in [OUTER_ROUTINE, INNER_ROUTINE] {
        let (seen, spans) = (depths.clone(), counter.clone());
        sim.exception_routine(routine, move |_, _, _, _, _, _| {
            seen.borrow_mut().push(spans.depth());
            SEARCH
        });
    }
    let (seen, spans) = (depths.clone(), counter.clone());
    sim.exception_routine(MID_ROUTINE, move |sim, record, _, _, _, chain| {
        seen.borrow_mut().push(spans.depth());
        if !record.flags.is_unwinding() {
            // accept, like an __except block of the frame would
            rtl_unwind(sim, MID, 0x40_6000, Some(record), 0, chain);
        }
        SEARCH
    });
    let mut chain = chain();

    let outcome = tracing::subscriber::with_default(counter.clone(), || {
        sim.run(|sim| {
            let mut record = ExceptionRecord::new(CODE, ExceptionFlags::empty(), u64::from(RAISE_EIP));
            nt_raise_exception(sim, &mut record, &mut context(), true, &mut chain)
        })
    });
    assert_eq!(outcome.resumed32().expect("resumed").eip, 0x40_6000);
    // inner and mid searching, then inner unwinding
    assert_eq!(*depths.borrow(), [0, 0, 0]);
    assert!(counter.enters() > 0);
    assert_eq!(counter.depth(), 0);
}

#[test]
fn remote_context_goes_to_the_collaborator() {
    let mut sim = sim();
    let context = context();

    let status = set_context_thread(&mut sim, ThreadHandle(7), &context);
    assert_eq!(status, STATUS_SUCCESS);
    assert_eq!(sim.remote32.len(), 1);
    assert_eq!(sim.remote32[0].0, ThreadHandle(7));
}

#[test]
fn partial_context_is_not_installed_on_the_current_thread() {
    let mut sim = sim();
    let context = Context32 {
        context_flags: CONTEXT_I386_INTEGER,
        ..Default::default()
    };

    let outcome = sim.run(|sim| set_context_thread(sim, ThreadHandle::CURRENT, &context));
    assert!(matches!(outcome, Outcome::Returned(STATUS_SUCCESS)));
}
