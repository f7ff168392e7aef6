use super::{c_specific_handler, ScopeRecord, ScopeTable};
use crate::amd64::dispatcher::DispatcherContext;
use crate::amd64::rtl_raise_exception;
use crate::context::{Context64, CONTEXT_AMD64_FULL, RAX, RBX, RSP};
use crate::error::Error;
use crate::record::{ExceptionFlags, ExceptionRecord};
use crate::sim::{Event, FunctionBuilder, ImageBuilder, SimPlatform};
use crate::stack::StackLimits;
use crate::status::{
    ExceptionDisposition, EXCEPTION_EXECUTE_HANDLER, UNW_FLAG_EHANDLER, UNW_FLAG_UHANDLER,
};

const IMAGE_BASE: u64 = 0x1_8000_0000;
const LIMITS: StackLimits = StackLimits {
    base: 0x40_0000,
    limit: 0x3f_0000,
};
/// Scratch space for scope tables, inside the stack mapping.
const TABLE: u64 = LIMITS.limit + 0x40;
const FRAME: u64 = LIMITS.base - 0x200;

fn finally(begin: u32, end: u32, handler: u32) -> ScopeRecord {
    ScopeRecord {
        begin,
        end,
        handler,
        jump_target: 0,
    }
}

fn dispatch_at(pc_rva: u32) -> DispatcherContext {
    let mut context = Context64::default();
    context.rip = IMAGE_BASE + u64::from(pc_rva);
    context.gpr[RSP] = FRAME;
    let mut dispatch = DispatcherContext::new(0, &context);
    dispatch.image_base = IMAGE_BASE;
    dispatch.handler_data = TABLE;
    dispatch
}

fn sim_with_table(table: &ScopeTable) -> SimPlatform {
    let mut sim = SimPlatform::new(LIMITS);
    sim.memory.write_bytes(TABLE, &table.to_bytes()).unwrap();
    sim
}

fn call(
    sim: &mut SimPlatform,
    flags: ExceptionFlags,
    dispatch: &mut DispatcherContext,
) -> ExceptionDisposition {
    let mut record = ExceptionRecord::new(0xe000_0001, flags, dispatch.control_pc);
    let mut context = dispatch.context.clone();
    c_specific_handler(sim, &mut record, FRAME, &mut context, dispatch)
}

fn finally_calls(sim: &SimPlatform) -> Vec<u64> {
    sim.log
        .iter()
        .filter_map(|event| match *event {
            Event::Finally { handler, .. } => Some(handler - IMAGE_BASE),
            _ => None,
        })
        .collect()
}

#[test]
fn parses_scope_table() {
    let table = ScopeTable {
        records: vec![
            finally(0x1000, 0x1010, 0x2000),
            ScopeRecord {
                begin: 0x1000,
                end: 0x1040,
                handler: EXCEPTION_EXECUTE_HANDLER as u32,
                jump_target: 0x1050,
            },
        ],
    };
    let bytes = table.to_bytes();
    assert_eq!(bytes.len(), 4 + 2 * ScopeRecord::SIZE);
    assert_eq!(ScopeTable::parse(&bytes).unwrap(), table);

    assert!(matches!(
        ScopeTable::parse(&bytes[..bytes.len() - 1]),
        Err(Error::Truncated { .. })
    ));
}

#[test]
fn absurd_scope_count_is_rejected() {
    let mut sim = SimPlatform::new(LIMITS);
    sim.memory.write_u32(TABLE, 0x10_0000).unwrap();
    assert!(matches!(
        ScopeTable::read(&sim, TABLE),
        Err(Error::InvalidImage(_))
    ));
}

#[test]
fn scope_ranges_are_half_open() {
    let scope = finally(0x1000, 0x1010, 0x2000);
    assert!(!scope.covers(IMAGE_BASE, IMAGE_BASE + 0xfff));
    assert!(scope.covers(IMAGE_BASE, IMAGE_BASE + 0x1000));
    assert!(scope.covers(IMAGE_BASE, IMAGE_BASE + 0x100f));
    assert!(!scope.covers(IMAGE_BASE, IMAGE_BASE + 0x1010));
}

#[test]
fn unreadable_table_continues_search() {
    let mut sim = SimPlatform::new(LIMITS);
    let mut dispatch = dispatch_at(0x1008);
    dispatch.handler_data = 0xdead_0000;

    assert_eq!(
        call(&mut sim, ExceptionFlags::UNWINDING, &mut dispatch),
        ExceptionDisposition::ContinueSearch
    );
    assert!(sim.log.is_empty());
}

#[test]
fn unwinding_runs_covering_finally_blocks() {
    let table = ScopeTable {
        records: vec![
            finally(0x1004, 0x100c, 0x2000),
            // does not cover the pc
            finally(0x1010, 0x1020, 0x2010),
            finally(0x1000, 0x1040, 0x2020),
        ],
    };
    let mut sim = sim_with_table(&table);
    let mut dispatch = dispatch_at(0x1008);

    assert_eq!(
        call(&mut sim, ExceptionFlags::UNWINDING, &mut dispatch),
        ExceptionDisposition::ContinueSearch
    );
    assert_eq!(finally_calls(&sim), [0x2000, 0x2020]);
    assert_eq!(dispatch.scope_index, 3);
}

#[test]
fn unwinding_resumes_after_scope_index() {
    let table = ScopeTable {
        records: vec![
            finally(0x1000, 0x1010, 0x2000),
            finally(0x1000, 0x1020, 0x2010),
        ],
    };
    let mut sim = sim_with_table(&table);
    let mut dispatch = dispatch_at(0x1008);
    // the first block already ran before a collided unwind
    dispatch.scope_index = 1;

    call(&mut sim, ExceptionFlags::UNWINDING, &mut dispatch);
    assert_eq!(finally_calls(&sim), [0x2010]);
    assert_eq!(dispatch.scope_index, 2);
}

#[test]
fn target_unwind_stops_at_region_containing_target() {
    let table = ScopeTable {
        records: vec![
            finally(0x1004, 0x100c, 0x2000),
            finally(0x1000, 0x1040, 0x2010),
        ],
    };
    let mut sim = sim_with_table(&table);
    let mut dispatch = dispatch_at(0x1008);
    dispatch.target_ip = IMAGE_BASE + 0x1030;

    call(
        &mut sim,
        ExceptionFlags::UNWINDING | ExceptionFlags::TARGET_UNWIND,
        &mut dispatch,
    );
    assert_eq!(finally_calls(&sim), [0x2000]);
}

#[test]
fn search_skips_finally_blocks() {
    let table = ScopeTable {
        records: vec![finally(0x1000, 0x1010, 0x2000)],
    };
    let mut sim = sim_with_table(&table);
    let mut dispatch = dispatch_at(0x1008);

    assert_eq!(
        call(&mut sim, ExceptionFlags::empty(), &mut dispatch),
        ExceptionDisposition::ContinueSearch
    );
    assert!(sim.log.is_empty());
}

#[test]
fn execute_handler_constant_needs_no_filter() {
    let mut image = ImageBuilder::new(IMAGE_BASE);
    let c_specific = image.stub();
    let function = image.add_function(FunctionBuilder::new().push(RBX).alloc(0x20).body(0x40));
    let (begin, end) = function.body_range(0, 0x20);
    let landing = function.body_range(0x30, 1).0;
    let table = ScopeTable {
        records: vec![ScopeRecord {
            begin,
            end,
            handler: EXCEPTION_EXECUTE_HANDLER as u32,
            jump_target: landing,
        }],
    };
    image.set_handler(
        &function,
        UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER,
        c_specific,
        table.to_bytes(),
    );

    let mut sim = SimPlatform::new(LIMITS);
    sim.load(image.build());
    sim.c_specific_handler(c_specific);
    let mut context = Context64 {
        context_flags: CONTEXT_AMD64_FULL,
        ..Default::default()
    };
    context.gpr[RSP] = LIMITS.base;
    function.enter(&mut sim.memory, &mut context).unwrap();
    let frame = context.gpr[RSP];
    context.rip = function.body_address(0x08);
    sim.context = context;

    let resumed = sim
        .run(|sim| {
            let mut record = ExceptionRecord::new(0xc000_0094, ExceptionFlags::empty(), 0);
            rtl_raise_exception(sim, &mut record)
        })
        .resumed()
        .expect("resumed");
    assert_eq!(resumed.rip, IMAGE_BASE + u64::from(landing));
    assert_eq!(resumed.gpr[RSP], frame);
    assert_eq!(resumed.gpr[RAX], 0xc000_0094);
    assert!(!sim
        .log
        .iter()
        .any(|event| matches!(event, Event::Filter { .. })));
}
