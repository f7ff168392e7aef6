//! Raises an exception in a simulated guest where `program` calls `outer`,
//! which calls `inner`, which faults. `outer` has a `__finally` around the
//! call, `program` an `__except` whose filter accepts the exception.

use sehwind::amd64::{dispatch_fault, ScopeRecord, ScopeTable};
use sehwind::context::{CONTEXT_AMD64_FULL, RBX, RSI, RSP};
use sehwind::sim::{FunctionBuilder, ImageBuilder, Outcome, SimPlatform};
use sehwind::status::{
    EXCEPTION_EXECUTE_HANDLER, STATUS_ACCESS_VIOLATION, UNW_FLAG_EHANDLER, UNW_FLAG_UHANDLER,
};
use sehwind::{Context64, ExceptionFlags, ExceptionRecord, StackLimits};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const IMAGE_BASE: u64 = 0x1_4000_0000;
const LIMITS: StackLimits = StackLimits {
    base: 0x20_0000,
    limit: 0x1f_0000,
};

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let mut image = ImageBuilder::new(IMAGE_BASE);
    let c_specific = image.stub();
    let filter = image.stub();
    let finally = image.stub();

    let program = image.add_function(FunctionBuilder::new().push(RBX).alloc(0x20).body(0x40));
    let outer = image.add_function(FunctionBuilder::new().push(RSI).alloc(0x30).body(0x40));
    let inner = image.add_function(FunctionBuilder::new().alloc(0x28).body(0x40));
    let rva = |address: u64| (address - IMAGE_BASE) as u32;

    let (begin, end) = program.body_range(0x10, 0x10);
    let landing = program.body_range(0x30, 1).0;
    let program_scopes = ScopeTable {
        records: vec![ScopeRecord {
            begin,
            end,
            handler: rva(filter),
            jump_target: landing,
        }],
    };
    image.set_handler(&program, UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER, c_specific, program_scopes.to_bytes());

    let (begin, end) = outer.body_range(0x08, 0x10);
    let outer_scopes = ScopeTable {
        records: vec![ScopeRecord {
            begin,
            end,
            handler: rva(finally),
            jump_target: 0,
        }],
    };
    image.set_handler(&outer, UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER, c_specific, outer_scopes.to_bytes());

    let mut sim = SimPlatform::new(LIMITS);
    sim.load(image.build());
    sim.c_specific_handler(c_specific);
    sim.filter(filter, |_, pointers, _| {
        tracing::info!(code = pointers.record.code, "filter looking at the exception");
        EXCEPTION_EXECUTE_HANDLER
    });
    sim.finally(finally, |_, abnormal, frame| {
        tracing::info!(abnormal, frame, "__finally running");
    });
    sim.name(inner.body_address(0x08), "inner+0x8");

    let mut context = Context64 {
        context_flags: CONTEXT_AMD64_FULL,
        ..Default::default()
    };
    context.gpr[RSP] = LIMITS.base;
    context.rip = 0x7ff7_0000_1000;
    program.enter(&mut sim.memory, &mut context).unwrap();
    context.rip = program.body_address(0x14);
    outer.enter(&mut sim.memory, &mut context).unwrap();
    context.rip = outer.body_address(0x10);
    inner.enter(&mut sim.memory, &mut context).unwrap();
    context.rip = inner.body_address(0x08);

    let fault = ExceptionRecord::new(STATUS_ACCESS_VIOLATION, ExceptionFlags::empty(), context.rip)
        .with_parameters(&[0, 0xdead_beef]);
    match sim.run(|sim| dispatch_fault(sim, &fault, &context)) {
        Outcome::Resumed(resumed) => {
            tracing::info!(rip = resumed.rip, rsp = resumed.rsp(), "resumed in the __except block")
        }
        Outcome::Terminated(status) => tracing::error!(status, "process terminated"),
        outcome => tracing::warn!(?outcome, "unexpected outcome"),
    }
    for event in &sim.log {
        tracing::info!(?event, "guest call");
    }
}
