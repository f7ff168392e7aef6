use super::{add_function_table, lookup_function_entry, RuntimeFunction, UnwindHistoryTable};
use crate::context::RBX;
use crate::env::Module;
use crate::sim::{FunctionBuilder, ImageBuilder, PlacedFunction, SimPlatform};
use crate::stack::StackLimits;

const IMAGE_BASE: u64 = 0x1_8000_0000;
const LIMITS: StackLimits = StackLimits {
    base: 0x10_0000,
    limit: 0xf_0000,
};

fn three_functions() -> (SimPlatform, Module, Vec<PlacedFunction>) {
    let mut image = ImageBuilder::new(IMAGE_BASE);
    let functions = (0..3)
        .map(|n| image.add_function(FunctionBuilder::new().push(RBX).body(0x20 + n * 8)))
        .collect();
    let mut sim = SimPlatform::new(LIMITS);
    let module = sim.load(image.build());
    (sim, module, functions)
}

#[test]
fn finds_each_function() {
    let (sim, module, functions) = three_functions();
    let (rva, _) = module.exception_directory.unwrap();
    for (n, function) in functions.iter().enumerate() {
        for pc in [function.begin_address(), function.body_address(0x1f)] {
            let entry = lookup_function_entry(&sim, pc, None).unwrap();
            assert_eq!(entry.image_base, IMAGE_BASE);
            assert_eq!(entry.function.begin, function.begin);
            assert_eq!(entry.function.end, function.end);
            assert_eq!(
                entry.address,
                IMAGE_BASE + u64::from(rva) + n as u64 * RuntimeFunction::SIZE
            );
        }
    }
}

#[test]
fn gaps_and_foreign_addresses_have_no_entry() {
    let (sim, _, functions) = three_functions();
    // functions are 16-byte aligned, the padding in between belongs to none
    let gap = IMAGE_BASE + u64::from(functions[0].end);
    assert!(gap < functions[1].begin_address());
    assert_eq!(lookup_function_entry(&sim, gap, None), None);
    // the headers
    assert_eq!(lookup_function_entry(&sim, IMAGE_BASE + 0x10, None), None);
    // no module at all
    assert_eq!(lookup_function_entry(&sim, 0x1234, None), None);
}

#[test]
fn module_without_exception_directory() {
    let mut sim = SimPlatform::new(LIMITS);
    sim.memory.map(0x50_0000, 0x1000);
    sim.modules.push(Module {
        base: 0x50_0000,
        size: 0x1000,
        exception_directory: None,
    });
    assert_eq!(lookup_function_entry(&sim, 0x50_0100, None), None);
}

#[test]
fn chain_links_resolve_to_the_target() {
    let mut image = ImageBuilder::new(IMAGE_BASE);
    let target = image.add_function(FunctionBuilder::new().push(RBX).body(0x10));
    // a cold block split off the function, sharing its unwind info
    let cold_begin = (image.stub() - IMAGE_BASE) as u32;
    image.add_chain_link(cold_begin, cold_begin + 0x10, &target);
    let mut sim = SimPlatform::new(LIMITS);
    sim.load(image.build());

    let entry = lookup_function_entry(&sim, IMAGE_BASE + u64::from(cold_begin) + 4, None).unwrap();
    assert_eq!(entry.function.begin, target.begin);
    assert_eq!(entry.function.end, target.end);
    assert!(!entry.function.is_chain_link());
}

#[test]
fn chain_link_cycles_are_not_followed_forever() {
    let (mut sim, module, functions) = three_functions();
    let (rva, _) = module.exception_directory.unwrap();
    // the second entry links to itself
    let entry = IMAGE_BASE + u64::from(rva) + RuntimeFunction::SIZE;
    sim.memory.write_u32(entry + 8, (rva + 12) | 1).unwrap();

    assert_eq!(lookup_function_entry(&sim, functions[1].body_address(0), None), None);
    assert!(lookup_function_entry(&sim, functions[0].body_address(0), None).is_some());
}

#[test]
fn history_table_short_circuits_the_search() {
    let (mut sim, module, functions) = three_functions();
    let mut history = UnwindHistoryTable::new();
    let pc = functions[2].body_address(4);

    let first = lookup_function_entry(&sim, pc, Some(&mut history)).unwrap();
    assert_eq!(history.lookup(pc), Some(first));
    assert_eq!(history.lookup(functions[0].body_address(0)), None);

    // wreck the directory, only the history still knows
    let (rva, size) = module.exception_directory.unwrap();
    sim.memory
        .write_bytes(IMAGE_BASE + u64::from(rva), &vec![0u8; size as usize])
        .unwrap();
    assert_eq!(lookup_function_entry(&sim, pc, None), None);
    assert_eq!(lookup_function_entry(&sim, pc, Some(&mut history)), Some(first));
}

#[test]
fn history_table_keeps_the_most_recent_entries() {
    let mut image = ImageBuilder::new(IMAGE_BASE);
    let functions: Vec<_> = (0..14)
        .map(|_| image.add_function(FunctionBuilder::new().body(8)))
        .collect();
    let mut sim = SimPlatform::new(LIMITS);
    sim.load(image.build());

    let mut history = UnwindHistoryTable::new();
    for function in &functions {
        lookup_function_entry(&sim, function.begin_address(), Some(&mut history)).unwrap();
    }
    // twelve slots, the first two lookups were evicted
    assert_eq!(history.lookup(functions[0].begin_address()), None);
    assert_eq!(history.lookup(functions[1].begin_address()), None);
    for function in &functions[2..] {
        assert!(history.lookup(function.begin_address()).is_some());
    }
}

#[test]
fn dynamic_tables_are_accepted() {
    assert!(add_function_table(0x1000, 4, IMAGE_BASE));
}
