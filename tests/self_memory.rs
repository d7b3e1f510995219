//! Remote-memory primitives exercised against the test binary's own task.
//!
//! A process always owns its own task port without `task_for_pid`
//! entitlements, so reading/writing/region-walking `mach_task_self()` is the
//! same pattern teacher's `tests/task_dumper.rs` uses to validate
//! `TaskDumper` against `std::env::current_exe()`'s own live image, without
//! needing a spawned child or debugger privileges.
#![cfg(target_os = "macos")]

use mach_debug::memory::Memory;

fn self_memory() -> Memory {
    // SAFETY: `mach_task_self` takes no arguments and cannot fail.
    let task = unsafe { mach2::traps::mach_task_self() };
    Memory::new(task).expect("mach_task_self should always yield a usable task")
}

#[test]
fn reads_back_a_local_stack_value() {
    let memory = self_memory();
    let value: u64 = 0xDEAD_BEEF_CAFE_F00D;
    let address = &value as *const u64 as u64;

    let bytes = memory.read(address, 8).expect("read of our own stack");
    assert_eq!(bytes, value.to_le_bytes());
}

#[test]
fn region_at_reports_a_valid_mapping_for_the_stack() {
    let memory = self_memory();
    let local = 0u8;
    let address = &local as *const u8 as u64;

    let region = memory.region_at(address).expect("region lookup");
    assert!(region.is_valid());
    assert!(region.contains(address));
}

#[test]
fn region_at_reports_invalid_for_a_null_page_gap() {
    let memory = self_memory();
    let region = memory.region_at(0).expect("region lookup at address 0");
    assert!(!region.is_valid(), "page zero is never mapped");
}

#[test]
fn writes_and_restores_a_heap_byte() {
    let memory = self_memory();
    let mut boxed = Box::new([0u8; 8]);
    let address = boxed.as_ptr() as u64;

    let written = memory.write(address, &[1, 2, 3, 4]).expect("write to our own heap");
    assert_eq!(written, 4);
    assert_eq!(&boxed[..4], &[1, 2, 3, 4]);

    // `ProtectionGuard` only raised protection here if it wasn't already
    // read+write, which heap pages always are; nothing to assert beyond the
    // write having landed without the process's own mapping ending up
    // read-only afterward.
    boxed[0] = 0;
}
