//! End-to-end process control: spawn, attach, resolve a symbol, set a
//! breakpoint, continue to it, and detach.
//!
//! Ignored by default: `task_for_pid` against a freshly forked child only
//! succeeds for a debugger that is either running as root or carries the
//! `com.apple.security.cs.debugger` entitlement (or the target is signed
//! `get-task-allow`). `cargo test -- --ignored` after codesigning the test
//! binary with that entitlement exercises the full path; without it, the
//! self-task tests in `tests/self_memory.rs` already cover the memory
//! subsystem without needing the privilege at all.
#![cfg(target_os = "macos")]

use std::path::PathBuf;

use mach_debug::process::{Process, ProcessStatus};
use mach_debug::session::{Session, State};

#[test]
#[ignore = "requires task_for_pid entitlement against a child process"]
fn spawn_attach_and_run_to_exit() {
    let process = Process::spawn(&PathBuf::from("/usr/bin/true")).expect("spawn /usr/bin/true");
    assert!(process.pid() > 0);

    // The dynamic linker is always mapped by the time the child stops at
    // entry; its own image type is `MH_DYLINKER`.
    assert!(
        process.images().any(|image| image.file_type() == mach_debug::macho::MH_DYLINKER),
        "dynamic linker should already be mapped at entry"
    );

    loop {
        match process.cont().expect("continue") {
            ProcessStatus::Exited(code) => {
                assert_eq!(code, 0);
                break;
            }
            ProcessStatus::Stopped(signal) => {
                panic!("unexpected stop (signal {signal}) debugging /usr/bin/true");
            }
            ProcessStatus::Signaled(signal) => panic!("unexpectedly signaled ({signal})"),
            ProcessStatus::Continued => continue,
        }
    }
}

#[test]
#[ignore = "requires task_for_pid entitlement against a child process"]
fn session_run_reaches_idle_after_a_quick_child_exits() {
    let mut session = Session::new(PathBuf::from("/usr/bin/true"));
    session.run().expect("run to completion");
    assert_eq!(session.state(), State::Idle);
}

#[test]
fn session_refuses_continue_before_run() {
    let mut session = Session::new(PathBuf::from("/usr/bin/true"));
    assert!(session.continue_().is_err());
    assert_eq!(session.state(), State::Idle);
}
