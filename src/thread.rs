//! Register-file access for a single stopped thread.

use crate::error::{Kind, Result};
use crate::mach::{self, check, thread_get_state, thread_set_state, ThreadState};

/// A thread inside the target, identified by its Mach thread port.
pub struct Thread {
    id: mach2::mach_types::thread_act_t,
}

impl Thread {
    pub fn new(id: mach2::mach_types::thread_act_t) -> Self {
        Self { id }
    }

    pub fn id(&self) -> mach2::mach_types::thread_act_t {
        self.id
    }

    /// Fetches the thread's register file into a snapshot.
    pub fn state(&self) -> Result<ThreadState> {
        let mut state = ThreadState::default();
        let mut count = mach::THREAD_STATE_MAX as u32;

        // SAFETY: syscall, `state.state` has room for `THREAD_STATE_MAX` words.
        let kr = unsafe {
            thread_get_state(
                self.id,
                mach::THREAD_STATE_FLAVOR,
                state.state.as_mut_ptr(),
                &mut count,
            )
        };
        check(kr, Kind::Kernel).map_err(|e| e.context("thread", self.id))?;
        state.state_size = count * std::mem::size_of::<u32>() as u32;
        Ok(state)
    }

    /// Writes a snapshot back, e.g. after rewinding the program counter past
    /// a breakpoint trap.
    pub fn set_state(&self, state: &ThreadState) -> Result<()> {
        let count = state.state_size / std::mem::size_of::<u32>() as u32;

        // SAFETY: syscall, `state.state` holds `count` valid words.
        let kr = unsafe {
            thread_set_state(
                self.id,
                mach::THREAD_STATE_FLAVOR,
                state.state.as_ptr() as *mut u32,
                count,
            )
        };
        check(kr, Kind::Kernel).map_err(|e| e.context("thread", self.id))
    }
}
