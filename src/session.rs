//! Session driver: the state machine binding a [`Process`] to a
//! [`Controller`] and exposing the command grammar's operations (spec §4.8).
//!
//! Grounded on `Debugger::HandleProcessRun`/`HandleProcessContinue` in
//! `original_source/src/MAD/Debugger.cpp`: spawn-attach-continue on `run`,
//! the `StandingOnBreakpoint`/`StepOverCurrentBreakpoint` preamble before
//! every resume, and the `MachProcessStatusType` switch that only treats
//! `SIGTRAP` as a breakpoint dispatch.

use std::path::{Path, PathBuf};

use crate::breakpoint::{Controller, Directives, HitOutcome, SeedId};
use crate::error::{Error, Kind, Result};
use crate::process::{Process, ProcessStatus};

/// Where the session currently stands relative to its one attached process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopped,
}

/// Owns at most one attached [`Process`] and the [`Controller`] tracking its
/// breakpoints. The only thing that outlives a single `run`/exit cycle is the
/// controller's seed table, so a breakpoint set before `run` is still pending
/// resolution against the next spawned process (spec §4.7 "PendingSeeds").
pub struct Session {
    executable: PathBuf,
    process: Option<Process>,
    controller: Controller,
    state: State,
}

impl Session {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            process: None,
            controller: Controller::new(),
            state: State::Idle,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// `process run`: spawn, attach, install the dyld-sync breakpoint, and
    /// continue until the next user-visible stop. Refuses if a process is
    /// already attached (spec §4.8: "On run when already running: refuse,
    /// keep state").
    pub fn run(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::internal(Kind::Process, "a program is already running")
                .context("executable", self.executable.display().to_string()));
        }

        log::debug!("spawning {}", self.executable.display());
        let process = Process::spawn(&self.executable)?;
        log::debug!("attaching to pid {}", process.pid());

        self.controller.attach(&process)?;
        self.process = Some(process);
        self.state = State::Running;
        self.continue_loop()
    }

    /// `process continue`: resume after a stop. Refuses if idle (spec §4.8:
    /// "On continue when idle: diagnose, keep state").
    pub fn continue_(&mut self) -> Result<()> {
        if self.process.is_none() {
            return Err(Error::internal(Kind::Process, "you must run the program first"));
        }
        self.continue_loop()
    }

    /// Drives the process forward until either it terminates or a
    /// breakpoint's callbacks vote to break back into the prompt.
    fn continue_loop(&mut self) -> Result<()> {
        loop {
            let process = self
                .process
                .as_ref()
                .expect("continue_loop only runs while a process is attached");

            self.controller.step_over_if_needed(process)?;

            match process.cont()? {
                ProcessStatus::Exited(code) => {
                    log::info!("program {} finished with status {code}", self.executable.display());
                    self.teardown(false)?;
                    return Ok(());
                }
                ProcessStatus::Signaled(signal) => {
                    log::info!("program {} signaled ({signal})", self.executable.display());
                    self.teardown(false)?;
                    return Ok(());
                }
                ProcessStatus::Stopped(libc::SIGTRAP) => {
                    let process = self.process.as_ref().expect("checked above");
                    match self.controller.hit_dispatch(process)? {
                        HitOutcome::Continue | HitOutcome::Unknown => continue,
                        HitOutcome::Break => {
                            self.state = State::Stopped;
                            return Ok(());
                        }
                    }
                }
                ProcessStatus::Stopped(signal) => {
                    log::warn!("unhandled stop signal {signal}, breaking into the prompt");
                    self.state = State::Stopped;
                    return Ok(());
                }
                ProcessStatus::Continued => continue,
            }
        }
    }

    /// Tears down the attached process. `alive` selects whether the
    /// controller should try to restore breakpoint patches first (it cannot,
    /// and must not try, once the process has already exited or been
    /// killed).
    fn teardown(&mut self, alive: bool) -> Result<()> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };

        if alive {
            self.controller.detach(Some(&process))?;
            if let Err(e) = process.detach() {
                log::warn!("detach failed (process may have already exited): {e}");
            }
        } else {
            self.controller.detach(None)?;
        }

        self.state = State::Idle;
        Ok(())
    }

    /// `breakpoint set --name SYM`: adds a by-symbol Seed that breaks into
    /// the prompt on every hit. Works whether or not a process is currently
    /// attached; an unresolved seed stays pending until the next `run` or
    /// dyld-sync event resolves it.
    pub fn breakpoint_set_by_symbol(&mut self, symbol: impl Into<String>) -> Result<SeedId> {
        let target = self.process.as_ref().map(|p| p as &dyn crate::breakpoint::DebugTarget);
        self.controller
            .add_symbol_seed(symbol, Box::new(|_| Directives::BREAK), target)
    }

    /// `breakpoint set --address ADDR`.
    pub fn breakpoint_set_by_address(&mut self, address: u64) -> Result<SeedId> {
        let target = self.process.as_ref().map(|p| p as &dyn crate::breakpoint::DebugTarget);
        self.controller
            .add_address_seed(address, Box::new(|_| Directives::BREAK), target)
    }

    pub fn breakpoint_remove(&mut self, id: SeedId) -> Result<()> {
        match self.process.as_ref() {
            Some(process) => self.controller.remove_seed(id, process),
            None => {
                // No live target to patch; the seed is only pending anyway.
                self.controller.remove_seed_pending_only(id)
            }
        }
    }

    /// Cleanly ends the session: restores breakpoints and detaches if a
    /// process is still attached. Called from `mad exit`.
    pub fn shutdown(&mut self) -> Result<()> {
        self.teardown(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_idle() {
        let session = Session::new(PathBuf::from("/bin/true"));
        assert_eq!(session.state(), State::Idle);
        assert_eq!(session.executable(), Path::new("/bin/true"));
    }

    #[test]
    fn continue_without_run_is_refused() {
        let mut session = Session::new(PathBuf::from("/bin/true"));
        let err = session.continue_().unwrap_err();
        assert_eq!(err.kind(), Kind::Process);
    }
}
