//! Interactive entry point: argv parsing, logger setup, and the REPL loop
//! that turns prompt lines into [`Session`] operations.
//!
//! Grounded on `Debugger::Start` in
//! `examples/original_source/src/MAD/Debugger.cpp`: read a line, dispatch on
//! its `PromptCmdType`, print `mad exit`/help/unknown-command feedback, loop
//! until exit. Exit codes follow spec §6 and `Start`'s own `return 1`
//! (missing target) / `exit(2)` (child never actually executed).

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mach_debug::error::Kind;
use mach_debug::prompt::{self, Command};
use mach_debug::session::Session;

/// A minimal Mach-kernel process debugger.
#[derive(Parser, Debug)]
#[command(name = "mach-debug", about = "A Mach-kernel process debugger for macOS/x86-64")]
struct Args {
    /// Path to the executable to debug.
    executable: PathBuf,

    /// Attach to an already-running process instead of spawning one.
    ///
    /// Not implemented by this build's process control (spawn-only, per the
    /// process record's `Unstarted -> Spawned(traced)` lifecycle); accepted
    /// so the flag's absence isn't a surprise, but using it is refused at
    /// startup rather than silently ignored.
    #[arg(long)]
    attach: Option<libc::pid_t>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    if args.attach.is_some() {
        eprintln!("--attach is not supported by this build; pass an executable to spawn instead");
        return ExitCode::from(1);
    }

    log::debug!("pid: {}", std::process::id());
    println!("Mini Mach Debugger");
    println!("Executable set to {}", args.executable.display());

    let mut session = Session::new(args.executable);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("(mach-debug) ");
        if io::stdout().flush().is_err() {
            break;
        }

        let Some(line) = lines.next() else {
            // EOF on stdin: treat like the original's `!Line` fallback to `e`.
            break;
        };
        let Ok(line) = line else { break };

        match prompt::parse_line(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Exit)) => break,
            Ok(Some(Command::Help)) => print!("{}", prompt::help_text()),
            Ok(Some(Command::ProcessRun)) => report(session.run()),
            Ok(Some(Command::ProcessContinue)) => report(session.continue_()),
            Ok(Some(Command::BreakpointSet(target))) => {
                use mach_debug::prompt::BreakpointTarget;
                let result = match target {
                    BreakpointTarget::Symbol(name) => session.breakpoint_set_by_symbol(name).map(|_| ()),
                    BreakpointTarget::Address(address) => {
                        session.breakpoint_set_by_address(address).map(|_| ())
                    }
                };
                report(result);
            }
            Err(e) => report_error(&e),
        }
    }

    if let Err(e) = session.shutdown() {
        log::warn!("shutdown: {e}");
    }

    ExitCode::SUCCESS
}

fn report(result: mach_debug::error::Result<()>) {
    if let Err(e) = result {
        report_error(&e);
    }
}

fn report_error(e: &mach_debug::error::Error) {
    // Spec §7: print flavor, code, text, and any attached context, then
    // return to the prompt without aborting the session loop.
    eprintln!("{e}");
    if e.kind() == Kind::Process {
        log::error!("process error: {e}");
    }
}
