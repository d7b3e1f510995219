//! Command grammar for the session's external interface (spec §6):
//! whitespace-tokenized shortcuts (`r`, `c`, `b ...`, `?`, `e`) and
//! `group cmd` pairs (`mad help`, `process run`, `breakpoint set --name SYM`).
//!
//! Grounded on `Prompt::Show`'s `Tokenize`-then-dispatch shape in
//! `original_source/src/MAD/Prompt.cpp` (shortcut table checked first, then
//! `group`/`cmd` lookup), reworked around `clap`'s derive API in place of the
//! original's `args::ArgumentParser`, the way `other_examples/.../jesse99-udb`
//! builds its own command surface on `clap`.

use clap::Parser;

use crate::error::{Error, Kind, Result};

/// One fully parsed command ready for [`crate::session::Session`] to act on.
#[derive(Debug, Clone)]
pub enum Command {
    Help,
    Exit,
    ProcessRun,
    ProcessContinue,
    BreakpointSet(BreakpointTarget),
}

#[derive(Debug, Clone)]
pub enum BreakpointTarget {
    Symbol(String),
    Address(u64),
}

/// `breakpoint set --name SYM` / `breakpoint set --address 0x...`, parsed by
/// `clap` the way `other_examples/.../jesse99-udb` parses its own subcommands
/// rather than hand-rolling flag matching.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_flag = true)]
struct BreakpointSetArgs {
    #[arg(long = "name")]
    name: Option<String>,
    #[arg(long = "address")]
    address: Option<String>,
}

/// Parses one input line. `Ok(None)` means an empty line (re-prompt, per
/// `Prompt::Show`'s `!strlen(Line)` check); `Err` means the line didn't match
/// any known shortcut or group/command pair.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut tokens = line.split_whitespace();
    let first = tokens.next().expect("non-empty line has at least one token");
    let rest: Vec<&str> = tokens.collect();

    let command = match first {
        "?" => Command::Help,
        "e" => Command::Exit,
        "r" => Command::ProcessRun,
        "c" => Command::ProcessContinue,
        "b" => parse_breakpoint_set(&rest)?,
        "mad" => match rest.first().copied() {
            Some("help") => Command::Help,
            Some("exit") => Command::Exit,
            _ => return Err(unknown_command(line)),
        },
        "process" => match rest.first().copied() {
            Some("run") => Command::ProcessRun,
            Some("continue") => Command::ProcessContinue,
            _ => return Err(unknown_command(line)),
        },
        "breakpoint" => match rest.first().copied() {
            Some("set") => parse_breakpoint_set(&rest[1..])?,
            _ => return Err(unknown_command(line)),
        },
        _ => return Err(unknown_command(line)),
    };

    Ok(Some(command))
}

fn parse_breakpoint_set(args: &[&str]) -> Result<Command> {
    let parsed = BreakpointSetArgs::try_parse_from(args)
        .map_err(|e| Error::internal(Kind::Prompt, "malformed breakpoint set arguments").context("detail", e))?;

    if let Some(name) = parsed.name {
        return Ok(Command::BreakpointSet(BreakpointTarget::Symbol(name)));
    }
    if let Some(address) = parsed.address {
        let address = parse_address(&address)?;
        return Ok(Command::BreakpointSet(BreakpointTarget::Address(address)));
    }

    Err(Error::internal(
        Kind::Prompt,
        "breakpoint set needs --name or --address",
    ))
}

fn parse_address(text: &str) -> Result<u64> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"));
    let result = match digits {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>().or_else(|_| u64::from_str_radix(text, 16)),
    };
    result.map_err(|_| Error::internal(Kind::Prompt, "not a valid address").context("value", text))
}

fn unknown_command(line: &str) -> Error {
    Error::internal(Kind::Prompt, "unknown command").context("line", line)
}

/// The command reference shown by `mad help` / `?` (spec §6's grammar table).
pub fn help_text() -> &'static str {
    "\
Debugger commands:
  mad help             -- list commands (shortcut: ?)
  mad exit             -- quit (shortcut: e)
  process run          -- spawn + attach + continue (shortcut: r)
  process continue     -- resume after a stop (shortcut: c)
  breakpoint set --name SYM      -- add a by-symbol breakpoint (shortcut: b --name SYM)
  breakpoint set --address ADDR  -- add a by-address breakpoint (shortcut: b --address ADDR)
"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortcuts_match_group_commands() {
        assert!(matches!(parse_line("r").unwrap(), Some(Command::ProcessRun)));
        assert!(matches!(
            parse_line("process run").unwrap(),
            Some(Command::ProcessRun)
        ));
        assert!(matches!(parse_line("c").unwrap(), Some(Command::ProcessContinue)));
        assert!(matches!(parse_line("?").unwrap(), Some(Command::Help)));
        assert!(matches!(parse_line("e").unwrap(), Some(Command::Exit)));
    }

    #[test]
    fn empty_line_is_none() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn breakpoint_set_by_symbol() {
        let cmd = parse_line("b --name _main").unwrap().unwrap();
        match cmd {
            Command::BreakpointSet(BreakpointTarget::Symbol(name)) => assert_eq!(name, "_main"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn breakpoint_set_by_hex_address() {
        let cmd = parse_line("breakpoint set --address 0x1000").unwrap().unwrap();
        match cmd {
            Command::BreakpointSet(BreakpointTarget::Address(addr)) => assert_eq!(addr, 0x1000),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn breakpoint_set_without_target_is_an_error() {
        assert!(parse_line("b").unwrap_err().kind() == Kind::Prompt);
    }

    #[test]
    fn unknown_token_is_an_error() {
        assert!(parse_line("frobnicate").is_err());
    }
}
