//! Uniform failure reporting across OS, kernel, and internal conditions.
//!
//! An [`Error`] is a tagged value: a [`Kind`] naming which subsystem raised it,
//! a [`Flavor`] naming where the underlying code came from, and a set of
//! context key/value pairs the call site attached on the way up. Nothing here
//! ever panics or aborts the session loop; every fallible operation in this
//! crate returns a `Result<T>` and lets the caller decide.

use std::fmt;

use crate::mach::KernelError;

pub type Result<T> = std::result::Result<T, Error>;

/// Which subsystem raised the error. See the error handling design: kinds are
/// not exhaustive and mostly orthogonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Missing or malformed command-line/session arguments.
    Arguments,
    /// Unknown or malformed prompt command.
    Prompt,
    /// Spawn/trace/attach/detach/wait failure.
    Process,
    /// Breakpoint enable/disable/resolve failure.
    Breakpoint,
    /// Mach-O header/load-command/symbol-table malformed.
    Parser,
    /// Non-contiguous write range, region not found, short read/write.
    Memory,
    /// Mach kernel call returned a non-success `kern_return_t`.
    Kernel,
    /// POSIX errno from fork/wait/ptrace/sysctl.
    Os,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Arguments => "arguments",
            Self::Prompt => "prompt",
            Self::Process => "process",
            Self::Breakpoint => "breakpoint",
            Self::Parser => "parser",
            Self::Memory => "memory",
            Self::Kernel => "kernel",
            Self::Os => "os",
        };
        f.write_str(s)
    }
}

/// Where the numeric code and text came from.
#[derive(Debug)]
pub enum Flavor {
    /// A condition internal to this crate; the text is authored at the call site.
    Internal(String),
    /// A `kern_return_t` from a Mach trap.
    Kernel(KernelError),
    /// A POSIX `errno`.
    Os(i32),
}

impl Flavor {
    fn code(&self) -> i32 {
        match self {
            Self::Internal(_) => 0,
            Self::Kernel(e) => *e as i32,
            Self::Os(errno) => *errno,
        }
    }

    fn text(&self) -> String {
        match self {
            Self::Internal(text) => text.clone(),
            Self::Kernel(e) => e.to_string(),
            Self::Os(errno) => std::io::Error::from_raw_os_error(*errno).to_string(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::Kernel(_) => "kernel",
            Self::Os(_) => "os",
        }
    }
}

/// A single failure, uniform across OS, kernel, and internal origins.
#[derive(Debug)]
pub struct Error {
    kind: Kind,
    flavor: Flavor,
    context: Vec<(&'static str, String)>,
}

impl Error {
    pub fn new(kind: Kind, flavor: Flavor) -> Self {
        Self {
            kind,
            flavor,
            context: Vec::new(),
        }
    }

    /// An internal condition with an author-supplied message.
    pub fn internal(kind: Kind, text: impl Into<String>) -> Self {
        Self::new(kind, Flavor::Internal(text.into()))
    }

    /// A failed Mach trap.
    pub fn kernel(kind: Kind, kr: mach2::kern_return::kern_return_t) -> Self {
        Self::new(kind, Flavor::Kernel(KernelError::from(kr)))
    }

    /// The current `errno`.
    pub fn os(kind: Kind) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        Self::new(kind, Flavor::Os(errno))
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Attaches a key/value pair that is printed alongside the error. Chainable.
    pub fn context(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.context.push((key, value.to_string()));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: [{}:{}] {}",
            self.kind,
            self.flavor.name(),
            self.flavor.code(),
            self.flavor.text()
        )?;
        for (key, value) in &self.context {
            write!(f, " ({key}={value})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
