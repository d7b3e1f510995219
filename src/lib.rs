//! A minimal Mach-kernel process debugger for macOS/x86-64.
//!
//! Modules correspond to the component design: [`error`] (uniform failure
//! reporting), [`mach`]/[`memory`]/[`stream`] (remote-memory primitives and
//! the paged stream built over them), [`macho`]/[`image`] (Mach-O parsing
//! and the per-image symbol index), [`thread`]/[`process`] (register access
//! and process control), [`breakpoint`] (the Seed/VPoint/APoint graph), and
//! [`session`]/[`prompt`] (the REPL driver and its command grammar).

#![cfg(target_os = "macos")]

pub mod breakpoint;
pub mod error;
pub mod image;
pub mod mach;
pub mod macho;
pub mod memory;
pub mod prompt;
pub mod process;
pub mod session;
pub mod stream;
pub mod thread;
