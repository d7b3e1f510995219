//! Process control: spawn, trace, attach, wait/continue/step, and dynamic
//! image discovery.
//!
//! Grounded on the C++ `MachProcess` (spawn + `task_for_pid` + dyld session)
//! and on `task_threads`/`PT_*` for thread enumeration and tracing, with one
//! deliberate substitution: image enumeration reads `dyld_all_image_infos`
//! directly out of the target's memory instead of going through the
//! Objective-C block-based `dyld_process_info_create`/`_for_each_image`
//! session API, which has no safe, block-free binding in the crates this
//! debugger otherwise depends on.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use scroll::{Pread, LE};

use crate::breakpoint::DebugTarget;
use crate::error::{Error, Kind, Result};
use crate::image::Image;
use crate::mach::{self, check, mach_port_name_t};
use crate::macho;
use crate::memory::Memory;
use crate::stream::PagedStream;
use crate::thread::{Thread, ThreadState};

/// Outcome of resuming the target and waiting for its next stop.
///
/// A failure of the control primitive itself (the `fork`/`ptrace`/`wait`
/// call, not the traced process) is reported as `Err`, not as a variant here
/// — Rust's `Result` already is the "did the primitive itself fail" channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The process was resumed; this is not a final state. `cont()`/`step()`
    /// always wait synchronously before returning, so this variant is never
    /// constructed by them — it exists for callers that want to represent
    /// the in-between state explicitly (e.g. a future async driver).
    Continued,
    /// Delivered a signal that left the process stopped.
    Stopped(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Exited normally.
    Exited(i32),
}

/// One loaded Mach-O image plus the load address it was indexed under.
struct LoadedImage {
    image: Image,
}

/// A traced child process: its task port, memory subsystem, and the set of
/// images mapped into it.
pub struct Process {
    executable: PathBuf,
    pid: libc::pid_t,
    task: mach_port_name_t,
    memory: Memory,
    images: Vec<LoadedImage>,
    images_by_name: HashMap<String, usize>,
    images_by_type: HashMap<u32, Vec<usize>>,
}

impl Process {
    /// Forks, requests tracing in the child, execs `executable`, and waits
    /// for the child to stop at entry. On success the parent has already
    /// obtained the task port and built the initial image set.
    pub fn spawn(executable: &Path) -> Result<Self> {
        let path = CString::new(executable.as_os_str().as_bytes())
            .map_err(|_| Error::internal(Kind::Arguments, "executable path contains a NUL byte"))?;

        // SAFETY: classic debugger fork: the child only calls async-signal-safe
        // functions (`ptrace`, `execv`, `_exit`) before exec replaces its image.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(Error::os(Kind::Process).context("call", "fork")),
            0 => {
                // SAFETY: single-threaded child between fork and exec.
                unsafe {
                    if libc::ptrace(libc::PT_TRACE_ME, 0, std::ptr::null_mut(), 0) != 0 {
                        libc::_exit(127);
                    }
                    let argv: [*const libc::c_char; 2] = [path.as_ptr(), std::ptr::null()];
                    libc::execv(path.as_ptr(), argv.as_ptr());
                    libc::_exit(127);
                }
            }
            child_pid => {
                match wait_for(child_pid)? {
                    ProcessStatus::Stopped(_) => {}
                    other => {
                        return Err(Error::internal(
                            Kind::Process,
                            format!("child did not stop at entry: {other:?}"),
                        )
                        .context("pid", child_pid))
                    }
                }

                let (task, memory) = attach_task(child_pid)?;
                let mut process = Self {
                    executable: executable.to_path_buf(),
                    pid: child_pid,
                    task,
                    memory,
                    images: Vec::new(),
                    images_by_name: HashMap::new(),
                    images_by_type: HashMap::new(),
                };
                process.enumerate_images()?;
                Ok(process)
            }
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn task(&self) -> mach_port_name_t {
        self.task
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Enumerates the threads currently in the task.
    pub fn threads(&self) -> Result<Vec<Thread>> {
        let mut list: mach2::mach_types::thread_act_array_t = std::ptr::null_mut();
        let mut count: mach2::message::mach_msg_type_number_t = 0;

        // SAFETY: syscall; `list`/`count` are only read after success.
        let kr = unsafe { mach::task_threads(self.task, &mut list, &mut count) };
        check(kr, Kind::Kernel)?;

        // SAFETY: the kernel allocated `count` valid thread ports at `list`.
        let threads = unsafe { std::slice::from_raw_parts(list, count as usize) }
            .iter()
            .map(|&id| Thread::new(id))
            .collect();

        Ok(threads)
    }

    /// The thread register operations and breakpoint dispatch act on.
    /// Multi-threaded single-step arbitration is out of scope (spec §1); the
    /// controller always operates on the first thread in the task's thread
    /// list, matching `Process.GetTask().GetThreads().front()` in the
    /// original `Breakpoints::CheckBreakpoints`.
    pub fn stopped_thread(&self) -> Result<Thread> {
        self.threads()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal(Kind::Process, "task has no threads").context("pid", self.pid))
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.iter().map(|loaded| &loaded.image)
    }

    /// Images in the order symbol-seed resolution should search them (spec
    /// §9, open question 1): the executable first, then shared libraries in
    /// load order, then the dynamic linker last.
    pub fn images_in_resolution_order(&self) -> Vec<&Image> {
        let executables = self.images_by_file_type(macho::MH_EXECUTE);
        let dylinkers: std::collections::HashSet<usize> = self
            .images_by_type
            .get(&macho::MH_DYLINKER)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        let middle = self
            .images
            .iter()
            .enumerate()
            .filter(|(i, loaded)| {
                loaded.image.file_type() != macho::MH_EXECUTE && !dylinkers.contains(i)
            })
            .map(|(_, loaded)| &loaded.image);
        let dynamic_linkers = self.images_by_file_type(macho::MH_DYLINKER);

        executables.chain(middle).chain(dynamic_linkers).collect()
    }

    /// Resolves `name` against images in the order defined by
    /// [`Process::images_in_resolution_order`]; the first image whose symbol
    /// table reports the name wins (spec §4.7 "symbol name" resolution).
    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.images_in_resolution_order()
            .into_iter()
            .find_map(|image| image.symbol_by_name(name))
            .map(|symbol| symbol.value)
    }

    pub fn image_by_name(&self, name: &str) -> Option<&Image> {
        self.images_by_name
            .get(name)
            .map(|&i| &self.images[i].image)
    }

    pub fn images_by_file_type(&self, file_type: u32) -> impl Iterator<Item = &Image> {
        self.images_by_type
            .get(&file_type)
            .into_iter()
            .flatten()
            .map(|&i| &self.images[i].image)
    }

    /// Rebuilds the image set from the target's `dyld_all_image_infos`.
    /// Called once at attach time and again after the dyld sync breakpoint
    /// fires, once all initial shared libraries are mapped.
    pub fn enumerate_images(&mut self) -> Result<()> {
        let dyld_info: mach::TaskDyldInfo = crate::memory::task_info(self.task)?;
        let all_images_addr = dyld_info.all_image_info_addr;
        if all_images_addr == 0 {
            return Ok(());
        }

        // struct dyld_all_image_infos: version, info_array_count, info_array_addr, ...
        let header = self.memory.read(all_images_addr, 16)?;
        if header.len() < 16 {
            return Err(Error::internal(
                Kind::Process,
                "short read of dyld_all_image_infos",
            ));
        }
        let info_array_count: u32 = header.pread_with(4, LE).map_err(|_| {
            Error::internal(Kind::Process, "malformed dyld_all_image_infos")
        })?;
        let info_array_addr: u64 = header.pread_with(8, LE).map_err(|_| {
            Error::internal(Kind::Process, "malformed dyld_all_image_infos")
        })?;

        // struct dyld_image_info: image_load_address, image_file_path, image_file_mod_date
        const ENTRY_SIZE: usize = 24;
        let entries = self
            .memory
            .read(info_array_addr, info_array_count as usize * ENTRY_SIZE)?;

        self.images.clear();
        self.images_by_name.clear();
        self.images_by_type.clear();

        let mut seen = std::collections::BTreeSet::new();

        for i in 0..(entries.len() / ENTRY_SIZE) {
            let off = i * ENTRY_SIZE;
            let load_address: u64 = match entries.pread_with(off, LE) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let file_path_addr: u64 = match entries.pread_with(off + 8, LE) {
                Ok(v) => v,
                Err(_) => continue,
            };

            if load_address == 0 || !seen.insert(load_address) {
                continue;
            }

            let name = self
                .read_remote_cstring(file_path_addr)
                .unwrap_or_default();

            let mut source = PagedStream::new(self.memory, load_address);
            match Image::parse(&mut source, load_address) {
                Ok(image) => {
                    let index = self.images.len();
                    if !name.is_empty() {
                        self.images_by_name.insert(name, index);
                    }
                    self.images_by_type
                        .entry(image.file_type())
                        .or_default()
                        .push(index);
                    self.images.push(LoadedImage { image });
                }
                Err(e) => {
                    log::warn!(
                        "skipping image at {load_address:#x} ({name}): {e}",
                        name = if name.is_empty() { "<unknown>" } else { &name }
                    );
                }
            }
        }

        Ok(())
    }

    fn read_remote_cstring(&self, addr: u64) -> Result<String> {
        if addr == 0 {
            return Ok(String::new());
        }
        const CHUNK: usize = 64;
        const MAX_LEN: usize = 4096;
        let mut out = Vec::new();
        let mut cursor = addr;

        loop {
            let chunk = self.memory.read(cursor, CHUNK)?;
            if chunk.is_empty() {
                break;
            }
            match chunk.iter().position(|&b| b == 0) {
                Some(nul) => {
                    out.extend_from_slice(&chunk[..nul]);
                    break;
                }
                None => {
                    out.extend_from_slice(&chunk);
                    cursor += chunk.len() as u64;
                    if out.len() >= MAX_LEN {
                        break;
                    }
                }
            }
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Resumes the process, optionally single-stepping one instruction
    /// instead of running freely, and waits for the next stop.
    fn resume(&self, single_step: bool) -> Result<ProcessStatus> {
        let request = if single_step {
            libc::PT_STEP
        } else {
            libc::PT_CONTINUE
        };

        // SAFETY: syscall against a pid this process owns via `PT_TRACE_ME`.
        let result = unsafe { libc::ptrace(request, self.pid, 1 as *mut libc::c_char, 0) };
        if result != 0 {
            return Err(Error::os(Kind::Process)
                .context("pid", self.pid)
                .context("call", if single_step { "PT_STEP" } else { "PT_CONTINUE" }));
        }

        wait_for(self.pid)
    }

    /// Resumes the process and waits for its next stop.
    pub fn cont(&self) -> Result<ProcessStatus> {
        self.resume(false)
    }

    /// Single-steps one instruction and waits for the resulting stop.
    pub fn step(&self) -> Result<ProcessStatus> {
        self.resume(true)
    }

    /// Releases trace privileges, invalidates the task port, and clears the
    /// image list. Callers must restore breakpoints before calling this if
    /// the process is still alive.
    pub fn detach(mut self) -> Result<()> {
        // SAFETY: syscall; detaching a pid this process is tracing.
        let result = unsafe { libc::ptrace(libc::PT_DETACH, self.pid, 1 as *mut libc::c_char, 0) };
        if result != 0 {
            return Err(Error::os(Kind::Process).context("pid", self.pid).context("call", "PT_DETACH"));
        }
        self.task = 0;
        self.images.clear();
        self.images_by_name.clear();
        self.images_by_type.clear();
        Ok(())
    }
}

impl DebugTarget for Process {
    fn resolve_symbol(&self, name: &str) -> Option<u64> {
        Process::resolve_symbol(self, name)
    }

    fn read_byte(&self, address: u64) -> Result<u8> {
        let bytes = self.memory.read(address, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| Error::internal(Kind::Memory, "short read").context("address", format!("{address:#x}")))
    }

    fn write_byte(&self, address: u64, byte: u8) -> Result<()> {
        let written = self.memory.write(address, &[byte])?;
        if written != 1 {
            return Err(Error::internal(Kind::Memory, "short write")
                .context("address", format!("{address:#x}")));
        }
        Ok(())
    }

    fn stopped_thread_state(&self) -> Result<ThreadState> {
        self.stopped_thread()?.state()
    }

    fn set_stopped_thread_state(&self, state: &ThreadState) -> Result<()> {
        self.stopped_thread()?.set_state(state)
    }

    fn single_step(&self) -> Result<()> {
        match self.step()? {
            ProcessStatus::Stopped(_) => Ok(()),
            other => Err(Error::internal(
                Kind::Process,
                format!("single-step did not re-stop the process: {other:?}"),
            )),
        }
    }
}

/// Obtains the task port for `pid` and initializes the memory subsystem
/// through it.
fn attach_task(pid: libc::pid_t) -> Result<(mach_port_name_t, Memory)> {
    let mut task: mach_port_name_t = 0;
    // SAFETY: syscall; `task` is written only on success.
    let kr = unsafe { mach2::traps::task_for_pid(mach2::traps::mach_task_self(), pid, &mut task) };
    check(kr, Kind::Kernel).map_err(|e| e.context("pid", pid))?;
    let memory = Memory::new(task)?;
    Ok((task, memory))
}

/// Waits for `pid`'s next status change, retrying transparently on `EINTR`.
fn wait_for(pid: libc::pid_t) -> Result<ProcessStatus> {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ProcessStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ProcessStatus::Signaled(signal as i32))
            }
            Ok(WaitStatus::Stopped(_, signal)) => return Ok(ProcessStatus::Stopped(signal as i32)),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                return Err(Error::os(Kind::Process)
                    .context("pid", pid)
                    .context("errno", errno as i32))
            }
        }
    }
}
