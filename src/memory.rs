//! Remote-memory primitives: reading and writing another task's address
//! space, discovering the memory regions that back it, and temporarily
//! raising page protection to make a write possible.
//!
//! Grounded on the C++ `MachMemory`/`MachMemoryRegion` pair: region lookup
//! via `mach_vm_region_recurse`, a write that first raises protection on
//! every region touched and only then issues per-region writes, and a
//! protection guard whose `Drop` restores the original protection
//! unconditionally, even on a partial failure mid-write.

use mach2::kern_return::KERN_SUCCESS;
use mach2::vm_prot::{vm_prot_t, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_submap_info_64, vm_region_submap_info_data_64_t};

use crate::error::{Error, Kind, Result};
use crate::mach::{self, check, mach_port_name_t};

/// A single memory region as reported by the kernel's region iterator.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub address: u64,
    pub size: u64,
    pub protection: vm_prot_t,
    pub max_protection: vm_prot_t,
    valid: bool,
}

impl Region {
    fn invalid() -> Self {
        Self {
            address: 0,
            size: 0,
            protection: 0,
            max_protection: 0,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn following_address(&self) -> u64 {
        self.address + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        self.valid && address >= self.address && address < self.following_address()
    }
}

/// A handle to another task's virtual memory. Cheap to copy: it is just the
/// task port name plus a cached page size, both of which outlive the handle
/// for as long as the task itself does.
#[derive(Debug, Clone, Copy)]
pub struct Memory {
    task: mach_port_name_t,
    page_size: u64,
}

impl Memory {
    /// Initializes the subsystem for an already-obtained task port, fetching
    /// the host page size through it.
    pub fn new(task: mach_port_name_t) -> Result<Self> {
        let info: mach::TaskVmInfo = task_info(task)?;
        Ok(Self {
            task,
            page_size: info.page_size.max(1) as u64,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the region covering `requested`, or an invalid sentinel if the
    /// kernel's next region starts past `requested` (a gap in the address space).
    pub fn region_at(&self, requested: u64) -> Result<Region> {
        let mut address = requested;
        let mut size: u64 = 0;
        let mut depth: u32 = 0;
        let mut info = std::mem::MaybeUninit::<vm_region_submap_info_64>::uninit();

        // mach/vm_region.h
        const INFO_COUNT: u32 = (std::mem::size_of::<vm_region_submap_info_data_64_t>()
            / std::mem::size_of::<mach2::natural_t>()) as u32;
        let mut info_count = INFO_COUNT;

        // SAFETY: syscall, `info` is sized per `info_count`.
        let kr = unsafe {
            mach2::vm::mach_vm_region_recurse(
                self.task,
                &mut address,
                &mut size,
                &mut depth,
                info.as_mut_ptr().cast(),
                &mut info_count,
            )
        };

        if kr != KERN_SUCCESS {
            return Ok(Region::invalid());
        }
        if requested < address || requested >= address + size {
            // The kernel found the next mapped region, not one covering
            // `requested`: there is a gap at the address we asked about.
            return Ok(Region::invalid());
        }

        // SAFETY: `kr == KERN_SUCCESS` guarantees the kernel filled `info`.
        let info = unsafe { info.assume_init() };
        Ok(Region {
            address,
            size,
            protection: info.protection,
            max_protection: info.max_protection,
            valid: true,
        })
    }

    /// Enumerates the regions covering `[address, address + size)`, in order.
    /// If the range is not fully mapped the list ends with an invalid sentinel.
    pub fn regions_covering(&self, address: u64, size: u64) -> Result<Vec<Region>> {
        let mut regions = Vec::new();
        let mut addr = address;
        let mut remaining = size;

        while remaining > 0 {
            let region = self.region_at(addr)?;
            if !region.is_valid() {
                regions.push(region);
                break;
            }
            let covered = (region.following_address() - addr).min(remaining);
            addr += covered;
            remaining -= covered;
            regions.push(region);
        }

        Ok(regions)
    }

    /// Reads up to `size` bytes at `address`. A short read (fewer bytes than
    /// requested, including zero) is reported by the returned vector's length,
    /// not an error.
    pub fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut out_size: u64 = 0;

        // SAFETY: syscall, `buf` is `size` bytes and outlives the call.
        let kr = unsafe {
            mach2::vm::mach_vm_read_overwrite(
                self.task,
                address,
                size as u64,
                buf.as_mut_ptr() as u64,
                &mut out_size,
            )
        };
        check(kr, Kind::Kernel).map_err(|e| {
            e.context("address", format!("{address:#x}"))
                .context("size", size)
        })?;
        buf.truncate(out_size as usize);
        Ok(buf)
    }

    /// Writes `data` at `address`, following the algorithm in the remote-memory
    /// primitives design: enumerate the covering regions, refuse on a gap,
    /// raise every region to read+write, write region by region, and restore
    /// every region's original protection on the way out regardless of outcome.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let regions = self.regions_covering(address, data.len() as u64)?;
        if regions.last().is_none_or(|r| !r.is_valid()) {
            return Err(Error::internal(
                Kind::Memory,
                "write range is not contiguously mapped",
            )
            .context("address", format!("{address:#x}"))
            .context("size", data.len()));
        }

        // Raise protection on every region before writing anything. If any
        // region refuses, the guards collected so far restore themselves on
        // drop and zero bytes are reported written.
        let mut guards = Vec::with_capacity(regions.len());
        for region in &regions {
            guards.push(ProtectionGuard::raise(self.task, region)?);
        }

        let mut written = 0usize;
        let mut addr = address;
        let mut remaining = data;
        for region in &regions {
            if remaining.is_empty() {
                break;
            }
            let covered = ((region.following_address() - addr) as usize).min(remaining.len());
            if covered == 0 {
                continue;
            }
            let chunk = &remaining[..covered];

            // SAFETY: syscall, `chunk` stays alive for the call's duration.
            let kr = unsafe {
                mach2::vm::mach_vm_write(
                    self.task,
                    addr,
                    chunk.as_ptr() as mach2::vm_types::vm_offset_t,
                    chunk.len() as u32,
                )
            };
            if kr != KERN_SUCCESS {
                // `guards` still restores protection on every region touched.
                return Ok(written);
            }

            written += covered;
            addr += covered as u64;
            remaining = &remaining[covered..];
        }

        Ok(written)
    }
}

/// Raises a region's protection to read+write for the guard's lifetime,
/// restoring the original protection unconditionally on drop.
struct ProtectionGuard {
    task: mach_port_name_t,
    address: u64,
    size: u64,
    original_protection: vm_prot_t,
    raised: bool,
}

impl ProtectionGuard {
    fn raise(task: mach_port_name_t, region: &Region) -> Result<Self> {
        let mut guard = Self {
            task,
            address: region.address,
            size: region.size,
            original_protection: region.protection,
            raised: false,
        };

        if region.protection & (VM_PROT_READ | VM_PROT_WRITE) != (VM_PROT_READ | VM_PROT_WRITE) {
            guard.set_protection(VM_PROT_READ | VM_PROT_WRITE)?;
            guard.raised = true;
        }

        Ok(guard)
    }

    fn set_protection(&self, protection: vm_prot_t) -> Result<()> {
        // SAFETY: syscall against a region we already know the bounds of.
        let kr = unsafe {
            mach2::vm::mach_vm_protect(self.task, self.address, self.size, 0, protection)
        };
        // Spec §4.2: a kernel refusal of the protection change is a `kernel`
        // error, not `memory` — the gap/non-contiguous case is tagged
        // `Kind::Memory` by the caller in `Memory::write`, not here.
        check(kr, Kind::Kernel)
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        if self.raised {
            // Best-effort: there's nothing more to do if the kernel now
            // refuses the restore, and this runs in a context that can't
            // propagate a `Result`.
            let _ = self.set_protection(self.original_protection);
        }
    }
}

pub(crate) fn task_info<T: mach::TaskInfo + Default>(task: mach_port_name_t) -> Result<T> {
    let mut info = T::default();
    let mut count = (std::mem::size_of::<T>() / std::mem::size_of::<mach2::natural_t>())
        as mach2::message::mach_msg_type_number_t;

    // SAFETY: syscall, `info` is sized for `T::FLAVOR` by construction.
    let kr = unsafe {
        mach2::task_info::task_info(
            task,
            T::FLAVOR,
            (&mut info as *mut T).cast(),
            &mut count,
        )
    };
    check(kr, Kind::Kernel)?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_sentinel_is_invalid() {
        let sentinel = Region::invalid();
        assert!(!sentinel.is_valid());
        assert!(!sentinel.contains(0x1000));
    }

    #[test]
    fn region_contains_is_half_open() {
        let region = Region {
            address: 0x1000,
            size: 0x1000,
            protection: VM_PROT_READ,
            max_protection: VM_PROT_READ | VM_PROT_WRITE,
            valid: true,
        };
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1fff));
        assert!(!region.contains(0x2000));
    }
}
