use crate::utils::page_size;
use anyhow::{Result, anyhow};
use memmap2::{MmapMut, MmapOptions};
use nix::libc::{PROT_NONE, mprotect};

/// Anonymous mapping used as the stack of a `clone`d child.
///
/// The lowest page of the mapping is `PROT_NONE`: the stack grows down,
/// so an overflow faults instead of running into unrelated memory.
pub struct CloneStack {
    mmap: MmapMut,
    guard: usize,
}

impl CloneStack {
    /// Maps `stack_size` usable bytes plus one guard page.
    pub fn new(stack_size: usize) -> Result<Self> {
        let page_size = page_size()?;

        if stack_size == 0 || stack_size % page_size != 0 {
            return Err(anyhow!(
                "stack_size must be a non-zero multiple of the system page size ({} bytes)",
                page_size
            ));
        }

        let total_size = stack_size
            .checked_add(page_size)
            .ok_or_else(|| anyhow!("stack_size + guard page overflows usize"))?;

        let mut mmap = MmapOptions::new().len(total_size).map_anon()?;

        // SAFETY:
        // - The mapping starts page-aligned and is at least one page long.
        // - `mmap` owns the memory for as long as `Self` lives.
        let ret = unsafe { mprotect(mmap.as_mut_ptr().cast(), page_size, PROT_NONE) };
        if ret != 0 {
            return Err(anyhow!(
                "Failed to set guard page protection: {}",
                std::io::Error::last_os_error()
            ));
        }

        Ok(Self {
            mmap,
            guard: page_size,
        })
    }

    /// Usable stack memory, excluding the guard page.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[self.guard..]
    }
}
