//! Simulated application address space
//!
//! The syscall gate never trusts a user pointer. Every argument that points
//! into the caller's memory goes through [`UserMemory`], which only knows
//! the regions that were explicitly mapped and reports anything else as
//! [`KernelError::Fault`].

use kernel_api::{KernelError, KernelResult};
use log::trace;

/// Region access rights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
struct Region {
    base: u64,
    data: Vec<u8>,
    access: Access,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end())
    }
}

/// Mapped memory of one application
#[derive(Debug, Clone, Default)]
pub struct UserMemory {
    regions: Vec<Region>,
}

impl UserMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` zeroed bytes at `base`
    ///
    /// Fails with [`KernelError::InvalidArgs`] for an empty region, a null
    /// base or a range that wraps, and with [`KernelError::AlreadyExists`]
    /// if it overlaps an existing mapping.
    pub fn map(&mut self, base: u64, len: usize, access: Access) -> KernelResult<()> {
        let end = base
            .checked_add(len as u64)
            .ok_or(KernelError::InvalidArgs)?;
        if len == 0 || base == 0 {
            return Err(KernelError::InvalidArgs);
        }
        if self
            .regions
            .iter()
            .any(|r| base < r.end() && r.base < end)
        {
            return Err(KernelError::AlreadyExists);
        }
        trace!("mapped {:#x}..{:#x} {:?}", base, end, access);
        self.regions.push(Region {
            base,
            data: vec![0; len],
            access,
        });
        Ok(())
    }

    /// Removes the mapping that starts at `base`
    pub fn unmap(&mut self, base: u64) -> KernelResult<()> {
        let index = self
            .regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(KernelError::NotFound)?;
        self.regions.remove(index);
        Ok(())
    }

    fn region(&self, addr: u64, len: usize) -> KernelResult<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(KernelError::Fault)
    }

    fn region_mut(&mut self, addr: u64, len: usize) -> KernelResult<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.contains(addr, len))
            .ok_or(KernelError::Fault)
    }

    /// Checks that `len` bytes at `addr` are mapped
    pub fn check_readable(&self, addr: u64, len: usize) -> KernelResult<()> {
        self.region(addr, len).map(|_| ())
    }

    /// Checks that `len` bytes at `addr` can be written by the kernel
    pub fn check_writable(&self, addr: u64, len: usize) -> KernelResult<()> {
        match self.region(addr, len)?.access {
            Access::ReadWrite => Ok(()),
            Access::ReadOnly => Err(KernelError::Fault),
        }
    }

    /// Fills `dst` from user memory at `addr`
    pub fn copy_from_user(&self, dst: &mut [u8], addr: u64) -> KernelResult<()> {
        let region = self.region(addr, dst.len())?;
        let start = (addr - region.base) as usize;
        dst.copy_from_slice(&region.data[start..start + dst.len()]);
        Ok(())
    }

    /// Writes `src` to user memory at `addr`
    ///
    /// Read-only regions fault like unmapped ones.
    pub fn copy_to_user(&mut self, addr: u64, src: &[u8]) -> KernelResult<()> {
        let region = self.region_mut(addr, src.len())?;
        if region.access == Access::ReadOnly {
            return Err(KernelError::Fault);
        }
        let start = (addr - region.base) as usize;
        region.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Reads a NUL-terminated string of fewer than `max` bytes
    ///
    /// A string that does not terminate within `max` bytes fails with
    /// [`KernelError::InvalidArgs`], as does one that is not UTF-8.
    pub fn strncpy_from_user(&self, addr: u64, max: usize) -> KernelResult<String> {
        let region = self.region(addr, 1)?;
        let start = (addr - region.base) as usize;
        let available = &region.data[start..];
        let window = &available[..available.len().min(max)];
        match window.iter().position(|&b| b == 0) {
            Some(len) => String::from_utf8(window[..len].to_vec())
                .map_err(|_| KernelError::InvalidArgs),
            // ran off the end of the mapping before finding the terminator
            None if window.len() < max => Err(KernelError::Fault),
            None => Err(KernelError::InvalidArgs),
        }
    }

    pub fn read_u32(&self, addr: u64) -> KernelResult<u32> {
        let mut raw = [0u8; 4];
        self.copy_from_user(&mut raw, addr)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Kernel-side write that ignores access rights, for loading test data
    pub fn poke(&mut self, addr: u64, src: &[u8]) -> KernelResult<()> {
        let region = self.region_mut(addr, src.len())?;
        let start = (addr - region.base) as usize;
        region.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Kernel-side read of `len` bytes
    pub fn peek(&self, addr: u64, len: usize) -> KernelResult<Vec<u8>> {
        let mut out = vec![0; len];
        self.copy_from_user(&mut out, addr)?;
        Ok(out)
    }
}
