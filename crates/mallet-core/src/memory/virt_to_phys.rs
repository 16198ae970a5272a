use std::fmt::{self, Debug, Formatter};
use std::ops::{Add, Sub};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use pagemap2::{PageMapEntry, PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

/// Physical memory address.
///
/// A newtype wrapper around a physical byte address.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// Returns the physical address of the first byte of page `page`.
    pub const fn from_page(page: u64) -> Self {
        PhysAddr(page << PAGE_SHIFT)
    }

    /// Returns the address as a u64.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the page frame number containing this address.
    pub const fn page(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(&self) -> usize {
        self.0 as usize & PAGE_MASK
    }
}

/// Errors that can happen during pagemap operations
#[derive(Debug, Error)]
#[error(transparent)]
pub struct LinuxPageMapError(#[from] PageMapError);

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/self/pagemap`; requires root privileges for real frame
/// numbers.
pub struct LinuxPageMap {
    pagemap: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Opens the pagemap of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, LinuxPageMapError> {
        Ok(LinuxPageMap {
            pagemap: pagemap2::PageMap::new(std::process::id() as u64)?,
        })
    }

    /// Returns the raw pagemap entries for the virtual region
    /// `[start, start + len)`.
    ///
    /// One entry is produced per 4 KiB page. Entry `i` describes the page at
    /// `start + i * 4096`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pagemap read fails.
    pub fn entries(
        &mut self,
        start: u64,
        len: usize,
    ) -> Result<Vec<PageMapEntry>, LinuxPageMapError> {
        let vma = VirtualMemoryArea::from((start, start + len as u64));
        Ok(self.pagemap.pagemap_vma(&vma)?)
    }

    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if the pagemap lookup fails.
    pub fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, LinuxPageMapError> {
        let page_start = virt & !(PAGE_MASK as u64);
        let entries = self.entries(page_start, PAGE_MASK + 1)?;
        assert_eq!(
            entries.len(),
            1,
            "got {} pagemap entries for virtual address 0x{:x}, expected exactly one",
            entries.len(),
            virt
        );
        let pfn = entries[0].pfn()?;
        if pfn == 0 {
            log::warn!(
                "Got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                virt
            );
        }
        Ok(PhysAddr((pfn << PAGE_SHIFT) | (virt & PAGE_MASK as u64)))
    }
}

impl From<PhysAddr> for u64 {
    fn from(addr: PhysAddr) -> u64 {
        addr.0
    }
}

impl fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Add<u64> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: u64) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

impl Sub<u64> for PhysAddr {
    type Output = PhysAddr;

    fn sub(self, rhs: u64) -> Self::Output {
        assert!(self.0 >= rhs);
        PhysAddr(self.0 - rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;

    fn sub(self, rhs: PhysAddr) -> Self::Output {
        assert!(self.0 >= rhs.0);
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::PhysAddr;

    #[test]
    fn test_page_arithmetic() {
        let p = PhysAddr::new(0x12345678);
        assert_eq!(p.page(), 0x12345);
        assert_eq!(p.page_offset(), 0x678);
        assert_eq!(PhysAddr::from_page(p.page()) + p.page_offset() as u64, p);
    }
}
