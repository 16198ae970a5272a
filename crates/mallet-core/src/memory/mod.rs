//! Physical memory abstractions.
//!
//! The `memory` module provides:
//! - [`DramLayout`] / [`DramAddr`]: bidirectional translation between physical
//!   addresses and (bank, row, column) triples via XOR mapping functions and
//!   row/column bit masks.
//! - [`PhysPageFinder`]: a large anonymous allocation together with a reverse
//!   index from physical frame number to virtual address, built from
//!   `/proc/self/pagemap`.
//! - [`PhysAddr`] / [`LinuxPageMap`]: a physical-address newtype and a
//!   pagemap-backed virtual-to-physical resolver.

mod dram;
mod page_finder;
mod virt_to_phys;

pub use self::dram::{DramAddr, DramLayout, LayoutError};
pub use self::page_finder::{AcquireError, PhysPageFinder};
pub use self::virt_to_phys::{LinuxPageMap, LinuxPageMapError, PhysAddr};
