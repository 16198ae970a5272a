use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::ptr::null_mut;

use log::{debug, info};
use thiserror::Error;

use crate::config::{AllocPageSize, Config};
use crate::memory::{LinuxPageMap, LinuxPageMapError, PhysAddr};
use crate::util::PAGE_SHIFT;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Errors raised while acquiring physical memory.
///
/// All of these are environment errors and fatal for the session.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// mmap of the hammering region failed
    #[error("failed to map {size} bytes of {page_size} pages: {source}")]
    Mmap {
        /// Requested region size in bytes
        size: usize,
        /// Configured allocation page size
        page_size: AllocPageSize,
        /// OS error
        source: std::io::Error,
    },
    /// Reading the process pagemap failed
    #[error(transparent)]
    PageMap(#[from] LinuxPageMapError),
    /// Reading /proc/meminfo failed
    #[error("could not read {MEMINFO_PATH}: {0}")]
    Meminfo(#[from] std::io::Error),
    /// A required /proc/meminfo field was missing
    #[error("could not retrieve {field} from {MEMINFO_PATH}")]
    MeminfoField {
        /// Name of the missing field
        field: &'static str,
    },
    /// The system hugepage size does not match the configured one
    #[error("hugepage size of system ({system_kb} KiB) and configuration ({configured}) do not match")]
    HugepageSizeMismatch {
        /// Hugepagesize reported by the kernel, in KiB
        system_kb: u64,
        /// Configured allocation page size
        configured: AllocPageSize,
    },
    /// Fewer free hugepages than the configuration requests
    #[error("found {free} free hugepages, configuration requested {requested}")]
    NotEnoughHugepages {
        /// Free hugepages reported by the kernel
        free: u64,
        /// Hugepages requested by the configuration
        requested: u64,
    },
}

/// Owner of the hammering memory pool and its physical-frame index.
///
/// Maps a large anonymous region (4 KiB, 2 MiB or 1 GiB pages), forces
/// residency, and builds an ordered map from physical frame number to the
/// page offset inside the region. The map is never mutated after
/// construction and answers `phys -> virt` lookups for the whole session.
///
/// Frame numbers are stored as `u32`, which covers up to 16 TiB of physical
/// memory; larger frames are rejected with an assertion.
pub struct PhysPageFinder {
    mem: *mut u8,
    len: usize,
    // PFN -> page offset relative to `mem`
    pagemap: BTreeMap<u32, u32>,
}

impl PhysPageFinder {
    /// Allocates the memory pool described by `cfg` and indexes its frames.
    ///
    /// # Errors
    ///
    /// Any failure to map memory, read `/proc/meminfo` for hugepage
    /// accounting, or read the pagemap is fatal and reported as
    /// [`AcquireError`].
    pub fn new(cfg: &Config) -> Result<Self, AcquireError> {
        let (len, flags) = match cfg.alloc_page_size {
            AllocPageSize::FourKb => {
                info!("Using default allocation...");
                let len = cfg.memory_size as usize;
                info!("Allocate {} bytes ({} GiB)...", len, len >> 30);
                (
                    len,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE | libc::MAP_NORESERVE,
                )
            }
            page_size @ (AllocPageSize::TwoMb | AllocPageSize::OneGb) => {
                let count = hugepage_count(cfg)?;
                info!("Using {} {} hugepages for allocation...", count, page_size);
                let huge_flag = match page_size {
                    AllocPageSize::TwoMb => libc::MAP_HUGE_2MB,
                    _ => libc::MAP_HUGE_1GB,
                };
                (
                    page_size.bytes() * count as usize,
                    libc::MAP_PRIVATE
                        | libc::MAP_ANONYMOUS
                        | libc::MAP_POPULATE
                        | libc::MAP_HUGETLB
                        | huge_flag,
                )
            }
        };

        let mem = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(AcquireError::Mmap {
                size: len,
                page_size: cfg.alloc_page_size,
                source: std::io::Error::last_os_error(),
            });
        }
        let mem = mem as *mut u8;

        info!("Building page map...");
        let mut resolver = LinuxPageMap::new()?;
        let entries = resolver.entries(mem as u64, len)?;
        let mut pagemap = BTreeMap::new();
        for (page_offset, entry) in entries.iter().enumerate() {
            if !entry.present() {
                // no valid frame number in this case
                continue;
            }
            let frame = entry.pfn().map_err(LinuxPageMapError::from)?;
            assert!(
                frame <= u32::MAX as u64,
                "PFN 0x{:x} exceeds the 16 TiB limit of the page map",
                frame
            );
            assert!(page_offset <= u32::MAX as usize);
            pagemap.insert(frame as u32, page_offset as u32);
        }
        debug!("Page map holds {} frames", pagemap.len());

        Ok(Self { mem, len, pagemap })
    }

    /// Looks up the virtual address that owns the physical address.
    ///
    /// Returns `None` when the containing frame is not part of the pool. The
    /// in-page offset is preserved: the returned pointer and `phys` agree in
    /// their low 12 bits.
    pub fn find_page(&self, phys: PhysAddr) -> Option<*mut u8> {
        let frame = u32::try_from(phys.page()).ok()?;
        let page_offset = *self.pagemap.get(&frame)?;
        Some(unsafe {
            self.mem
                .byte_add((page_offset as usize) << PAGE_SHIFT)
                .byte_add(phys.page_offset())
        })
    }

    /// Returns true when the frame with number `page` belongs to the pool.
    pub fn contains_page(&self, page: u64) -> bool {
        u32::try_from(page).is_ok_and(|p| self.pagemap.contains_key(&p))
    }

    /// Lowest owned page frame number.
    pub fn first_page(&self) -> Option<u64> {
        self.pagemap.first_key_value().map(|(&p, _)| p as u64)
    }

    /// Highest owned page frame number.
    pub fn last_page(&self) -> Option<u64> {
        self.pagemap.last_key_value().map(|(&p, _)| p as u64)
    }

    /// Iterates the owned frames in PFN order as `(pfn, page_offset)`.
    pub fn owned_pages(&self) -> impl DoubleEndedIterator<Item = (u64, u32)> + '_ {
        self.pagemap.iter().map(|(&p, &o)| (p as u64, o))
    }

    /// Number of owned page frames.
    pub fn page_count(&self) -> usize {
        self.pagemap.len()
    }

    /// Size of the mapped region in bytes.
    pub fn region_len(&self) -> usize {
        self.len
    }

    /// Writes the PFN index to `path`, one `pfn page_offset` pair per line.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if file creation or writing fails.
    pub fn write_allocation_file(&self, path: &str) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for (pfn, page_offset) in self.owned_pages() {
            writeln!(writer, "0x{:x} {}", pfn, page_offset)?;
        }
        writer.flush()
    }
}

impl Drop for PhysPageFinder {
    fn drop(&mut self) {
        let r = unsafe { libc::munmap(self.mem as *mut libc::c_void, self.len) };
        debug_assert_eq!(r, 0, "munmap: {}", std::io::Error::last_os_error());
    }
}

/// Resolves the number of hugepages to map, consulting `/proc/meminfo`.
///
/// Adopts `HugePages_Free` when `use_free_memory` is set and verifies that
/// the system hugepage size matches the configured allocation page size.
fn hugepage_count(cfg: &Config) -> Result<u64, AcquireError> {
    let mut contents = String::new();
    File::open(MEMINFO_PATH)?.read_to_string(&mut contents)?;

    let system_kb = meminfo_value(&contents, "Hugepagesize:")
        .ok_or(AcquireError::MeminfoField { field: "Hugepagesize" })?;
    if system_kb << 10 != cfg.alloc_page_size.bytes() as u64 {
        return Err(AcquireError::HugepageSizeMismatch {
            system_kb,
            configured: cfg.alloc_page_size,
        });
    }

    let free = meminfo_value(&contents, "HugePages_Free:")
        .ok_or(AcquireError::MeminfoField { field: "HugePages_Free" })?;
    if free != 0 {
        if cfg.use_free_memory {
            info!("Found {} free hugepages", free);
            return Ok(free);
        }
        if cfg.hugepage_count > free {
            return Err(AcquireError::NotEnoughHugepages {
                free,
                requested: cfg.hugepage_count,
            });
        }
    }
    Ok(cfg.hugepage_count)
}

fn meminfo_value(contents: &str, token: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(token))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PAGE_SIZE;

    const MEMINFO: &str = "MemTotal:       65505620 kB\n\
                           MemFree:        57344000 kB\n\
                           HugePages_Total:      16\n\
                           HugePages_Free:       12\n\
                           HugePages_Rsvd:        0\n\
                           Hugepagesize:       2048 kB\n";

    #[test]
    fn test_meminfo_value() {
        assert_eq!(meminfo_value(MEMINFO, "HugePages_Free:"), Some(12));
        assert_eq!(meminfo_value(MEMINFO, "Hugepagesize:"), Some(2048));
        assert_eq!(meminfo_value(MEMINFO, "HugePages_Surp:"), None);
        assert_eq!(meminfo_value("", "Hugepagesize:"), None);
    }

    #[test]
    fn test_alloc_4k_and_index() {
        // a small 4 KiB pool; pagemap may hold zero PFNs without root, the
        // region itself must still map and unmap cleanly
        let mut cfg = Config::default();
        cfg.alloc_page_size = AllocPageSize::FourKb;
        cfg.memory_size = (64 * PAGE_SIZE) as u64;
        let finder = PhysPageFinder::new(&cfg).expect("acquisition failed");
        assert_eq!(finder.region_len(), 64 * PAGE_SIZE);
        for (pfn, page_offset) in finder.owned_pages() {
            let phys = PhysAddr::from_page(pfn) + 0x123;
            let virt = finder.find_page(phys).expect("owned page must resolve");
            assert_eq!(virt as usize & (PAGE_SIZE - 1), 0x123);
            assert!((page_offset as usize) < 64);
        }
    }
}
