use mallet_core::memory::{DramAddr, LinuxPageMap, PhysAddr, PhysPageFinder};
use mallet_core::util::{PAGE_SIZE, ROW_SIZE};
use mallet_core::{Config, HammerPattern};

const LAYOUT_INI: &str = "[dram_layout]\n\
                          functions=0x2040,0x44000,0x88000,0x110000,0x220000\n\
                          row_masks=0xffffc0000\n\
                          col_masks=0x1fff\n";

fn configured() -> Config {
    let mut cfg = Config::default();
    cfg.merge_str(LAYOUT_INI).expect("layout must parse");
    cfg.finalize().expect("layout must verify");
    cfg
}

#[test]
fn test_layout_from_ini_roundtrips() -> anyhow::Result<()> {
    let cfg = configured();
    let layout = &cfg.dram_layout;
    assert_eq!(layout.banks(), 32);

    let p = PhysAddr::new(0x12345000);
    let dram = DramAddr::from_phys(p, layout);
    assert_eq!(dram.row, 0x48d);
    assert_eq!(dram.phys(layout), p);

    // every row start maps back onto itself across all banks
    for bank in 0..layout.banks() {
        for row in [1u64, 0x48d, 0x2000] {
            let phys = DramAddr::new(bank, row, 0).phys(layout);
            let back = DramAddr::from_phys(phys, layout);
            assert_eq!(back, DramAddr::new(bank, row, 0));
            assert!(back.equal_row(&DramAddr::new(bank, row, 0x40)));
        }
    }
    Ok(())
}

#[test]
fn test_row_neighbors_differ_by_row_stride() {
    let cfg = configured();
    let layout = &cfg.dram_layout;

    // consecutive rows of a bank are one ROW_SIZE * banks-per-row-bit apart
    // in the row mask's stride
    let a = DramAddr::new(5, 100, 0).phys(layout);
    let b = DramAddr::new(5, 101, 0).phys(layout);
    let stride = 1u64 << layout.row_masks[0].trailing_zeros();
    assert_eq!(
        DramAddr::from_phys(PhysAddr::new(a.as_u64() + stride), layout).row,
        101
    );
    assert_eq!(b.as_u64() & layout.row_masks[0], 101 << 18);
    assert!(ROW_SIZE as u64 <= stride);
}

#[test]
fn test_pattern_covers_configured_rows() {
    let mut cfg = Config::default();
    cfg.merge_str(
        "[hammer]\n\
         aggressor_rows=6\n\
         hammer_pattern=vax\n\
         random_pattern_area=64\n",
    )
    .unwrap();
    cfg.finalize().unwrap();

    let pattern: &HammerPattern = &cfg.hammer_pattern;
    assert_eq!(pattern.len() as u64, 64);
    assert_eq!(pattern.aggressors(), 6);
    assert_eq!(cfg.aggressor_rows, 6);
    assert_eq!(pattern.victims(), 64 - 6);
}

/// Needs root: real frame numbers are only visible to privileged processes.
#[test]
#[ignore = "requires root for real PFNs in /proc/self/pagemap"]
fn test_find_page_agrees_with_pagemap() -> anyhow::Result<()> {
    let mut cfg = Config::default();
    cfg.use_free_memory = false;
    cfg.memory_size = (1024 * PAGE_SIZE) as u64;
    cfg.finalize().unwrap();

    let pages = PhysPageFinder::new(&cfg)?;
    assert!(pages.page_count() > 0);

    let mut resolver = LinuxPageMap::new()?;
    for (pfn, _) in pages.owned_pages().take(64) {
        let phys = PhysAddr::from_page(pfn) + 0x7ff;
        let virt = pages.find_page(phys).expect("owned frame must resolve");
        assert_eq!(virt as usize & (PAGE_SIZE - 1), 0x7ff);
        let back = resolver.get_phys(virt as u64)?;
        assert_eq!(back, phys);
    }
    Ok(())
}
