//! Flip finder for a physically contiguous run of pages.
//!
//! Assumes the page map holds a long run of consecutive frames (as produced
//! by hugepage or early-boot allocations). The run is located once, aligned
//! to a row boundary, partitioned by bank, and then walked window by window
//! with one of three advance policies.

use std::collections::BTreeMap;

use indicatif::MultiProgress;
use itertools::Itertools;
use log::{error, info, trace};

use super::{FinderCtx, FinderError, experiment_loop};
use crate::config::{Config, IterAlgorithm};
use crate::flipper::HammerAddrs;
use crate::memory::{DramAddr, PhysAddr, PhysPageFinder};
use crate::report::FlipSink;
use crate::temperature::TemperatureController;
use crate::util::{PAGE_SIZE, PAGES_PER_ROW, cancel};

/// Runs the contiguous finder. Not finding a suitable run is logged and
/// ends the session without an error.
pub(crate) fn run(
    cfg: &Config,
    pages: &PhysPageFinder,
    sink: &mut dyn FlipSink,
    progress: Option<MultiProgress>,
) -> Result<(), FinderError> {
    let ctx = FinderCtx::new(cfg, pages, progress);
    let Some(finder) = ContiguousFinder::prepare(ctx) else {
        return Ok(());
    };
    experiment_loop(cfg, sink, |sink, temperature| {
        finder.pass(sink, temperature)
    })
}

struct ContiguousFinder<'a> {
    ctx: FinderCtx<'a>,
    pages_per_bank: usize,
    banks: BTreeMap<u64, Vec<PhysAddr>>,
}

impl<'a> ContiguousFinder<'a> {
    /// Locates the contiguous run and partitions its pages by bank.
    fn prepare(ctx: FinderCtx<'a>) -> Option<Self> {
        let (first_page, last_page, pages_per_bank) = determine_page_range(&ctx)?;

        let banks: BTreeMap<u64, Vec<PhysAddr>> = (first_page..=last_page)
            .map(|page| {
                let phys = PhysAddr::from_page(page);
                (DramAddr::from_phys(phys, &ctx.cfg.dram_layout).bank, phys)
            })
            .filter(|(bank, _)| ctx.cfg.banks.contains(bank))
            .into_group_map()
            .into_iter()
            .collect();

        Some(ContiguousFinder {
            ctx,
            pages_per_bank,
            banks,
        })
    }

    fn pass(
        &self,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<(), FinderError> {
        match self.ctx.cfg.iter_algorithm {
            IterAlgorithm::Default => self.default_test(sink, temperature),
            IterAlgorithm::Fast => self.fast_test(sink, temperature),
            IterAlgorithm::Debug => self.debug_test(sink, temperature),
        }
    }

    /// Advances one row per iteration, hammering every row multiple times.
    fn default_test(
        &self,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<(), FinderError> {
        let windows = (self.pages_per_bank - self.ctx.hammer_pages) / PAGES_PER_ROW + 1;
        let bar = self.ctx.window_bar((windows * self.banks.len()) as u64);

        for offset in (0..=self.pages_per_bank - self.ctx.hammer_pages).step_by(PAGES_PER_ROW) {
            for (&bank, pages) in &self.banks {
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                let end = offset + self.ctx.hammer_pages;
                if end > pages.len() {
                    error!("window end ({}) > pages in bank {} ({})", end, bank, pages.len());
                    return Ok(());
                }
                if !self.hammer(bank, &pages[offset..end], sink, temperature)? {
                    return Ok(());
                }
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(())
    }

    /// Advances by pattern size minus one row, so every row is hammered at
    /// most twice (the second time with a one-row shift).
    fn fast_test(
        &self,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<(), FinderError> {
        let hammer_pages = self.ctx.hammer_pages;
        if hammer_pages <= PAGES_PER_ROW {
            return Ok(());
        }
        for offset in
            (0..=self.pages_per_bank - hammer_pages).step_by(hammer_pages - PAGES_PER_ROW)
        {
            for (&bank, pages) in &self.banks {
                if offset + hammer_pages > pages.len() {
                    return Ok(());
                }
                self.hammer(bank, &pages[offset..offset + hammer_pages], sink, temperature)?;

                let shifted = offset + PAGES_PER_ROW;
                if shifted + hammer_pages <= pages.len()
                    && !self.hammer(bank, &pages[shifted..shifted + hammer_pages], sink, temperature)?
                {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Hammers only the first configured bank, then stops. Debugging aid.
    fn debug_test(
        &self,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<(), FinderError> {
        let Some((&bank, pages)) = self.banks.first_key_value() else {
            return Ok(());
        };
        let hammer_pages = self.ctx.hammer_pages;
        if hammer_pages <= PAGES_PER_ROW {
            return Ok(());
        }
        for offset in
            (0..=self.pages_per_bank - hammer_pages).step_by(hammer_pages - PAGES_PER_ROW)
        {
            if offset + hammer_pages > pages.len()
                || !self.hammer(bank, &pages[offset..offset + hammer_pages], sink, temperature)?
            {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Builds the window addresses along the pattern and hammers them.
    fn hammer(
        &self,
        bank: u64,
        window: &[PhysAddr],
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<bool, FinderError> {
        if cancel::exit_requested() {
            trace!("exit requested");
            return Ok(false);
        }

        let mut addrs = HammerAddrs::default();
        addrs.victims.reserve(self.ctx.victim_rows);
        addrs.aggs.reserve(self.ctx.cfg.aggressor_rows as usize);

        for (row_offset, &is_agg) in self.ctx.cfg.hammer_pattern.bits().iter().enumerate() {
            let p0 = window[row_offset * PAGES_PER_ROW];
            let p1 = window[row_offset * PAGES_PER_ROW + 1];
            // both physical pages of the row must be ours and adjacent
            assert_eq!(p1 - p0, PAGE_SIZE as u64);

            // the virtual pages must be in the same row as well
            let v0 = self.ctx.pages.find_page(p0);
            let v1 = self.ctx.pages.find_page(p1);
            assert!(
                matches!((v0, v1), (Some(v0), Some(v1)) if v1 as usize - v0 as usize == PAGE_SIZE),
                "virtual pages of row at {:?} are not adjacent",
                p0
            );

            if is_agg {
                addrs.aggs.push(p0);
            } else {
                addrs.victims.push(p0);
            }
        }

        self.ctx.hammer_window(bank, addrs, temperature, sink)
    }
}

/// Finds the first run of consecutive frames with at least `min_length`
/// pages. Returns the run's first and last page number.
fn find_run(pages: &PhysPageFinder, min_length: u64) -> Option<(u64, u64)> {
    let mut first_page = u64::MAX;
    let mut prev_page = u64::MAX;

    for (page, _) in pages.owned_pages() {
        if page != prev_page.wrapping_add(1) {
            first_page = page;
        } else if page > first_page && page - first_page > min_length {
            return Some((first_page, page));
        }
        prev_page = page;
    }
    None
}

/// Extends a run from a fixed first page and checks the minimum length.
fn find_run_fixed(pages: &PhysPageFinder, first_page: u64, min_length: u64) -> Option<u64> {
    let mut last_page = first_page;
    for page in first_page..=pages.last_page()? {
        if pages.contains_page(page) {
            last_page = page;
        } else {
            break;
        }
    }
    (last_page - first_page > min_length).then_some(last_page)
}

/// Physical address of the first page of `row`, minimized over all banks.
fn find_first_page_in_row(cfg: &Config, row: u64) -> PhysAddr {
    (0..cfg.dram_layout.banks())
        .map(|bank| DramAddr::new(bank, row, 0).phys(&cfg.dram_layout))
        .min()
        .expect("layout has at least one bank")
}

/// Determines the page range for hammering, honoring `test_first_row`,
/// `test_last_row` and `test_max_rows`. Returns `(first_page, last_page,
/// pages_per_bank)`; failures are logged and end the session.
fn determine_page_range(ctx: &FinderCtx) -> Option<(u64, u64, usize)> {
    let cfg = ctx.cfg;
    let banks_cnt = cfg.dram_layout.banks();
    let min_length = banks_cnt * cfg.test_min_rows * PAGES_PER_ROW as u64;
    let mut first_row = cfg.test_first_row;

    if first_row == 0 {
        info!("Determine contiguous pages...");
        let Some((first_page, _)) = find_run(ctx.pages, min_length) else {
            error!("Could not find run of minimum length");
            return None;
        };

        // skip a row so we can be sure we own every page of the first row;
        // this also lowers the chance of flipping bits in memory allocated
        // by another process
        first_row = DramAddr::from_phys(PhysAddr::from_page(first_page), &cfg.dram_layout).row + 1;
    }

    info!("Determine contiguous pages starting at row {}...", first_row);

    let first_page_phys = find_first_page_in_row(cfg, first_row);
    let first_page = first_page_phys.page();

    if ctx.pages.find_page(first_page_phys).is_none() {
        error!("Could not find first row {}", first_row);
        return None;
    }

    let Some(mut last_page) = find_run_fixed(ctx.pages, first_page, min_length) else {
        error!(
            "Could not find {} rows starting at row {}",
            cfg.test_min_rows, first_row
        );
        return None;
    };

    if cfg.test_last_row > 0 {
        let last_page_phys = find_first_page_in_row(cfg, cfg.test_last_row + 1) - 1u64;
        last_page = last_page.min(last_page_phys.page());
    }

    if cfg.test_max_rows > 0 {
        let first = DramAddr::from_phys(PhysAddr::from_page(first_page), &cfg.dram_layout).row;
        let last_page_phys = find_first_page_in_row(cfg, first + cfg.test_max_rows) - 1u64;
        last_page = last_page.min(last_page_phys.page());
    }

    let pages_cnt = (last_page - first_page + 1) as usize;
    let rows_cnt = pages_cnt / (PAGES_PER_ROW * banks_cnt as usize);
    info!("Found {} contiguous pages", pages_cnt);
    info!("Test {} rows/bank...", rows_cnt);

    let pages_per_bank = pages_cnt / banks_cnt as usize;
    if pages_per_bank < ctx.hammer_pages {
        error!(
            "Expected at least {} pages per bank, got {} pages per bank",
            ctx.hammer_pages, pages_per_bank
        );
        return None;
    }

    Some((first_page, last_page, pages_per_bank))
}
