//! Flip finder for fragmented memory.
//!
//! Works on whatever frames the pool happens to own. Per bank, the first
//! and last owned rows bound the walk (row order correlates with physical
//! page order); rows with absent pages are collected up front, and any
//! window whose padded span touches a missing row is skipped - we could
//! otherwise cause bit flips in memory we do not own.

use std::collections::{BTreeSet, HashMap};

use indicatif::MultiProgress;
use log::{error, info, trace, warn};

use super::{FinderCtx, FinderError, experiment_loop};
use crate::config::{Config, IterAlgorithm};
use crate::flipper::HammerAddrs;
use crate::memory::{DramAddr, PhysAddr, PhysPageFinder};
use crate::report::FlipSink;
use crate::temperature::TemperatureController;
use crate::util::cancel;

/// Runs the non-contiguous finder.
pub(crate) fn run(
    cfg: &Config,
    pages: &PhysPageFinder,
    sink: &mut dyn FlipSink,
    progress: Option<MultiProgress>,
) -> Result<(), FinderError> {
    let ctx = FinderCtx::new(cfg, pages, progress);
    let Some(finder) = NoncontiguousFinder::prepare(ctx) else {
        error!("Page map is empty, nothing to hammer");
        return Ok(());
    };
    experiment_loop(cfg, sink, |sink, temperature| {
        finder.pass(sink, temperature)
    })
}

struct NoncontiguousFinder<'a> {
    ctx: FinderCtx<'a>,
    missing_rows: HashMap<u64, BTreeSet<u64>>,
}

impl<'a> NoncontiguousFinder<'a> {
    /// Derives the page bounds and collects the missing rows per bank.
    fn prepare(ctx: FinderCtx<'a>) -> Option<Self> {
        let first_page = ctx.pages.first_page()?;
        let last_page = ctx.pages.last_page()?;

        let mut missing_rows: HashMap<u64, BTreeSet<u64>> = HashMap::new();
        for page in first_page..=last_page {
            if !ctx.pages.contains_page(page) {
                let dram = DramAddr::from_phys(PhysAddr::from_page(page), &ctx.cfg.dram_layout);
                // a row is missing if any of its pages is missing
                missing_rows.entry(dram.bank).or_default().insert(dram.row);
            }
        }

        Some(NoncontiguousFinder { ctx, missing_rows })
    }

    fn pass(
        &self,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<(), FinderError> {
        if self.ctx.hammer_rows == 0 {
            warn!("Hammer pattern is empty, nothing to do");
            return Ok(());
        }
        for &bank in &self.ctx.cfg.banks {
            if cancel::exit_requested() {
                trace!("exit requested");
                break;
            }

            let Some((first_row, last_row)) = self.row_bounds(bank) else {
                warn!("Bank {} has no owned rows in range, skipping", bank);
                continue;
            };

            info!(
                "Testing bank {}: rows [{}, {}], missing rows: {}",
                bank,
                first_row,
                last_row,
                self.missing_rows.get(&bank).map_or(0, |rows| rows.len())
            );

            let go_on = match self.ctx.cfg.iter_algorithm {
                IterAlgorithm::Default => {
                    self.default_test(bank, first_row, last_row, sink, temperature)?
                }
                IterAlgorithm::Fast => {
                    self.fast_test(bank, first_row, last_row, sink, temperature)?
                }
                IterAlgorithm::Debug => {
                    self.debug_test(bank, first_row, last_row, sink, temperature)?
                }
            };
            if !go_on {
                break;
            }
        }
        Ok(())
    }

    /// First and last owned rows of `bank`, clamped by the configured row
    /// range.
    ///
    /// The first owned page from the low end and the last from the high end
    /// give the bounds - a higher row cannot have a lower physical address
    /// under a mask-based layout.
    fn row_bounds(&self, bank: u64) -> Option<(u64, u64)> {
        let cfg = self.ctx.cfg;
        let dram_of = |page: u64| DramAddr::from_phys(PhysAddr::from_page(page), &cfg.dram_layout);

        let mut first_row = self
            .ctx
            .pages
            .owned_pages()
            .map(|(page, _)| dram_of(page))
            .find(|dram| dram.bank == bank)?
            .row;
        let mut last_row = self
            .ctx
            .pages
            .owned_pages()
            .rev()
            .map(|(page, _)| dram_of(page))
            .find(|dram| dram.bank == bank)?
            .row;

        if cfg.test_first_row != 0 {
            first_row = first_row.max(cfg.test_first_row);
        }
        if cfg.test_last_row != 0 {
            last_row = last_row.min(cfg.test_last_row);
        }

        (last_row >= first_row).then_some((first_row, last_row))
    }

    /// True when any row in `[first_victim - padding, last_victim +
    /// padding]` is missing from the pool.
    fn is_any_row_missing(&self, bank: u64, first_victim: u64, last_victim: u64) -> bool {
        let padding = self.ctx.cfg.row_padding;
        match self.missing_rows.get(&bank) {
            Some(rows) => rows
                .range(first_victim.saturating_sub(padding)..=last_victim + padding)
                .next()
                .is_some(),
            None => false,
        }
    }

    /// Advances one row per iteration, hammering every row multiple times.
    fn default_test(
        &self,
        bank: u64,
        first_row: u64,
        last_row: u64,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<bool, FinderError> {
        let Some(last_start) = (last_row + 1).checked_sub(self.ctx.hammer_rows as u64) else {
            return Ok(true);
        };
        let bar = self.ctx.window_bar(last_start.saturating_sub(first_row) + 1);

        for row in first_row..=last_start {
            if let Some(bar) = &bar {
                bar.inc(1);
            }
            if !self.hammer(bank, row, row + self.ctx.hammer_rows as u64 - 1, sink, temperature)? {
                return Ok(false);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(true)
    }

    /// Advances by pattern size minus one row; each row is hammered at most
    /// twice, the second time with a one-row shift.
    ///
    /// The last rows of a block stay untested when fewer than a whole
    /// pattern remains.
    fn fast_test(
        &self,
        bank: u64,
        first_row: u64,
        last_row: u64,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<bool, FinderError> {
        let hammer_rows = self.ctx.hammer_rows as u64;
        let Some(last_start) = (last_row + 1).checked_sub(hammer_rows) else {
            return Ok(true);
        };

        let mut row = first_row;
        while row <= last_start {
            if !self.hammer(bank, row, row + hammer_rows - 1, sink, temperature)?
                || !self.hammer(bank, row + 1, row + hammer_rows, sink, temperature)?
            {
                return Ok(false);
            }
            row += hammer_rows - 1;
        }
        Ok(true)
    }

    /// Like `fast_test` without the shifted pass, and stops after the first
    /// bank. Debugging aid.
    fn debug_test(
        &self,
        bank: u64,
        first_row: u64,
        last_row: u64,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<bool, FinderError> {
        let hammer_rows = self.ctx.hammer_rows as u64;
        let Some(last_start) = (last_row + 1).checked_sub(hammer_rows) else {
            return Ok(false);
        };

        let mut row = first_row;
        while row <= last_start {
            if !self.hammer(bank, row, row + hammer_rows - 1, sink, temperature)? {
                return Ok(false);
            }
            row += hammer_rows - 1;
        }
        Ok(false) // test only the first bank
    }

    /// Hammers the window `[first_victim, last_victim]`, skipping it when a
    /// padded row is missing.
    fn hammer(
        &self,
        bank: u64,
        first_victim: u64,
        last_victim: u64,
        sink: &mut dyn FlipSink,
        temperature: Option<&TemperatureController>,
    ) -> Result<bool, FinderError> {
        if self.is_any_row_missing(bank, first_victim, last_victim) {
            return Ok(true);
        }

        let cfg = self.ctx.cfg;
        let mut addrs = HammerAddrs::default();
        addrs.victims.reserve(self.ctx.victim_rows);
        addrs.aggs.reserve(cfg.aggressor_rows as usize);

        for (offset, &is_agg) in cfg.hammer_pattern.bits().iter().enumerate() {
            let dram = DramAddr::new(bank, first_victim + offset as u64, 0);
            let phys = dram.phys(&cfg.dram_layout);
            if is_agg {
                addrs.aggs.push(phys);
            } else {
                addrs.victims.push(phys);
            }
        }

        if !self.ctx.hammer_window(bank, addrs, temperature, sink)? {
            return Ok(false);
        }

        if cancel::exit_requested() {
            trace!("exit requested");
        }
        Ok(!cancel::exit_requested())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Missing-row window logic, independent of real memory: a window is
    /// skipped when its padded span touches a missing row.
    #[test]
    fn test_padded_window_overlap() {
        let mut missing: HashMap<u64, BTreeSet<u64>> = HashMap::new();
        missing.entry(3).or_default().insert(100);

        let padding = 10u64;
        let overlaps = |first: u64, last: u64| {
            missing
                .get(&3)
                .is_some_and(|rows| {
                    rows.range(first.saturating_sub(padding)..=last + padding)
                        .next()
                        .is_some()
                })
        };

        // window [80, 95]: 100 lies in [70, 105] -> skipped
        assert!(overlaps(80, 95));
        // window [80, 89]: 100 lies outside [70, 99] -> hammered
        assert!(!overlaps(80, 89));
        // other banks are unaffected
        assert!(missing.get(&2).is_none());
    }
}
