//! The bit flipper: row initialization, hammer-kernel dispatch and the flip
//! scan.
//!
//! This module is the unsafe boundary of the crate. Raw row writes,
//! cache-line flushes, fences, timestamp reads and the execution of
//! generated code are all contained here and exposed as three typed
//! operations: initialize rows to a pattern, hammer with the selected
//! variant, scan rows for differences from the pattern.

mod blacksmith;
mod machinecode;
mod variants;

use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_clflushopt, _mm_mfence};
use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::{Config, HammerAlgorithm};
use crate::memory::{DramAddr, PhysAddr, PhysPageFinder};
use crate::report::{FlipSink, TestInfo};
use crate::temperature::{TemperatureController, TemperatureError};
use crate::util::{CL_SIZE, PAGE_SIZE, ROW_SIZE};

/// Physical addresses of the first byte of each row in a hammer window.
#[derive(Debug, Clone, Default)]
pub struct HammerAddrs {
    /// Aggressor row starts
    pub aggs: Vec<PhysAddr>,
    /// Victim row starts
    pub victims: Vec<PhysAddr>,
}

/// Errors raised while hammering. All of these abort the run.
#[derive(Debug, Error)]
pub enum FlipperError {
    /// Mapping an executable page for the generated kernel failed
    #[error("failed to map executable memory for the hammer kernel: {0}")]
    JitMap(std::io::Error),
    /// The runtime assembler rejected the kernel
    #[error("error occurred while jitting code, aborting execution")]
    Assemble,
    /// The blacksmith kernel has no aggressors left between the sync windows
    #[error("blacksmith needs more than {need} aggressors for syncing, got {have}")]
    TooFewAggressors {
        /// Aggressors available
        have: usize,
        /// Aggressors consumed by the two sync windows
        need: usize,
    },
    /// The measured temperature left the configured interval
    #[error("temperature outside of given interval: expected {target}, got {actual}")]
    TemperatureExcursion {
        /// Target temperature
        target: i64,
        /// Measured temperature
        actual: i64,
    },
    /// Talking to the temperature controller failed
    #[error(transparent)]
    Temperature(#[from] TemperatureError),
}

/// A single observed bit flip.
///
/// `victim_phys` is the physical address of the 64-bit word holding the
/// flipped bit, `bit` its index within that word, and `flips_to` the value
/// the bit changed to (1 for a 0→1 flip).
#[derive(Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub struct BitFlip {
    /// Physical address of the affected 64-bit word
    pub victim_phys: u64,
    /// Bank of the victim cell
    pub bank: u64,
    /// Row of the victim cell
    pub row: u64,
    /// Column of the victim cell
    pub col: u64,
    /// Bit index within the word (0..63)
    pub bit: u8,
    /// 1 for a 0→1 flip, 0 for a 1→0 flip
    pub flips_to: u8,
}

impl fmt::Debug for BitFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitFlip")
            .field("victim_phys", &format_args!("{:#x}", self.victim_phys))
            .field("dram", &DramAddr::new(self.bank, self.row, self.col))
            .field("bit", &self.bit)
            .field("flips_to", &self.flips_to)
            .finish()
    }
}

#[inline(always)]
fn clflush(addr: *const u8) {
    unsafe { _mm_clflush(addr) }
}

#[target_feature(enable = "clflushopt")]
unsafe fn clflushopt(addr: *const u8) {
    unsafe { _mm_clflushopt(addr) }
}

/// Evicts the cache line of `addr`, preferring `clflushopt` when the
/// platform exposes it.
#[inline(always)]
pub(crate) fn flush_line(addr: *const u8, use_clflushopt: bool) {
    if use_clflushopt {
        unsafe { clflushopt(addr) }
    } else {
        clflush(addr)
    }
}

#[inline(always)]
pub(crate) fn mfence() {
    unsafe { _mm_mfence() }
}

#[inline(always)]
pub(crate) fn rdtscp() -> u64 {
    let mut aux = 0;
    unsafe { __rdtscp(&mut aux) }
}

/// Hammers one window of victim and aggressor rows and scans for flips.
///
/// A flipper is constructed per window with the physical row addresses,
/// resolves them through the [`PhysPageFinder`], runs the configured hammer
/// variant for each initialization pair, and emits one [`BitFlip`] event per
/// differing bit.
pub struct BitFlipper<'a> {
    cfg: &'a Config,
    phys: HammerAddrs,
    virt_aggs: Vec<*mut u8>,
    virt_victims: Vec<*mut u8>,
    temperature: Option<&'a TemperatureController>,
    use_clflushopt: bool,
}

impl<'a> BitFlipper<'a> {
    /// Creates a flipper for one window.
    pub fn new(
        cfg: &'a Config,
        phys: HammerAddrs,
        temperature: Option<&'a TemperatureController>,
    ) -> Self {
        BitFlipper {
            cfg,
            phys,
            virt_aggs: vec![],
            virt_victims: vec![],
            temperature,
            use_clflushopt: std::arch::is_x86_feature_detected!("clflushopt"),
        }
    }

    /// Resolves every aggressor and victim row start to a virtual address.
    ///
    /// Returns false without retaining partial state when any row is not in
    /// the page map; the caller skips the window in that case.
    pub fn find_pages(&mut self, finder: &PhysPageFinder) -> bool {
        let resolve = |addrs: &[PhysAddr]| {
            addrs
                .iter()
                .map(|&p| finder.find_page(p))
                .collect::<Option<Vec<_>>>()
        };
        let (Some(aggs), Some(victims)) = (resolve(&self.phys.aggs), resolve(&self.phys.victims))
        else {
            return false;
        };
        self.virt_aggs = aggs;
        self.virt_victims = victims;
        true
    }

    /// Hammers the window once per configured initialization pair.
    ///
    /// The whole invocation is wrapped in one reporter transaction. Returns
    /// true iff at least one bit flipped.
    ///
    /// # Errors
    ///
    /// Fails on JIT errors and on temperature excursions; both abort the
    /// run. Reporter failures are logged and ignored.
    pub fn hammer(&mut self, sink: &mut dyn FlipSink) -> Result<bool, FlipperError> {
        if let Err(err) = sink.begin_transaction() {
            warn!("Failed to open report transaction: {}", err);
        }

        // test every configured pair, by default both 0->1 and 1->0 flips
        let mut seen_flip = false;
        for i in 0..self.cfg.victim_init.len() {
            seen_flip |=
                self.hammer_and_check(self.cfg.victim_init[i], self.cfg.aggressor_init[i], sink)?;
        }

        if let Err(err) = sink.commit() {
            warn!("Failed to commit report transaction: {}", err);
        }
        Ok(seen_flip)
    }

    fn hammer_and_check(
        &self,
        victim_init: u64,
        aggressor_init: u64,
        sink: &mut dyn FlipSink,
    ) -> Result<bool, FlipperError> {
        for &victim in &self.virt_victims {
            self.init_row(victim, victim_init);
        }
        for &agg in &self.virt_aggs {
            self.init_row(agg, aggressor_init);
        }

        self.run_kernel()?;

        let temperature = match self.temperature {
            Some(tc) => {
                let actual = tc.actual_temperature()?;
                let target = tc.target_temperature();
                if actual <= target - self.cfg.interval || actual >= target + self.cfg.interval {
                    return Err(FlipperError::TemperatureExcursion { target, actual });
                }
                info!("Current temperature: {} °C", actual);
                Some(actual)
            }
            None => None,
        };

        if let Err(err) = sink.record_test(&TestInfo::new(
            &self.phys.aggs,
            victim_init,
            aggressor_init,
            temperature,
        )) {
            warn!("Failed to record test: {}", err);
        }

        let flips = self.scan(victim_init);
        for flip in &flips {
            if let Err(err) = sink.record_flip(flip) {
                warn!("Failed to record bit flip: {}", err);
            }
        }
        info!("Found {} bit flip(s)", flips.len());

        if flips.len() >= 8 * PAGE_SIZE {
            self.dump_rows(victim_init, aggressor_init);
        }

        Ok(!flips.is_empty())
    }

    /// Fills a row with the repeating 64-bit word and evicts it from the
    /// cache so the later check does not just return cached data.
    fn init_row(&self, row: *mut u8, word: u64) {
        unsafe {
            for offset in (0..ROW_SIZE).step_by(size_of::<u64>()) {
                std::ptr::write_volatile(row.byte_add(offset) as *mut u64, word);
            }
            for offset in (0..ROW_SIZE).step_by(CL_SIZE) {
                flush_line(row.byte_add(offset), self.use_clflushopt);
            }
        }
    }

    /// Runs the configured hammer variant over the aggressors.
    fn run_kernel(&self) -> Result<(), FlipperError> {
        if self.virt_aggs.is_empty() {
            // an empty window produces no memory traffic at all
            return Ok(());
        }
        match self.cfg.hammer_algorithm {
            HammerAlgorithm::Default => {
                variants::hammer_default(&self.virt_aggs, self.cfg.hammer_count, self.use_clflushopt)
            }
            HammerAlgorithm::Trrespass => variants::hammer_trrespass(
                &self.virt_aggs,
                self.cfg.hammer_count,
                self.cfg.threshold,
                self.use_clflushopt,
            ),
            HammerAlgorithm::Assembly => {
                variants::hammer_assembly(&self.virt_aggs, self.cfg.hammer_count, self.use_clflushopt)
            }
            HammerAlgorithm::MachineCode => {
                return machinecode::hammer(
                    &self.virt_aggs,
                    self.cfg.hammer_count,
                    self.cfg.nop_count,
                    self.use_clflushopt,
                );
            }
            HammerAlgorithm::Blacksmith => {
                let params = blacksmith::BlacksmithParams {
                    hammer_order: &self.cfg.hammer_order,
                    num_aggs_for_sync: self.cfg.num_aggs_for_sync as usize,
                    total_num_activations: self.cfg.total_num_activations,
                    flushing: self.cfg.flushing,
                    fencing: self.cfg.fencing,
                    use_clflushopt: self.use_clflushopt,
                };
                let sync_activations = blacksmith::hammer(&params, &self.virt_aggs)?;
                debug!(
                    "{} activations in the trailing refresh syncs",
                    sync_activations
                );
            }
        }
        Ok(())
    }

    /// Compares every victim row word-by-word against its initialization
    /// template, emitting one [`BitFlip`] per differing bit.
    fn scan(&self, victim_init: u64) -> Vec<BitFlip> {
        let layout = &self.cfg.dram_layout;
        let mut flips = vec![];

        for (v, &victim) in self.virt_victims.iter().enumerate() {
            unsafe {
                for offset in (0..ROW_SIZE).step_by(CL_SIZE) {
                    flush_line(victim.byte_add(offset), self.use_clflushopt);
                }
                mfence();

                for flip_offset in (0..ROW_SIZE).step_by(size_of::<u64>()) {
                    let value =
                        std::ptr::read_volatile(victim.byte_add(flip_offset) as *const u64);
                    if value == victim_init {
                        continue;
                    }

                    for bit in 0..u64::BITS as u8 {
                        let flips_to = ((value >> bit) & 1) as u8;
                        if ((victim_init >> bit) & 1) as u8 == flips_to {
                            continue;
                        }

                        let word_phys = self.phys.victims[v] + flip_offset as u64;
                        let byte_phys = word_phys + (bit / 8) as u64;
                        let dram = DramAddr::from_phys(byte_phys, layout);
                        info!(
                            "Flip at 0x{:x} {}: 0x{:02x} -> 0x{:02x} (bit {} flipped to {})",
                            byte_phys.as_u64(),
                            dram,
                            (victim_init >> (bit / 8 * 8)) & 0xff,
                            (value >> (bit / 8 * 8)) & 0xff,
                            bit % 8,
                            flips_to
                        );
                        flips.push(BitFlip {
                            victim_phys: word_phys.as_u64(),
                            bank: dram.bank,
                            row: dram.row,
                            col: dram.col,
                            bit,
                            flips_to,
                        });
                    }
                }
            }
        }
        flips
    }

    /// Diagnostic dump for implausibly high flip counts.
    fn dump_rows(&self, victim_init: u64, aggressor_init: u64) {
        warn!("Very high number of bit flips detected");
        debug!(
            "victim_init: 0x{:016x}, aggressor_init: 0x{:016x}",
            victim_init, aggressor_init
        );
        let first_words = |row: *mut u8| {
            (0..8)
                .map(|i| unsafe { std::ptr::read_volatile(row.byte_add(i * 8) as *const u64) })
                .map(|w| format!("0x{:016x}", w))
                .collect::<Vec<_>>()
                .join(", ")
        };
        for &victim in &self.virt_victims {
            debug!("victim {:p}: {}", victim, first_words(victim));
        }
        for &agg in &self.virt_aggs {
            debug!("aggressor {:p}: {}", agg, first_words(agg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{LogReporter, ReportError, RunInfo};

    /// Collects everything the flipper reports.
    #[derive(Default)]
    struct CollectingSink {
        tests: Vec<TestInfo>,
        flips: Vec<BitFlip>,
        committed: bool,
    }

    impl FlipSink for CollectingSink {
        fn begin_run(&mut self, _info: &RunInfo) -> Result<(), ReportError> {
            Ok(())
        }
        fn end_run(&mut self) -> Result<(), ReportError> {
            Ok(())
        }
        fn begin_transaction(&mut self) -> Result<(), ReportError> {
            Ok(())
        }
        fn commit(&mut self) -> Result<(), ReportError> {
            self.committed = true;
            Ok(())
        }
        fn record_test(&mut self, test: &TestInfo) -> Result<(), ReportError> {
            self.tests.push(test.clone());
            Ok(())
        }
        fn record_flip(&mut self, flip: &BitFlip) -> Result<(), ReportError> {
            self.flips.push(*flip);
            Ok(())
        }
    }

    fn flipper_over_rows<'a>(
        cfg: &'a Config,
        buffer: *mut u8,
        victims: &[usize],
        aggs: &[usize],
    ) -> BitFlipper<'a> {
        let mut flipper = BitFlipper::new(
            cfg,
            HammerAddrs {
                aggs: aggs.iter().map(|&i| PhysAddr::new((i * ROW_SIZE) as u64)).collect(),
                victims: victims
                    .iter()
                    .map(|&i| PhysAddr::new((i * ROW_SIZE) as u64))
                    .collect(),
            },
            None,
        );
        // bypass the page map: rows live in an ordinary test buffer
        flipper.virt_victims = victims
            .iter()
            .map(|&i| unsafe { buffer.byte_add(i * ROW_SIZE) })
            .collect();
        flipper.virt_aggs = aggs
            .iter()
            .map(|&i| unsafe { buffer.byte_add(i * ROW_SIZE) })
            .collect();
        flipper
    }

    #[test]
    fn test_scan_counts_every_differing_bit() {
        let cfg = Config::default();
        let mut buffer = vec![0u8; 3 * ROW_SIZE];
        let flipper = flipper_over_rows(&cfg, buffer.as_mut_ptr(), &[0, 2], &[1]);

        for &victim in &flipper.virt_victims {
            flipper.init_row(victim, 0);
        }
        // plant 0x81 in the first victim word: two 0->1 flips at bits 0 and 7
        unsafe { std::ptr::write_volatile(buffer.as_mut_ptr() as *mut u64, 0x81) };

        let flips = flipper.scan(0);
        assert_eq!(flips.len(), 2);
        assert_eq!(flips[0].bit, 0);
        assert_eq!(flips[0].flips_to, 1);
        assert_eq!(flips[1].bit, 7);
        assert_eq!(flips[1].flips_to, 1);
        assert_eq!(flips[0].victim_phys, 0);
    }

    #[test]
    fn test_scan_direction_and_popcount() {
        let cfg = Config::default();
        let mut buffer = vec![0u8; ROW_SIZE];
        let flipper = flipper_over_rows(&cfg, buffer.as_mut_ptr(), &[0], &[]);

        let victim_init = 0xffff_0000_dead_beefu64;
        flipper.init_row(buffer.as_mut_ptr(), victim_init);
        let observed = 0xfff7_0100_dead_beeeu64;
        unsafe {
            std::ptr::write_volatile(buffer.as_mut_ptr().byte_add(64) as *mut u64, observed)
        };

        let flips = flipper.scan(victim_init);
        assert_eq!(flips.len(), (observed ^ victim_init).count_ones() as usize);
        for flip in flips {
            assert_eq!(flip.flips_to as u64, (observed >> flip.bit) & 1);
            assert_eq!(flip.victim_phys, 64);
        }
    }

    #[test]
    fn test_hammer_default_produces_no_false_flips() {
        // hammering real (cached, refresh-healthy) memory must not report
        // flips; also exercises the full init/kernel/scan cycle
        let mut cfg = Config::default();
        cfg.hammer_count = 1000;
        let mut buffer = vec![0u8; 4 * ROW_SIZE];
        let mut flipper = flipper_over_rows(&cfg, buffer.as_mut_ptr(), &[0, 2], &[1, 3]);

        let mut sink = CollectingSink::default();
        let flipped = flipper.hammer(&mut sink).unwrap();
        assert!(!flipped);
        assert!(sink.flips.is_empty());
        assert!(sink.committed);
        // one test record per init pair
        assert_eq!(sink.tests.len(), cfg.victim_init.len());
        assert_eq!(sink.tests[0].victim_init, 0);
        assert_eq!(sink.tests[0].aggressor_init, !0);
    }

    #[test]
    fn test_empty_window_is_no_traffic() {
        let cfg = Config::default();
        let mut flipper = BitFlipper::new(&cfg, HammerAddrs::default(), None);
        let mut sink = LogReporter;
        assert!(!flipper.hammer(&mut sink).unwrap());
    }

    #[test]
    fn test_find_pages_is_all_or_nothing() {
        let mut cfg = Config::default();
        cfg.alloc_page_size = crate::config::AllocPageSize::FourKb;
        cfg.memory_size = (16 * PAGE_SIZE) as u64;
        let finder = PhysPageFinder::new(&cfg).unwrap();

        let mut addrs = HammerAddrs::default();
        // an address no pool can own: beyond the 16 TiB PFN cap
        addrs.aggs.push(PhysAddr::new(1 << 45));
        let mut flipper = BitFlipper::new(&cfg, addrs, None);
        assert!(!flipper.find_pages(&finder));
        assert!(flipper.virt_aggs.is_empty());
    }
}
