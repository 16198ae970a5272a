//! Flip finders and the experiment loop.
//!
//! A finder enumerates candidate hammer windows over the owned memory and
//! drives the [`BitFlipper`] for each of them. The experiment loop around it
//! handles repetitions, the optional temperature controller, the timeout
//! watchdog and SIGINT, all through the cooperative cancellation flag:
//! cancellation is checked between windows and between banks, never inside
//! a hammer kernel, and it is a normal early termination rather than an
//! error.

mod contiguous;
mod noncontiguous;

use std::thread;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::config::{Config, FinderKind};
use crate::flipper::{BitFlipper, FlipperError, HammerAddrs};
use crate::memory::{DramAddr, PhysPageFinder};
use crate::report::{FlipSink, RunInfo};
use crate::temperature::{TemperatureController, TemperatureError};
use crate::util::cancel::{self, SigintGuard};
use crate::util::{NamedProgress, PAGES_PER_ROW};

/// Errors that abort a hammering session.
#[derive(Debug, Error)]
pub enum FinderError {
    /// The target temperature was not reached in time
    #[error("timeout: could not reach target temperature within {0} seconds")]
    TemperatureTimeout(u64),
    /// Talking to the temperature controller failed
    #[error(transparent)]
    Temperature(#[from] TemperatureError),
    /// Hammering failed (JIT error or temperature excursion)
    #[error(transparent)]
    Flipper(#[from] FlipperError),
}

/// Runs the configured flip finder over the owned memory.
///
/// This is the top-level entry of a hammering session: it dispatches to the
/// contiguous or non-contiguous walker and wraps it into the experiment
/// loop.
///
/// # Errors
///
/// Returns a [`FinderError`] for the fatal conditions listed there. Not
/// finding a suitable memory range is logged and ends the session without
/// an error.
pub fn find_flips(
    cfg: &Config,
    pages: &PhysPageFinder,
    sink: &mut dyn FlipSink,
    progress: Option<MultiProgress>,
) -> Result<(), FinderError> {
    match cfg.memory_allocator {
        FinderKind::Contiguous => contiguous::run(cfg, pages, sink, progress),
        FinderKind::Noncontiguous => noncontiguous::run(cfg, pages, sink, progress),
    }
}

/// State shared by both finders.
pub(crate) struct FinderCtx<'a> {
    pub cfg: &'a Config,
    pub pages: &'a PhysPageFinder,
    /// Victim rows per window
    pub victim_rows: usize,
    /// Total rows per window (the expanded pattern length)
    pub hammer_rows: usize,
    /// Pages per window
    pub hammer_pages: usize,
    progress: Option<MultiProgress>,
}

impl<'a> FinderCtx<'a> {
    pub fn new(
        cfg: &'a Config,
        pages: &'a PhysPageFinder,
        progress: Option<MultiProgress>,
    ) -> Self {
        let pattern = &cfg.hammer_pattern;
        FinderCtx {
            cfg,
            pages,
            victim_rows: pattern.victims(),
            hammer_rows: pattern.len(),
            hammer_pages: pattern.len() * PAGES_PER_ROW,
            progress,
        }
    }

    /// Adds a progress bar over `len` hammer windows, when progress
    /// reporting is enabled.
    pub fn window_bar(&self, len: u64) -> Option<ProgressBar> {
        self.progress.as_ref().map(|mp| {
            let bar = mp.add(ProgressBar::new(len));
            bar.set_style(ProgressStyle::named_bar("Hammer windows"));
            bar
        })
    }

    /// Resolves a window and hammers it.
    ///
    /// Returns false when the window's pages are not in the page map; the
    /// caller decides whether that stops the pass.
    pub fn hammer_window(
        &self,
        bank: u64,
        addrs: HammerAddrs,
        temperature: Option<&TemperatureController>,
        sink: &mut dyn FlipSink,
    ) -> Result<bool, FinderError> {
        let layout = &self.cfg.dram_layout;
        let rows = match (addrs.aggs.first(), addrs.aggs.last()) {
            (Some(&first), Some(&last)) => (
                DramAddr::from_phys(first, layout).row,
                DramAddr::from_phys(last, layout).row,
            ),
            _ => (0, 0),
        };

        let mut flipper = BitFlipper::new(self.cfg, addrs, temperature);
        if !flipper.find_pages(self.pages) {
            error!("Could not find physical pages");
            return Ok(false);
        }

        info!(
            "Hammer {} aggressors (bank: {}, rows: [{}, {}])...",
            self.cfg.aggressor_rows, bank, rows.0, rows.1
        );
        flipper.hammer(sink)?;
        Ok(true)
    }
}

/// Wraps one finder pass into temperature control and repetitions.
///
/// The SIGINT handler is installed for the duration of the loop. With
/// target temperatures configured, each target is set on the controller and
/// polled at 1 Hz until it is reached, the configured timeout elapses
/// (fatal), or cancellation fires (clean exit); afterwards the controller is
/// always sent back to 20 °C.
pub(crate) fn experiment_loop<F>(
    cfg: &Config,
    sink: &mut dyn FlipSink,
    mut pass: F,
) -> Result<(), FinderError>
where
    F: FnMut(&mut dyn FlipSink, Option<&TemperatureController>) -> Result<(), FinderError>,
{
    let _sigint = SigintGuard::install();

    if cfg.target_temps.is_empty() {
        return repetition_loop(cfg, sink, None, &mut pass);
    }

    info!("Using Temperature Controller...");
    let mut controller = TemperatureController::connect(&cfg.device)?;

    for &target in &cfg.target_temps {
        controller.set_target_temperature(target)?;
        let start = Instant::now();

        cancel::reset();
        let mut actual = controller.actual_temperature()?;
        while actual != target && start.elapsed() < cfg.timeout && !cancel::exit_requested() {
            thread::sleep(Duration::from_secs(1));
            actual = controller.actual_temperature()?;
        }

        if cancel::exit_requested() {
            trace!("exit requested");
            // stop the heatpads once test runs are cancelled or aborted
            controller.set_target_temperature(20)?;
            return Ok(());
        }

        if actual != target {
            controller.set_target_temperature(20)?;
            return Err(FinderError::TemperatureTimeout(cfg.timeout.as_secs()));
        }

        repetition_loop(cfg, sink, Some(&controller), &mut pass)?;
    }

    controller.set_target_temperature(20)?;
    Ok(())
}

fn repetition_loop<F>(
    cfg: &Config,
    sink: &mut dyn FlipSink,
    temperature: Option<&TemperatureController>,
    pass: &mut F,
) -> Result<(), FinderError>
where
    F: FnMut(&mut dyn FlipSink, Option<&TemperatureController>) -> Result<(), FinderError>,
{
    for rep in 0..cfg.experiment_repetitions {
        debug!("Starting repetition {}", rep + 1);
        let run = RunInfo {
            aggressor_rows: cfg.aggressor_rows,
            hammer_count: cfg.hammer_count,
            hammer_algorithm: cfg.hammer_algorithm.as_str(),
            pattern: cfg.pattern_description.clone(),
            target_temperature: temperature.map(|tc| tc.target_temperature()),
            comment: cfg.comment.clone(),
        };
        if let Err(err) = sink.begin_run(&run) {
            warn!("Failed to record run start: {}", err);
        }

        cancel::reset();
        if !cfg.test_max_time.is_zero() {
            cancel::arm_timeout(cfg.test_max_time);
        }

        pass(sink, temperature)?;

        if let Err(err) = sink.end_run() {
            warn!("Failed to record run end: {}", err);
        }
    }
    Ok(())
}
