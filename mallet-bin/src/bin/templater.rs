//! Main binary: iterates over the owned memory and records bit flips.

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use mallet::{apply_free_memory, init_logging, system_memory};
use mallet_core::report::{FlipSink, JsonlReporter, LogReporter};
use mallet_core::{Config, PhysPageFinder, find_flips};

/// DRAM Rowhammer template discovery.
///
/// Must be executed as root. The first configuration file is the base;
/// later files only contain the changed settings and are run one after the
/// other against the memory allocated for the base configuration.
#[derive(Debug, Parser)]
#[clap(version)]
struct CliArgs {
    /// Configuration file(s); the first one is the base configuration
    #[clap(default_value = "config.ini")]
    configs: Vec<String>,
}

fn main() -> Result<()> {
    let progress = init_logging("info")?;
    let args = CliArgs::parse();

    if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
        info!("Kernel version: {}", release.trim());
    }

    let mut base = Config::default();
    base.merge_file(&args.configs[0])?;
    apply_free_memory(&mut base);

    let mut cfg = base.clone();
    cfg.finalize()?;
    info!("Configuration: {}", cfg.dram_layout);

    // the page finder allocates the free or configured memory once; override
    // configurations reuse the same pool
    let pages = PhysPageFinder::new(&cfg)?;
    log_page_info(&cfg, &pages);

    if args.configs.len() <= 1 {
        run(&cfg, &pages, &progress)?;
    } else {
        info!("Using '{}' as base configuration", args.configs[0]);
        warn!("Only the base configuration is considered for memory allocation");

        for path in &args.configs[1..] {
            let mut cfg = base.clone();
            cfg.merge_file(path)?;
            cfg.finalize()?;
            run(&cfg, &pages, &progress)?;
        }
    }

    Ok(())
}

fn run(
    cfg: &Config,
    pages: &PhysPageFinder,
    progress: &indicatif::MultiProgress,
) -> Result<()> {
    let mut sink: Box<dyn FlipSink> = if cfg.report_file.is_empty() {
        Box::new(LogReporter)
    } else {
        Box::new(JsonlReporter::open(&cfg.report_file)?)
    };
    find_flips(cfg, pages, sink.as_mut(), Some(progress.clone()))?;
    Ok(())
}

fn log_page_info(cfg: &Config, pages: &PhysPageFinder) {
    info!(
        "Allocated {} bytes, {} pages present in the page map",
        pages.region_len(),
        pages.page_count()
    );
    if let Some((free, total)) = system_memory() {
        info!(
            "System memory: {} of {} bytes free after allocation",
            free, total
        );
    }
    if !cfg.page_allocation_file.is_empty() {
        match pages.write_allocation_file(&cfg.page_allocation_file) {
            Ok(()) => info!("Page allocation written to {}", cfg.page_allocation_file),
            Err(err) => warn!(
                "Could not write page allocation file {}: {}",
                cfg.page_allocation_file, err
            ),
        }
    }
}
