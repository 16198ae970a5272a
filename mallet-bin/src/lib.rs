//! # mallet
//!
//! mallet is a DRAM Rowhammer template-discovery tool. It allocates a large
//! pool of physical memory, walks the rows it owns bank by bank, and
//! hammers configurable aggressor patterns to record which cells flip.
//!
//! ## Quickstart
//!
//! ```sh
//! cargo build --release
//! sudo ./target/release/templater config.ini
//! ```
//!
//! The `templater` binary runs the discovery loop described by the given
//! configuration file; `validator` replays previously recorded flips. Both
//! must run as root to read real frame numbers from `/proc/self/pagemap`.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Initializes env_logger behind an indicatif bridge, so log lines and
/// progress bars do not tear each other.
///
/// `default_filter` applies when `RUST_LOG` is unset; the discovery loop
/// runs at `info` to narrate windows and flips, the validator defaults to
/// `debug` since replaying known flips is a diagnostic session.
pub fn init_logging(default_filter: &str) -> anyhow::Result<MultiProgress> {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let logger = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Free and total physical memory of the machine, in bytes.
pub fn system_memory() -> Option<(u64, u64)> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    let unit = info.mem_unit as u64;
    Some((info.freeram * unit, info.totalram * unit))
}

/// Applies the free-memory sizing policy to the configuration.
///
/// With `use_free_memory` set and 4 KiB pages configured, the pool size
/// becomes the configured percentage of the currently free memory.
pub fn apply_free_memory(cfg: &mut mallet_core::Config) {
    if !cfg.use_free_memory {
        return;
    }
    match system_memory() {
        Some((free, _)) => {
            cfg.memory_size = (free as f64 * cfg.allocate_percentage) as u64;
        }
        None => log::warn!("Could not retrieve sysinfo"),
    }
}
