//! # mallet-core
//!
//! `mallet-core` is the engine of the mallet Rowhammer template-discovery
//! tool. Running as a privileged process on an x86-64 Linux host, it
//! allocates a large pool of physical memory, enumerates the frames it
//! owns, and repeatedly stresses chosen aggressor rows to induce bit flips
//! in nearby victim rows. Discovered flips are emitted as structured events
//! so a downstream runtime can reproduce them.
//!
//! ## Main components
//!
//! - [`memory`] - the DRAM address model ([`memory::DramAddr`],
//!   [`memory::DramLayout`]) and the physical page acquirer
//!   ([`memory::PhysPageFinder`]).
//! - [`pattern`] - expansion of textual hammer patterns into dense
//!   victim/aggressor sequences.
//! - [`flipper`] - row initialization, the five hammer kernels (`default`,
//!   `trrespass`, `assembly`, `machinecode`, `blacksmith`) and the flip
//!   scan.
//! - [`finder`] - the contiguous and non-contiguous walkers and the
//!   experiment loop with temperature control, timeout and SIGINT handling.
//! - [`config`] - the typed session configuration and its INI intake.
//! - [`report`] - the structured event sink.
//!
//! ## Platform support
//!
//! x86-64 Linux only: the engine relies on `/proc/self/pagemap`, hugepage
//! mappings, `clflush`/`clflushopt`, `mfence`/`lfence` and `rdtscp`, and it
//! executes generated code from anonymous RWX mappings. Real frame numbers
//! require root.

#![warn(missing_docs)]

pub mod config;
pub mod finder;
pub mod flipper;
pub mod memory;
pub mod pattern;
pub mod report;
pub mod temperature;
pub mod util;

pub use crate::config::Config;
pub use crate::finder::{FinderError, find_flips};
pub use crate::flipper::{BitFlip, BitFlipper, HammerAddrs};
pub use crate::memory::{DramAddr, DramLayout, PhysAddr, PhysPageFinder};
pub use crate::pattern::HammerPattern;
pub use crate::report::{FlipSink, JsonlReporter, LogReporter};
