//! Utility types used throughout the mallet crate.
//!
//! This module provides:
//! - Constants for page, row and cache-line geometry ([`PAGE_SIZE`],
//!   [`ROW_SIZE`], [`CL_SIZE`], ...)
//! - Cooperative cancellation primitives ([`cancel`])
//! - Seedable random number generation ([`Rng`])
//! - Progress-bar styling ([`NamedProgress`])

pub mod cancel;
mod constants;
mod progress;
mod rng;

pub use self::constants::*;
pub use self::progress::NamedProgress;
pub use self::rng::Rng;
