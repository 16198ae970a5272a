//! Typed session configuration and its INI-style intake.
//!
//! The hammering engine consumes one immutable [`Config`] per run. The
//! record mirrors the documented configuration sections (`dram_layout`,
//! `memory`, `hammer`, `blacksmith`, `temperature`, `report`); unset keys
//! keep their defaults, so a later file can be merged over an earlier one to
//! express base/override configurations. [`Config::finalize`] verifies the
//! result and expands the hammer pattern.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::memory::{DramLayout, LayoutError};
use crate::pattern::{HammerPattern, PatternError};
use crate::util::Rng;

/// Allocation granularity of the hammering memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPageSize {
    /// Regular 4 KiB pages
    FourKb,
    /// 2 MiB hugepages
    TwoMb,
    /// 1 GiB hugepages
    OneGb,
}

impl AllocPageSize {
    /// Page size in bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            AllocPageSize::FourKb => 4 << 10,
            AllocPageSize::TwoMb => 2 << 20,
            AllocPageSize::OneGb => 1 << 30,
        }
    }
}

impl fmt::Display for AllocPageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocPageSize::FourKb => "4kb",
            AllocPageSize::TwoMb => "2mb",
            AllocPageSize::OneGb => "1gb",
        })
    }
}

/// Selection of the hammer kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HammerAlgorithm {
    /// Access + flush reference loop
    Default,
    /// TRRespass-style refresh-aligned loop
    Trrespass,
    /// Inline-assembly loop
    Assembly,
    /// Hand-emitted machine code with configurable NOP padding
    MachineCode,
    /// Refresh-synchronized non-uniform JIT
    Blacksmith,
}

impl HammerAlgorithm {
    /// Configuration-file spelling of the algorithm.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HammerAlgorithm::Default => "default",
            HammerAlgorithm::Trrespass => "trrespass",
            HammerAlgorithm::Assembly => "assembly",
            HammerAlgorithm::MachineCode => "machinecode",
            HammerAlgorithm::Blacksmith => "blacksmith",
        }
    }
}

/// Selection of the memory iteration strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderKind {
    /// Requires a run of physically consecutive pages
    Contiguous,
    /// Walks whatever frames the pool happens to own
    Noncontiguous,
}

/// Window advance policy of the flip finders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterAlgorithm {
    /// Advance one row per window; rows are hammered multiple times
    Default,
    /// Advance by pattern size minus one row; each row is hammered at most
    /// twice
    Fast,
    /// First bank only; stops after one bank (debugging aid)
    Debug,
}

/// Blacksmith flush scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush directly after each access
    EarliestPossible,
    /// Flush only before re-accessing
    LatestPossible,
}

/// Blacksmith fence scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencePolicy {
    /// Accepted for configuration compatibility; emits nothing
    EarliestPossible,
    /// mfence before re-accessing an aggressor
    LatestPossible,
}

/// Errors raised while reading or verifying a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed to parse
    #[error("invalid value '{value}' for {section}.{key}")]
    InvalidValue {
        /// Configuration section
        section: String,
        /// Key within the section
        key: String,
        /// The rejected value
        value: String,
    },
    /// An initialization pattern had no 0x/0b prefix
    #[error("initialization pattern '{value}' must be binary (0b) or hexadecimal (0x)")]
    InitPatternBase {
        /// The rejected value
        value: String,
    },
    /// Row or column masks violate the contiguity requirement
    #[error(transparent)]
    Layout(#[from] LayoutError),
    /// The hammer pattern description is invalid
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// A configured bank does not exist in the layout
    #[error("specified a bank that is out of range [0, {max}]")]
    BankOutOfRange {
        /// Largest valid bank id
        max: u64,
    },
    /// victim_init and aggressor_init lengths differ
    #[error("victim_init and aggressor_init must have same number of items")]
    InitLengthMismatch,
    /// A hammer_order entry is not a valid 1-based aggressor index
    #[error("hammer_order entries must be 1-based indices in [1, {len}]")]
    HammerOrderOutOfRange {
        /// Number of aggressors in the order
        len: usize,
    },
}

/// Immutable session configuration.
///
/// Field defaults match the tool's shipped configuration template; see the
/// individual sections for their INI keys.
#[derive(Debug, Clone)]
pub struct Config {
    // [dram_layout]
    /// Mapping functions and row/column masks of the DIMM under test.
    /// Keys: `functions`, `row_masks`, `col_masks` (comma-separated).
    pub dram_layout: DramLayout,

    // [memory]
    /// Allocation page size: `4kb`, `2mb` or `1gb`. Hugepages must be
    /// reserved in the bootloader configuration.
    pub alloc_page_size: AllocPageSize,
    /// Export file for the page allocation index (empty = disabled).
    pub page_allocation_file: String,
    /// Derive `memory_size` (4 KiB pages) or `hugepage_count` (hugepages)
    /// from the free memory of the machine.
    pub use_free_memory: bool,
    /// Fraction of free memory to allocate when `use_free_memory` is set and
    /// 4 KiB pages are used.
    pub allocate_percentage: f64,
    /// Pool size in bytes (4 KiB pages with `use_free_memory` disabled).
    pub memory_size: u64,
    /// Number of hugepages to map (hugepages with `use_free_memory`
    /// disabled).
    pub hugepage_count: u64,

    // [hammer]
    /// Times the experiment should be executed.
    pub experiment_repetitions: u32,
    /// rdtscp-delta threshold for refresh alignment (trrespass only;
    /// 0 disables the pre-sync).
    pub threshold: u64,
    /// Iterations of the hammer loop per test.
    pub hammer_count: u64,
    /// Number of rows to hammer. May be rounded up during pattern expansion
    /// and is taken from `hammer_order` for the blacksmith algorithm.
    pub aggressor_rows: u32,
    /// Which flip finder walks the pool: `contiguous` or `noncontiguous`.
    pub memory_allocator: FinderKind,
    /// Window advance policy: `default`, `fast` or `debug`. `debug`
    /// deliberately stops after the first bank.
    pub iter_algorithm: IterAlgorithm,
    /// Banks to hammer (empty = all banks of the layout).
    pub banks: Vec<u64>,
    /// Rows around a window that must be owned before hammering it.
    pub row_padding: u64,
    /// Hammer pattern description (`v`, `a`, `x`; `0`/`1` aliases accepted).
    pub pattern_description: String,
    /// Row area over which `x` tokens spread the pattern.
    pub random_pattern_area: u64,
    /// The hammer kernel to run.
    pub hammer_algorithm: HammerAlgorithm,
    /// NOPs between access and flush (machinecode only).
    pub nop_count: u64,
    /// Initialization words for the victim rows.
    pub victim_init: Vec<u64>,
    /// Initialization words for the aggressor rows (empty = inverted
    /// victim_init).
    pub aggressor_init: Vec<u64>,
    /// Minimum rows to test per bank (contiguous only).
    pub test_min_rows: u64,
    /// Maximum rows to test per bank (contiguous only; 0 = unrestricted).
    pub test_max_rows: u64,
    /// First row to test (0 = determine automatically).
    pub test_first_row: u64,
    /// Last row to test (0 = determine automatically).
    pub test_last_row: u64,
    /// Experiment timeout (zero = disabled).
    pub test_max_time: Duration,

    // [blacksmith]
    /// Aggressor access order as 1-based indices into the aggressor list.
    pub hammer_order: Vec<u64>,
    /// Aggressors used for syncing to the refresh.
    pub num_aggs_for_sync: u64,
    /// Total number of row activations per kernel call.
    pub total_num_activations: u64,
    /// Flush scheduling strategy.
    pub flushing: FlushPolicy,
    /// Fence scheduling strategy (`earliest_possible` is a no-op kept for
    /// configuration compatibility).
    pub fencing: FencePolicy,

    // [temperature]
    /// Serial device of the temperature controller (empty = disabled).
    pub device: String,
    /// Target temperatures to test, in degree Celsius.
    pub target_temps: Vec<i64>,
    /// Allowed deviation from the target temperature.
    pub interval: i64,
    /// Timeout for reaching a target temperature.
    pub timeout: Duration,

    // [report]
    /// JSON-lines report file (empty = log-only reporting).
    pub report_file: String,
    /// Free-form comment attached to every emitted run record.
    pub comment: String,

    /// The expanded hammer pattern; rebuilt by [`Config::finalize`].
    pub hammer_pattern: HammerPattern,
}

impl Default for Config {
    fn default() -> Self {
        let aggressor_rows = 24;
        Config {
            dram_layout: DramLayout {
                h_fns: vec![0x2040, 0x44000, 0x88000, 0x110000, 0x220000],
                row_masks: vec![0xffffc0000],
                col_masks: vec![(1 << 13) - 1],
            },
            alloc_page_size: AllocPageSize::FourKb,
            page_allocation_file: String::new(),
            use_free_memory: true,
            allocate_percentage: 0.99,
            memory_size: 16 << 30,
            hugepage_count: 1,
            experiment_repetitions: 1,
            threshold: 0,
            hammer_count: 1_000_000,
            aggressor_rows,
            memory_allocator: FinderKind::Noncontiguous,
            iter_algorithm: IterAlgorithm::Default,
            banks: vec![],
            row_padding: 10,
            pattern_description: "va".into(),
            random_pattern_area: 0,
            hammer_algorithm: HammerAlgorithm::Default,
            nop_count: 80,
            victim_init: vec![0, !0],
            aggressor_init: vec![!0, 0],
            test_min_rows: (aggressor_rows as u64 * 2) + 1,
            test_max_rows: 0,
            test_first_row: 0,
            test_last_row: 0,
            test_max_time: Duration::ZERO,
            hammer_order: vec![],
            num_aggs_for_sync: 2,
            total_num_activations: 5_000_000,
            flushing: FlushPolicy::EarliestPossible,
            fencing: FencePolicy::LatestPossible,
            device: String::new(),
            target_temps: vec![],
            interval: 3,
            timeout: Duration::ZERO,
            report_file: String::new(),
            comment: String::new(),
            hammer_pattern: HammerPattern::expand("va", aggressor_rows, 0, &mut Rng::from_seed(0))
                .expect("default pattern is valid"),
        }
    }
}

type Ini = HashMap<String, HashMap<String, String>>;

fn parse_ini(text: &str) -> Ini {
    let mut ini: Ini = HashMap::new();
    let mut section = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.to_string();
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            ini.entry(section.clone())
                .or_default()
                .insert(key.to_string(), value.trim().to_string());
        }
    }
    ini
}

fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_list<T>(s: &str, parse: impl Fn(&str) -> Option<T>) -> Option<Vec<T>> {
    if s.is_empty() {
        return Some(vec![]);
    }
    s.split(',').map(|item| parse(item.trim())).collect()
}

/// `[hh:][mm:]ss`; the original tool maps malformed component counts to a
/// zero duration, which is mirrored here.
fn parse_duration(s: &str) -> Option<Duration> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return Some(Duration::ZERO);
    }
    let mut secs = 0u64;
    for part in parts {
        secs = secs * 60 + part.parse::<u64>().ok()?;
    }
    Some(Duration::from_secs(secs))
}

/// Checks for a correct initialization pattern and converts it to a 64-bit
/// word, repeating or truncating the digits to the full word width.
fn parse_init_pattern(s: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InitPatternBase { value: s.into() };
    let (prefix, digits) = s.split_at_checked(2).ok_or_else(invalid)?;
    let (radix, length) = match prefix {
        "0x" => (16, 16),
        "0b" => (2, 64),
        _ => return Err(invalid()),
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    if !digits.len().is_power_of_two() {
        warn!("Length of initialization pattern is not a power of two");
    }
    if digits.len() > length {
        warn!(
            "Maximum length of initialization pattern is {}, truncating pattern",
            length
        );
    }
    let repeated = digits.repeat(length.div_ceil(digits.len()));
    u64::from_str_radix(&repeated[..length], radix).map_err(|_| invalid())
}

fn take<T>(
    ini: &Ini,
    section: &str,
    key: &str,
    out: &mut T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<(), ConfigError> {
    if let Some(value) = ini.get(section).and_then(|s| s.get(key)) {
        *out = parse(value).ok_or_else(|| ConfigError::InvalidValue {
            section: section.into(),
            key: key.into(),
            value: value.clone(),
        })?;
    }
    Ok(())
}

impl Config {
    /// Merges the configuration file at `path` over the current values.
    ///
    /// A file that cannot be read logs a warning and leaves the
    /// configuration untouched (the tool proceeds with defaults), returning
    /// `false`.
    ///
    /// # Errors
    ///
    /// Returns an error for values that fail to parse.
    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<bool, ConfigError> {
        let path = path.as_ref();
        info!("Parsing configuration file '{}'", path.display());
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    "Could not read configuration file '{}' ({}), proceeding with current configuration",
                    path.display(),
                    err
                );
                return Ok(false);
            }
        };
        self.merge_str(&text)?;
        Ok(true)
    }

    /// Merges INI-formatted `text` over the current values.
    ///
    /// # Errors
    ///
    /// Returns an error for values that fail to parse.
    pub fn merge_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let ini = parse_ini(text);

        // dram_layout
        let u64_list = |s: &str| parse_list(s, parse_u64);
        take(&ini, "dram_layout", "functions", &mut self.dram_layout.h_fns, u64_list)?;
        take(&ini, "dram_layout", "row_masks", &mut self.dram_layout.row_masks, u64_list)?;
        take(&ini, "dram_layout", "col_masks", &mut self.dram_layout.col_masks, u64_list)?;

        // memory
        take(&ini, "memory", "alloc_page_size", &mut self.alloc_page_size, |s| {
            match s {
                "4kb" => Some(AllocPageSize::FourKb),
                "2mb" => Some(AllocPageSize::TwoMb),
                "1gb" => Some(AllocPageSize::OneGb),
                _ => None,
            }
        })?;
        take(&ini, "memory", "page_allocation_file", &mut self.page_allocation_file, str_value)?;
        take(&ini, "memory", "use_free_memory", &mut self.use_free_memory, parse_bool)?;
        take(&ini, "memory", "allocate_percentage", &mut self.allocate_percentage, |s| {
            s.parse().ok()
        })?;
        take(&ini, "memory", "memory_size", &mut self.memory_size, parse_u64)?;
        take(&ini, "memory", "hugepage_count", &mut self.hugepage_count, parse_u64)?;

        // blacksmith, before [hammer]: the order determines the aggressor
        // count when the blacksmith algorithm is selected
        take(&ini, "blacksmith", "hammer_order", &mut self.hammer_order, u64_list)?;
        take(&ini, "blacksmith", "num_aggs_for_sync", &mut self.num_aggs_for_sync, parse_u64)?;
        take(&ini, "blacksmith", "total_num_activations", &mut self.total_num_activations, parse_u64)?;
        take(&ini, "blacksmith", "flushing", &mut self.flushing, |s| match s {
            "earliest_possible" => Some(FlushPolicy::EarliestPossible),
            "latest_possible" => Some(FlushPolicy::LatestPossible),
            _ => None,
        })?;
        take(&ini, "blacksmith", "fencing", &mut self.fencing, |s| match s {
            "earliest_possible" => Some(FencePolicy::EarliestPossible),
            "latest_possible" => Some(FencePolicy::LatestPossible),
            _ => None,
        })?;

        // hammer
        take(&ini, "hammer", "experiment_repetitions", &mut self.experiment_repetitions, |s| {
            s.parse().ok()
        })?;
        take(&ini, "hammer", "threshold", &mut self.threshold, parse_u64)?;
        take(&ini, "hammer", "hammer_count", &mut self.hammer_count, parse_u64)?;
        take(&ini, "hammer", "aggressor_rows", &mut self.aggressor_rows, |s| s.parse().ok())?;
        take(&ini, "hammer", "memory_allocator", &mut self.memory_allocator, |s| match s {
            "contiguous" => Some(FinderKind::Contiguous),
            "noncontiguous" => Some(FinderKind::Noncontiguous),
            _ => None,
        })?;
        take(&ini, "hammer", "iter_algorithm", &mut self.iter_algorithm, |s| match s {
            "default" => Some(IterAlgorithm::Default),
            "fast" => Some(IterAlgorithm::Fast),
            "debug" => Some(IterAlgorithm::Debug),
            _ => None,
        })?;
        take(&ini, "hammer", "banks", &mut self.banks, u64_list)?;
        take(&ini, "hammer", "row_padding", &mut self.row_padding, parse_u64)?;
        take(&ini, "hammer", "hammer_algorithm", &mut self.hammer_algorithm, |s| match s {
            "default" => Some(HammerAlgorithm::Default),
            "trrespass" => Some(HammerAlgorithm::Trrespass),
            "assembly" => Some(HammerAlgorithm::Assembly),
            "machinecode" => Some(HammerAlgorithm::MachineCode),
            "blacksmith" => Some(HammerAlgorithm::Blacksmith),
            _ => None,
        })?;
        take(&ini, "hammer", "random_pattern_area", &mut self.random_pattern_area, parse_u64)?;
        // 0/1 are aliases for v/a in pattern descriptions
        take(&ini, "hammer", "hammer_pattern", &mut self.pattern_description, |s| {
            Some(s.replace('0', "v").replace('1', "a"))
        })?;
        take(&ini, "hammer", "nop_count", &mut self.nop_count, parse_u64)?;
        if let Some(value) = ini.get("hammer").and_then(|s| s.get("victim_init")) {
            self.victim_init = split_init_patterns(value)?;
        }
        if let Some(value) = ini.get("hammer").and_then(|s| s.get("aggressor_init")) {
            self.aggressor_init = split_init_patterns(value)?;
        }
        take(&ini, "hammer", "test_min_rows", &mut self.test_min_rows, parse_u64)?;
        take(&ini, "hammer", "test_max_rows", &mut self.test_max_rows, parse_u64)?;
        take(&ini, "hammer", "test_first_row", &mut self.test_first_row, parse_u64)?;
        take(&ini, "hammer", "test_last_row", &mut self.test_last_row, parse_u64)?;
        take(&ini, "hammer", "test_max_time", &mut self.test_max_time, parse_duration)?;

        // temperature
        take(&ini, "temperature", "device", &mut self.device, str_value)?;
        take(&ini, "temperature", "target_temps", &mut self.target_temps, |s| {
            parse_list(s, |item| item.parse().ok())
        })?;
        take(&ini, "temperature", "interval", &mut self.interval, |s| s.parse().ok())?;
        take(&ini, "temperature", "timeout", &mut self.timeout, parse_duration)?;

        // report
        take(&ini, "report", "file", &mut self.report_file, str_value)?;
        take(&ini, "report", "comment", &mut self.comment, str_value)?;

        Ok(())
    }

    /// Verifies the merged values and expands the hammer pattern.
    ///
    /// Normalizations performed here: the bank list defaults to all banks of
    /// the layout, `test_max_rows` is raised to its minimum legal value with
    /// a warning, an empty `aggressor_init` becomes the inverted
    /// `victim_init`, and `aggressor_rows` is adjusted to the expansion
    /// (or to `hammer_order.len()` for the blacksmith algorithm).
    ///
    /// # Errors
    ///
    /// Returns a pointed [`ConfigError`] for inconsistent values.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        self.dram_layout.verify()?;

        let banks_cnt = self.dram_layout.banks();
        if self.banks.is_empty() {
            self.banks = (0..banks_cnt).collect();
        } else if self.banks.iter().any(|&b| b >= banks_cnt) {
            return Err(ConfigError::BankOutOfRange { max: banks_cnt - 1 });
        }

        let test_max_rows_lb = self.test_min_rows + self.row_padding * 2;
        if self.test_max_rows > 0 && self.test_max_rows < test_max_rows_lb {
            self.test_max_rows = test_max_rows_lb;
            warn!(
                "Changed value of test_max_rows to minimum allowed value {} (test_min_rows + 2 * row_padding)",
                self.test_max_rows
            );
        }

        if self.aggressor_init.is_empty() {
            self.aggressor_init = self.victim_init.iter().map(|v| !v).collect();
        }
        if self.victim_init.len() != self.aggressor_init.len() {
            return Err(ConfigError::InitLengthMismatch);
        }

        if self.hammer_algorithm == HammerAlgorithm::Blacksmith {
            let len = self.hammer_order.len();
            if self.hammer_order.iter().any(|&i| i == 0 || i > len as u64) {
                return Err(ConfigError::HammerOrderOutOfRange { len });
            }
            self.aggressor_rows = len as u32;
        }

        let mut rng = Rng::from_seed(rand::random());
        let pattern = HammerPattern::expand(
            &self.pattern_description,
            self.aggressor_rows,
            self.random_pattern_area,
            &mut rng,
        )?;
        if pattern.aggressors() != self.aggressor_rows {
            info!(
                "Increased aggressor_rows from {} to {} to cover whole pattern periods",
                self.aggressor_rows,
                pattern.aggressors()
            );
            self.aggressor_rows = pattern.aggressors();
        }
        self.hammer_pattern = pattern;

        Ok(())
    }
}

fn str_value(s: &str) -> Option<String> {
    Some(s.to_string())
}

fn split_init_patterns(value: &str) -> Result<Vec<u64>, ConfigError> {
    if value.is_empty() {
        return Ok(vec![]);
    }
    value
        .split(',')
        .map(|item| parse_init_pattern(item.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_finalize() {
        let mut cfg = Config::default();
        cfg.finalize().expect("defaults must verify");
        assert_eq!(cfg.banks.len(), 32);
        assert_eq!(cfg.aggressor_rows, 24);
        assert_eq!(cfg.hammer_pattern.aggressors(), 24);
        assert_eq!(cfg.test_min_rows, 49);
    }

    #[test]
    fn test_merge_and_finalize() {
        let mut cfg = Config::default();
        cfg.merge_str(
            "; memory setup\n\
             [memory]\n\
             alloc_page_size=2mb\n\
             use_free_memory=false\n\
             memory_size=0x40000000\n\
             \n\
             [hammer]\n\
             aggressor_rows=4\n\
             hammer_pattern=1v0a\n\
             banks=1,2,3\n\
             hammer_count=42\n\
             test_max_time=1:02:03\n\
             victim_init=0x00,0xff\n\
             aggressor_init=0xff,0x00\n",
        )
        .unwrap();
        cfg.finalize().unwrap();
        assert_eq!(cfg.alloc_page_size, AllocPageSize::TwoMb);
        assert!(!cfg.use_free_memory);
        assert_eq!(cfg.memory_size, 0x40000000);
        assert_eq!(cfg.pattern_description, "avva");
        assert_eq!(cfg.banks, vec![1, 2, 3]);
        assert_eq!(cfg.hammer_count, 42);
        assert_eq!(cfg.test_max_time, Duration::from_secs(3723));
        assert_eq!(cfg.victim_init, vec![0, !0u64]);
        assert_eq!(cfg.aggressor_init, vec![!0u64, 0]);
        assert_eq!(cfg.hammer_pattern.aggressors(), 4);
    }

    #[test]
    fn test_init_pattern_parsing() {
        assert_eq!(parse_init_pattern("0x00").unwrap(), 0);
        assert_eq!(parse_init_pattern("0xff").unwrap(), !0u64);
        assert_eq!(parse_init_pattern("0xa5").unwrap(), 0xa5a5a5a5a5a5a5a5);
        assert_eq!(parse_init_pattern("0b01").unwrap(), 0x5555555555555555);
        // truncation keeps the leading 16 hex digits
        assert_eq!(
            parse_init_pattern("0x00112233445566778899aabbccddeeff").unwrap(),
            0x0011223344556677
        );
        assert!(matches!(
            parse_init_pattern("123"),
            Err(ConfigError::InitPatternBase { .. })
        ));
        assert!(matches!(
            parse_init_pattern("0x"),
            Err(ConfigError::InitPatternBase { .. })
        ));
    }

    #[test]
    fn test_inverted_aggressor_init_default() {
        let mut cfg = Config::default();
        cfg.merge_str("[hammer]\nvictim_init=0x0f\naggressor_init=\n")
            .unwrap();
        cfg.finalize().unwrap();
        assert_eq!(cfg.victim_init, vec![0x0f0f0f0f0f0f0f0f]);
        assert_eq!(cfg.aggressor_init, vec![0xf0f0f0f0f0f0f0f0]);
    }

    #[test]
    fn test_init_length_mismatch() {
        let mut cfg = Config::default();
        cfg.merge_str("[hammer]\nvictim_init=0x00,0xff\naggressor_init=0xff\n")
            .unwrap();
        assert!(matches!(
            cfg.finalize(),
            Err(ConfigError::InitLengthMismatch)
        ));
    }

    #[test]
    fn test_max_rows_normalized_upward() {
        let mut cfg = Config::default();
        cfg.merge_str("[hammer]\ntest_max_rows=5\n").unwrap();
        cfg.finalize().unwrap();
        // test_min_rows (49) + 2 * row_padding (10)
        assert_eq!(cfg.test_max_rows, 69);
    }

    #[test]
    fn test_bank_out_of_range() {
        let mut cfg = Config::default();
        cfg.merge_str("[hammer]\nbanks=31,32\n").unwrap();
        assert!(matches!(
            cfg.finalize(),
            Err(ConfigError::BankOutOfRange { max: 31 })
        ));
    }

    #[test]
    fn test_blacksmith_order_sets_aggressor_rows() {
        let mut cfg = Config::default();
        cfg.merge_str(
            "[hammer]\nhammer_algorithm=blacksmith\n\
             [blacksmith]\nhammer_order=2,1,4,3,5,6\n",
        )
        .unwrap();
        cfg.finalize().unwrap();
        assert_eq!(cfg.aggressor_rows, 6);

        cfg.merge_str("[blacksmith]\nhammer_order=1,7\n").unwrap();
        assert!(matches!(
            cfg.finalize(),
            Err(ConfigError::HammerOrderOutOfRange { len: 2 })
        ));
    }

    #[test]
    fn test_invalid_value_is_pointed() {
        let mut cfg = Config::default();
        let err = cfg
            .merge_str("[memory]\nalloc_page_size=8kb\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("memory.alloc_page_size"));
    }

    #[test]
    fn test_non_contiguous_mask_rejected() {
        let mut cfg = Config::default();
        cfg.merge_str("[dram_layout]\nrow_masks=0xf0f00000\n").unwrap();
        assert!(matches!(cfg.finalize(), Err(ConfigError::Layout(_))));
    }
}
