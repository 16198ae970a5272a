//! Replays previously recorded bit flips.
//!
//! Reads an address file with one flip record per line: comma-separated
//! tokens, the first of which is metadata; the last token is the victim's
//! physical byte address (rounded down to its row start), the tokens in
//! between are the aggressor addresses.

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use mallet::{apply_free_memory, init_logging};
use mallet_core::memory::PhysAddr;
use mallet_core::report::LogReporter;
use mallet_core::util::ROW_SIZE;
use mallet_core::{BitFlipper, Config, HammerAddrs, PhysPageFinder};

/// Validates recorded bit flips by hammering their aggressors again.
#[derive(Debug, Parser)]
#[clap(version)]
struct CliArgs {
    /// Address file with one flip record per line
    addresses: String,
    /// Configuration file
    #[clap(default_value = "config.ini")]
    config: String,
}

fn parse_hex(token: &str) -> Result<u64> {
    let token = token.trim();
    u64::from_str_radix(token.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid hex token '{}'", token))
}

fn read_addr_file(path: &str) -> Result<Vec<HammerAddrs>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read address file '{}'", path))?;

    let mut records = vec![];
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let tokens: Vec<&str> = line.split(',').collect();
        if tokens.len() < 2 {
            bail!("malformed record '{}': expected at least 2 tokens", line);
        }

        // the first token is metadata, the last the victim address, the
        // tokens in between the aggressors
        let victim = parse_hex(tokens[tokens.len() - 1])?;
        let mut addrs = HammerAddrs {
            victims: vec![PhysAddr::new(victim / ROW_SIZE as u64 * ROW_SIZE as u64)],
            aggs: vec![],
        };
        for token in &tokens[1..tokens.len() - 1] {
            addrs.aggs.push(PhysAddr::new(parse_hex(token)?));
        }
        records.push(addrs);
    }
    Ok(records)
}

fn main() -> Result<()> {
    // replaying known flips is a diagnostic session, default to verbose
    let _progress = init_logging("debug")?;
    let args = CliArgs::parse();

    let mut cfg = Config::default();
    cfg.merge_file(&args.config)?;
    apply_free_memory(&mut cfg);
    cfg.finalize()?;

    let records = read_addr_file(&args.addresses)?;
    info!("Validating {} flip record(s)", records.len());

    // the page finder allocates the free or configured memory
    let pages = PhysPageFinder::new(&cfg)?;

    let mut sink = LogReporter;
    for addrs in records {
        let mut flipper = BitFlipper::new(&cfg, addrs, None);
        if !flipper.find_pages(&pages) {
            info!("Could not find physical pages");
            continue;
        }
        flipper.hammer(&mut sink)?;
    }

    Ok(())
}
