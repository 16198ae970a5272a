//! Structured flip reporting.
//!
//! The hammering engine emits events through the [`FlipSink`] trait; how a
//! surrounding tool stores them is not part of the engine. Two
//! implementations ship with the crate: [`JsonlReporter`] appends one JSON
//! object per event to a file, [`LogReporter`] only logs. Sink failures are
//! never fatal - callers log them and the run continues without persisting
//! the offending record.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use log::{info, trace};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::flipper::BitFlip;
use crate::memory::PhysAddr;

/// Errors raised by report sinks.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Writing the report failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serializing an event failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Metadata describing one experiment run.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    /// Number of aggressor rows per window
    pub aggressor_rows: u32,
    /// Hammer-loop iterations per test
    pub hammer_count: u64,
    /// Name of the hammer kernel
    pub hammer_algorithm: &'static str,
    /// The pattern description the run was configured with
    pub pattern: String,
    /// Target temperature, when temperature control is active
    pub target_temperature: Option<i64>,
    /// Free-form comment from the configuration
    pub comment: String,
}

/// Metadata describing one hammer-and-check invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TestInfo {
    /// Physical row addresses of the aggressors
    pub aggressors: Vec<u64>,
    /// Victim initialization word
    pub victim_init: u64,
    /// Aggressor initialization word
    pub aggressor_init: u64,
    /// Actual temperature at hammer time, when measured
    pub temperature: Option<i64>,
}

impl TestInfo {
    /// Builds the test metadata from physical aggressor addresses.
    pub fn new(
        aggressors: &[PhysAddr],
        victim_init: u64,
        aggressor_init: u64,
        temperature: Option<i64>,
    ) -> Self {
        TestInfo {
            aggressors: aggressors.iter().map(|a| a.as_u64()).collect(),
            victim_init,
            aggressor_init,
            temperature,
        }
    }
}

/// Receiver for structured hammering events.
///
/// Events between [`begin_transaction`](FlipSink::begin_transaction) and
/// [`commit`](FlipSink::commit) belong to one hammer invocation and are
/// persisted together.
pub trait FlipSink {
    /// Starts a new experiment run.
    fn begin_run(&mut self, info: &RunInfo) -> Result<(), ReportError>;
    /// Ends the current experiment run.
    fn end_run(&mut self) -> Result<(), ReportError>;
    /// Opens the transaction wrapping one hammer invocation.
    fn begin_transaction(&mut self) -> Result<(), ReportError>;
    /// Commits the events recorded since the transaction began.
    fn commit(&mut self) -> Result<(), ReportError>;
    /// Records one hammer-and-check test.
    fn record_test(&mut self, test: &TestInfo) -> Result<(), ReportError>;
    /// Records one observed bit flip.
    fn record_flip(&mut self, flip: &BitFlip) -> Result<(), ReportError>;
}

/// Logging-only sink, the default when no report file is configured.
#[derive(Debug, Default)]
pub struct LogReporter;

impl FlipSink for LogReporter {
    fn begin_run(&mut self, info: &RunInfo) -> Result<(), ReportError> {
        info!(
            "Starting run: {} aggressors, {} hammers, algorithm {}",
            info.aggressor_rows, info.hammer_count, info.hammer_algorithm
        );
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), ReportError> {
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), ReportError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ReportError> {
        Ok(())
    }

    fn record_test(&mut self, test: &TestInfo) -> Result<(), ReportError> {
        trace!(
            "test: {} aggressors, init 0x{:016x}/0x{:016x}",
            test.aggressors.len(),
            test.victim_init,
            test.aggressor_init
        );
        Ok(())
    }

    fn record_flip(&mut self, _flip: &BitFlip) -> Result<(), ReportError> {
        // the flipper already logs every flip
        Ok(())
    }
}

/// JSON-lines report writer.
///
/// Emits one object per event, tagged with `kind` (`run`, `run_end`, `test`,
/// `flip`) and an RFC 3339 timestamp. Events of one transaction are buffered
/// and written at commit, so an aborted hammer invocation leaves no partial
/// records.
pub struct JsonlReporter {
    writer: BufWriter<File>,
    pending: Vec<serde_json::Value>,
    in_transaction: bool,
}

impl JsonlReporter {
    /// Opens (and appends to) the report file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &str) -> Result<Self, ReportError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Writing flip reports to {}", path);
        Ok(JsonlReporter {
            writer: BufWriter::new(file),
            pending: Vec::new(),
            in_transaction: false,
        })
    }

    fn emit(&mut self, event: serde_json::Value) -> Result<(), ReportError> {
        if self.in_transaction {
            self.pending.push(event);
            return Ok(());
        }
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn tagged(kind: &str, payload: serde_json::Value) -> serde_json::Value {
        json!({
            "kind": kind,
            "time": chrono::Local::now().to_rfc3339(),
            "data": payload,
        })
    }
}

impl FlipSink for JsonlReporter {
    fn begin_run(&mut self, run: &RunInfo) -> Result<(), ReportError> {
        self.emit(Self::tagged("run", serde_json::to_value(run)?))
    }

    fn end_run(&mut self) -> Result<(), ReportError> {
        self.emit(Self::tagged("run_end", json!({})))?;
        self.writer.flush()?;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), ReportError> {
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ReportError> {
        self.in_transaction = false;
        for event in std::mem::take(&mut self.pending) {
            self.emit(event)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn record_test(&mut self, test: &TestInfo) -> Result<(), ReportError> {
        self.emit(Self::tagged("test", serde_json::to_value(test)?))
    }

    fn record_flip(&mut self, flip: &BitFlip) -> Result<(), ReportError> {
        self.emit(Self::tagged("flip", serde_json::to_value(flip)?))
    }
}
