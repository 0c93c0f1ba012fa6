//! Garage exit-lane reconciliation daemon.
//!
//! A fixed camera watches the exit lane of a parking garage. This crate
//! drives one repeating cycle: capture a frame, run license-plate
//! recognition on it, parse the recognizer output into ranked candidates,
//! look the best plate up in the vehicle ledger, and close the matching
//! open visit (`in_garage` -> `exited`).
//!
//! # Module Structure
//!
//! - `capture`: frame sources (stills spool directory, `stub://` synthetic)
//! - `alpr`: recognizer invocation (subprocess with deadline) and output parsing
//! - `ledger`: vehicle visit store (SQLite, plus in-memory for tests)
//! - `engine`: the reconciliation cycle and the outer loop
//! - `config`: daemon configuration (JSON file + `EXITLANE_*` env overrides)
//!
//! The daemon never terminates on a single bad cycle. Capture, recognition
//! and ledger failures are transient: the cycle is abandoned, logged, and
//! the loop carries on after its configured interval. Only configuration
//! errors at startup are fatal.

pub mod alpr;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ledger;

pub use alpr::{parse_candidates, AlprConfig, AlprRecognizer, Candidate, PlateRecognizer, Region};
pub use capture::{CameraConfig, CameraSource, FrameSource};
pub use config::ExitLaneConfig;
pub use engine::{CycleOutcome, MatchPolicy, ReconciliationEngine};
pub use error::{Error, Result};
pub use frame::Frame;
pub use ledger::{
    InMemoryVehicleLedger, SqliteVehicleLedger, VehicleLedger, VehicleRecord, VisitId, VisitStatus,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as whole seconds since the Unix epoch.
///
/// Exit timestamps are stored at second granularity; a pre-epoch system
/// clock collapses to zero rather than aborting a cycle.
pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
