//! The reconciliation engine.
//!
//! One cycle walks `Idle -> Capturing -> Recognizing -> Matching ->
//! Updating -> Idle`: grab a frame, run recognition on it, pick the best
//! qualifying candidate, look it up among open visits, and close the match
//! with a compare-and-set. Every policy decision lives here: the
//! minimum-confidence gate, the multi-match tie-break, and the rule that a
//! transient failure abandons the cycle instead of the process.
//!
//! The loop is a single logical worker. Cycles never overlap, and a stop
//! signal is honored between cycles, never mid-cycle, so the updating step
//! is always a single atomic operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::alpr::{parse_candidates, Candidate, PlateRecognizer};
use crate::capture::FrameSource;
use crate::error::Result;
use crate::ledger::{VehicleLedger, VehicleRecord, VisitId};
use crate::now_s;

/// Phase of the current cycle. Always returns to `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Capturing,
    Recognizing,
    Matching,
    Updating,
}

/// How one completed cycle ended. Abandoned cycles surface as `Err` from
/// `run_cycle` instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No candidate qualified (nothing recognized, or everything fell
    /// below the confidence minimum). The ledger was not consulted.
    NoPlate,
    /// A plate was recognized but no open visit matched it, or another
    /// writer closed the visit first.
    NotFound { plate: String },
    /// An open visit was closed.
    Exited { plate: String, visit: VisitId },
}

/// Matching policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct MatchPolicy {
    /// Candidates with a reported confidence below this are rejected.
    /// Candidates with no reported confidence pass the gate.
    pub min_confidence: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 70.0,
        }
    }
}

pub struct ReconciliationEngine<S, R, L> {
    camera: S,
    recognizer: R,
    ledger: L,
    policy: MatchPolicy,
    cycle_interval: Duration,
    phase: CyclePhase,
    cycles_run: u64,
}

/// Granularity of the between-cycle sleep; a stop signal is noticed within
/// one slice.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl<S, R, L> ReconciliationEngine<S, R, L>
where
    S: FrameSource,
    R: PlateRecognizer,
    L: VehicleLedger,
{
    pub fn new(
        camera: S,
        recognizer: R,
        ledger: L,
        policy: MatchPolicy,
        cycle_interval: Duration,
    ) -> Self {
        Self {
            camera,
            recognizer,
            ledger,
            policy,
            cycle_interval,
            phase: CyclePhase::Idle,
            cycles_run: 0,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!("cycle #{}: {:?}", self.cycles_run, phase);
        self.phase = phase;
    }

    /// Run one full cycle. Transient errors abandon the cycle and are
    /// reported to the caller; the ledger is untouched on every path that
    /// does not reach `Updating`.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycles_run += 1;

        self.enter(CyclePhase::Capturing);
        let frame = self.camera.capture()?;

        self.enter(CyclePhase::Recognizing);
        let raw = self.recognizer.recognize(&frame)?;
        // The frame is owned by this cycle and done with once recognition
        // has run.
        drop(frame);

        self.enter(CyclePhase::Matching);
        let candidates = parse_candidates(&raw);
        let Some(candidate) = self.select_candidate(&candidates) else {
            return Ok(CycleOutcome::NoPlate);
        };
        let plate = candidate.plate.clone();

        let matches = self.ledger.find_in_garage(&plate)?;
        let Some(record) = Self::pick_open_visit(&plate, matches) else {
            return Ok(CycleOutcome::NotFound { plate });
        };

        self.enter(CyclePhase::Updating);
        if self.ledger.mark_exited(record.id, now_s())? {
            Ok(CycleOutcome::Exited {
                plate,
                visit: record.id,
            })
        } else {
            // Lost the race: another writer closed this visit after our
            // lookup. The record is terminal either way.
            warn!("visit {} for plate {} was already closed", record.id, plate);
            Ok(CycleOutcome::NotFound { plate })
        }
    }

    /// First candidate, in recognizer rank order, that passes the
    /// confidence gate.
    fn select_candidate<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        for candidate in candidates {
            if candidate.plate.is_empty() {
                continue;
            }
            match candidate.confidence {
                Some(conf) if conf < self.policy.min_confidence => {
                    info!(
                        "candidate {} rejected: confidence {:.1} below minimum {:.1}",
                        candidate.plate, conf, self.policy.min_confidence
                    );
                }
                _ => return Some(candidate),
            }
        }
        None
    }

    /// Resolve the ledger lookup. More than one open visit for a plate
    /// violates the entry-side invariant; take the most recent entry and
    /// warn.
    fn pick_open_visit(plate: &str, matches: Vec<VehicleRecord>) -> Option<VehicleRecord> {
        if matches.len() > 1 {
            warn!(
                "ledger inconsistency: {} open visits for plate {}, taking most recent entry",
                matches.len(),
                plate
            );
        }
        // `find_in_garage` orders most-recent entry first.
        matches.into_iter().next()
    }

    /// Run cycles until `shutdown` is set. No cycle error terminates the
    /// loop; transient failures are logged and the next cycle starts after
    /// the configured interval.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!(
            "reconciliation loop started (min confidence {:.1}, interval {:?})",
            self.policy.min_confidence, self.cycle_interval
        );
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_cycle() {
                Ok(CycleOutcome::Exited { plate, visit }) => {
                    info!("recorded exit for plate {} (visit {})", plate, visit);
                }
                Ok(CycleOutcome::NotFound { plate }) => {
                    info!("plate {} not found or already exited", plate);
                }
                Ok(CycleOutcome::NoPlate) => {
                    debug!("no qualifying plate this cycle");
                }
                Err(e) => {
                    warn!("cycle #{} abandoned: {}", self.cycles_run, e);
                }
            }
            self.enter(CyclePhase::Idle);
            self.sleep_between_cycles(shutdown);
        }
        self.enter(CyclePhase::Idle);
        info!("reconciliation loop stopped after {} cycles", self.cycles_run);
    }

    fn sleep_between_cycles(&self, shutdown: &AtomicBool) {
        let deadline = Instant::now() + self.cycle_interval;
        while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(SHUTDOWN_POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::frame::Frame;
    use crate::ledger::{InMemoryVehicleLedger, VisitStatus};

    struct StaticCamera;

    impl FrameSource for StaticCamera {
        fn capture(&mut self) -> Result<Frame> {
            Ok(Frame::new(vec![0u8; 16], 4, 4))
        }
    }

    struct FailingCamera;

    impl FrameSource for FailingCamera {
        fn capture(&mut self) -> Result<Frame> {
            Err(Error::Capture("camera unavailable".into()))
        }
    }

    /// Returns a fixed raw output and counts invocations, so tests can
    /// assert the recognizer was (or was not) reached.
    struct ScriptedRecognizer {
        raw: String,
        calls: u64,
    }

    impl ScriptedRecognizer {
        fn new(raw: &str) -> Self {
            Self {
                raw: raw.to_string(),
                calls: 0,
            }
        }
    }

    impl PlateRecognizer for ScriptedRecognizer {
        fn recognize(&mut self, _frame: &Frame) -> Result<String> {
            self.calls += 1;
            Ok(self.raw.clone())
        }
    }

    /// Ledger wrapper counting lookups, for asserting "no ledger query
    /// issued" outcomes.
    struct CountingLedger {
        inner: InMemoryVehicleLedger,
        finds: u64,
    }

    impl CountingLedger {
        fn new(inner: InMemoryVehicleLedger) -> Self {
            Self { inner, finds: 0 }
        }
    }

    impl VehicleLedger for CountingLedger {
        fn record_entry(&mut self, plate: &str, entry_ts: u64) -> Result<VisitId> {
            self.inner.record_entry(plate, entry_ts)
        }

        fn find_in_garage(&mut self, plate: &str) -> Result<Vec<VehicleRecord>> {
            self.finds += 1;
            self.inner.find_in_garage(plate)
        }

        fn mark_exited(&mut self, id: VisitId, exit_ts: u64) -> Result<bool> {
            self.inner.mark_exited(id, exit_ts)
        }

        fn open_visits(&mut self) -> Result<Vec<VehicleRecord>> {
            self.inner.open_visits()
        }

        fn recent_visits(&mut self, limit: usize) -> Result<Vec<VehicleRecord>> {
            self.inner.recent_visits(limit)
        }

        fn get(&mut self, id: VisitId) -> Result<Option<VehicleRecord>> {
            self.inner.get(id)
        }
    }

    fn engine_with(
        raw: &str,
        ledger: CountingLedger,
        min_confidence: f32,
    ) -> ReconciliationEngine<StaticCamera, ScriptedRecognizer, CountingLedger> {
        ReconciliationEngine::new(
            StaticCamera,
            ScriptedRecognizer::new(raw),
            ledger,
            MatchPolicy { min_confidence },
            Duration::from_millis(1),
        )
    }

    #[test]
    fn recognized_open_vehicle_is_exited() {
        let mut inner = InMemoryVehicleLedger::new();
        let id = inner.record_entry("ABC1234", 1_000).unwrap();
        let mut engine = engine_with(
            "Plate found\n1 ABC1234 confidence: 95.2",
            CountingLedger::new(inner),
            70.0,
        );

        let outcome = engine.run_cycle().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Exited {
                plate: "ABC1234".into(),
                visit: id
            }
        );
        let record = engine.ledger_mut().get(id).unwrap().unwrap();
        assert_eq!(record.status, VisitStatus::Exited);
        assert!(record.timestamp_exit.is_some());
    }

    #[test]
    fn no_plate_output_never_touches_the_ledger() {
        let mut engine = engine_with(
            "No license plates found.",
            CountingLedger::new(InMemoryVehicleLedger::new()),
            70.0,
        );

        assert_eq!(engine.run_cycle().unwrap(), CycleOutcome::NoPlate);
        assert_eq!(engine.ledger_mut().finds, 0);
    }

    #[test]
    fn low_confidence_candidate_is_rejected_without_lookup() {
        let mut inner = InMemoryVehicleLedger::new();
        inner.record_entry("XYZ999", 1_000).unwrap();
        let mut engine = engine_with(
            "plate0: 1 result\n\t- XYZ999\t confidence: 40.0",
            CountingLedger::new(inner),
            70.0,
        );

        assert_eq!(engine.run_cycle().unwrap(), CycleOutcome::NoPlate);
        assert_eq!(engine.ledger_mut().finds, 0);
    }

    #[test]
    fn rejection_falls_through_to_next_ranked_candidate() {
        let mut inner = InMemoryVehicleLedger::new();
        let id = inner.record_entry("DEF5678", 1_000).unwrap();
        let raw = "plate0: 2 results\n\
                   \t- XYZ999\t confidence: 40.0\n\
                   \t- DEF5678\t confidence: 88.0";
        let mut engine = engine_with(raw, CountingLedger::new(inner), 70.0);

        let outcome = engine.run_cycle().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Exited {
                plate: "DEF5678".into(),
                visit: id
            }
        );
    }

    #[test]
    fn absent_confidence_passes_the_gate() {
        let mut inner = InMemoryVehicleLedger::new();
        let id = inner.record_entry("GHI9012", 1_000).unwrap();
        let mut engine = engine_with(
            "Plate found\n- GHI9012",
            CountingLedger::new(inner),
            70.0,
        );

        let outcome = engine.run_cycle().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Exited {
                plate: "GHI9012".into(),
                visit: id
            }
        );
    }

    #[test]
    fn unknown_plate_reports_not_found_without_mutation() {
        let mut inner = InMemoryVehicleLedger::new();
        let other = inner.record_entry("AAA1111", 1_000).unwrap();
        let mut engine = engine_with(
            "Plate found\n1 ZZZ0000 confidence: 92.0",
            CountingLedger::new(inner),
            70.0,
        );

        assert_eq!(
            engine.run_cycle().unwrap(),
            CycleOutcome::NotFound {
                plate: "ZZZ0000".into()
            }
        );
        let untouched = engine.ledger_mut().get(other).unwrap().unwrap();
        assert_eq!(untouched.status, VisitStatus::InGarage);
    }

    #[test]
    fn already_exited_record_is_never_remarked() {
        let mut inner = InMemoryVehicleLedger::new();
        let id = inner.record_entry("ABC1234", 1_000).unwrap();
        inner.mark_exited(id, 2_000).unwrap();
        let mut engine = engine_with(
            "Plate found\n1 ABC1234 confidence: 95.2",
            CountingLedger::new(inner),
            70.0,
        );

        assert_eq!(
            engine.run_cycle().unwrap(),
            CycleOutcome::NotFound {
                plate: "ABC1234".into()
            }
        );
        let record = engine.ledger_mut().get(id).unwrap().unwrap();
        assert_eq!(record.timestamp_exit, Some(2_000));
    }

    /// Reports an open visit on lookup but fails the compare-and-set, as
    /// if another writer closed the visit between the two calls.
    struct RacingLedger;

    impl VehicleLedger for RacingLedger {
        fn record_entry(&mut self, _plate: &str, _entry_ts: u64) -> Result<VisitId> {
            Ok(VisitId(1))
        }

        fn find_in_garage(&mut self, plate: &str) -> Result<Vec<VehicleRecord>> {
            Ok(vec![VehicleRecord {
                id: VisitId(1),
                plate_number: plate.to_string(),
                status: VisitStatus::InGarage,
                timestamp_entry: 1_000,
                timestamp_exit: None,
            }])
        }

        fn mark_exited(&mut self, _id: VisitId, _exit_ts: u64) -> Result<bool> {
            Ok(false)
        }

        fn open_visits(&mut self) -> Result<Vec<VehicleRecord>> {
            Ok(vec![])
        }

        fn recent_visits(&mut self, _limit: usize) -> Result<Vec<VehicleRecord>> {
            Ok(vec![])
        }

        fn get(&mut self, _id: VisitId) -> Result<Option<VehicleRecord>> {
            Ok(None)
        }
    }

    #[test]
    fn losing_the_update_race_reports_not_found() {
        let mut engine = ReconciliationEngine::new(
            StaticCamera,
            ScriptedRecognizer::new("Plate found\n1 ABC1234 confidence: 95.2"),
            RacingLedger,
            MatchPolicy::default(),
            Duration::from_millis(1),
        );

        assert_eq!(
            engine.run_cycle().unwrap(),
            CycleOutcome::NotFound {
                plate: "ABC1234".into()
            }
        );
    }

    #[test]
    fn capture_failure_abandons_cycle_before_recognition() {
        let mut engine = ReconciliationEngine::new(
            FailingCamera,
            ScriptedRecognizer::new("Plate found\n1 ABC1234 confidence: 95.2"),
            CountingLedger::new(InMemoryVehicleLedger::new()),
            MatchPolicy::default(),
            Duration::from_millis(1),
        );

        let err = engine.run_cycle().err().unwrap();
        assert!(matches!(err, Error::Capture(_)));
        assert!(err.is_transient());
        assert_eq!(engine.recognizer.calls, 0);
        assert_eq!(engine.ledger.finds, 0);
    }

    #[test]
    fn duplicate_open_visits_resolve_to_most_recent_entry() {
        // Violates the entry-side invariant; handled defensively.
        let mut inner = InMemoryVehicleLedger::new();
        let older = inner.record_entry("ABC1234", 1_000).unwrap();
        let newer = inner.record_entry("ABC1234", 5_000).unwrap();
        let mut engine = engine_with(
            "Plate found\n1 ABC1234 confidence: 95.2",
            CountingLedger::new(inner),
            70.0,
        );

        let outcome = engine.run_cycle().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Exited {
                plate: "ABC1234".into(),
                visit: newer
            }
        );
        let still_open = engine.ledger_mut().get(older).unwrap().unwrap();
        assert_eq!(still_open.status, VisitStatus::InGarage);
    }

    #[test]
    fn engine_returns_to_idle_between_cycles() {
        let mut engine = engine_with(
            "No license plates found.",
            CountingLedger::new(InMemoryVehicleLedger::new()),
            70.0,
        );
        engine.run_cycle().unwrap();
        assert_eq!(engine.phase(), CyclePhase::Matching);

        let shutdown = AtomicBool::new(true);
        engine.run(&shutdown);
        assert_eq!(engine.phase(), CyclePhase::Idle);
    }

    #[test]
    fn run_loop_survives_transient_failures_and_stops_on_signal() {
        use std::sync::Arc;

        let mut engine = ReconciliationEngine::new(
            FailingCamera,
            ScriptedRecognizer::new(""),
            CountingLedger::new(InMemoryVehicleLedger::new()),
            MatchPolicy::default(),
            Duration::from_millis(1),
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let stopper = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.store(true, Ordering::SeqCst);
        });
        engine.run(&shutdown);
        handle.join().expect("stopper thread");
        assert!(engine.cycles_run >= 1);
    }
}
