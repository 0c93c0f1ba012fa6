//! Recognizer output parsing.
//!
//! The recognizer prints one summary line followed by one line per
//! candidate, whitespace-separated, with the plate token in field 1 and the
//! confidence percentage in field 3:
//!
//! ```text
//! plate0: 2 results
//!     - ABC1234    confidence: 95.2
//!     - ABC123A    confidence: 87.0
//! ```
//!
//! Parsing is tolerant by contract: a line that does not decompose into at
//! least a plate token is skipped, a confidence that does not parse as a
//! percentage yields an absent confidence, and candidate order is preserved
//! exactly as the recognizer ranked it.

use std::sync::OnceLock;

use regex::Regex;

/// One recognized plate candidate. Never persisted; rebuilt every cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Normalized plate string, always non-empty.
    pub plate: String,
    /// Confidence percentage in [0, 100], absent when the recognizer did
    /// not report one (or reported garbage).
    pub confidence: Option<f32>,
}

fn plate_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]{2,10}$").expect("plate token pattern"))
}

/// Normalize a plate string for ledger matching: trim plus ASCII uppercase.
/// No ambiguous-character substitution (0/O, 1/I) is applied.
pub fn normalize_plate(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Parse one recognizer invocation's raw output into ranked candidates.
///
/// The first line is always the summary and is never a candidate. Malformed
/// candidate lines are skipped, not fatal.
pub fn parse_candidates(raw: &str) -> Vec<Candidate> {
    let mut lines = raw.lines();
    if lines.next().is_none() {
        return Vec::new();
    }

    let mut out = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(token) = fields.get(1) else {
            continue;
        };
        if !plate_token_re().is_match(token) {
            continue;
        }
        let confidence = fields
            .get(3)
            .and_then(|f| f.parse::<f32>().ok())
            .filter(|c| (0.0..=100.0).contains(c));
        out.push(Candidate {
            plate: normalize_plate(token),
            confidence,
        });
    }
    out
}
