//! Error taxonomy for the exit-lane daemon.
//!
//! One variant per failure boundary. `Capture`, `Recognition` and `Ledger`
//! are transient: the engine logs them, abandons the current cycle and
//! keeps looping. `Config` is fatal and only produced at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transient errors abandon the current cycle; the loop continues.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::Config(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Ledger(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
