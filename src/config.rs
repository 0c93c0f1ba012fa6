//! Daemon configuration.
//!
//! Loaded from a JSON file (path via `--config` or the `EXITLANE_CONFIG`
//! env var), then overridden field-by-field from `EXITLANE_*` env vars,
//! then validated. Validation failures are `Error::Config` and fatal at
//! startup; nothing at runtime re-reads configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::alpr::{AlprConfig, Region};
use crate::capture::CameraConfig;
use crate::engine::MatchPolicy;
use crate::error::{Error, Result};

const DEFAULT_DB_PATH: &str = "garage.db";
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CAMERA_SOURCE: &str = "stub://exit_lane";
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_ALPR_COMMAND: &str = "alpr";
const DEFAULT_MIN_CONFIDENCE: f32 = 70.0;
const DEFAULT_ALPR_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize, Default)]
struct ExitLaneConfigFile {
    db_path: Option<String>,
    cycle_interval_ms: Option<u64>,
    camera: Option<CameraConfigFile>,
    recognition: Option<RecognitionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    capture_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    command: Option<String>,
    region: Option<Region>,
    min_confidence: Option<f32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExitLaneConfig {
    pub db_path: String,
    pub cycle_interval: Duration,
    pub camera_source: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub capture_timeout: Duration,
    pub alpr_command: String,
    pub region: Region,
    pub min_confidence: f32,
    pub recognition_timeout: Duration,
}

impl ExitLaneConfig {
    /// Load from `EXITLANE_CONFIG` (if set), apply env overrides, validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("EXITLANE_CONFIG").ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load from an explicit file path (or defaults when `None`), apply
    /// env overrides, validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ExitLaneConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ExitLaneConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            cycle_interval: Duration::from_millis(
                file.cycle_interval_ms.unwrap_or(DEFAULT_CYCLE_INTERVAL_MS),
            ),
            camera_source: camera
                .source
                .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
            frame_width: camera.width.unwrap_or(DEFAULT_FRAME_WIDTH),
            frame_height: camera.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            capture_timeout: Duration::from_millis(
                camera.capture_timeout_ms.unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS),
            ),
            alpr_command: recognition
                .command
                .unwrap_or_else(|| DEFAULT_ALPR_COMMAND.to_string()),
            region: recognition.region.unwrap_or_default(),
            min_confidence: recognition.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            recognition_timeout: Duration::from_millis(
                recognition.timeout_ms.unwrap_or(DEFAULT_ALPR_TIMEOUT_MS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("EXITLANE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(source) = std::env::var("EXITLANE_CAMERA_SOURCE") {
            if !source.trim().is_empty() {
                self.camera_source = source;
            }
        }
        if let Ok(command) = std::env::var("EXITLANE_ALPR_COMMAND") {
            if !command.trim().is_empty() {
                self.alpr_command = command;
            }
        }
        if let Ok(region) = std::env::var("EXITLANE_ALPR_REGION") {
            if !region.trim().is_empty() {
                self.region = region.parse()?;
            }
        }
        if let Ok(value) = std::env::var("EXITLANE_MIN_CONFIDENCE") {
            self.min_confidence = value
                .parse()
                .map_err(|_| Error::Config("EXITLANE_MIN_CONFIDENCE must be a number".into()))?;
        }
        if let Ok(value) = std::env::var("EXITLANE_CYCLE_INTERVAL_MS") {
            let ms: u64 = value.parse().map_err(|_| {
                Error::Config("EXITLANE_CYCLE_INTERVAL_MS must be an integer of milliseconds".into())
            })?;
            self.cycle_interval = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("EXITLANE_CAPTURE_TIMEOUT_MS") {
            let ms: u64 = value.parse().map_err(|_| {
                Error::Config("EXITLANE_CAPTURE_TIMEOUT_MS must be an integer of milliseconds".into())
            })?;
            self.capture_timeout = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("EXITLANE_ALPR_TIMEOUT_MS") {
            let ms: u64 = value.parse().map_err(|_| {
                Error::Config("EXITLANE_ALPR_TIMEOUT_MS must be an integer of milliseconds".into())
            })?;
            self.recognition_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.min_confidence) {
            return Err(Error::Config(format!(
                "min_confidence must be within [0, 100], got {}",
                self.min_confidence
            )));
        }
        if self.cycle_interval.is_zero() {
            return Err(Error::Config("cycle_interval_ms must be greater than zero".into()));
        }
        if self.capture_timeout.is_zero() {
            return Err(Error::Config("capture_timeout_ms must be greater than zero".into()));
        }
        if self.recognition_timeout.is_zero() {
            return Err(Error::Config("recognition timeout_ms must be greater than zero".into()));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(Error::Config("frame dimensions must be non-zero".into()));
        }
        if self.db_path.trim().is_empty() {
            return Err(Error::Config("db_path must not be empty".into()));
        }
        Ok(())
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            source: self.camera_source.clone(),
            width: self.frame_width,
            height: self.frame_height,
            capture_timeout: self.capture_timeout,
        }
    }

    pub fn alpr_config(&self) -> AlprConfig {
        AlprConfig {
            command: self.alpr_command.clone(),
            region: self.region,
            timeout: self.recognition_timeout,
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            min_confidence: self.min_confidence,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ExitLaneConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config file {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid config file {}: {}", path.display(), e)))
}
