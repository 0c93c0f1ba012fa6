//! Plate recognition.
//!
//! The recognizer is an external collaborator invoked as an isolated
//! subprocess (`alpr -c <region> <image>`) with a hard deadline: a hung
//! recognizer is killed and the cycle reports `Error::Recognition`. A
//! `stub:` backend produces scripted output for demos and tests.

mod parser;

pub use parser::{normalize_plate, parse_candidates, Candidate};

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// How often a running recognizer subprocess is polled for exit.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Region hint passed to the recognizer (`-c` flag).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Us,
    Eu,
}

impl Region {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Eu => "eu",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" => Ok(Region::Us),
            "eu" => Ok(Region::Eu),
            other => Err(Error::Config(format!("unknown region {:?}", other))),
        }
    }
}

/// Something that turns a frame into raw recognizer output.
pub trait PlateRecognizer {
    fn recognize(&mut self, frame: &Frame) -> Result<String>;
}

/// Configuration for the recognizer invocation.
#[derive(Clone, Debug)]
pub struct AlprConfig {
    /// Recognizer executable, or `stub:<plate>[:<confidence>]` /
    /// `stub:none` for a scripted backend.
    pub command: String,
    pub region: Region,
    /// Hard deadline for one invocation; the subprocess is killed on expiry.
    pub timeout: Duration,
}

impl Default for AlprConfig {
    fn default() -> Self {
        Self {
            command: "alpr".to_string(),
            region: Region::Us,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Plate recognizer front end, dispatching to the subprocess backend or the
/// `stub:` scripted backend.
pub struct AlprRecognizer {
    backend: AlprBackend,
}

enum AlprBackend {
    Process(ProcessAlpr),
    Scripted(ScriptedAlpr),
}

impl AlprRecognizer {
    pub fn new(config: AlprConfig) -> Self {
        if let Some(script) = config.command.strip_prefix("stub:") {
            Self {
                backend: AlprBackend::Scripted(ScriptedAlpr::new(script)),
            }
        } else {
            Self {
                backend: AlprBackend::Process(ProcessAlpr::new(config)),
            }
        }
    }
}

impl PlateRecognizer for AlprRecognizer {
    fn recognize(&mut self, frame: &Frame) -> Result<String> {
        match &mut self.backend {
            AlprBackend::Process(alpr) => alpr.recognize(frame),
            AlprBackend::Scripted(alpr) => alpr.recognize(frame),
        }
    }
}

// ----------------------------------------------------------------------------
// Subprocess backend
// ----------------------------------------------------------------------------

struct ProcessAlpr {
    config: AlprConfig,
    invocations: u64,
}

impl ProcessAlpr {
    fn new(config: AlprConfig) -> Self {
        Self {
            config,
            invocations: 0,
        }
    }

    /// Frame image handed to the subprocess. Ephemeral; removed after the
    /// invocation.
    fn frame_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("exitlane_frame_{}.jpg", std::process::id()))
    }

    fn recognize(&mut self, frame: &Frame) -> Result<String> {
        let img_path = self.frame_path();
        std::fs::write(&img_path, frame.data()).map_err(|e| {
            Error::Recognition(format!("failed to stage frame {}: {}", img_path.display(), e))
        })?;

        self.invocations += 1;
        debug!(
            "alpr invocation #{}: {} -c {} {}",
            self.invocations,
            self.config.command,
            self.config.region,
            img_path.display()
        );

        let result = self.run_bounded(&img_path);
        let _ = std::fs::remove_file(&img_path);
        result
    }

    /// Run the recognizer with a kill-on-deadline timeout.
    fn run_bounded(&self, img_path: &std::path::Path) -> Result<String> {
        let mut child = Command::new(&self.config.command)
            .arg("-c")
            .arg(self.config.region.as_arg())
            .arg(img_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Recognition(format!("failed to launch {}: {}", self.config.command, e))
            })?;

        let deadline = Instant::now() + self.config.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::Recognition(format!(
                            "{} timed out after {:?}",
                            self.config.command, self.config.timeout
                        )));
                    }
                    std::thread::sleep(CHILD_POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Recognition(format!("wait failed: {}", e)));
                }
            }
        };

        // Candidate listings are a handful of lines, well under the pipe
        // buffer, so reading after exit cannot deadlock.
        let mut raw = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut raw)
                .map_err(|e| Error::Recognition(format!("unreadable output: {}", e)))?;
        }

        if !status.success() {
            let mut err_out = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut err_out);
            }
            return Err(Error::Recognition(format!(
                "{} exited with {} ({})",
                self.config.command,
                status,
                err_out.trim()
            )));
        }

        Ok(raw)
    }
}

// ----------------------------------------------------------------------------
// Scripted backend (stub:) for demos and tests
// ----------------------------------------------------------------------------

struct ScriptedAlpr {
    output: String,
}

impl ScriptedAlpr {
    /// `script` is the part after `stub:`: empty or `none` for a no-plate
    /// reading, otherwise `<plate>` or `<plate>:<confidence>`.
    fn new(script: &str) -> Self {
        let output = match script {
            "" | "none" => "No license plates found.".to_string(),
            scripted => {
                let (plate, confidence) = match scripted.split_once(':') {
                    Some((plate, conf)) => (plate, conf),
                    None => (scripted, "95.0"),
                };
                format!(
                    "plate0: 1 result\n    - {}\t confidence: {}\n",
                    plate, confidence
                )
            }
        };
        Self { output }
    }

    fn recognize(&mut self, _frame: &Frame) -> Result<String> {
        Ok(self.output.clone())
    }
}
