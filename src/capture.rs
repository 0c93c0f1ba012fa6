//! Exit-lane frame sources.
//!
//! The camera collaborator is external: on the real installation a grabber
//! process writes each captured still into a spool directory, and the
//! daemon picks up the newest file. For development and tests a `stub://`
//! source generates synthetic frames in-process.
//!
//! `capture()` is blocking and bounded: the spool backend polls for a frame
//! newer than the last one consumed and gives up with `Error::Capture` once
//! the configured timeout elapses, so a dead grabber cannot stall the loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use log::debug;
use rand::Rng;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Something that yields frames on demand.
pub trait FrameSource {
    /// Prepare the source. Called once at startup.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until the next frame is available or the source's deadline
    /// passes.
    fn capture(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Configuration for the exit-lane camera.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// `stub://<name>` for a synthetic source, otherwise a local spool
    /// directory path.
    pub source: String,
    /// Frame width (synthetic frames; advisory for spool frames).
    pub width: u32,
    /// Frame height (synthetic frames; advisory for spool frames).
    pub height: u32,
    /// Upper bound on how long one `capture()` may block.
    pub capture_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: "stub://exit_lane".to_string(),
            width: 640,
            height: 480,
            capture_timeout: Duration::from_secs(5),
        }
    }
}

/// Exit-lane camera source.
///
/// Dispatches to a synthetic generator for `stub://` sources and to the
/// spool-directory watcher for everything else.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    Spool(SpoolCamera),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        if config.source.starts_with("stub://") {
            Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCamera::new(config)),
            })
        } else {
            if config.source.contains("://") {
                return Err(Error::Capture(format!(
                    "camera source must be a local spool directory or stub:// (got {})",
                    config.source
                )));
            }
            Ok(Self {
                backend: CameraBackend::Spool(SpoolCamera::new(config)),
            })
        }
    }

    /// Frame statistics for health logging.
    pub fn stats(&self) -> CameraStats {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.stats(),
            CameraBackend::Spool(camera) => camera.stats(),
        }
    }
}

impl FrameSource for CameraSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.connect(),
            CameraBackend::Spool(camera) => camera.connect(),
        }
    }

    fn capture(&mut self) -> Result<Frame> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.capture(),
            CameraBackend::Spool(camera) => camera.capture(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(_) => true,
            CameraBackend::Spool(camera) => camera.healthy,
        }
    }
}

/// Statistics for a camera source.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub source: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for development and tests
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    config: CameraConfig,
    frame_count: u64,
}

impl SyntheticCamera {
    fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        debug!("synthetic camera ready: {}", self.config.source);
        Ok(())
    }

    fn capture(&mut self) -> Result<Frame> {
        let len = (self.config.width * self.config.height) as usize;
        let mut data = vec![0u8; len];
        let mut rng = rand::thread_rng();
        for (i, px) in data.iter_mut().enumerate() {
            // Horizontal gradient plus per-frame noise so successive frames
            // differ.
            let base = (i as u64 % self.config.width as u64) as u8;
            *px = base.wrapping_add(self.frame_count as u8) ^ rng.gen::<u8>() & 0x0f;
        }
        self.frame_count += 1;
        Ok(Frame::new(
            data,
            self.config.width,
            self.config.height,
        ))
    }

    fn stats(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Spool-directory source
// ----------------------------------------------------------------------------

const SPOOL_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct SpoolCamera {
    config: CameraConfig,
    frame_count: u64,
    healthy: bool,
    /// mtime and path of the last still handed out; a frame is "new" when
    /// its mtime is strictly later, or equal with a different path.
    last_seen: Option<(SystemTime, PathBuf)>,
}

impl SpoolCamera {
    fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            healthy: false,
            last_seen: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let dir = Path::new(&self.config.source);
        if !dir.is_dir() {
            return Err(Error::Capture(format!(
                "spool directory {} does not exist",
                dir.display()
            )));
        }
        self.healthy = true;
        debug!("spool camera watching {}", dir.display());
        Ok(())
    }

    fn capture(&mut self) -> Result<Frame> {
        let deadline = Instant::now() + self.config.capture_timeout;
        loop {
            if let Some((mtime, path)) = self.newest_still()? {
                let is_new = match &self.last_seen {
                    None => true,
                    Some((seen_mtime, seen_path)) => {
                        mtime > *seen_mtime || (mtime == *seen_mtime && path != *seen_path)
                    }
                };
                if is_new {
                    let data = fs::read(&path).map_err(|e| {
                        self.healthy = false;
                        Error::Capture(format!("failed to read still {}: {}", path.display(), e))
                    })?;
                    self.last_seen = Some((mtime, path));
                    self.frame_count += 1;
                    self.healthy = true;
                    return Ok(Frame::new(data, self.config.width, self.config.height));
                }
            }
            if Instant::now() >= deadline {
                self.healthy = false;
                return Err(Error::Capture(format!(
                    "no new frame in {} within {:?}",
                    self.config.source, self.config.capture_timeout
                )));
            }
            std::thread::sleep(SPOOL_POLL_INTERVAL);
        }
    }

    /// Newest regular file in the spool directory, by mtime.
    fn newest_still(&self) -> Result<Option<(SystemTime, PathBuf)>> {
        let entries = fs::read_dir(&self.config.source)
            .map_err(|e| Error::Capture(format!("spool directory unreadable: {}", e)))?;
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let mtime = match meta.modified() {
                Ok(mtime) => mtime,
                Err(_) => continue,
            };
            let replace = match &newest {
                None => true,
                Some((best, _)) => mtime > *best,
            };
            if replace {
                newest = Some((mtime, entry.path()));
            }
        }
        Ok(newest)
    }

    fn stats(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }
}
