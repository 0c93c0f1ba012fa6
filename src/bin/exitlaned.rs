//! exitlaned - garage exit-lane daemon
//!
//! This daemon:
//! 1. Captures frames from the exit-lane camera source
//! 2. Runs plate recognition on each frame (subprocess with a deadline)
//! 3. Matches the best candidate against open visits in the vehicle ledger
//! 4. Closes matched visits (`in_garage` -> `exited`) with a conditional update
//!
//! No single cycle failure terminates the process; stop it with SIGINT.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use exitlane::{
    AlprRecognizer, CameraSource, ExitLaneConfig, FrameSource, ReconciliationEngine,
    SqliteVehicleLedger,
};

/// Garage exit-lane reconciliation daemon.
#[derive(Parser, Debug)]
#[command(name = "exitlaned", version, about)]
struct Args {
    /// Path to JSON configuration file (falls back to EXITLANE_CONFIG).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = match args.config.as_deref() {
        Some(path) => ExitLaneConfig::load_from(Some(path)),
        None => ExitLaneConfig::load(),
    }
    .context("loading configuration")?;

    log::info!(
        "exitlaned starting: camera={} recognizer={} region={} db={}",
        cfg.camera_source,
        cfg.alpr_command,
        cfg.region,
        cfg.db_path
    );

    let mut camera = CameraSource::new(cfg.camera_config())?;
    camera.connect().context("connecting camera source")?;
    let recognizer = AlprRecognizer::new(cfg.alpr_config());
    let ledger = SqliteVehicleLedger::open(&cfg.db_path)
        .with_context(|| format!("opening ledger {}", cfg.db_path))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("stop signal received, finishing current cycle");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    let mut engine = ReconciliationEngine::new(
        camera,
        recognizer,
        ledger,
        cfg.match_policy(),
        cfg.cycle_interval,
    );
    engine.run(&shutdown);

    log::info!("exitlaned stopped");
    Ok(())
}
