//! visits - operator CLI for the vehicle ledger
//!
//! Lists visits as JSON lines, and can record a manual entry (the normal
//! entry path is the entry-side camera process, not this tool).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use exitlane::{now_s, SqliteVehicleLedger, VehicleLedger};

#[derive(Parser, Debug)]
#[command(name = "visits", version, about)]
struct Cli {
    /// Ledger database path.
    #[arg(short, long, default_value = "garage.db", env = "EXITLANE_DB_PATH")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List visits currently in the garage.
    Open,
    /// List recent visits regardless of status.
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Record a vehicle entry manually.
    Add { plate: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut ledger = SqliteVehicleLedger::open(&cli.db)
        .with_context(|| format!("opening ledger {}", cli.db))?;

    match cli.command {
        Command::Open => print_records(ledger.open_visits()?),
        Command::List { limit } => print_records(ledger.recent_visits(limit)?),
        Command::Add { plate } => {
            let normalized = exitlane::alpr::normalize_plate(&plate);
            let id = ledger.record_entry(&normalized, now_s())?;
            println!("recorded entry for plate {} (visit {})", normalized, id);
            Ok(())
        }
    }
}

fn print_records(records: Vec<exitlane::VehicleRecord>) -> Result<()> {
    for record in records {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
