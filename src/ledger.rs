//! Vehicle visit ledger.
//!
//! One record per garage visit. Records are created by the entry-side
//! process; this daemon only ever closes them, via a conditional update
//! keyed by the stable visit id. The compare-and-set on `status` is the
//! sole concurrency-safety mechanism against other writers: closing an
//! already-closed visit is a no-op that reports `false` and leaves
//! `timestamp_exit` untouched.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Stable identifier of one garage visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VisitId(pub i64);

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a visit. `Exited` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    InGarage,
    Exited,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::InGarage => "in_garage",
            VisitStatus::Exited => "exited",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "in_garage" => Ok(VisitStatus::InGarage),
            "exited" => Ok(VisitStatus::Exited),
            other => Err(Error::Ledger(format!("unknown visit status {:?}", other))),
        }
    }
}

/// One vehicle visit as persisted in the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: VisitId,
    pub plate_number: String,
    pub status: VisitStatus,
    /// Seconds since the Unix epoch.
    pub timestamp_entry: u64,
    /// Set exactly once, by the exit transition.
    pub timestamp_exit: Option<u64>,
}

/// Store of vehicle visits.
///
/// `find_in_garage` and `open_visits` return records ordered most-recent
/// entry first; the engine's defensive multi-match tie-break relies on
/// that ordering.
pub trait VehicleLedger {
    /// Open a new visit. Used by the entry-side companion and by tests;
    /// the exit daemon never calls this.
    fn record_entry(&mut self, plate: &str, entry_ts: u64) -> Result<VisitId>;

    /// Open visits for one plate, most recent entry first.
    fn find_in_garage(&mut self, plate: &str) -> Result<Vec<VehicleRecord>>;

    /// Conditionally close a visit: set `exited` and the exit timestamp
    /// only if the record is still `in_garage`. Returns `false` when the
    /// precondition failed.
    fn mark_exited(&mut self, id: VisitId, exit_ts: u64) -> Result<bool>;

    /// All open visits, most recent entry first.
    fn open_visits(&mut self) -> Result<Vec<VehicleRecord>>;

    /// Most recent visits regardless of status, newest entry first.
    fn recent_visits(&mut self, limit: usize) -> Result<Vec<VehicleRecord>>;

    fn get(&mut self, id: VisitId) -> Result<Option<VehicleRecord>>;
}

// ----------------------------------------------------------------------------
// SQLite-backed ledger
// ----------------------------------------------------------------------------

/// How long a ledger statement may wait on a lock held by another writer.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteVehicleLedger {
    conn: Connection,
}

impl SqliteVehicleLedger {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS vehicle_visits (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              plate_number TEXT NOT NULL,
              status TEXT NOT NULL CHECK (status IN ('in_garage', 'exited')),
              timestamp_entry INTEGER NOT NULL,
              timestamp_exit INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_visits_plate_status
              ON vehicle_visits(plate_number, status);
            "#,
        )?;
        Ok(())
    }

    fn record_from_row(row: &Row<'_>) -> Result<VehicleRecord> {
        let status: String = row.get(2)?;
        let entry: i64 = row.get(3)?;
        let exit: Option<i64> = row.get(4)?;
        Ok(VehicleRecord {
            id: VisitId(row.get(0)?),
            plate_number: row.get(1)?,
            status: VisitStatus::parse(&status)?,
            timestamp_entry: entry.max(0) as u64,
            timestamp_exit: exit.map(|v| v.max(0) as u64),
        })
    }

    fn query_records(
        &mut self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<VehicleRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::record_from_row(row)?);
        }
        Ok(out)
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, plate_number, status, timestamp_entry, timestamp_exit FROM vehicle_visits";

impl VehicleLedger for SqliteVehicleLedger {
    fn record_entry(&mut self, plate: &str, entry_ts: u64) -> Result<VisitId> {
        let entry = i64::try_from(entry_ts)
            .map_err(|_| Error::Ledger("entry timestamp exceeds i64 range".into()))?;
        self.conn.execute(
            "INSERT INTO vehicle_visits(plate_number, status, timestamp_entry) VALUES (?1, 'in_garage', ?2)",
            params![plate, entry],
        )?;
        Ok(VisitId(self.conn.last_insert_rowid()))
    }

    fn find_in_garage(&mut self, plate: &str) -> Result<Vec<VehicleRecord>> {
        let sql = format!(
            "{} WHERE plate_number = ?1 AND status = 'in_garage' ORDER BY timestamp_entry DESC, id DESC",
            SELECT_COLUMNS
        );
        self.query_records(&sql, &[&plate])
    }

    fn mark_exited(&mut self, id: VisitId, exit_ts: u64) -> Result<bool> {
        let exit = i64::try_from(exit_ts)
            .map_err(|_| Error::Ledger("exit timestamp exceeds i64 range".into()))?;
        let changed = self.conn.execute(
            "UPDATE vehicle_visits SET status = 'exited', timestamp_exit = ?1 \
             WHERE id = ?2 AND status = 'in_garage'",
            params![exit, id.0],
        )?;
        Ok(changed == 1)
    }

    fn open_visits(&mut self) -> Result<Vec<VehicleRecord>> {
        let sql = format!(
            "{} WHERE status = 'in_garage' ORDER BY timestamp_entry DESC, id DESC",
            SELECT_COLUMNS
        );
        self.query_records(&sql, &[])
    }

    fn recent_visits(&mut self, limit: usize) -> Result<Vec<VehicleRecord>> {
        let sql = format!(
            "{} ORDER BY timestamp_entry DESC, id DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        self.query_records(&sql, &[&(limit as i64)])
    }

    fn get(&mut self, id: VisitId) -> Result<Option<VehicleRecord>> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        Ok(self.query_records(&sql, &[&id.0])?.into_iter().next())
    }
}

// ----------------------------------------------------------------------------
// In-memory ledger (tests, demos)
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryVehicleLedger {
    visits: Vec<VehicleRecord>,
    next_id: i64,
}

impl InMemoryVehicleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_desc(mut records: Vec<VehicleRecord>) -> Vec<VehicleRecord> {
        records.sort_by(|a, b| {
            b.timestamp_entry
                .cmp(&a.timestamp_entry)
                .then(b.id.0.cmp(&a.id.0))
        });
        records
    }
}

impl VehicleLedger for InMemoryVehicleLedger {
    fn record_entry(&mut self, plate: &str, entry_ts: u64) -> Result<VisitId> {
        self.next_id += 1;
        let id = VisitId(self.next_id);
        self.visits.push(VehicleRecord {
            id,
            plate_number: plate.to_string(),
            status: VisitStatus::InGarage,
            timestamp_entry: entry_ts,
            timestamp_exit: None,
        });
        Ok(id)
    }

    fn find_in_garage(&mut self, plate: &str) -> Result<Vec<VehicleRecord>> {
        let matches = self
            .visits
            .iter()
            .filter(|v| v.status == VisitStatus::InGarage && v.plate_number == plate)
            .cloned()
            .collect();
        Ok(Self::sorted_desc(matches))
    }

    fn mark_exited(&mut self, id: VisitId, exit_ts: u64) -> Result<bool> {
        for visit in &mut self.visits {
            if visit.id == id && visit.status == VisitStatus::InGarage {
                visit.status = VisitStatus::Exited;
                visit.timestamp_exit = Some(exit_ts);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn open_visits(&mut self) -> Result<Vec<VehicleRecord>> {
        let open = self
            .visits
            .iter()
            .filter(|v| v.status == VisitStatus::InGarage)
            .cloned()
            .collect();
        Ok(Self::sorted_desc(open))
    }

    fn recent_visits(&mut self, limit: usize) -> Result<Vec<VehicleRecord>> {
        let mut all = Self::sorted_desc(self.visits.clone());
        all.truncate(limit);
        Ok(all)
    }

    fn get(&mut self, id: VisitId) -> Result<Option<VehicleRecord>> {
        Ok(self.visits.iter().find(|v| v.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite() -> SqliteVehicleLedger {
        SqliteVehicleLedger::open(":memory:").expect("open in-memory ledger")
    }

    fn conditional_update_is_idempotent(ledger: &mut dyn VehicleLedger) {
        let id = ledger.record_entry("ABC1234", 1_000).unwrap();

        assert!(ledger.mark_exited(id, 2_000).unwrap());
        let closed = ledger.get(id).unwrap().unwrap();
        assert_eq!(closed.status, VisitStatus::Exited);
        assert_eq!(closed.timestamp_exit, Some(2_000));

        // Second close fails the precondition and changes nothing.
        assert!(!ledger.mark_exited(id, 9_999).unwrap());
        let still_closed = ledger.get(id).unwrap().unwrap();
        assert_eq!(still_closed.timestamp_exit, Some(2_000));
    }

    #[test]
    fn sqlite_conditional_update_is_idempotent() {
        conditional_update_is_idempotent(&mut sqlite());
    }

    #[test]
    fn in_memory_conditional_update_is_idempotent() {
        conditional_update_is_idempotent(&mut InMemoryVehicleLedger::new());
    }

    #[test]
    fn find_in_garage_excludes_exited_records() {
        let mut ledger = sqlite();
        let first = ledger.record_entry("ABC1234", 1_000).unwrap();
        ledger.mark_exited(first, 1_500).unwrap();
        let second = ledger.record_entry("ABC1234", 2_000).unwrap();

        let open = ledger.find_in_garage("ABC1234").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second);
    }

    #[test]
    fn open_matches_come_most_recent_first() {
        let mut ledger = sqlite();
        let older = ledger.record_entry("ABC1234", 1_000).unwrap();
        let newer = ledger.record_entry("ABC1234", 5_000).unwrap();

        let open = ledger.find_in_garage("ABC1234").unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].id, newer);
        assert_eq!(open[1].id, older);
    }

    #[test]
    fn recent_visits_honors_limit() {
        let mut ledger = sqlite();
        for i in 0..5 {
            ledger.record_entry("ABC1234", 1_000 + i).unwrap();
        }
        let recent = ledger.recent_visits(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp_entry, 1_004);
    }

    #[test]
    fn get_returns_none_for_unknown_visit() {
        let mut ledger = sqlite();
        assert!(ledger.get(VisitId(42)).unwrap().is_none());
    }
}
