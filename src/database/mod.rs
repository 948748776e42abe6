pub mod models;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::unix_seconds;
use models::{Measurement, Run};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS runs (
            run_id INTEGER PRIMARY KEY,
            name TEXT,
            comment TEXT,
            uut_mac TEXT, -- hex-string formatted 32-bit mac of the uut
            timestamp REAL -- unix timestamp in fractional seconds
            );
    CREATE TABLE IF NOT EXISTS measurements (
            measurement_id INTEGER PRIMARY KEY,
            run_id INTEGER,
            channel INTEGER, -- -1 marks the zero calibration baseline
            duty_cycle REAL, -- setpoint duty cycle as a float between 0.0 and 1.0
            voltage REAL, -- volts
            voltage_stdev REAL, -- volts
            timestamp REAL, -- unix timestamp in fractional seconds
            FOREIGN KEY (run_id) REFERENCES runs (run_id));
";

/// Results store, passed around explicitly instead of a shared cursor.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens the database file, creating it and the schema on first use.
    /// The schema is applied with CREATE TABLE IF NOT EXISTS and never migrated.
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("opening database {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("creating results schema")?;
        info!("opened database {path}");
        Ok(Self { conn })
    }

    /// Records a new run under a fresh name and returns its row.
    pub fn create_run(&mut self, requested_name: &str, uut_mac: u32) -> Result<Run> {
        let name = self.derive_run_name(requested_name)?;
        let created = unix_seconds(Utc::now());
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (name, uut_mac, timestamp) VALUES (?1, ?2, ?3)",
            params![name, format!("{uut_mac:08x}"), created],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.commit().context("recording run")?;
        info!("recorded run {run_id} as {name:?}");
        Ok(Run {
            run_id,
            name,
            uut_mac,
            created,
        })
    }

    // Names ending in a digit are taken verbatim; colliding runs stay
    // distinguishable through their run_id, so this is left as-is rather
    // than second-guessing the operator.
    fn derive_run_name(&self, requested: &str) -> Result<String> {
        if requested
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_digit())
        {
            return Ok(requested.to_string());
        }
        let highest = self
            .run_names_with_prefix(requested)?
            .iter()
            .map(|name| {
                name.get(requested.len()..)
                    .and_then(|suffix| suffix.parse::<u32>().ok())
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0);
        Ok(format!("{requested}{}", highest + 1))
    }

    fn run_names_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM runs WHERE name LIKE ?1 || '%'")?;
        let names = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("{} existing runs share the prefix {prefix:?}", names.len());
        Ok(names)
    }

    /// Inserts one measurement row and returns its generated id.
    pub fn record_measurement(&self, m: &Measurement) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO measurements \
                    (run_id, channel, duty_cycle, voltage, voltage_stdev, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    m.run_id,
                    m.channel,
                    m.duty_cycle,
                    m.voltage,
                    m.voltage_stdev,
                    unix_seconds(Utc::now())
                ],
            )
            .context("recording measurement")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All measurements of a run in insertion order.
    pub fn measurements(&self, run_id: i64) -> Result<Vec<Measurement>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, channel, duty_cycle, voltage, voltage_stdev \
             FROM measurements WHERE run_id = ?1 ORDER BY measurement_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(Measurement {
                    run_id: row.get(0)?,
                    channel: row.get(1)?,
                    duty_cycle: row.get(2)?,
                    voltage: row.get(3)?,
                    voltage_stdev: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
