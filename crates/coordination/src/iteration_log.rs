//! Append-only SQLite logs of completed updates and weight rounds.

use rusqlite::{params, Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One completed local update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Agent that took the step
    pub agent_id: u32,
    /// Wall-clock time, milliseconds since the epoch
    pub timestamp_ms: u64,
    /// Local update count after the step
    pub iteration: u64,
    /// Command epoch of the step
    pub epoch: u64,
    /// Local cost before the step
    pub cost_before: f64,
    /// Local cost after the step
    pub cost_after: f64,
    /// Time spent in the optimizer
    pub elapsed_ms: u64,
    /// Step ran on stale neighbor data
    pub stale: bool,
    /// Pose and measurement payload received from peers so far
    pub bytes_received: u64,
}

/// Weight change of one edge in one weight round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRoundRecord {
    /// Responsible agent
    pub agent_id: u32,
    /// Wall-clock time, milliseconds since the epoch
    pub timestamp_ms: u64,
    /// Weight round
    pub round: u64,
    /// Edge endpoints
    pub r1: u32,
    /// Pose index on r1
    pub p1: u32,
    /// Other robot
    pub r2: u32,
    /// Pose index on r2
    pub p2: u32,
    /// |new - old|
    pub weight_delta: f64,
    /// Convergence flag after the round
    pub converged: bool,
}

/// Current wall-clock time in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persisted iteration and weight-round log of one agent
#[derive(Debug)]
pub struct IterationLog {
    db: Connection,
}

impl IterationLog {
    /// Open (or create) a log file
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory log, gone when dropped
    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> SqliteResult<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS iterations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                iteration INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                cost_before REAL NOT NULL,
                cost_after REAL NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                stale INTEGER NOT NULL DEFAULT 0,
                bytes_received INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS weight_rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                round INTEGER NOT NULL,
                r1 INTEGER NOT NULL,
                p1 INTEGER NOT NULL,
                r2 INTEGER NOT NULL,
                p2 INTEGER NOT NULL,
                weight_delta REAL NOT NULL,
                converged INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_iterations_iteration ON iterations(iteration)",
            [],
        )?;

        Ok(Self { db })
    }

    /// Append one completed update
    pub fn append_iteration(&mut self, record: &IterationRecord) -> SqliteResult<()> {
        self.db.execute(
            "INSERT INTO iterations (agent_id, timestamp_ms, iteration, epoch, cost_before, cost_after, elapsed_ms, stale, bytes_received)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.agent_id,
                record.timestamp_ms as i64,
                record.iteration as i64,
                record.epoch as i64,
                record.cost_before,
                record.cost_after,
                record.elapsed_ms as i64,
                record.stale as i32,
                record.bytes_received as i64
            ],
        )?;
        Ok(())
    }

    /// Append every edge of one weight round in a single transaction
    pub fn append_weight_round(&mut self, records: &[WeightRoundRecord]) -> SqliteResult<()> {
        let tx = self.db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO weight_rounds (agent_id, timestamp_ms, round, r1, p1, r2, p2, weight_delta, converged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.agent_id,
                    r.timestamp_ms as i64,
                    r.round as i64,
                    r.r1,
                    r.p1,
                    r.r2,
                    r.p2,
                    r.weight_delta,
                    r.converged as i32
                ])?;
            }
        }
        tx.commit()
    }

    /// Every logged update in append order
    pub fn iterations(&self) -> SqliteResult<Vec<IterationRecord>> {
        let mut stmt = self.db.prepare(
            "SELECT agent_id, timestamp_ms, iteration, epoch, cost_before, cost_after, elapsed_ms, stale, bytes_received
             FROM iterations ORDER BY id",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(IterationRecord {
                    agent_id: row.get(0)?,
                    timestamp_ms: row.get::<_, i64>(1)? as u64,
                    iteration: row.get::<_, i64>(2)? as u64,
                    epoch: row.get::<_, i64>(3)? as u64,
                    cost_before: row.get(4)?,
                    cost_after: row.get(5)?,
                    elapsed_ms: row.get::<_, i64>(6)? as u64,
                    stale: row.get::<_, i32>(7)? != 0,
                    bytes_received: row.get::<_, i64>(8)? as u64,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Every logged weight delta of `round`
    pub fn weight_round(&self, round: u64) -> SqliteResult<Vec<WeightRoundRecord>> {
        let mut stmt = self.db.prepare(
            "SELECT agent_id, timestamp_ms, round, r1, p1, r2, p2, weight_delta, converged
             FROM weight_rounds WHERE round = ?1 ORDER BY id",
        )?;

        let records = stmt
            .query_map([round as i64], |row| {
                Ok(WeightRoundRecord {
                    agent_id: row.get(0)?,
                    timestamp_ms: row.get::<_, i64>(1)? as u64,
                    round: row.get::<_, i64>(2)? as u64,
                    r1: row.get(3)?,
                    p1: row.get(4)?,
                    r2: row.get(5)?,
                    p2: row.get(6)?,
                    weight_delta: row.get(7)?,
                    converged: row.get::<_, i32>(8)? != 0,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Number of logged updates
    pub fn iteration_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM iterations", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
