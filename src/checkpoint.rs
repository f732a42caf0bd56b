use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::InputRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Pending,
    Done,
    Failed,
}

impl CheckpointStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Done => "done",
            CheckpointStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "done" => CheckpointStatus::Done,
            "failed" => CheckpointStatus::Failed,
            _ => CheckpointStatus::Pending,
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts remain; the row will be picked up again.
    Retryable { attempts: u32 },
    /// Attempt budget exhausted; excluded from automatic retry.
    Terminal { attempts: u32 },
    /// The row was already done; nothing changed.
    AlreadyDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRow {
    pub row_number: u64,
    pub url: String,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub total: usize,
    pub done: usize,
    pub pending: usize,
    pub retryable: usize,
    pub terminal: Vec<FailedRow>,
}

/// Per-stage row progress, persisted in SQLite so a run can resume.
///
/// Every mark is its own committed statement, so a crash loses at most the
/// rows still in flight. `done` is final: nothing moves a row out of it.
pub struct CheckpointTracker {
    conn: Connection,
    stage: String,
    max_attempts: u32,
}

impl CheckpointTracker {
    pub fn open(path: &Path, stage: &str, max_attempts: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open checkpoint db {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::with_connection(conn, stage, max_attempts)
    }

    pub fn in_memory(stage: &str, max_attempts: u32) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, stage, max_attempts)
    }

    fn with_connection(conn: Connection, stage: &str, max_attempts: u32) -> Result<Self> {
        init_schema(&conn)?;
        Ok(CheckpointTracker {
            conn,
            stage: stage.to_string(),
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Add rows not seen before as `pending`. Known rows keep their state.
    pub fn register(&self, rows: &[InputRow]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO checkpoints (stage, row_number, url, status)
                 VALUES (?1, ?2, ?3, 'pending')",
            )?;
            for r in rows {
                count += stmt.execute(params![self.stage, r.row_number as i64, r.url])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn status(&self, row: u64) -> Result<Option<CheckpointStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM checkpoints WHERE stage = ?1 AND row_number = ?2",
                params![self.stage, row as i64],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status.as_deref().map(CheckpointStatus::parse))
    }

    /// True when the row still needs work: unknown, pending, or failed with
    /// attempts left.
    pub fn is_pending(&self, row: u64) -> Result<bool> {
        let entry: Option<(String, u32)> = self
            .conn
            .query_row(
                "SELECT status, attempts FROM checkpoints WHERE stage = ?1 AND row_number = ?2",
                params![self.stage, row as i64],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(match entry {
            None => true,
            Some((status, attempts)) => match CheckpointStatus::parse(&status) {
                CheckpointStatus::Done => false,
                CheckpointStatus::Pending => true,
                CheckpointStatus::Failed => attempts < self.max_attempts,
            },
        })
    }

    /// Rows still needing work, in row order.
    pub fn pending_rows(&self) -> Result<Vec<InputRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_number, url FROM checkpoints
             WHERE stage = ?1
               AND (status = 'pending' OR (status = 'failed' AND attempts < ?2))
             ORDER BY row_number",
        )?;
        let rows = stmt
            .query_map(params![self.stage, self.max_attempts], |row| {
                Ok(InputRow {
                    row_number: row.get::<_, i64>(0)? as u64,
                    url: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record a completed row. Call only after its output is written.
    pub fn mark_done(&self, row: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO checkpoints (stage, row_number, url, status, updated_at)
             VALUES (?1, ?2, '', 'done', datetime('now'))
             ON CONFLICT(stage, row_number) DO UPDATE
             SET status = 'done', last_error = NULL, updated_at = datetime('now')",
            params![self.stage, row as i64],
        )?;
        Ok(())
    }

    /// Record one failed attempt for a row.
    pub fn mark_failed(&self, row: u64, error: &str) -> Result<FailureOutcome> {
        if self.status(row)? == Some(CheckpointStatus::Done) {
            return Ok(FailureOutcome::AlreadyDone);
        }
        self.conn.execute(
            "INSERT INTO checkpoints (stage, row_number, url, status, attempts, last_error, updated_at)
             VALUES (?1, ?2, '', 'failed', 1, ?3, datetime('now'))
             ON CONFLICT(stage, row_number) DO UPDATE
             SET status = 'failed', attempts = attempts + 1, last_error = ?3,
                 updated_at = datetime('now')
             WHERE status != 'done'",
            params![self.stage, row as i64, error],
        )?;
        let attempts: u32 = self.conn.query_row(
            "SELECT attempts FROM checkpoints WHERE stage = ?1 AND row_number = ?2",
            params![self.stage, row as i64],
            |r| r.get(0),
        )?;
        Ok(if attempts >= self.max_attempts {
            FailureOutcome::Terminal { attempts }
        } else {
            FailureOutcome::Retryable { attempts }
        })
    }

    /// Row numbers already completed for this stage.
    pub fn completed_rows(&self) -> Result<HashSet<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT row_number FROM checkpoints WHERE stage = ?1 AND status = 'done'")?;
        let rows = stmt
            .query_map(params![self.stage], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|n| n as u64))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(rows)
    }

    /// Fold the WAL into the main database file.
    pub fn persist(&self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
            .optional()?;
        Ok(())
    }

    /// Operator action: give failed rows a fresh attempt budget.
    pub fn reset_failed(&self) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE checkpoints SET status = 'pending', attempts = 0, updated_at = datetime('now')
             WHERE stage = ?1 AND status = 'failed'",
            params![self.stage],
        )?;
        Ok(n)
    }

    pub fn summary(&self) -> Result<CheckpointSummary> {
        let mut summary = CheckpointSummary::default();
        let mut stmt = self.conn.prepare(
            "SELECT status, attempts, COUNT(*) FROM checkpoints WHERE stage = ?1
             GROUP BY status, attempts >= ?2",
        )?;
        let groups = stmt
            .query_map(params![self.stage, self.max_attempts], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, i64>(2)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, attempts, count) in groups {
            summary.total += count;
            match CheckpointStatus::parse(&status) {
                CheckpointStatus::Done => summary.done += count,
                CheckpointStatus::Pending => summary.pending += count,
                CheckpointStatus::Failed if attempts < self.max_attempts => {
                    summary.retryable += count
                }
                CheckpointStatus::Failed => {}
            }
        }
        summary.terminal = self.terminal_failures()?;
        Ok(summary)
    }

    pub fn terminal_failures(&self) -> Result<Vec<FailedRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_number, url, attempts, COALESCE(last_error, '') FROM checkpoints
             WHERE stage = ?1 AND status = 'failed' AND attempts >= ?2
             ORDER BY row_number",
        )?;
        let rows = stmt
            .query_map(params![self.stage, self.max_attempts], |row| {
                Ok(FailedRow {
                    row_number: row.get::<_, i64>(0)? as u64,
                    url: row.get(1)?,
                    attempts: row.get(2)?,
                    last_error: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Stage names recorded in a checkpoint database.
pub fn list_stages(path: &Path) -> Result<Vec<String>> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open checkpoint db {:?}", path))?;
    init_schema(&conn)?;
    let mut stmt = conn.prepare("SELECT DISTINCT stage FROM checkpoints ORDER BY stage")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoints (
            stage       TEXT NOT NULL,
            row_number  INTEGER NOT NULL,
            url         TEXT NOT NULL DEFAULT '',
            status      TEXT NOT NULL CHECK(status IN ('pending','done','failed')),
            attempts    INTEGER NOT NULL DEFAULT 0,
            last_error  TEXT,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (stage, row_number)
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(stage, status);
        ",
    )?;
    Ok(())
}
