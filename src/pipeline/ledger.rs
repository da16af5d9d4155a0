use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::PipelineError;
use crate::model::TaskStatus;
use crate::util::now_utc_string;

/// Durable per-task state. The ledger is what makes the notification
/// invariant hold across at-least-once redelivery: attempt counts survive
/// process restarts, and the notified flags guarantee a task never emits
/// a second success or failure notification.
pub struct TaskLedger {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub correlation_key: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub success_notified: bool,
    pub failure_notified: bool,
    pub results_reference: Option<String>,
    pub updated_at: String,
}

impl TaskLedger {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)
            .map_err(|err| PipelineError::Ledger(format!("failed to open ledger: {err}")))?;
        let ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| PipelineError::Ledger(format!("failed to open ledger: {err}")))?;
        let ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&self) -> Result<(), PipelineError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                  correlation_key   TEXT PRIMARY KEY,
                  status            TEXT NOT NULL,
                  attempts          INTEGER NOT NULL DEFAULT 0,
                  last_error        TEXT,
                  success_notified  INTEGER NOT NULL DEFAULT 0,
                  failure_notified  INTEGER NOT NULL DEFAULT 0,
                  results_reference TEXT,
                  created_at        TEXT NOT NULL,
                  updated_at        TEXT NOT NULL
                );
                ",
            )
            .map_err(ledger_error)
    }

    /// Register one delivery attempt: upsert the row, bump the counter,
    /// move the task to Running. Returns the attempt number just started.
    pub fn begin_attempt(&self, correlation_key: &str) -> Result<u32, PipelineError> {
        let now = now_utc_string();
        self.conn
            .execute(
                "
                INSERT INTO tasks (correlation_key, status, attempts, created_at, updated_at)
                VALUES (?1, ?2, 1, ?3, ?3)
                ON CONFLICT(correlation_key) DO UPDATE SET
                  status = ?2,
                  attempts = attempts + 1,
                  updated_at = ?3
                ",
                params![correlation_key, TaskStatus::Running.as_str(), now],
            )
            .map_err(ledger_error)?;

        self.conn
            .query_row(
                "SELECT attempts FROM tasks WHERE correlation_key = ?1",
                [correlation_key],
                |row| row.get::<_, u32>(0),
            )
            .map_err(ledger_error)
    }

    pub fn record_status(
        &self,
        correlation_key: &str,
        status: TaskStatus,
    ) -> Result<(), PipelineError> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE correlation_key = ?1",
                params![correlation_key, status.as_str(), now_utc_string()],
            )
            .map_err(ledger_error)?;
        Ok(())
    }

    pub fn record_error(
        &self,
        correlation_key: &str,
        status: TaskStatus,
        message: &str,
    ) -> Result<(), PipelineError> {
        let now = now_utc_string();
        self.conn
            .execute(
                "
                INSERT INTO tasks (correlation_key, status, attempts, last_error, created_at, updated_at)
                VALUES (?1, ?2, 0, ?3, ?4, ?4)
                ON CONFLICT(correlation_key) DO UPDATE SET
                  status = ?2,
                  last_error = ?3,
                  updated_at = ?4
                ",
                params![correlation_key, status.as_str(), message, now],
            )
            .map_err(ledger_error)?;
        Ok(())
    }

    pub fn record_success(
        &self,
        correlation_key: &str,
        results_reference: &str,
    ) -> Result<(), PipelineError> {
        self.conn
            .execute(
                "
                UPDATE tasks
                SET status = ?2, results_reference = ?3, last_error = NULL, updated_at = ?4
                WHERE correlation_key = ?1
                ",
                params![
                    correlation_key,
                    TaskStatus::Succeeded.as_str(),
                    results_reference,
                    now_utc_string()
                ],
            )
            .map_err(ledger_error)?;
        Ok(())
    }

    pub fn task(&self, correlation_key: &str) -> Result<Option<TaskRow>, PipelineError> {
        self.conn
            .query_row(
                "
                SELECT correlation_key, status, attempts, last_error,
                       success_notified, failure_notified, results_reference, updated_at
                FROM tasks
                WHERE correlation_key = ?1
                ",
                [correlation_key],
                |row| {
                    let status_text: String = row.get(1)?;
                    Ok(TaskRow {
                        correlation_key: row.get(0)?,
                        status: TaskStatus::parse(&status_text).unwrap_or(TaskStatus::Pending),
                        attempts: row.get(2)?,
                        last_error: row.get(3)?,
                        success_notified: row.get::<_, i64>(4)? != 0,
                        failure_notified: row.get::<_, i64>(5)? != 0,
                        results_reference: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(ledger_error)
    }

    /// Atomically claim the right to send the success notification.
    /// Returns false when it was already claimed, in which case the caller
    /// must not notify again.
    pub fn claim_success_notification(&self, correlation_key: &str) -> Result<bool, PipelineError> {
        let changed = self
            .conn
            .execute(
                "
                UPDATE tasks
                SET success_notified = 1, updated_at = ?2
                WHERE correlation_key = ?1 AND success_notified = 0
                ",
                params![correlation_key, now_utc_string()],
            )
            .map_err(ledger_error)?;
        Ok(changed == 1)
    }

    /// Release a success claim whose delivery failed so a later attempt
    /// can notify.
    pub fn release_success_notification(
        &self,
        correlation_key: &str,
    ) -> Result<(), PipelineError> {
        self.conn
            .execute(
                "UPDATE tasks SET success_notified = 0, updated_at = ?2 WHERE correlation_key = ?1",
                params![correlation_key, now_utc_string()],
            )
            .map_err(ledger_error)?;
        Ok(())
    }

    /// Atomically claim the right to send the failure notification.
    pub fn claim_failure_notification(&self, correlation_key: &str) -> Result<bool, PipelineError> {
        let now = now_utc_string();
        self.conn
            .execute(
                "
                INSERT INTO tasks (correlation_key, status, attempts, created_at, updated_at)
                VALUES (?1, ?2, 0, ?3, ?3)
                ON CONFLICT(correlation_key) DO NOTHING
                ",
                params![correlation_key, TaskStatus::Pending.as_str(), now],
            )
            .map_err(ledger_error)?;

        let changed = self
            .conn
            .execute(
                "
                UPDATE tasks
                SET failure_notified = 1, updated_at = ?2
                WHERE correlation_key = ?1 AND failure_notified = 0
                ",
                params![correlation_key, now],
            )
            .map_err(ledger_error)?;
        Ok(changed == 1)
    }

    pub fn status_counts(&self) -> Result<Vec<(String, i64)>, PipelineError> {
        let mut statement = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
            .map_err(ledger_error)?;

        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(ledger_error)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(ledger_error)
    }

    pub fn recent_tasks(&self, limit: usize) -> Result<Vec<TaskRow>, PipelineError> {
        let mut statement = self
            .conn
            .prepare(
                "
                SELECT correlation_key, status, attempts, last_error,
                       success_notified, failure_notified, results_reference, updated_at
                FROM tasks
                ORDER BY updated_at DESC
                LIMIT ?1
                ",
            )
            .map_err(ledger_error)?;

        let rows = statement
            .query_map([limit as i64], |row| {
                let status_text: String = row.get(1)?;
                Ok(TaskRow {
                    correlation_key: row.get(0)?,
                    status: TaskStatus::parse(&status_text).unwrap_or(TaskStatus::Pending),
                    attempts: row.get(2)?,
                    last_error: row.get(3)?,
                    success_notified: row.get::<_, i64>(4)? != 0,
                    failure_notified: row.get::<_, i64>(5)? != 0,
                    results_reference: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })
            .map_err(ledger_error)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(ledger_error)
    }
}

fn ledger_error(err: rusqlite::Error) -> PipelineError {
    PipelineError::Ledger(err.to_string())
}
