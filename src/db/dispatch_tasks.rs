//! Outbox rows for the queued dispatcher.
//!
//! A task is written in the same SQLite transaction as the posting it
//! describes, so either both exist or neither does. The dispatch worker
//! claims due tasks, delivers them and records the outcome.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::*;
use crate::util::{parse_time_column, to_db_time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Delivered,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Delivered => "delivered",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "delivered" => Some(TaskStatus::Delivered),
            "dead" => Some(TaskStatus::Dead),
            _ => None,
        }
    }
}

/// Fields for a new outbox row.
#[derive(Debug, Clone)]
pub struct NewDispatchTask<'a> {
    pub handler: &'a str,
    pub url: &'a str,
    pub method: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub payload_json: &'a str,
}

/// A row from the `dispatch_tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchTask {
    pub id: u64,
    pub handler: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub payload_json: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

const TASK_COLUMNS: &str = "id, handler, url, method, headers_json, payload_json, status, \
     attempts, last_error, next_attempt_at, created_at, delivered_at";

impl LedgerDb {
    // =========================================================================
    // Dispatch outbox
    // =========================================================================

    /// Queue a task, due immediately. Returns the task id.
    pub fn enqueue_dispatch_task(
        &self,
        task: &NewDispatchTask<'_>,
    ) -> Result<u64, rusqlite::Error> {
        let headers_json = serde_json::to_string(task.headers)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let now = to_db_time(Utc::now());
        self.conn.execute(
            "INSERT INTO dispatch_tasks
                (handler, url, method, headers_json, payload_json, status, attempts,
                 next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
            params![
                task.handler,
                task.url,
                task.method,
                headers_json,
                task.payload_json,
                now
            ],
        )?;
        Ok(self.last_id())
    }

    /// Pending tasks whose next attempt is due, oldest first.
    pub fn get_due_dispatch_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DispatchTask>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM dispatch_tasks
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY next_attempt_at, id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_db_time(now), limit as i64], Self::map_task_row)?;
        rows.collect()
    }

    pub fn get_dispatch_task(&self, id: u64) -> Result<Option<DispatchTask>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM dispatch_tasks WHERE id = ?1"),
                params![id as i64],
                Self::map_task_row,
            )
            .optional()
    }

    /// Number of tasks in a given state.
    pub fn count_dispatch_tasks(&self, status: TaskStatus) -> Result<u64, rusqlite::Error> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dispatch_tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn mark_dispatch_delivered(&self, id: u64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE dispatch_tasks
             SET status = 'delivered', attempts = attempts + 1, last_error = NULL, delivered_at = ?2
             WHERE id = ?1",
            params![id as i64, to_db_time(Utc::now())],
        )?;
        Ok(())
    }

    /// Record a failed attempt and push the task back by `delay`.
    pub fn reschedule_dispatch_task(
        &self,
        id: u64,
        error: &str,
        delay: Duration,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE dispatch_tasks
             SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
             WHERE id = ?1",
            params![id as i64, error, to_db_time(Utc::now() + delay)],
        )?;
        Ok(())
    }

    /// Give up on a task after its final failed attempt.
    pub fn mark_dispatch_dead(&self, id: u64, error: &str) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE dispatch_tasks
             SET status = 'dead', attempts = attempts + 1, last_error = ?2
             WHERE id = ?1",
            params![id as i64, error],
        )?;
        Ok(())
    }

    /// Delete delivered tasks older than `before`. Dead tasks are kept for inspection.
    pub fn prune_delivered_tasks(&self, before: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "DELETE FROM dispatch_tasks WHERE status = 'delivered' AND delivered_at < ?1",
            params![to_db_time(before)],
        )
    }

    fn map_task_row(row: &Row<'_>) -> rusqlite::Result<DispatchTask> {
        let headers_json: String = row.get(4)?;
        let status_text: String = row.get(6)?;
        let next_text: String = row.get(9)?;
        let created_text: String = row.get(10)?;
        let delivered_text: Option<String> = row.get(11)?;
        Ok(DispatchTask {
            id: row.get::<_, i64>(0)? as u64,
            handler: row.get(1)?,
            url: row.get(2)?,
            method: row.get(3)?,
            headers: serde_json::from_str(&headers_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            payload_json: row.get(5)?,
            status: TaskStatus::parse(&status_text)
                .ok_or_else(|| accounts::invalid_text(6, &status_text))?,
            attempts: row.get::<_, i64>(7)? as u32,
            last_error: row.get(8)?,
            next_attempt_at: parse_time_column(9, &next_text)?,
            created_at: parse_time_column(10, &created_text)?,
            delivered_at: delivered_text
                .map(|t| parse_time_column(11, &t))
                .transpose()?,
        })
    }
}
