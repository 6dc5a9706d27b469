/// Run Ledger
///
/// Durable record of every run: created RUNNING at start, moved exactly once
/// to COMPLETED or FAILED. Synchronous callers only ever observe a run through
/// this record.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(anyhow!("Unknown run status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub owner_id: Option<String>,
    pub status: RunStatus,
    /// Serialized payload the run started with (credential masked)
    pub input: Option<Value>,
    /// Serialized extracted variables, set on a terminal transition
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn running(run_id: Uuid, workflow_id: &str, owner_id: Option<String>, input: Value) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.to_string(),
            owner_id,
            status: RunStatus::Running,
            input: Some(input),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Narrow create/update/read interface over run records
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn create(&self, record: &RunRecord) -> Result<()>;

    /// RUNNING -> COMPLETED; false if the run was not RUNNING
    async fn complete(&self, run_id: Uuid, output: Value) -> Result<bool>;

    /// RUNNING -> FAILED; false if the run was not RUNNING
    async fn fail(&self, run_id: Uuid, error: &str, output: Option<Value>) -> Result<bool>;

    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Most recently started RUNNING record of a workflow
    async fn find_running(&self, workflow_id: &str) -> Result<Option<RunRecord>>;
}

/// Run ledger sharing the application SQLite database
#[derive(Debug, Clone)]
pub struct SqliteRunLedger {
    pool: SqlitePool,
}

impl SqliteRunLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                owner_id TEXT,
                status TEXT NOT NULL,
                input TEXT,
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_runs_workflow_status ON workflow_runs(workflow_id, status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let output_json = output.map(|v| v.to_string());

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = ?, output = ?, error = ?, completed_at = ?
            WHERE run_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status.as_str())
        .bind(output_json)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            tracing::warn!(
                "⚠️ Run {} was not RUNNING; ignoring transition to {}",
                run_id,
                status.as_str()
            );
        }
        Ok(applied)
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(Into::into)
}

fn record_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let run_id: String = row.get("run_id");
    let status: String = row.get("status");
    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(RunRecord {
        run_id: Uuid::parse_str(&run_id)?,
        workflow_id: row.get("workflow_id"),
        owner_id: row.get("owner_id"),
        status: RunStatus::parse(&status)?,
        input: parse_json(row.get("input"))?,
        output: parse_json(row.get("output"))?,
        error: row.get("error"),
        started_at: parse_time(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_time).transpose()?,
    })
}

#[async_trait]
impl RunLedger for SqliteRunLedger {
    async fn create(&self, record: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (run_id, workflow_id, owner_id, status, input, output, error, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_id)
        .bind(&record.owner_id)
        .bind(record.status.as_str())
        .bind(record.input.as_ref().map(Value::to_string))
        .bind(record.output.as_ref().map(Value::to_string))
        .bind(&record.error)
        .bind(record.started_at.to_rfc3339())
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        tracing::debug!("📝 Created run record {} ({})", record.run_id, record.workflow_id);
        Ok(())
    }

    async fn complete(&self, run_id: Uuid, output: Value) -> Result<bool> {
        self.finish(run_id, RunStatus::Completed, Some(output), None)
            .await
    }

    async fn fail(&self, run_id: Uuid, error: &str, output: Option<Value>) -> Result<bool> {
        self.finish(run_id, RunStatus::Failed, output, Some(error))
            .await
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_running(&self, workflow_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE workflow_id = ? AND status = 'RUNNING'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }
}

/// Outcome of polling a run record
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Terminal(RunRecord),
    /// The run keeps executing; only the wait gave up
    TimedOut,
    NotFound,
}

/// Poll the record every `poll_interval` until it is terminal or `timeout`
/// elapses
pub async fn wait_for_terminal(
    ledger: &dyn RunLedger,
    run_id: Uuid,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<WaitOutcome> {
    let deadline = Instant::now() + timeout;

    loop {
        match ledger.get(run_id).await? {
            None => return Ok(WaitOutcome::NotFound),
            Some(record) if record.status.is_terminal() => {
                return Ok(WaitOutcome::Terminal(record));
            }
            Some(_) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!("⏰ Timed out waiting for run {} after {:?}", run_id, timeout);
            return Ok(WaitOutcome::TimedOut);
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
