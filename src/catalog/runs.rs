use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use crate::catalog::CatalogStore;
use crate::error::EtlError;

/// Run lifecycle. `Running` is also the resting state of a timed-out run
/// awaiting resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Run {
    pub id: i64,
    pub job_id: i64,
    pub run_status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub records_loaded: i64,
    pub error_message: Option<String>,
    pub run_context: Option<Value>,
}

/// What to do with the `checkpoint` key of the run context on update.
#[derive(Debug, Clone)]
pub enum CheckpointUpdate {
    /// Leave the stored checkpoint untouched.
    Keep,
    /// Replace it with this serialized checkpoint.
    Set(Value),
    /// Remove it (terminal success).
    Clear,
}

impl CatalogStore {
    /// Open a run in `running`. Original parameters, when present, are kept
    /// under the context's `parameters` key for the lifetime of the run.
    pub async fn create_run(
        &self,
        job_id: i64,
        parameters: Option<&Value>,
    ) -> Result<i64, EtlError> {
        let context = parameters.map(|p| serde_json::json!({ "parameters": p }));

        let row = sqlx::query(
            "INSERT INTO etl_runs (job_id, run_status, run_context) \
             VALUES ($1, 'running', $2) RETURNING id",
        )
        .bind(job_id)
        .bind(context)
        .fetch_one(&self.pool)
        .await?;

        let run_id: i64 = row.try_get("id")?;

        tracing::info! { job_id, run_id, "Created run." };

        Ok(run_id)
    }

    /// Update a run's status, counters, and checkpoint, and mirror the
    /// last-run summary onto the owning job row. One transaction; the store
    /// is the single writer for a run row.
    pub async fn update_run(
        &self,
        run_id: i64,
        status: RunStatus,
        records_loaded: i64,
        error_message: Option<&str>,
        checkpoint: CheckpointUpdate,
    ) -> Result<(), EtlError> {
        let (checkpoint_json, clear) = match checkpoint {
            CheckpointUpdate::Keep => (None, false),
            CheckpointUpdate::Set(value) => (Some(value), false),
            CheckpointUpdate::Clear => (None, true),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE etl_runs SET \
                run_status = $2, \
                records_loaded = $3, \
                error_message = $4, \
                completed_at = CASE WHEN $2 <> 'running' THEN now() ELSE NULL END, \
                duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT, \
                run_context = CASE \
                    WHEN $5::jsonb IS NOT NULL \
                        THEN jsonb_set(COALESCE(run_context, '{}'::jsonb), '{checkpoint}', $5::jsonb) \
                    WHEN $6 THEN COALESCE(run_context, '{}'::jsonb) - 'checkpoint' \
                    ELSE run_context \
                END \
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(records_loaded)
        .bind(error_message)
        .bind(checkpoint_json)
        .bind(clear)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE etl_jobs SET \
                last_run_at = now(), \
                last_run_status = $2, \
                last_run_records = $3, \
                updated_at = now() \
             WHERE id = (SELECT job_id FROM etl_runs WHERE id = $1)",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(records_loaded)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info! {
            run_id,
            status = %status,
            records_loaded,
            "Updated run."
        };

        Ok(())
    }

    pub async fn run(&self, run_id: i64) -> Result<Run, EtlError> {
        let run = sqlx::query_as::<_, Run>(
            "SELECT id, job_id, run_status, started_at, completed_at, duration_ms, \
                    records_loaded, error_message, run_context \
             FROM etl_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        run.ok_or_else(|| EtlError::ConfigInvalid(format!("run {run_id} not found")))
    }

    /// The raw checkpoint value stored on a run, if any. The executor owns
    /// the shape; the store only persists it.
    pub async fn checkpoint(&self, run_id: i64) -> Result<Option<Value>, EtlError> {
        let row = sqlx::query("SELECT run_context -> 'checkpoint' AS cp FROM etl_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| r.try_get::<Option<Value>, _>("cp").ok().flatten()))
    }

    /// The latest running or failed run of a job that carries a checkpoint,
    /// which a resuming executor may pick up instead of opening a new run.
    pub async fn find_resumable_run(&self, job_id: i64) -> Result<Option<i64>, EtlError> {
        let row = sqlx::query(
            "SELECT id FROM etl_runs \
             WHERE job_id = $1 \
               AND run_status IN ('running', 'failed') \
               AND run_context ? 'checkpoint' \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("id")?),
            None => None,
        })
    }

    /// High-water mark for incremental loads: completion time of the latest
    /// successful run for this (job, parameters) pair.
    pub async fn last_successful_completed_at(
        &self,
        job_id: i64,
        parameters: Option<&Value>,
    ) -> Result<Option<DateTime<Utc>>, EtlError> {
        let row = sqlx::query(
            "SELECT completed_at FROM etl_runs \
             WHERE job_id = $1 \
               AND run_status = 'success' \
               AND ($2::jsonb IS NULL OR run_context -> 'parameters' = $2::jsonb) \
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(job_id)
        .bind(parameters)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            r.try_get::<Option<DateTime<Utc>>, _>("completed_at")
                .ok()
                .flatten()
        }))
    }

    /// External reaper path: runs stuck in `running` beyond the threshold
    /// are swept to `failed`. Returns the number of runs swept.
    pub async fn sweep_stuck_runs(&self, threshold_hours: u64) -> Result<u64, EtlError> {
        let result = sqlx::query(
            "UPDATE etl_runs SET \
                run_status = 'failed', \
                error_message = COALESCE(error_message, 'swept: exceeded stuck-run threshold'), \
                completed_at = now(), \
                duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT \
             WHERE run_status = 'running' \
               AND started_at < now() - make_interval(hours => $1)",
        )
        .bind(threshold_hours as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn! {
                count = result.rows_affected(),
                "Swept stuck runs to failed."
            };
        }

        Ok(result.rows_affected())
    }
}
