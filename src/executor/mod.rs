//! Per-job extract/load pipeline with checkpoint, timeout, and resume.

mod checkpoint;
mod template;

pub use checkpoint::{Checkpoint, FailedParameter, PagingCheckpoint, ParameterCheckpoint};

use std::pin::pin;
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use serde_json::Value;
use tokio::time::Instant;

use crate::api::{ApiClient, ApiClientConfig, ODataQuery};
use crate::catalog::{CatalogStore, CheckpointUpdate, JobConfig, RunStatus};
use crate::error::EtlError;
use crate::loader::{DataLoader, StagingRecord};
use crate::preflight;
use crate::settings::Settings;

/// Reserved payload key carrying the parent parameter value, so downstream
/// triggers can recover which patient/study a sub-record belongs to.
const PARENT_ID_KEY: &str = "_parentId";

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    /// Pick up the latest resumable run of this job instead of opening a
    /// fresh one.
    pub resume: bool,
    /// Wall-clock deadline override; defaults to the configured per-run
    /// timeout.
    pub timeout: Option<Duration>,
    /// Override the catalog-sourced parameter list (targeted backfills and
    /// tests).
    pub parameter_values: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: i64,
    /// `Running` is returned only on the timeout path and means "resume me".
    pub status: RunStatus,
    pub records_loaded: i64,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

/// Seam between the dispatch layers and the executor, so the orchestrator
/// and scheduler can be exercised against a stub runner.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(
        &self,
        job_id: i64,
        opts: ExecuteOptions,
    ) -> Result<ExecutionResult, EtlError>;
}

/// Why the inner pipeline stopped short of draining its pages.
enum PipelineInterrupt {
    /// Deadline fired; a checkpoint was persisted and the run stays
    /// `running`.
    Timeout { total_records: i64 },
    Fatal(EtlError),
}

impl From<EtlError> for PipelineInterrupt {
    fn from(err: EtlError) -> Self {
        PipelineInterrupt::Fatal(err)
    }
}

/// Which checkpoint shape a paging position is persisted under.
enum CheckpointShape<'a> {
    Paging,
    Parameter {
        parameter_index: usize,
        base_total: i64,
        failed: &'a [FailedParameter],
    },
}

impl CheckpointShape<'_> {
    /// Wrap a paging position into the persisted shape; returns the
    /// checkpoint and the run-level record count it represents.
    fn wrap(&self, page: PagingCheckpoint) -> (Checkpoint, i64) {
        match self {
            CheckpointShape::Paging => {
                let total = page.total_records;
                (Checkpoint::Paging(page), total)
            }
            CheckpointShape::Parameter {
                parameter_index,
                base_total,
                failed,
            } => {
                let total = base_total + page.total_records;
                (
                    Checkpoint::Parameter(ParameterCheckpoint {
                        parameter_index: *parameter_index,
                        total_records: total,
                        failed_parameters: failed.to_vec(),
                        page: Some(page),
                        saved_at: Utc::now(),
                    }),
                    total,
                )
            }
        }
    }
}

struct PipelineOutcome {
    total_records: i64,
    /// Partial-success parameterized runs keep their final checkpoint (it
    /// carries the failure list for post-hoc inspection).
    keep_checkpoint: bool,
}

pub struct JobExecutor {
    catalog: CatalogStore,
    loader: DataLoader,
    default_client: ApiClient,
    settings: Settings,
}

impl JobExecutor {
    pub fn new(
        catalog: CatalogStore,
        loader: DataLoader,
        default_client: ApiClient,
        settings: Settings,
    ) -> Self {
        Self {
            catalog,
            loader,
            default_client,
            settings,
        }
    }

    /// Execute one job end to end, possibly resuming from a checkpoint.
    ///
    /// Exactly one terminal run record is written on success or
    /// unrecoverable failure; a timeout leaves the run `running` behind a
    /// valid checkpoint. Errors are returned only for failures that occur
    /// before a run exists (unknown/inactive job, blocked preflight).
    pub async fn execute(
        &self,
        job_id: i64,
        opts: ExecuteOptions,
    ) -> Result<ExecutionResult, EtlError> {
        let started = Instant::now();

        let job = self.catalog.job(job_id).await?;
        if !job.is_active {
            return Err(EtlError::ConfigInvalid(format!("job {job_id} is not active")));
        }

        let dry_run = opts.dry_run || self.settings.dry_run;
        // A dry run touches no network, so only the environment and host
        // rails apply.
        preflight::preflight(&self.settings, !dry_run, false, Some(dry_run))?;

        let client = self.client_for_job(&job).await?;

        let parameters_context = opts
            .parameter_values
            .as_ref()
            .map(|values| serde_json::json!({ "values": values }));

        let mut run_id = None;
        let mut saved_checkpoint = None;
        if opts.resume {
            if let Some(existing) = self.catalog.find_resumable_run(job_id).await? {
                saved_checkpoint = match self.catalog.checkpoint(existing).await? {
                    Some(value) => Some(Checkpoint::from_value(existing, value)?),
                    None => None,
                };
                run_id = Some(existing);
                tracing::info! { job_id, run_id = existing, "Resuming run from checkpoint." };
            } else {
                tracing::info! { job_id, "No resumable run found, starting fresh." };
            }
        }
        let run_id = match run_id {
            Some(id) => id,
            None => {
                self.catalog
                    .create_run(job_id, parameters_context.as_ref())
                    .await?
            }
        };

        let timeout = opts
            .timeout
            .unwrap_or(Duration::from_secs(self.settings.timeout_seconds));
        let deadline = started + timeout;

        tracing::info! {
            job_id,
            job_name = %job.name,
            run_id,
            requires_parameters = job.requires_parameters,
            incremental = job.incremental_load,
            dry_run,
            timeout_seconds = timeout.as_secs(),
            "Job execution started."
        };

        let incremental_clause = self
            .incremental_filter(&job, parameters_context.as_ref())
            .await?;

        let outcome = if job.requires_parameters {
            self.execute_parameterized(
                &job,
                &client,
                run_id,
                &opts,
                saved_checkpoint,
                incremental_clause,
                deadline,
                dry_run,
            )
            .await
        } else {
            let resume_page = match saved_checkpoint {
                Some(Checkpoint::Paging(page)) => Some(page),
                _ => None,
            };
            self.extract_and_load(
                &job,
                &client,
                run_id,
                &job.source_endpoint,
                None,
                resume_page,
                incremental_clause,
                deadline,
                dry_run,
                CheckpointShape::Paging,
            )
            .await
            .map(|total_records| PipelineOutcome {
                total_records,
                keep_checkpoint: false,
            })
        };

        let duration_seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(outcome) => {
                let update = if outcome.keep_checkpoint {
                    CheckpointUpdate::Keep
                } else {
                    CheckpointUpdate::Clear
                };
                self.catalog
                    .update_run(run_id, RunStatus::Success, outcome.total_records, None, update)
                    .await?;

                tracing::info! {
                    job_id,
                    run_id,
                    records_loaded = outcome.total_records,
                    duration_seconds,
                    "Job execution completed."
                };

                Ok(ExecutionResult {
                    run_id,
                    status: RunStatus::Success,
                    records_loaded: outcome.total_records,
                    error_message: None,
                    duration_seconds,
                })
            }
            Err(PipelineInterrupt::Timeout { total_records }) => {
                let message = EtlError::Timeout {
                    timeout_seconds: timeout.as_secs(),
                    records_loaded: total_records,
                }
                .to_string();

                // The checkpoint itself was persisted at the interruption
                // point; this write records the message without touching it.
                self.catalog
                    .update_run(
                        run_id,
                        RunStatus::Running,
                        total_records,
                        Some(&message),
                        CheckpointUpdate::Keep,
                    )
                    .await?;

                tracing::warn! {
                    job_id,
                    run_id,
                    records_loaded = total_records,
                    duration_seconds,
                    "Job timed out with checkpoint saved, retry to resume."
                };

                Ok(ExecutionResult {
                    run_id,
                    status: RunStatus::Running,
                    records_loaded: total_records,
                    error_message: Some(message),
                    duration_seconds,
                })
            }
            Err(PipelineInterrupt::Fatal(err)) => {
                let message = err.to_string();
                self.catalog
                    .update_run(
                        run_id,
                        RunStatus::Failed,
                        0,
                        Some(&message),
                        CheckpointUpdate::Keep,
                    )
                    .await?;

                tracing::error! {
                    job_id,
                    run_id,
                    error = %message,
                    duration_seconds,
                    "Job execution failed."
                };

                Ok(ExecutionResult {
                    run_id,
                    status: RunStatus::Failed,
                    records_loaded: 0,
                    error_message: Some(message),
                    duration_seconds,
                })
            }
        }
    }

    /// Incremental high-water filter for this run: `ts gt <iso8601Z>` from
    /// the last successful run's completion, composed later by conjunction.
    async fn incremental_filter(
        &self,
        job: &JobConfig,
        parameters: Option<&Value>,
    ) -> Result<Option<String>, EtlError> {
        if !job.incremental_load {
            return Ok(None);
        }
        if job.timestamp_field_name.is_empty() {
            return Err(EtlError::ConfigInvalid(format!(
                "job {} is incremental but has no timestamp field",
                job.id
            )));
        }

        let Some(high_water) = self
            .catalog
            .last_successful_completed_at(job.id, parameters)
            .await?
        else {
            tracing::info! { job_id = job.id, "No previous success, running full load." };
            return Ok(None);
        };

        let clause = format!(
            "{} gt {}",
            job.timestamp_field_name,
            high_water.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );
        tracing::info! {
            job_id = job.id,
            filter = %clause,
            "Incremental filter applied."
        };
        Ok(Some(clause))
    }

    /// Credential selection. Development and test always use the process
    /// default regardless of the job's credential reference; production
    /// resolves the reference and falls back to the default with a warning
    /// when the row is missing or inactive.
    async fn client_for_job(&self, job: &JobConfig) -> Result<ApiClient, EtlError> {
        if self.settings.is_development() || self.settings.is_test() {
            if job.source_instance_id.is_some() {
                tracing::info! {
                    job_id = job.id,
                    credential_id = job.source_instance_id,
                    environment = %self.settings.environment,
                    "Using process-default credentials outside production."
                };
            }
            return Ok(self.default_client.clone());
        }

        let Some(credential_id) = job.source_instance_id else {
            return Ok(self.default_client.clone());
        };

        match self.catalog.credential(credential_id).await? {
            Some(credential) => {
                tracing::info! {
                    job_id = job.id,
                    credential_id,
                    base_url = %credential.base_url,
                    "Using catalog credentials."
                };
                let config = ApiClientConfig::with_credential(
                    &self.settings,
                    credential.base_url,
                    credential.api_key,
                );
                Ok(ApiClient::new(config)?)
            }
            None => {
                tracing::warn! {
                    job_id = job.id,
                    credential_id,
                    "Credential missing or inactive, falling back to default."
                };
                Ok(self.default_client.clone())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_parameterized(
        &self,
        job: &JobConfig,
        client: &ApiClient,
        run_id: i64,
        opts: &ExecuteOptions,
        saved_checkpoint: Option<Checkpoint>,
        incremental_clause: Option<String>,
        deadline: Instant,
        dry_run: bool,
    ) -> Result<PipelineOutcome, PipelineInterrupt> {
        let placeholder = template::placeholder_name(&job.source_endpoint)?;

        let values = match &opts.parameter_values {
            Some(values) => values.clone(),
            None => {
                let table = job.parameter_source_table.as_deref().ok_or_else(|| {
                    EtlError::ConfigInvalid(format!(
                        "job {} requires parameters but has no parameter source table",
                        job.id
                    ))
                })?;
                let column = job.parameter_source_column.as_deref().ok_or_else(|| {
                    EtlError::ConfigInvalid(format!(
                        "job {} requires parameters but has no parameter source column",
                        job.id
                    ))
                })?;
                self.catalog.parameter_values(table, column).await?
            }
        };

        if values.is_empty() {
            tracing::info! { job_id = job.id, "No parameter values to process." };
            return Ok(PipelineOutcome {
                total_records: 0,
                keep_checkpoint: false,
            });
        }

        let (start_index, mut total, mut failed, mut resume_page) = match saved_checkpoint {
            Some(Checkpoint::Parameter(p)) => {
                tracing::info! {
                    job_id = job.id,
                    run_id,
                    start_index = p.parameter_index,
                    total_values = values.len(),
                    previous_records = p.total_records,
                    previous_failures = p.failed_parameters.len(),
                    "Resuming parameterized job."
                };
                // The nested page's records re-enter the total when its
                // parameter resumes, so they come out of the base here.
                let base = match &p.page {
                    Some(page) => p.total_records - page.total_records,
                    None => p.total_records,
                };
                (p.parameter_index, base, p.failed_parameters, p.page)
            }
            _ => (0, 0, Vec::new(), None),
        };

        let mut successes = start_index.saturating_sub(failed.len());
        let mut params_since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        for (index, value) in values.iter().enumerate() {
            if index < start_index {
                continue;
            }

            if Instant::now() >= deadline {
                let checkpoint = Checkpoint::Parameter(ParameterCheckpoint {
                    parameter_index: index,
                    total_records: total,
                    failed_parameters: failed.clone(),
                    page: None,
                    saved_at: Utc::now(),
                });
                self.save_checkpoint(run_id, &checkpoint, total).await?;
                return Err(PipelineInterrupt::Timeout {
                    total_records: total,
                });
            }

            let endpoint = template::substitute(&job.source_endpoint, &placeholder, value);
            let nested = resume_page.take();

            let result = self
                .extract_and_load(
                    job,
                    client,
                    run_id,
                    &endpoint,
                    Some(value.as_str()),
                    nested,
                    incremental_clause.clone(),
                    deadline,
                    dry_run,
                    CheckpointShape::Parameter {
                        parameter_index: index,
                        base_total: total,
                        failed: &failed,
                    },
                )
                .await;

            match result {
                Ok(records) => {
                    total += records;
                    successes += 1;
                }
                Err(PipelineInterrupt::Timeout { total_records }) => {
                    // The nested parameter checkpoint was saved by the inner
                    // pipeline at this index.
                    return Err(PipelineInterrupt::Timeout {
                        total_records,
                    });
                }
                Err(PipelineInterrupt::Fatal(err)) => {
                    push_failure(
                        &mut failed,
                        FailedParameter {
                            value: value.clone(),
                            endpoint: endpoint.clone(),
                            error: err.to_string(),
                        },
                    );
                    tracing::warn! {
                        job_id = job.id,
                        run_id,
                        parameter = %value,
                        endpoint = %endpoint,
                        error = %err,
                        failed_count = failed.len(),
                        total_values = values.len(),
                        "Parameter execution failed, continuing."
                    };
                    continue;
                }
            }

            params_since_checkpoint += 1;
            let due_by_count =
                params_since_checkpoint % Settings::CHECKPOINT_INTERVAL_PARAMS == 0;
            let due_by_time = last_checkpoint.elapsed()
                >= Duration::from_secs(Settings::CHECKPOINT_INTERVAL_SECONDS);
            if due_by_count || due_by_time {
                let checkpoint = Checkpoint::Parameter(ParameterCheckpoint {
                    parameter_index: index + 1,
                    total_records: total,
                    failed_parameters: failed.clone(),
                    page: None,
                    saved_at: Utc::now(),
                });
                self.save_checkpoint(run_id, &checkpoint, total).await?;
                last_checkpoint = Instant::now();
                tracing::info! {
                    job_id = job.id,
                    run_id,
                    parameter_index = index + 1,
                    total_values = values.len(),
                    total_records = total,
                    failed_count = failed.len(),
                    "Parameterized checkpoint saved."
                };
            }
        }

        if failed.is_empty() {
            return Ok(PipelineOutcome {
                total_records: total,
                keep_checkpoint: false,
            });
        }

        tracing::warn! {
            job_id = job.id,
            run_id,
            total_values = values.len(),
            successes,
            failed_count = failed.len(),
            "Parameterized job finished with partial failures."
        };

        if successes == 0 {
            return Err(PipelineInterrupt::Fatal(EtlError::AllParametersFailed {
                total: values.len(),
                first_error: failed[0].error.clone(),
            }));
        }

        // Partial success: persist the final failure list in the run
        // context so it stays inspectable after the run closes.
        let checkpoint = Checkpoint::Parameter(ParameterCheckpoint {
            parameter_index: values.len(),
            total_records: total,
            failed_parameters: failed,
            page: None,
            saved_at: Utc::now(),
        });
        self.save_checkpoint(run_id, &checkpoint, total).await?;

        Ok(PipelineOutcome {
            total_records: total,
            keep_checkpoint: true,
        })
    }

    /// One endpoint's extract/load loop: stream pages, wrap items into
    /// envelopes, commit loader batches in order, checkpoint periodically,
    /// and honor the deadline at page boundaries.
    #[allow(clippy::too_many_arguments)]
    async fn extract_and_load(
        &self,
        job: &JobConfig,
        client: &ApiClient,
        run_id: i64,
        endpoint: &str,
        parent_parameter: Option<&str>,
        resume: Option<PagingCheckpoint>,
        incremental_clause: Option<String>,
        deadline: Instant,
        dry_run: bool,
        shape: CheckpointShape<'_>,
    ) -> Result<i64, PipelineInterrupt> {
        let initial_skip = resume.as_ref().map(|c| c.skip).unwrap_or(0);
        let mut total = resume.as_ref().map(|c| c.total_records).unwrap_or(0);
        let mut page_index = resume.as_ref().map(|c| c.page_index).unwrap_or(0);
        let mut skip = initial_skip;

        let mut query = ODataQuery {
            top: Some(self.loader.batch_size() as i64),
            skip: (initial_skip > 0).then_some(initial_skip),
            ..Default::default()
        };
        if let Some(clause) = &incremental_clause {
            query = query.and_filter(clause);
        }

        tracing::info! {
            job_id = job.id,
            run_id,
            endpoint = %endpoint,
            resume_from_skip = initial_skip,
            dry_run,
            "Extracting pages."
        };

        let mut pages = pin!(
            client
                .fetch_pages(endpoint, query, dry_run)
                .map_err(EtlError::Api)?
        );

        let mut batch: Vec<StagingRecord> = Vec::new();
        let mut last_checkpoint = Instant::now();

        loop {
            let page = match pages.try_next().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    // Best-effort flush of the in-flight batch before
                    // surfacing the failure.
                    if !batch.is_empty() {
                        match self.flush(job, run_id, &mut batch, dry_run).await {
                            Ok(flushed) => total += flushed,
                            Err(flush_err) => {
                                tracing::error! {
                                    job_id = job.id,
                                    run_id,
                                    error = %flush_err,
                                    "Failed to flush in-flight batch after extraction error."
                                };
                            }
                        }
                    }
                    return Err(EtlError::Api(err).into());
                }
            };

            // Deadline at the page boundary: abandon this page, persist the
            // position it starts at, and leave the run resumable.
            if Instant::now() >= deadline {
                total += self.flush(job, run_id, &mut batch, dry_run).await?;
                let (checkpoint, run_total) = shape.wrap(PagingCheckpoint {
                    skip,
                    page_index,
                    total_records: total,
                    saved_at: Utc::now(),
                });
                self.save_checkpoint(run_id, &checkpoint, run_total).await?;
                return Err(PipelineInterrupt::Timeout {
                    total_records: run_total,
                });
            }

            page_index += 1;
            let page_len = page.items.len();

            for item in page.items {
                let Value::Object(mut payload) = item else {
                    tracing::warn! {
                        job_id = job.id,
                        endpoint = %endpoint,
                        "Skipping non-object item in page."
                    };
                    continue;
                };
                if let Some(parent) = parent_parameter {
                    payload.insert(
                        PARENT_ID_KEY.to_string(),
                        Value::String(parent.to_string()),
                    );
                }
                batch.push(StagingRecord::new(Value::Object(payload)));

                if batch.len() >= self.loader.batch_size() {
                    total += self.flush(job, run_id, &mut batch, dry_run).await?;
                }
            }

            skip += page_len as i64;

            if last_checkpoint.elapsed()
                >= Duration::from_secs(Settings::CHECKPOINT_INTERVAL_SECONDS)
            {
                // Checkpoints only ever cover flushed records.
                total += self.flush(job, run_id, &mut batch, dry_run).await?;
                let (checkpoint, run_total) = shape.wrap(PagingCheckpoint {
                    skip,
                    page_index,
                    total_records: total,
                    saved_at: Utc::now(),
                });
                self.save_checkpoint(run_id, &checkpoint, run_total).await?;
                last_checkpoint = Instant::now();
            }
        }

        total += self.flush(job, run_id, &mut batch, dry_run).await?;

        tracing::info! {
            job_id = job.id,
            run_id,
            endpoint = %endpoint,
            records = total,
            pages = page_index,
            "Extraction drained."
        };

        Ok(total)
    }

    /// Commit the accumulated batch through the loader and return how many
    /// rows it touched. Any failed loader batch fails the run; partial
    /// silent loads are worse than a resumable failure.
    async fn flush(
        &self,
        job: &JobConfig,
        run_id: i64,
        batch: &mut Vec<StagingRecord>,
        dry_run: bool,
    ) -> Result<i64, EtlError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let records = std::mem::take(batch);
        let batch_len = records.len();
        let result = self
            .loader
            .load_to_staging(
                &job.target_table,
                records,
                job.id,
                run_id,
                job.source_instance_id,
                dry_run,
            )
            .await?;

        if result.batches_failed > 0 {
            return Err(EtlError::LoaderBatchFailed {
                failed: result.batches_failed,
                total: result.batches_total,
                first_error: result
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            });
        }

        tracing::info! {
            job_id = job.id,
            run_id,
            target_table = %job.target_table,
            batch_len,
            inserted = result.inserted,
            updated = result.updated,
            "Batch committed."
        };

        Ok(result.rows_loaded() as i64)
    }

    async fn save_checkpoint(
        &self,
        run_id: i64,
        checkpoint: &Checkpoint,
        records_loaded: i64,
    ) -> Result<(), EtlError> {
        self.catalog
            .update_run(
                run_id,
                RunStatus::Running,
                records_loaded,
                None,
                CheckpointUpdate::Set(checkpoint.to_value()?),
            )
            .await
    }
}

fn push_failure(failed: &mut Vec<FailedParameter>, failure: FailedParameter) {
    failed.push(failure);
    let excess = failed
        .len()
        .saturating_sub(Settings::FAILED_PARAMETER_RETENTION);
    if excess > 0 {
        failed.drain(..excess);
    }
}

#[async_trait::async_trait]
impl JobRunner for JobExecutor {
    async fn run_job(
        &self,
        job_id: i64,
        opts: ExecuteOptions,
    ) -> Result<ExecutionResult, EtlError> {
        self.execute(job_id, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_list_is_a_ring_buffer() {
        let mut failed = Vec::new();
        for i in 0..250 {
            push_failure(
                &mut failed,
                FailedParameter {
                    value: i.to_string(),
                    endpoint: String::new(),
                    error: String::new(),
                },
            );
        }

        assert_eq!(failed.len(), Settings::FAILED_PARAMETER_RETENTION);
        assert_eq!(failed[0].value, "150");
        assert_eq!(failed.last().unwrap().value, "249");
    }

    #[test]
    fn paging_shape_wraps_transparently() {
        let page = PagingCheckpoint {
            skip: 300,
            page_index: 3,
            total_records: 280,
            saved_at: Utc::now(),
        };

        let (checkpoint, run_total) = CheckpointShape::Paging.wrap(page.clone());
        assert_eq!(run_total, 280);
        assert_eq!(checkpoint, Checkpoint::Paging(page));
    }

    #[test]
    fn parameter_shape_nests_the_page_and_adds_the_base_total() {
        let failed = vec![FailedParameter {
            value: "101".to_string(),
            endpoint: "/patients/101/allergies/odata".to_string(),
            error: "upstream server error (status 500)".to_string(),
        }];
        let shape = CheckpointShape::Parameter {
            parameter_index: 7,
            base_total: 1000,
            failed: &failed,
        };

        let (checkpoint, run_total) = shape.wrap(PagingCheckpoint {
            skip: 200,
            page_index: 2,
            total_records: 150,
            saved_at: Utc::now(),
        });

        assert_eq!(run_total, 1150);
        let Checkpoint::Parameter(p) = checkpoint else {
            panic!("expected parameter checkpoint");
        };
        assert_eq!(p.parameter_index, 7);
        assert_eq!(p.total_records, 1150);
        assert_eq!(p.failed_parameters, failed);
        assert_eq!(p.page.unwrap().skip, 200);
    }
}
