//! DAG validation, topological batching, and bounded parallel dispatch.

mod graph;

pub use graph::JobGraph;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, stream};

use crate::catalog::{CatalogStore, RunStatus};
use crate::error::EtlError;
use crate::executor::{ExecuteOptions, ExecutionResult, JobRunner};

/// Terminal disposition of one job within an orchestrated pass.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The executor produced a run record (success, failed, or a resumable
    /// timeout).
    Finished(ExecutionResult),
    /// An upstream job did not succeed; no run was created.
    Skipped { reason: String },
    /// The runner failed before a run existed (bad config, preflight).
    DispatchFailed { error: String },
}

impl JobOutcome {
    /// Whether dependents downstream of this job must be skipped.
    fn blocks_dependents(&self) -> bool {
        match self {
            JobOutcome::Finished(result) => result.status != RunStatus::Success,
            JobOutcome::Skipped { .. } | JobOutcome::DispatchFailed { .. } => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct OrchestratorReport {
    pub outcomes: BTreeMap<i64, JobOutcome>,
}

impl OrchestratorReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| {
                matches!(o, JobOutcome::Finished(r) if r.status == RunStatus::Success)
            })
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, JobOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| {
                matches!(
                    o,
                    JobOutcome::Finished(r) if r.status == RunStatus::Failed
                ) || matches!(o, JobOutcome::DispatchFailed { .. })
            })
            .count()
    }

    /// Runs left `running` by a timeout: not terminal, resumable on the
    /// next pass.
    pub fn running(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| {
                matches!(o, JobOutcome::Finished(r) if r.status == RunStatus::Running)
            })
            .count()
    }

    pub fn records_loaded(&self) -> i64 {
        self.outcomes
            .values()
            .filter_map(|o| match o {
                JobOutcome::Finished(r) => Some(r.records_loaded),
                _ => None,
            })
            .sum()
    }
}

pub struct Orchestrator {
    catalog: CatalogStore,
    runner: Arc<dyn JobRunner>,
    max_parallel: usize,
}

impl Orchestrator {
    pub fn new(catalog: CatalogStore, runner: Arc<dyn JobRunner>, max_parallel: usize) -> Self {
        Self {
            catalog,
            runner,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Plan and run the whole active catalog.
    pub async fn run_all(&self, opts: ExecuteOptions) -> Result<OrchestratorReport, EtlError> {
        let jobs = self.catalog.active_jobs().await?;
        let selected: Vec<(i64, Vec<i64>)> = jobs
            .into_iter()
            .map(|j| (j.id, j.depends_on))
            .collect();
        dispatch_batches(self.runner.clone(), &selected, self.max_parallel, opts).await
    }

    /// Plan and run an explicit selection. Dependencies must be satisfied
    /// within the selection.
    pub async fn run_selected(
        &self,
        job_ids: &[i64],
        opts: ExecuteOptions,
    ) -> Result<OrchestratorReport, EtlError> {
        let jobs = self.catalog.active_jobs().await?;
        let selected: Vec<(i64, Vec<i64>)> = jobs
            .into_iter()
            .filter(|j| job_ids.contains(&j.id))
            .map(|j| (j.id, j.depends_on))
            .collect();

        for id in job_ids {
            if !selected.iter().any(|(job_id, _)| job_id == id) {
                return Err(EtlError::ConfigInvalid(format!(
                    "job {id} is not in the active catalog"
                )));
            }
        }

        dispatch_batches(self.runner.clone(), &selected, self.max_parallel, opts).await
    }

    /// Single-job path used by the scheduler.
    pub async fn run_job(
        &self,
        job_id: i64,
        opts: ExecuteOptions,
    ) -> Result<ExecutionResult, EtlError> {
        self.runner.run_job(job_id, opts).await
    }
}

/// Validate the DAG, produce level batches, and dispatch each batch with
/// bounded parallelism. Graph errors are preflight: they return before any
/// run is created. A job whose run does not succeed blocks every transitive
/// dependent; skipped jobs never reach the runner.
pub async fn dispatch_batches(
    runner: Arc<dyn JobRunner>,
    jobs: &[(i64, Vec<i64>)],
    max_parallel: usize,
    opts: ExecuteOptions,
) -> Result<OrchestratorReport, EtlError> {
    let graph = JobGraph::build(jobs)?;
    let batches = graph.topological_batches()?;

    tracing::info! {
        jobs = jobs.len(),
        batches = batches.len(),
        max_parallel,
        "Execution plan ready."
    };

    let mut report = OrchestratorReport::default();
    // Dependent -> the upstream job that caused the skip.
    let mut skip_roots: BTreeMap<i64, i64> = BTreeMap::new();

    for (level, batch) in batches.into_iter().enumerate() {
        let mut runnable = Vec::new();
        for job_id in batch {
            match skip_roots.get(&job_id) {
                Some(root) => {
                    report.outcomes.insert(
                        job_id,
                        JobOutcome::Skipped {
                            reason: format!("upstream job {root} failed"),
                        },
                    );
                    tracing::warn! {
                        job_id,
                        upstream = root,
                        "Skipping job, upstream failed."
                    };
                }
                None => runnable.push(job_id),
            }
        }

        if runnable.is_empty() {
            continue;
        }

        tracing::info! {
            level,
            jobs = ?runnable,
            "Dispatching batch."
        };

        let results: Vec<(i64, Result<ExecutionResult, EtlError>)> = stream::iter(runnable)
            .map(|job_id| {
                let runner = runner.clone();
                let opts = opts.clone();
                async move { (job_id, runner.run_job(job_id, opts).await) }
            })
            .buffer_unordered(max_parallel.max(1))
            .collect()
            .await;

        let mut blocking = Vec::new();
        for (job_id, result) in results {
            let outcome = match result {
                Ok(result) => JobOutcome::Finished(result),
                Err(err) => JobOutcome::DispatchFailed {
                    error: err.to_string(),
                },
            };
            if outcome.blocks_dependents() {
                blocking.push(job_id);
            }
            report.outcomes.insert(job_id, outcome);
        }

        for root in blocking {
            for dependent in graph.transitive_dependents(&[root]) {
                skip_roots.entry(dependent).or_insert(root);
            }
        }
    }

    tracing::info! {
        succeeded = report.succeeded(),
        failed = report.failed(),
        running = report.running(),
        skipped = report.skipped(),
        records_loaded = report.records_loaded(),
        "Orchestrated pass finished."
    };

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Stub runner recording dispatch order; fails the configured job ids.
    struct StubRunner {
        fail: HashSet<i64>,
        time_out: HashSet<i64>,
        calls: Mutex<Vec<i64>>,
    }

    impl StubRunner {
        fn new(fail: &[i64], time_out: &[i64]) -> Arc<Self> {
            Arc::new(Self {
                fail: fail.iter().copied().collect(),
                time_out: time_out.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl JobRunner for StubRunner {
        async fn run_job(
            &self,
            job_id: i64,
            _opts: ExecuteOptions,
        ) -> Result<ExecutionResult, EtlError> {
            self.calls.lock().unwrap().push(job_id);
            let status = if self.fail.contains(&job_id) {
                RunStatus::Failed
            } else if self.time_out.contains(&job_id) {
                RunStatus::Running
            } else {
                RunStatus::Success
            };
            Ok(ExecutionResult {
                run_id: job_id,
                status,
                records_loaded: if status == RunStatus::Success { 1 } else { 0 },
                error_message: None,
                duration_seconds: 0.0,
            })
        }
    }

    fn jobs(defs: &[(i64, &[i64])]) -> Vec<(i64, Vec<i64>)> {
        defs.iter().map(|(id, deps)| (*id, deps.to_vec())).collect()
    }

    #[tokio::test]
    async fn failure_cascades_to_transitive_dependents() {
        let runner = StubRunner::new(&[1], &[]);
        let report = dispatch_batches(
            runner.clone(),
            &jobs(&[(1, &[]), (2, &[1]), (3, &[1])]),
            4,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            &report.outcomes[&1],
            JobOutcome::Finished(r) if r.status == RunStatus::Failed
        ));
        for id in [2, 3] {
            let JobOutcome::Skipped { reason } = &report.outcomes[&id] else {
                panic!("job {id} should be skipped");
            };
            assert_eq!(reason, "upstream job 1 failed");
        }

        // Skipped jobs never reach the runner, so no run is created for them.
        assert_eq!(runner.calls(), vec![1]);
    }

    #[tokio::test]
    async fn cascade_crosses_multiple_levels() {
        let runner = StubRunner::new(&[2], &[]);
        let report = dispatch_batches(
            runner.clone(),
            &jobs(&[(1, &[]), (2, &[1]), (3, &[2]), (4, &[3]), (5, &[1])]),
            4,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.succeeded(), 2); // 1 and 5
        assert_eq!(report.skipped(), 2); // 3 and 4
        assert_eq!(report.failed(), 1); // 2

        let mut calls = runner.calls();
        calls.sort_unstable();
        assert_eq!(calls, vec![1, 2, 5]);
    }

    #[tokio::test]
    async fn batches_run_in_dependency_order() {
        let runner = StubRunner::new(&[], &[]);
        dispatch_batches(
            runner.clone(),
            &jobs(&[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2, 3])]),
            4,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        let calls = runner.calls();
        let position =
            |id: i64| calls.iter().position(|c| *c == id).expect("job dispatched");

        assert!(position(1) < position(2));
        assert!(position(1) < position(3));
        assert!(position(2) < position(4));
        assert!(position(3) < position(4));
    }

    #[tokio::test]
    async fn cycle_is_preflight_and_dispatches_nothing() {
        let runner = StubRunner::new(&[], &[]);
        let err = dispatch_batches(
            runner.clone(),
            &jobs(&[(1, &[2]), (2, &[1])]),
            4,
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EtlError::DependencyCycle(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_dependency_is_preflight() {
        let runner = StubRunner::new(&[], &[]);
        let err = dispatch_batches(
            runner.clone(),
            &jobs(&[(1, &[42])]),
            4,
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EtlError::DependencyMissing(42)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn timed_out_upstream_blocks_dependents() {
        let runner = StubRunner::new(&[], &[1]);
        let report = dispatch_batches(
            runner.clone(),
            &jobs(&[(1, &[]), (2, &[1])]),
            4,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            &report.outcomes[&1],
            JobOutcome::Finished(r) if r.status == RunStatus::Running
        ));
        assert!(matches!(&report.outcomes[&2], JobOutcome::Skipped { .. }));

        // A resumable timeout is not a failure.
        assert_eq!(report.running(), 1);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.skipped(), 1);
    }
}
