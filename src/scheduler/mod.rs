//! Cron-driven dispatch with non-overlapping instances and hot reload.
//!
//! Each scheduled job gets its own trigger task that sleeps until the next
//! UTC occurrence and then runs the job inline, so a tick can never re-enter
//! a job that is still in flight and late ticks coalesce to one. A reload
//! diffs the trigger set against the catalog without touching in-flight
//! executions.

mod cron;

pub use cron::{next_occurrence, normalize_cron, parse_cron};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::catalog::CatalogStore;
use crate::error::EtlError;
use crate::executor::{ExecuteOptions, JobRunner};

const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

struct Trigger {
    schedule: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Guards against overlapping executions of the same job, including across
/// trigger replacement during a reload.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<i64>>>);

impl InFlight {
    /// Claim the job for execution; `false` means a run is already in
    /// flight and this tick coalesces away.
    async fn try_begin(&self, job_id: i64) -> bool {
        self.0.lock().await.insert(job_id)
    }

    async fn end(&self, job_id: i64) {
        self.0.lock().await.remove(&job_id);
    }
}

/// Reload plan: triggers to tear down and triggers to (re)create.
fn diff_triggers(
    current: &HashMap<i64, String>,
    desired: &[(i64, String)],
) -> (Vec<i64>, Vec<(i64, String)>) {
    let desired_map: HashMap<i64, &String> =
        desired.iter().map(|(id, s)| (*id, s)).collect();

    let mut to_remove = Vec::new();
    for (id, schedule) in current {
        if desired_map.get(id).copied() != Some(schedule) {
            to_remove.push(*id);
        }
    }
    to_remove.sort_unstable();

    let mut to_add = Vec::new();
    for (id, schedule) in desired {
        if current.get(id) != Some(schedule) {
            to_add.push((*id, schedule.clone()));
        }
    }
    to_add.sort_unstable();

    (to_remove, to_add)
}

pub struct Scheduler {
    catalog: CatalogStore,
    runner: Arc<dyn JobRunner>,
    triggers: Mutex<HashMap<i64, Trigger>>,
    in_flight: InFlight,
    reload_interval: Duration,
}

impl Scheduler {
    pub fn new(catalog: CatalogStore, runner: Arc<dyn JobRunner>) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            runner,
            triggers: Mutex::new(HashMap::new()),
            in_flight: InFlight::default(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
        })
    }

    /// Rebuild the trigger set from the catalog: add, replace, and remove
    /// triggers without dropping in-flight executions. Returns the number of
    /// registered triggers.
    pub async fn reload(self: &Arc<Self>) -> Result<usize, EtlError> {
        let jobs = self.catalog.scheduled_jobs().await?;
        let desired: Vec<(i64, String)> = jobs
            .iter()
            .filter_map(|j| j.cron_schedule.clone().map(|s| (j.id, s)))
            .collect();

        let mut triggers = self.triggers.lock().await;
        let current: HashMap<i64, String> = triggers
            .iter()
            .map(|(id, t)| (*id, t.schedule.clone()))
            .collect();

        let (to_remove, to_add) = diff_triggers(&current, &desired);

        for job_id in to_remove {
            if let Some(trigger) = triggers.remove(&job_id) {
                // Flag, don't abort: the task exits at its next boundary and
                // any in-flight run completes normally.
                let _ = trigger.cancel.send(true);
                drop(trigger.handle);
                tracing::info! { job_id, "Unscheduled trigger." };
            }
        }

        for (job_id, schedule) in to_add {
            let cron = match parse_cron(&schedule) {
                Ok(cron) => cron,
                Err(err) => {
                    tracing::error! {
                        job_id,
                        schedule = %schedule,
                        error = %err,
                        "Skipping job with invalid cron expression."
                    };
                    continue;
                }
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let runner = self.runner.clone();
            let in_flight = self.in_flight.clone();
            let handle = tokio::spawn(trigger_loop(
                job_id,
                cron,
                runner,
                in_flight,
                cancel_rx,
            ));

            triggers.insert(
                job_id,
                Trigger {
                    schedule: schedule.clone(),
                    cancel: cancel_tx,
                    handle,
                },
            );
            tracing::info! { job_id, schedule = %schedule, "Scheduled trigger." };
        }

        Ok(triggers.len())
    }

    /// Run the scheduler service: initial trigger load, then periodic hot
    /// reload from the catalog.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let count = self.reload().await?;
            tracing::debug! { triggers = count, "Scheduler reload complete." };
            tokio::time::sleep(self.reload_interval).await;
        }
    }
}

async fn trigger_loop(
    job_id: i64,
    cron: croner::Cron,
    runner: Arc<dyn JobRunner>,
    in_flight: InFlight,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        let Some(next) = next_occurrence(&cron, Utc::now()) else {
            tracing::warn! { job_id, "Cron schedule has no future occurrence, stopping trigger." };
            break;
        };

        let sleep_for = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancelled.changed() => break,
        }
        if *cancelled.borrow() {
            break;
        }

        if !in_flight.try_begin(job_id).await {
            tracing::warn! { job_id, "Previous run still in flight, coalescing tick." };
            continue;
        }

        tracing::info! { job_id, "Cron trigger fired." };
        let opts = ExecuteOptions {
            // A run left `running` by a timeout resumes on the next tick.
            resume: true,
            ..Default::default()
        };
        match runner.run_job(job_id, opts).await {
            Ok(result) => {
                tracing::info! {
                    job_id,
                    run_id = result.run_id,
                    status = %result.status,
                    records_loaded = result.records_loaded,
                    "Scheduled run finished."
                };
            }
            Err(err) => {
                tracing::error! { job_id, error = %err, "Scheduled run errored." };
            }
        }
        in_flight.end(job_id).await;

        if *cancelled.borrow() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_adds_replaces_and_removes() {
        let mut current = HashMap::new();
        current.insert(1, "0 2 * * *".to_string());
        current.insert(2, "0 3 * * *".to_string());
        current.insert(3, "0 4 * * *".to_string());

        let desired = vec![
            (1, "0 2 * * *".to_string()),  // unchanged
            (2, "30 3 * * *".to_string()), // replaced
            (4, "0 5 * * *".to_string()),  // added
        ];

        let (to_remove, to_add) = diff_triggers(&current, &desired);

        assert_eq!(to_remove, vec![2, 3]);
        assert_eq!(
            to_add,
            vec![(2, "30 3 * * *".to_string()), (4, "0 5 * * *".to_string())]
        );
    }

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let mut current = HashMap::new();
        current.insert(1, "0 2 * * *".to_string());

        let (to_remove, to_add) =
            diff_triggers(&current, &[(1, "0 2 * * *".to_string())]);
        assert!(to_remove.is_empty());
        assert!(to_add.is_empty());
    }

    #[tokio::test]
    async fn in_flight_claim_is_exclusive_per_job() {
        let in_flight = InFlight::default();

        assert!(in_flight.try_begin(1).await);
        assert!(!in_flight.try_begin(1).await);
        assert!(in_flight.try_begin(2).await);

        in_flight.end(1).await;
        assert!(in_flight.try_begin(1).await);
    }
}
