//! # Job Scheduler
//!
//! Registers every enabled job with a cron trigger, optionally runs each job
//! once at boot, and guarantees that a job never overlaps with itself: a tick
//! that fires while the same job id is still running is skipped. Different
//! jobs run concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::jobs::JobDefinition;
use crate::sync_executor::{RunReport, RunStatus};

/// Executes a job. Implemented by the job runner; tests substitute their own.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobDefinition) -> RunReport;
}

/// Result of a trigger.
#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(RunReport),
    /// The job was already running.
    Skipped,
}

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule '{schedule}' for job {job_id}: {source}")]
    InvalidSchedule {
        job_id: String,
        schedule: String,
        #[source]
        source: JobSchedulerError,
    },

    #[error("cron scheduler failed: {0}")]
    Cron(#[from] JobSchedulerError),
}

/// Cron scheduler with a per-job overlap guard.
#[derive(Clone)]
pub struct Scheduler {
    jobs: Vec<Arc<JobDefinition>>,
    handler: Arc<dyn JobHandler>,
    running: Arc<Mutex<HashSet<String>>>,
    run_on_boot: bool,
}

impl Scheduler {
    pub fn new(jobs: Vec<Arc<JobDefinition>>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            jobs,
            handler,
            running: Arc::new(Mutex::new(HashSet::new())),
            run_on_boot: true,
        }
    }

    /// Trigger every enabled job once when [`Scheduler::run`] starts.
    pub fn with_run_on_boot(mut self, run_on_boot: bool) -> Self {
        self.run_on_boot = run_on_boot;
        self
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .contains(job_id)
    }

    /// Run `job` unless it is already running.
    ///
    /// The running id is released on every exit path, including panics in
    /// the handler.
    pub async fn dispatch(&self, job: Arc<JobDefinition>) -> DispatchOutcome {
        {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if !running.insert(job.id.clone()) {
                warn!(job_id = %job.id, "Job is still running; skipping this tick");
                counter!("sync_job_skipped_total", "job_id" => job.id.clone()).increment(1);
                return DispatchOutcome::Skipped;
            }
        }

        let running = self.running.clone();
        let job_id = job.id.clone();
        let _release = scopeguard::guard((), move |_| {
            running
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .remove(&job_id);
        });

        let report = self.handler.handle(&job).await;
        if report.status == RunStatus::Fatal {
            error!(
                job_id = %job.id,
                run_id = %report.run_id,
                error = report.error.as_deref().unwrap_or_default(),
                "Job run ended with a fatal error"
            );
        }
        DispatchOutcome::Completed(report)
    }

    /// Schedule all enabled jobs and run until `shutdown` fires.
    ///
    /// In-flight runs are not aborted on shutdown.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let mut cron = JobScheduler::new().await?;

        let enabled: Vec<Arc<JobDefinition>> =
            self.jobs.iter().filter(|job| job.enabled).cloned().collect();
        for job in self.jobs.iter().filter(|job| !job.enabled) {
            info!(job_id = %job.id, "Job is disabled; not scheduling");
        }

        for job in &enabled {
            let scheduler = self.clone();
            let definition = job.clone();
            let trigger = Job::new_async(job.schedule.as_str(), move |_uuid, _lock| {
                let scheduler = scheduler.clone();
                let job = definition.clone();
                Box::pin(async move {
                    scheduler.dispatch(job).await;
                })
            })
            .map_err(|source| SchedulerError::InvalidSchedule {
                job_id: job.id.clone(),
                schedule: job.schedule.clone(),
                source,
            })?;
            cron.add(trigger).await?;
            info!(job_id = %job.id, schedule = %job.schedule, mode = %job.mode(), "Scheduled job");
        }

        if self.run_on_boot {
            for job in enabled {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.dispatch(job).await;
                });
            }
        }

        cron.start().await?;
        info!("Scheduler started");

        shutdown.cancelled().await;
        info!("Scheduler shutdown requested");
        cron.shutdown().await?;
        info!("Scheduler stopped");
        Ok(())
    }
}
