//! Job Runner
//!
//! Executes one job end to end. Pull jobs fetch every OData page, map the
//! records and load them; push jobs drain pending outbox rows through the
//! CSRF-protected writer and mark each row sent or failed. The runner is one
//! of the two catch-and-log layers: whatever happens, [`JobRunner::run`]
//! returns a [`RunReport`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, SyncConfig};
use crate::error::{ErrorContext, SyncError};
use crate::job_state::JobStateStore;
use crate::jobs::{JobDefinition, JobSpec, PullJob, PushJob};
use crate::logging::ErrorReporter;
use crate::odata::{ODataError, PullClient, PushClient, build_http_client, pull::with_filter};
use crate::repositories::{Loader, OutboxReader, OutboxRow};
use crate::scheduler::JobHandler;
use crate::transform::{MapOptions, MappedRow, map_row, to_object};

/// Where a run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Fetching,
    Reading,
    Transforming,
    Loading,
    Pushing,
    Done,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Completed, but some rows failed and were reported.
    PartialFailure,
    /// Aborted; job state was not advanced.
    Fatal,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Fatal => "fatal",
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_id: String,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_failed: usize,
    pub duration: Duration,
    /// Message of the fatal error, if any.
    pub error: Option<String>,
}

/// Defaults applied when a job does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    pub page_size: u32,
    pub batch_size: usize,
    pub map: MapOptions,
}

impl From<&SyncConfig> for RunnerOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            batch_size: config.batch_size,
            map: MapOptions {
                null_if_empty: config.null_if_empty,
                trim_strings: config.trim_strings,
            },
        }
    }
}

#[derive(Debug)]
struct RunProgress {
    phase: RunPhase,
    rows_read: usize,
    rows_written: usize,
    rows_failed: usize,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            rows_read: 0,
            rows_written: 0,
            rows_failed: 0,
        }
    }
}

/// Runs jobs against a shared database pool and HTTP client.
pub struct JobRunner {
    pull: PullClient,
    push: PushClient,
    loader: Loader,
    outbox: OutboxReader,
    state: JobStateStore,
    reporter: Arc<ErrorReporter>,
    options: RunnerOptions,
}

impl JobRunner {
    pub fn new(
        db: Arc<DatabaseConnection>,
        pull: PullClient,
        push: PushClient,
        state: JobStateStore,
        reporter: Arc<ErrorReporter>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            pull,
            push,
            loader: Loader::new(db.clone(), options.batch_size, reporter.clone()),
            outbox: OutboxReader::new(db),
            state,
            reporter,
            options,
        }
    }

    /// Build a runner from application configuration.
    pub fn from_config(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        reporter: Arc<ErrorReporter>,
    ) -> Result<Self, SyncError> {
        let http = build_http_client()?;
        Ok(Self::new(
            db,
            PullClient::from_config(http.clone(), &config.odata),
            PushClient::from_config(http, &config.odata),
            JobStateStore::new(&config.sync.state_dir),
            reporter,
            RunnerOptions::from(&config.sync),
        ))
    }

    pub fn state_store(&self) -> &JobStateStore {
        &self.state
    }

    /// Execute `job` once. Errors are reported, never returned.
    pub async fn run(&self, job: &JobDefinition) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("job_run", job_id = %job.id, run_id = %run_id, mode = %job.mode());
        self.run_inner(job, run_id).instrument(span).await
    }

    async fn run_inner(&self, job: &JobDefinition, run_id: Uuid) -> RunReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut progress = RunProgress::default();

        info!("Starting job run");

        let result = match &job.spec {
            JobSpec::Pull(spec) => self.run_pull(job, spec, started_at, &mut progress).await,
            JobSpec::Push(spec) => self.run_push(job, spec, started_at, &mut progress).await,
        };

        let status = match &result {
            Ok(()) if progress.rows_failed > 0 => RunStatus::PartialFailure,
            Ok(()) => RunStatus::Success,
            Err(_) => RunStatus::Fatal,
        };

        let error = match result {
            Ok(()) => {
                progress.phase = RunPhase::Done;
                None
            }
            Err(err) => {
                self.reporter
                    .report_error("Job run failed", &err, job_context(job));
                Some(err.to_string())
            }
        };

        let duration = started.elapsed();
        counter!("sync_job_runs_total", "job_id" => job.id.clone(), "status" => status.as_str())
            .increment(1);
        histogram!("sync_job_duration_seconds", "job_id" => job.id.clone())
            .record(duration.as_secs_f64());

        info!(
            status = status.as_str(),
            phase = ?progress.phase,
            rows_read = progress.rows_read,
            rows_written = progress.rows_written,
            rows_failed = progress.rows_failed,
            duration_ms = duration.as_millis() as u64,
            "Job run finished"
        );

        RunReport {
            job_id: job.id.clone(),
            run_id,
            status,
            phase: progress.phase,
            rows_read: progress.rows_read,
            rows_written: progress.rows_written,
            rows_failed: progress.rows_failed,
            duration,
            error,
        }
    }

    async fn run_pull(
        &self,
        job: &JobDefinition,
        spec: &PullJob,
        started_at: DateTime<Utc>,
        progress: &mut RunProgress,
    ) -> Result<(), SyncError> {
        progress.phase = RunPhase::Fetching;

        let mut url = spec.source.url.clone();
        if let Some(filter) = spec.source.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            url = with_filter(&url, filter)?;
        }
        if let Some(window) = &spec.source.incremental
            && let Some(last_success) = self.state.get_last_success(&job.id).await
        {
            let predicate = window.filter_since(last_success);
            info!(%last_success, filter = %predicate, "Applying incremental window");
            url = with_filter(&url, &predicate)?;
        }

        let page_size = spec.source.page_size.unwrap_or(self.options.page_size);
        let records = self.pull.fetch_all(&url, page_size).await?;
        progress.rows_read = records.len();

        progress.phase = RunPhase::Transforming;
        let rows: Vec<MappedRow> = records
            .iter()
            .map(|record| map_row(record, &job.mapping, self.options.map))
            .collect();

        progress.phase = RunPhase::Loading;
        let report = self
            .loader
            .load(&job.id, &spec.target, &job.mapping, &rows)
            .await?;
        progress.rows_written = report.written;
        progress.rows_failed = report.failed;

        self.state.set_last_success(&job.id, started_at).await?;
        Ok(())
    }

    async fn run_push(
        &self,
        job: &JobDefinition,
        spec: &PushJob,
        started_at: DateTime<Utc>,
        progress: &mut RunProgress,
    ) -> Result<(), SyncError> {
        progress.phase = RunPhase::Reading;

        let fields = job.mapping.source_fields();
        let rows = self
            .outbox
            .read_pending(&spec.source, &fields, self.options.batch_size as u64)
            .await?;
        progress.rows_read = rows.len();

        if rows.is_empty() {
            info!("No pending rows");
            self.state.set_last_success(&job.id, started_at).await?;
            return Ok(());
        }

        let endpoint = spec
            .target
            .endpoint()
            .map_err(|source| ODataError::InvalidUrl {
                url: spec.target.url.clone(),
                source,
            })?;

        progress.phase = RunPhase::Pushing;
        let mut session = self.push.fetch_csrf(&spec.target.url).await?;

        for row in rows {
            let mapped = map_row(&row.record, &job.mapping, self.options.map);
            let body = Value::Object(to_object(&job.mapping, &mapped));

            let outcome = match self.push.post_json(&endpoint, &body, &session).await {
                Err(err) if err.status() == Some(403) => {
                    warn!(key = %row.key, "CSRF token rejected; refreshing session");
                    session = self.push.fetch_csrf(&spec.target.url).await?;
                    self.push.post_json(&endpoint, &body, &session).await
                }
                other => other,
            };

            match outcome {
                Ok(response) => {
                    if self.outbox.mark_sent(&spec.source, &row.key, &response).await? {
                        progress.rows_written += 1;
                    } else {
                        warn!(key = %row.key, "Row was no longer pending when marking it sent");
                    }
                }
                Err(err) => {
                    progress.rows_failed += 1;
                    self.fail_row(job, spec, &endpoint, &row, body, err).await?;
                }
            }
        }

        counter!("sync_rows_pushed_total", "job_id" => job.id.clone())
            .increment(progress.rows_written as u64);

        self.state.set_last_success(&job.id, started_at).await?;
        Ok(())
    }

    /// Report a failed send and move the row to `error`.
    async fn fail_row(
        &self,
        job: &JobDefinition,
        spec: &PushJob,
        endpoint: &str,
        row: &OutboxRow,
        body: Value,
        err: ODataError,
    ) -> Result<(), SyncError> {
        let message = match err.body() {
            Some(body) => format!("{err}: {body}"),
            None => err.to_string(),
        };

        let ctx = ErrorContext::for_job(&job.id)
            .with_table(&spec.source.schema, &spec.source.table)
            .with_url(endpoint)
            .with_primary_key(row.key.clone())
            .with_row(body);
        self.reporter
            .report_error("Push failed for row", &SyncError::from(err), ctx);

        if !self.outbox.mark_error(&spec.source, &row.key, &message).await? {
            warn!(key = %row.key, "Row was no longer pending when marking it failed");
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: &JobDefinition) -> RunReport {
        self.run(job).await
    }
}

/// Diagnostic context identifying the job's endpoints.
fn job_context(job: &JobDefinition) -> ErrorContext {
    let ctx = ErrorContext::for_job(&job.id);
    match &job.spec {
        JobSpec::Pull(spec) => ctx
            .with_table(&spec.target.schema, &spec.target.table)
            .with_url(&spec.source.url),
        JobSpec::Push(spec) => ctx
            .with_table(&spec.source.schema, &spec.source.table)
            .with_url(&spec.target.url),
    }
}
