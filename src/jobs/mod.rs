//! # Job Definitions
//!
//! Each job lives in its own directory:
//!
//! ```text
//! jobs/
//!   materials/
//!     job.json      { id, mode, schedule, enabled?, source, target }
//!     mapping.json  { columns, rename?, length? }
//! ```
//!
//! Definitions are parsed into the typed [`JobSpec`] and validated when the
//! registry is loaded, so a bad file fails at startup rather than mid-run.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::job_state::sanitize_job_id;
use crate::repositories::{LoadTarget, OutboxQuery, WriteStrategy};
use crate::transform::Mapping;

pub const JOB_FILE: &str = "job.json";
pub const MAPPING_FILE: &str = "mapping.json";

/// Direction of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// OData → database.
    Pull,
    /// Database → OData.
    Push,
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobMode::Pull => write!(f, "pull"),
            JobMode::Push => write!(f, "push"),
        }
    }
}

/// Incremental pull window anchored on the last successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalWindow {
    /// OData property compared against the window start.
    pub field: String,
    /// Seconds subtracted from the last success to tolerate clock skew.
    #[serde(default)]
    pub overlap_seconds: i64,
}

impl IncrementalWindow {
    /// `$filter` predicate selecting entities changed since `last_success`.
    pub fn filter_since(&self, last_success: DateTime<Utc>) -> String {
        let since = last_success - Duration::seconds(self.overlap_seconds.max(0));
        format!(
            "{} gt {}",
            self.field,
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Static `$filter` applied to every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTarget {
    /// Service URL; also used for the CSRF handshake.
    pub url: String,
    /// Entity set or action appended to `url` for the POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl PushTarget {
    /// URL the payload is POSTed to.
    pub fn endpoint(&self) -> Result<String, url::ParseError> {
        let base = Url::parse(&self.url)?;
        match self.action.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            None => Ok(base.to_string()),
            Some(action) => {
                let mut base = base;
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }
                Ok(base.join(action.trim_start_matches('/'))?.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullJob {
    pub source: PullSource,
    pub target: LoadTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushJob {
    pub source: OutboxQuery,
    pub target: PushTarget,
}

/// Mode-specific part of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    Pull(PullJob),
    Push(PushJob),
}

/// A validated job, immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub id: String,
    /// Six- or seven-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    pub mapping: Mapping,
    pub spec: JobSpec,
    pub dir: PathBuf,
}

impl JobDefinition {
    pub fn mode(&self) -> JobMode {
        match self.spec {
            JobSpec::Pull(_) => JobMode::Pull,
            JobSpec::Push(_) => JobMode::Push,
        }
    }
}

/// Raw `job.json`; `source` and `target` are decoded once the mode is known.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobFile {
    id: String,
    mode: JobMode,
    schedule: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    source: Value,
    target: Value,
}

fn default_enabled() -> bool {
    true
}

/// Job definition errors
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid job definition in {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("duplicate job id '{id}' in {first} and {second}")]
    Duplicate {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("job ids '{first}' and '{second}' would share the state file '{file}'")]
    StateCollision {
        first: String,
        second: String,
        file: String,
    },

    #[error("missing {path}")]
    Missing { path: PathBuf },

    #[error("unknown job id(s): {}", ids.join(", "))]
    Unknown { ids: Vec<String> },
}

impl DefinitionError {
    fn invalid(path: &Path, message: impl Into<String>) -> Self {
        DefinitionError::Invalid {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// All jobs found under a jobs directory, in directory-name order.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new(jobs: Vec<JobDefinition>) -> Result<Self, DefinitionError> {
        let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut state_files: BTreeMap<String, String> = BTreeMap::new();
        for job in &jobs {
            if let Some(first) = seen.insert(job.id.clone(), job.dir.clone()) {
                return Err(DefinitionError::Duplicate {
                    id: job.id.clone(),
                    first,
                    second: job.dir.clone(),
                });
            }
            let file = sanitize_job_id(&job.id);
            if let Some(first) = state_files.insert(file.clone(), job.id.clone()) {
                return Err(DefinitionError::StateCollision {
                    first,
                    second: job.id.clone(),
                    file,
                });
            }
        }
        Ok(Self {
            jobs: jobs.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn jobs(&self) -> &[Arc<JobDefinition>] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.iter().find(|job| job.id == id).cloned()
    }

    /// Resolve `ids` in the given order; any unknown id fails the whole selection.
    pub fn select(&self, ids: &[String]) -> Result<Vec<Arc<JobDefinition>>, DefinitionError> {
        let mut selected = Vec::with_capacity(ids.len());
        let mut unknown = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.get(id) {
                Some(job) => selected.push(job),
                None => unknown.push(id.clone()),
            }
        }

        if unknown.is_empty() {
            Ok(selected)
        } else {
            Err(DefinitionError::Unknown { ids: unknown })
        }
    }
}

/// Load every job directory under `jobs_dir`.
///
/// Directories without a `job.json` are skipped with a warning.
pub fn load_registry(jobs_dir: &Path) -> Result<JobRegistry, DefinitionError> {
    let entries = fs::read_dir(jobs_dir).map_err(|source| DefinitionError::Io {
        path: jobs_dir.to_path_buf(),
        source,
    })?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DefinitionError::Io {
            path: jobs_dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut jobs = Vec::with_capacity(dirs.len());
    for dir in dirs {
        if !dir.join(JOB_FILE).is_file() {
            warn!(dir = %dir.display(), "Skipping directory without {}", JOB_FILE);
            continue;
        }
        jobs.push(load_job(&dir)?);
    }

    let registry = JobRegistry::new(jobs)?;
    info!(
        jobs = registry.len(),
        dir = %jobs_dir.display(),
        "Loaded job definitions"
    );
    Ok(registry)
}

/// Load and validate a single job directory.
pub fn load_job(dir: &Path) -> Result<JobDefinition, DefinitionError> {
    let job_path = dir.join(JOB_FILE);
    let mapping_path = dir.join(MAPPING_FILE);

    let file: JobFile = read_json(&job_path)?;
    if !mapping_path.is_file() {
        return Err(DefinitionError::Missing { path: mapping_path });
    }
    let mapping: Mapping = read_json(&mapping_path)?;

    let id = file.id.trim().to_string();
    if id.is_empty() {
        return Err(DefinitionError::invalid(&job_path, "`id` must not be empty"));
    }

    let schedule = normalize_schedule(&file.schedule)
        .map_err(|message| DefinitionError::invalid(&job_path, message))?;

    validate_mapping(&mapping).map_err(|message| DefinitionError::invalid(&mapping_path, message))?;

    let spec = match file.mode {
        JobMode::Pull => {
            let source: PullSource = decode(&job_path, "source", file.source)?;
            let target: LoadTarget = decode(&job_path, "target", file.target)?;
            validate_pull(&source, &target, &mapping)
                .map_err(|message| DefinitionError::invalid(&job_path, message))?;
            JobSpec::Pull(PullJob { source, target })
        }
        JobMode::Push => {
            let source: OutboxQuery = decode(&job_path, "source", file.source)?;
            let target: PushTarget = decode(&job_path, "target", file.target)?;
            validate_push(&target).map_err(|message| DefinitionError::invalid(&job_path, message))?;
            JobSpec::Push(PushJob { source, target })
        }
    };

    Ok(JobDefinition {
        id,
        schedule,
        enabled: file.enabled,
        mapping,
        spec,
        dir: dir.to_path_buf(),
    })
}

/// Accept 5- or 6-field cron; a 5-field expression gets a `0` seconds field.
///
/// The result is parsed the same way the scheduler parses it, so out-of-range
/// fields fail at load time rather than at registration.
pub fn normalize_schedule(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 => fields.join(" "),
        n => return Err(format!("cron expression '{expr}' has {n} fields; expected 5 or 6")),
    };
    Cron::new(&normalized)
        .with_seconds_required()
        .with_dom_and_dow()
        .parse()
        .map_err(|err| format!("invalid cron expression '{expr}': {err}"))?;
    Ok(normalized)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DefinitionError> {
    let text = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| DefinitionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    path: &Path,
    field: &str,
    value: Value,
) -> Result<T, DefinitionError> {
    serde_json::from_value(value)
        .map_err(|err| DefinitionError::invalid(path, format!("`{field}`: {err}")))
}

fn validate_mapping(mapping: &Mapping) -> Result<(), String> {
    if mapping.columns.is_empty() {
        return Err("`columns` must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for column in &mapping.columns {
        if column.trim().is_empty() {
            return Err("`columns` contains an empty name".to_string());
        }
        if !seen.insert(column.as_str()) {
            return Err(format!("column '{column}' is listed twice"));
        }
    }

    for column in mapping.length.keys() {
        if !seen.contains(column.as_str()) {
            return Err(format!("`length` refers to unknown column '{column}'"));
        }
    }
    for (source, target) in &mapping.rename {
        if !seen.contains(target.as_str()) {
            return Err(format!(
                "`rename` maps '{source}' to unknown column '{target}'"
            ));
        }
    }

    Ok(())
}

fn validate_pull(source: &PullSource, target: &LoadTarget, mapping: &Mapping) -> Result<(), String> {
    Url::parse(&source.url).map_err(|err| format!("invalid source url '{}': {err}", source.url))?;

    if source.page_size == Some(0) {
        return Err("`pageSize` must be greater than zero".to_string());
    }
    if target.table.trim().is_empty() {
        return Err("target `table` must not be empty".to_string());
    }

    match &target.strategy {
        WriteStrategy::Upsert { key } => {
            if let Some(missing) = key.iter().find(|k| mapping.position(k).is_none()) {
                return Err(format!("upsert key '{missing}' is not a mapped column"));
            }
        }
        WriteStrategy::Replace if source.incremental.is_some() => {
            return Err("incremental pulls cannot use the replace strategy".to_string());
        }
        _ => {}
    }

    Ok(())
}

fn validate_push(target: &PushTarget) -> Result<(), String> {
    target
        .endpoint()
        .map(|_| ())
        .map_err(|err| format!("invalid target url '{}': {err}", target.url))
}
