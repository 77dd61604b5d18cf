//! # Job State Store
//!
//! Durable `lastSuccessAt` per job, one JSON file per job under the state
//! directory. Writes go to `<file>.tmp` and are renamed into place, so a crash
//! mid-write leaves the previous state intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Persisted run state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunState {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Job state errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("job state I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize job state: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct JobStateStore {
    dir: PathBuf,
}

impl JobStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the state of `job_id`.
    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_job_id(job_id)))
    }

    /// Full state record; missing or unreadable files yield `None`.
    pub async fn get(&self, job_id: &str) -> Option<JobRunState> {
        let path = self.path_for(job_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(job_id, path = %path.display(), error = %err, "Failed to read job state");
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(job_id, path = %path.display(), error = %err, "Ignoring corrupt job state");
                None
            }
        }
    }

    pub async fn get_last_success(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.get(job_id).await.and_then(|state| state.last_success_at)
    }

    /// Atomically record `when` as the last successful run of `job_id`.
    pub async fn set_last_success(&self, job_id: &str, when: DateTime<Utc>) -> Result<(), StateError> {
        let state = JobRunState {
            job_id: job_id.to_string(),
            last_success_at: Some(when),
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&state)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StateError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path_for(job_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body).await.map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(job_id, path = %path.display(), "Job state saved");
        Ok(())
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_job_id(job_id: &str) -> String {
    let cleaned: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_become_safe_file_names() {
        assert_eq!(sanitize_job_id("materials"), "materials");
        assert_eq!(sanitize_job_id("sap/defects push"), "sap_defects_push");
        assert_eq!(sanitize_job_id(".."), "_..");
        assert_eq!(sanitize_job_id(""), "_");
    }

    #[tokio::test]
    async fn missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStateStore::new(dir.path());
        assert_eq!(store.get_last_success("never-ran").await, None);
    }

    #[tokio::test]
    async fn corrupt_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStateStore::new(dir.path());
        std::fs::write(store.path_for("broken"), "{not json").unwrap();
        assert_eq!(store.get_last_success("broken").await, None);
    }

    #[tokio::test]
    async fn write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStateStore::new(dir.path().join("nested"));
        store.set_last_success("job1", Utc::now()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["job1.json".to_string()]);
    }
}
