//! Error reporting with clipping, fingerprint deduplication and an optional
//! file sink.
//!
//! Every reported error is printed to the console through `tracing`. When an
//! error log file is configured, the first occurrence of each fingerprint is
//! also appended there; repeats are suppressed until the dedup TTL elapses
//! (or for the process lifetime when the TTL is zero).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::error;
use url::Url;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ErrorContext, SyncError};

/// Clip `text` to at most `max` characters, marking the cut with `…`.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}

/// Strip query string and fragment so paging parameters do not split fingerprints.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

/// Stable fingerprint of an error for dedup purposes.
///
/// `cause` is the underlying error's own message. The primary key is preferred
/// over the row snapshot when both are present.
pub fn fingerprint(message: &str, cause: Option<&str>, ctx: &ErrorContext) -> String {
    let mut hasher = Sha256::new();
    let mut field = |name: &str, value: &str| {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    };

    field("message", message);
    field("cause", cause.unwrap_or_default());
    field(
        "status",
        &ctx.http_status.map(|s| s.to_string()).unwrap_or_default(),
    );
    field(
        "url",
        &ctx.url.as_deref().map(normalize_url).unwrap_or_default(),
    );
    field("schema", ctx.schema.as_deref().unwrap_or_default());
    field("table", ctx.table.as_deref().unwrap_or_default());
    field("job", ctx.job_id.as_deref().unwrap_or_default());
    match (&ctx.primary_key, &ctx.row_snapshot) {
        (Some(key), _) => field("pk", &key.to_string()),
        (None, Some(row)) => field("row", &row.to_string()),
        (None, None) => {}
    }

    hex::encode(hasher.finalize())
}

/// File name with a `-<timestamp>-<pid>` suffix inserted before the extension.
pub fn rolled_path(path: &Path, now: DateTime<Utc>, pid: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "errors".to_string());
    let suffix = format!("{}-{}", now.format("%Y%m%dT%H%M%S"), pid);
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{suffix}"),
    };
    path.with_file_name(name)
}

/// One error occurrence.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
    pub context: ErrorContext,
    /// Message of the underlying error, with any URL query stripped.
    pub cause: Option<String>,
    /// Error source chain or other long-form detail.
    pub detail: Option<String>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>, context: ErrorContext) -> Self {
        Self {
            message: message.into(),
            context,
            cause: None,
            detail: None,
        }
    }

    /// Build an event from a [`SyncError`], merging its own context under `context`.
    pub fn from_error(message: impl Into<String>, err: &SyncError, context: ErrorContext) -> Self {
        let own = err.context();
        let mut cause = err.to_string();
        if let Some(url) = &own.url {
            cause = cause.replace(url.as_str(), &normalize_url(url));
        }
        Self {
            message: message.into(),
            context: context.merge(own),
            cause: Some(cause),
            detail: Some(err.chain()),
        }
    }
}

/// What happened to a reported event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub fingerprint: String,
    pub written_to_file: bool,
    pub suppressed: bool,
}

struct FileSink {
    path: PathBuf,
    file: File,
}

/// Console + file error reporter. Owns the dedup map.
pub struct ErrorReporter {
    format: LogFormat,
    limits: Limits,
    ttl: Option<Duration>,
    seen: Option<Mutex<LruCache<String, Instant>>>,
    sink: Option<Mutex<FileSink>>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    stack: usize,
    body: usize,
    sql: usize,
    row: usize,
}

impl ErrorReporter {
    /// Build a reporter, opening the error log file when one is configured.
    pub fn new(config: &LoggingConfig) -> io::Result<Self> {
        let sink = match &config.error_log_path {
            Some(path) => {
                let path = if config.error_log_roll {
                    rolled_path(path, Utc::now(), std::process::id())
                } else {
                    path.clone()
                };
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                Some(Mutex::new(FileSink { path, file }))
            }
            None => None,
        };

        let seen = if config.dedup {
            NonZeroUsize::new(config.dedup_max_entries).map(|cap| Mutex::new(LruCache::new(cap)))
        } else {
            None
        };

        Ok(Self {
            format: config.format,
            limits: Limits {
                stack: config.max_stack,
                body: config.max_body,
                sql: config.max_sql,
                row: config.max_row,
            },
            ttl: (config.dedup_ttl_seconds > 0)
                .then(|| Duration::from_secs(config.dedup_ttl_seconds)),
            seen,
            sink,
        })
    }

    /// Reporter with no file sink.
    pub fn console_only() -> Self {
        Self {
            format: LogFormat::Json,
            limits: Limits {
                stack: 4_000,
                body: 2_000,
                sql: 1_000,
                row: 2_000,
            },
            ttl: None,
            seen: None,
            sink: None,
        }
    }

    /// Path of the active error log file, if any.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|sink| {
            sink.lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .path
                .clone()
        })
    }

    /// Convenience wrapper around [`ErrorEvent::from_error`].
    pub fn report_error(
        &self,
        message: impl Into<String>,
        err: &SyncError,
        context: ErrorContext,
    ) -> ReportOutcome {
        self.report(&ErrorEvent::from_error(message, err, context))
    }

    /// Print the event to the console and, unless suppressed, to the file sink.
    pub fn report(&self, event: &ErrorEvent) -> ReportOutcome {
        let fingerprint = fingerprint(&event.message, event.cause.as_deref(), &event.context);
        let fields = self.clipped_fields(event);

        self.emit_console(event, &fingerprint, &fields);

        let Some(sink) = &self.sink else {
            return ReportOutcome {
                fingerprint,
                written_to_file: false,
                suppressed: false,
            };
        };

        if self.is_duplicate(&fingerprint) {
            return ReportOutcome {
                fingerprint,
                written_to_file: false,
                suppressed: true,
            };
        }

        let entry = self.render_entry(event, &fingerprint, &fields);
        let mut sink = sink.lock().unwrap_or_else(|poison| poison.into_inner());
        let written = sink
            .file
            .write_all(entry.as_bytes())
            .and_then(|_| sink.file.flush());
        if let Err(err) = &written {
            eprintln!(
                "Warning: failed to write error log {}: {}",
                sink.path.display(),
                err
            );
        }

        ReportOutcome {
            fingerprint,
            written_to_file: written.is_ok(),
            suppressed: false,
        }
    }

    /// Record `fingerprint`; true when it was already seen within the TTL.
    fn is_duplicate(&self, fingerprint: &str) -> bool {
        let Some(seen) = &self.seen else {
            return false;
        };
        let mut seen = seen.lock().unwrap_or_else(|poison| poison.into_inner());
        let now = Instant::now();

        if let Some(first_seen) = seen.get(fingerprint) {
            match self.ttl {
                None => return true,
                Some(ttl) if now.duration_since(*first_seen) < ttl => return true,
                Some(_) => {}
            }
        }

        seen.put(fingerprint.to_string(), now);
        false
    }

    fn clipped_fields(&self, event: &ErrorEvent) -> Map<String, Value> {
        let ctx = &event.context;
        let mut fields = Map::new();

        if let Some(job_id) = &ctx.job_id {
            fields.insert("job_id".into(), json!(job_id));
        }
        if let Some(status) = ctx.http_status {
            fields.insert("http_status".into(), json!(status));
        }
        if let Some(url) = &ctx.url {
            fields.insert("url".into(), json!(url));
        }
        if let Some(schema) = &ctx.schema {
            fields.insert("schema".into(), json!(schema));
        }
        if let Some(table) = &ctx.table {
            fields.insert("table".into(), json!(table));
        }
        if let Some(key) = &ctx.primary_key {
            fields.insert("primary_key".into(), key.clone());
        }
        if let Some(body) = &ctx.response_body {
            fields.insert("response_body".into(), json!(clip(body, self.limits.body)));
        }
        if let Some(sql) = &ctx.sql {
            fields.insert("sql".into(), json!(clip(sql, self.limits.sql)));
        }
        if let Some(row) = &ctx.row_snapshot {
            let rendered = row.to_string();
            let value = if rendered.chars().count() <= self.limits.row {
                row.clone()
            } else {
                json!(clip(&rendered, self.limits.row))
            };
            fields.insert("row".into(), value);
        }
        if let Some(detail) = &event.detail {
            fields.insert("detail".into(), json!(clip(detail, self.limits.stack)));
        }

        fields
    }

    fn emit_console(&self, event: &ErrorEvent, fingerprint: &str, fields: &Map<String, Value>) {
        let ctx = &event.context;
        let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
        let row = fields.get("row").map(|row| match self.format {
            LogFormat::Pretty => serde_json::to_string_pretty(row).unwrap_or_default(),
            LogFormat::Json => row.to_string(),
        });
        let primary_key = ctx.primary_key.as_ref().map(Value::to_string);

        error!(
            fingerprint = &fingerprint[..12],
            job_id = ctx.job_id.as_deref(),
            http_status = ctx.http_status,
            url = ctx.url.as_deref(),
            schema = ctx.schema.as_deref(),
            table = ctx.table.as_deref(),
            primary_key = primary_key.as_deref(),
            response_body = text("response_body").as_deref(),
            sql = text("sql").as_deref(),
            row = row.as_deref(),
            detail = text("detail").as_deref(),
            "{}",
            event.message
        );
    }

    fn render_entry(
        &self,
        event: &ErrorEvent,
        fingerprint: &str,
        fields: &Map<String, Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339();

        match self.format {
            LogFormat::Json => {
                let mut entry = Map::new();
                entry.insert("timestamp".into(), json!(timestamp));
                entry.insert("level".into(), json!("ERROR"));
                entry.insert("message".into(), json!(event.message));
                entry.insert("fingerprint".into(), json!(fingerprint));
                entry.extend(fields.clone());
                format!("{}\n", Value::Object(entry))
            }
            LogFormat::Pretty => {
                let mut lines = vec![
                    ("timestamp".to_string(), timestamp),
                    ("message".to_string(), event.message.clone()),
                    ("fingerprint".to_string(), fingerprint.to_string()),
                ];
                for (key, value) in fields {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        Value::Object(_) | Value::Array(_) => {
                            serde_json::to_string_pretty(value).unwrap_or_default()
                        }
                        other => other.to_string(),
                    };
                    lines.push((key.clone(), rendered));
                }
                render_block(&lines)
            }
        }
    }
}

/// Aligned `key : value` block; continuation lines are indented under the value.
fn render_block(lines: &[(String, String)]) -> String {
    let width = lines.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let indent = " ".repeat(width + 3);
    let mut out = String::from("----\n");
    for (key, value) in lines {
        let mut value_lines = value.lines();
        let first = value_lines.next().unwrap_or_default();
        out.push_str(&format!("{key:<width$} : {first}\n"));
        for continuation in value_lines {
            out.push_str(&indent);
            out.push_str(continuation);
            out.push('\n');
        }
    }
    out
}
