//! # OData Sync Library
//!
//! Job-based synchronization between SAP OData services and PostgreSQL:
//! paginated pulls into tables, outbox pushes through CSRF-protected writes,
//! per-job cron scheduling and durable job state.

pub mod config;
pub mod db;
pub mod error;
pub mod job_state;
pub mod jobs;
pub mod logging;
pub mod odata;
pub mod repositories;
pub mod scheduler;
pub mod sync_executor;
pub mod telemetry;
pub mod transform;
