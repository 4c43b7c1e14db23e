// Agora - Forum Intelligence Server Core
//
// This crate provides the job-coordination layer for the ingestion server:
// distributed locking over Postgres, the cron scheduler, crawl execution
// tracking, and the persisted job history ledger.
//
// Crawling and topic-generation business logic live behind collaborator
// traits (see kernel::tasks) and are wired in by the host service.

pub mod config;
pub mod kernel;

pub use config::*;

/// Migrations for the tables this crate owns (`cron_locks`,
/// `cron_job_history`). The host service runs them at startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
