//! Kernel module - job coordination infrastructure.
//!
//! This module provides everything the ingestion server needs to run
//! recurring background work safely across multiple instances:
//!
//! - [`DistributedLock`] - lease-based mutual exclusion over Postgres
//! - [`JobHistoryStore`] - append-only execution ledger
//! - [`HeartbeatMonitor`] - in-process liveness tracking for crawls
//! - [`CrawlerManager`] - per-forum crawl state machine + stall sweep
//! - [`Scheduler`] - cron task registry with timeout, retry, and backoff
//!
//! # Architecture
//!
//! ```text
//! Scheduler timer fires
//!     │
//!     ├─► task.can_run()           (skip if false)
//!     ├─► DistributedLock.acquire  (skip if another instance holds it)
//!     ├─► JobHistory.record_start
//!     ├─► task.execute()           (raced against execution timeout,
//!     │       │                     lease renewed at TTL/3 meanwhile)
//!     │       └─► CrawlerManager → HeartbeatMonitor.touch
//!     └─► finalize record, release lease, reset/advance retry counter
//! ```
//!
//! A separate stall sweep force-stops crawls that stopped heartbeating,
//! independent of the scheduler's own execution timeout.

pub mod crawler;
pub mod heartbeat;
pub mod history;
pub mod locks;
pub mod scheduler;
pub mod tasks;
pub mod testing;

pub use crawler::{CrawlError, CrawlHandle, CrawlState, CrawlStatus, CrawlerManager};
pub use heartbeat::HeartbeatMonitor;
pub use history::{HistoryPage, HistoryQuery, JobHistoryStore, JobRecord, JobStatus, PostgresJobHistoryStore};
pub use locks::{generate_instance_id, DistributedLock, Lease, LockStore, PostgresLockStore};
pub use scheduler::{CronTask, FiringOutcome, Scheduler, SchedulerError, TaskStatus};
pub use tasks::{CrawlAllForumsTask, ForumCrawler, GenerateTopicsTask, TopicGenerator};
