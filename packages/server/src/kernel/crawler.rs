//! Crawl execution tracking.
//!
//! The `CrawlerManager` owns the per-forum state machine
//! `idle -> running -> {idle, error}` and pairs it with the
//! [`HeartbeatMonitor`]: a crawl that stops reporting progress without
//! completing is force-stopped by the periodic stall sweep.
//!
//! State lives in process memory only. A restarted process has no memory of
//! prior runs beyond what the job history ledger records.
//!
//! Stopping is cooperative: it clears tracking and flips the state, but it
//! does not preempt an in-flight network call. The actual crawl body is
//! expected to poll its cancellation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::heartbeat::HeartbeatMonitor;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("crawl already running for {0}")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlState {
    Idle,
    Running,
    Error,
}

/// Snapshot of one named unit of work, as surfaced to status routes.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStatus {
    pub name: String,
    pub state: CrawlState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Caller-defined progress payload (pages fetched, topics seen, ...).
    pub progress: serde_json::Value,
}

impl CrawlStatus {
    fn idle(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: CrawlState::Idle,
            started_at: None,
            finished_at: None,
            last_error: None,
            progress: serde_json::Value::Null,
        }
    }
}

/// Tracks which named crawls are running in this process.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct CrawlerManager {
    inner: Arc<CrawlerInner>,
}

struct CrawlerInner {
    statuses: Mutex<HashMap<String, CrawlStatus>>,
    heartbeats: HeartbeatMonitor,
}

impl CrawlerManager {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CrawlerInner {
                statuses: Mutex::new(HashMap::new()),
                heartbeats: HeartbeatMonitor::new(stall_timeout),
            }),
        }
    }

    pub fn heartbeats(&self) -> &HeartbeatMonitor {
        &self.inner.heartbeats
    }

    /// Begin a crawl for `name`. Rejected if one is already running in this
    /// process; the distributed lock guards against other instances.
    pub fn start(&self, name: &str) -> Result<CrawlHandle, CrawlError> {
        let mut statuses = self
            .inner
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let status = statuses
            .entry(name.to_string())
            .or_insert_with(|| CrawlStatus::idle(name));

        if status.state == CrawlState::Running {
            return Err(CrawlError::AlreadyRunning(name.to_string()));
        }

        status.state = CrawlState::Running;
        status.started_at = Some(Utc::now());
        status.finished_at = None;
        status.last_error = None;
        status.progress = serde_json::Value::Null;
        drop(statuses);

        self.inner.heartbeats.touch(name);
        info!(crawl = %name, "crawl started");

        Ok(CrawlHandle {
            manager: self.clone(),
            name: name.to_string(),
        })
    }

    /// Cooperative stop: clears tracking and returns the state to idle.
    pub fn stop(&self, name: &str) {
        self.finish(name, CrawlState::Idle, None);
    }

    pub fn status(&self, name: &str) -> Option<CrawlStatus> {
        self.inner
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn statuses(&self) -> Vec<CrawlStatus> {
        self.inner
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.status(name)
            .is_some_and(|s| s.state == CrawlState::Running)
    }

    pub fn any_running(&self) -> bool {
        self.inner
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|s| s.state == CrawlState::Running)
    }

    /// Self-healing path for crawls that hang without erroring: every
    /// `interval`, force-stop whatever stopped heartbeating.
    pub fn spawn_stall_sweep(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for name in manager.inner.heartbeats.stalled() {
                            warn!(crawl = %name, "force-stopping stalled crawl");
                            manager.finish(
                                &name,
                                CrawlState::Error,
                                Some(format!(
                                    "stalled: no heartbeat for {}s",
                                    manager.inner.heartbeats.timeout().as_secs()
                                )),
                            );
                        }
                    }
                }
            }
        })
    }

    fn record_progress(&self, name: &str, progress: serde_json::Value) {
        let mut statuses = self
            .inner
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Only a running crawl beats; a force-stopped body still holding
        // its handle must not re-insert a heartbeat entry.
        let running = match statuses.get_mut(name) {
            Some(status) if status.state == CrawlState::Running => {
                status.progress = progress;
                true
            }
            _ => false,
        };
        drop(statuses);
        if running {
            self.inner.heartbeats.touch(name);
        }
    }

    fn finish(&self, name: &str, state: CrawlState, error: Option<String>) {
        self.inner.heartbeats.clear(name);
        let mut statuses = self
            .inner
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(status) = statuses.get_mut(name) {
            if status.state == CrawlState::Running {
                status.state = state;
                status.finished_at = Some(Utc::now());
                status.last_error = error;
            }
        }
    }
}

/// Handle held by a crawl body while it runs: reports progress (which
/// doubles as the heartbeat) and the final outcome.
pub struct CrawlHandle {
    manager: CrawlerManager,
    name: String,
}

impl CrawlHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn progress(&self, progress: serde_json::Value) {
        self.manager.record_progress(&self.name, progress);
    }

    pub fn complete(self) {
        info!(crawl = %self.name, "crawl completed");
        self.manager.finish(&self.name, CrawlState::Idle, None);
    }

    pub fn fail(self, error: &str) {
        warn!(crawl = %self.name, error = %error, "crawl failed");
        self.manager
            .finish(&self.name, CrawlState::Error, Some(error.to_string()));
    }
}
