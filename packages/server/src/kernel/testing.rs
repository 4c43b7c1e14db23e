//! In-memory store implementations for tests.
//!
//! These back the same traits as the Postgres stores so the scheduler, lock,
//! and history behavior can be exercised without a database. The memory lock
//! store keeps the one invariant that matters: at most one lease row per
//! lock name.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::history::{HistoryPage, HistoryQuery, JobHistoryStore, JobRecord, JobStatus};
use super::locks::{Lease, LockStore};

/// Lock store over a mutex-guarded map.
#[derive(Default)]
pub struct MemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lease rows currently present (expired or not).
    pub fn len(&self) -> usize {
        self.leases.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_insert(&self, lease: &Lease) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.contains_key(&lease.lock_name) {
            return Ok(false);
        }
        leases.insert(lease.lock_name.clone(), lease.clone());
        Ok(true)
    }

    async fn find(&self, lock_name: &str) -> Result<Option<Lease>> {
        Ok(self
            .leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(lock_name)
            .cloned())
    }

    async fn extend(
        &self,
        lock_name: &str,
        holder_id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get_mut(lock_name) {
            Some(lease) if lease.instance_id == holder_id => {
                lease.heartbeat_at = heartbeat_at;
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_held(&self, lock_name: &str, holder_id: &str) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(lock_name) {
            Some(lease) if lease.instance_id == holder_id => {
                leases.remove(lock_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, lock_name: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(lock_name) {
            Some(lease) if lease.expires_at < now => {
                leases.remove(lock_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at >= now);
        Ok((before - leases.len()) as u64)
    }

    async fn delete_all(&self) -> Result<u64> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let count = leases.len() as u64;
        leases.clear();
        Ok(count)
    }
}

/// Lock store whose every operation fails, for exercising the
/// infrastructure-error paths (fail-closed acquisition, outage records).
#[derive(Default)]
pub struct UnavailableLockStore;

#[async_trait]
impl LockStore for UnavailableLockStore {
    async fn try_insert(&self, _lease: &Lease) -> Result<bool> {
        Err(anyhow!("connection refused"))
    }

    async fn find(&self, _lock_name: &str) -> Result<Option<Lease>> {
        Err(anyhow!("connection refused"))
    }

    async fn extend(
        &self,
        _lock_name: &str,
        _holder_id: &str,
        _heartbeat_at: DateTime<Utc>,
        _expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        Err(anyhow!("connection refused"))
    }

    async fn delete_held(&self, _lock_name: &str, _holder_id: &str) -> Result<bool> {
        Err(anyhow!("connection refused"))
    }

    async fn delete_expired(&self, _lock_name: &str, _now: DateTime<Utc>) -> Result<bool> {
        Err(anyhow!("connection refused"))
    }

    async fn sweep_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }

    async fn delete_all(&self) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }
}

/// Job history ledger over a mutex-guarded vec.
#[derive(Default)]
pub struct MemoryJobHistoryStore {
    records: Mutex<Vec<JobRecord>>,
}

impl MemoryJobHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, newest first, without pagination. Test convenience.
    pub fn all(&self) -> Vec<JobRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<JobRecord> = records.clone();
        all.reverse();
        all
    }
}

#[async_trait]
impl JobHistoryStore for MemoryJobHistoryStore {
    async fn record_start(&self, job_name: &str) -> Result<i64> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let id = records.len() as i64 + 1;
        records.push(JobRecord {
            id,
            job_name: job_name.to_string(),
            status: JobStatus::Running,
            message: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        });
        Ok(id)
    }

    async fn record_completion(
        &self,
        id: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            // Finalize exactly once, as the status guard does in SQL.
            if record.status == JobStatus::Running {
                let completed_at = Utc::now();
                record.status = status;
                record.message = message.map(|m| m.to_string());
                record.duration_ms = Some((completed_at - record.started_at).num_milliseconds());
                record.completed_at = Some(completed_at);
            }
        }
        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut filtered: Vec<JobRecord> = records
            .iter()
            .filter(|r| {
                query
                    .job_name
                    .as_deref()
                    .is_none_or(|name| r.job_name == name)
                    && query.status.is_none_or(|status| r.status == status)
            })
            .cloned()
            .collect();
        filtered.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));

        let total = filtered.len() as i64;
        let limit = query.limit();
        let page: Vec<JobRecord> = filtered
            .into_iter()
            .skip(query.offset() as usize)
            .take(limit as usize)
            .collect();

        Ok(HistoryPage {
            records: page,
            total,
            has_more: query.offset() + limit < total,
        })
    }
}
