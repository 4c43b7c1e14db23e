//! Append-only execution ledger for scheduled jobs.
//!
//! Every firing writes a `running` record at start and finalizes it exactly
//! once as `success` or `failed`. The ledger is the only cross-restart
//! memory the coordination layer keeps about past runs; the dashboard's
//! job-history view reads it through [`JobHistoryStore::query`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow!("unknown job status: {}", other)),
        }
    }
}

/// One row of `cron_job_history`.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub job_name: String,
    pub status: JobStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Filters for the history query exposed to the dashboard.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub job_name: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl HistoryQuery {
    const DEFAULT_LIMIT: i64 = 50;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(1)
    }

    /// Offset clamped to zero, so a negative value pages from the start
    /// instead of erroring in Postgres.
    pub fn offset(&self) -> i64 {
        self.offset.max(0)
    }
}

/// A page of records plus pagination metadata.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<JobRecord>,
    pub total: i64,
    pub has_more: bool,
}

/// Storage for the job execution ledger.
#[async_trait]
pub trait JobHistoryStore: Send + Sync {
    /// Append a `running` record for a new execution attempt. Returns its id.
    async fn record_start(&self, job_name: &str) -> Result<i64>;

    /// Finalize a record exactly once: `running -> success|failed`, setting
    /// `completed_at` and `duration_ms`. Finalizing a record that is not
    /// `running` is a no-op.
    async fn record_completion(
        &self,
        id: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<()>;

    /// Query records, newest first, with optional name/status filters.
    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage>;
}

/// Postgres-backed ledger over `cron_job_history`.
pub struct PostgresJobHistoryStore {
    pool: PgPool,
}

impl PostgresJobHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobHistoryRow {
    id: i64,
    job_name: String,
    status: String,
    message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl JobHistoryRow {
    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id,
            job_name: self.job_name,
            status: JobStatus::parse(&self.status)?,
            message: self.message,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
        })
    }
}

#[async_trait]
impl JobHistoryStore for PostgresJobHistoryStore {
    async fn record_start(&self, job_name: &str) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO cron_job_history (job_name, status, started_at)
            VALUES ($1, 'running', NOW())
            RETURNING id
            "#,
        )
        .bind(job_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn record_completion(
        &self,
        id: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        // The status guard makes finalization idempotent; duration is
        // computed from started_at in the same statement so the invariant
        // duration_ms = completed_at - started_at holds exactly.
        sqlx::query(
            r#"
            UPDATE cron_job_history
            SET status = $2,
                message = $3,
                completed_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let status = query.status.map(|s| s.as_str());
        let limit = query.limit();

        let rows = sqlx::query_as::<_, JobHistoryRow>(
            r#"
            SELECT id, job_name, status, message, started_at, completed_at, duration_ms
            FROM cron_job_history
            WHERE ($1::TEXT IS NULL OR job_name = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY started_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(query.job_name.as_deref())
        .bind(status)
        .bind(limit)
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM cron_job_history
            WHERE ($1::TEXT IS NULL OR job_name = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            "#,
        )
        .bind(query.job_name.as_deref())
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(JobHistoryRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(HistoryPage {
            has_more: query.offset() + limit < total,
            records,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::MemoryJobHistoryStore;

    #[tokio::test]
    async fn completion_sets_duration_exactly_once() {
        let store = MemoryJobHistoryStore::new();
        let id = store.record_start("crawl_all_forums").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store
            .record_completion(id, JobStatus::Success, None)
            .await
            .unwrap();

        let page = store.query(&HistoryQuery::default()).await.unwrap();
        let record = &page.records[0];
        assert_eq!(record.status, JobStatus::Success);
        let completed = record.completed_at.unwrap();
        assert!(completed >= record.started_at);
        assert_eq!(
            record.duration_ms.unwrap(),
            (completed - record.started_at).num_milliseconds()
        );

        // Second finalization must not reopen or rewrite the record.
        store
            .record_completion(id, JobStatus::Failed, Some("late error"))
            .await
            .unwrap();
        let page = store.query(&HistoryQuery::default()).await.unwrap();
        assert_eq!(page.records[0].status, JobStatus::Success);
        assert_eq!(page.records[0].message, None);
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let store = MemoryJobHistoryStore::new();
        for i in 0..5 {
            let id = store.record_start("crawl_all_forums").await.unwrap();
            let status = if i % 2 == 0 {
                JobStatus::Success
            } else {
                JobStatus::Failed
            };
            store.record_completion(id, status, None).await.unwrap();
        }
        let other = store.record_start("generate_topics").await.unwrap();
        store
            .record_completion(other, JobStatus::Success, None)
            .await
            .unwrap();

        let page = store
            .query(&HistoryQuery {
                job_name: Some("crawl_all_forums".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(!page.has_more);

        let failed = store
            .query(&HistoryQuery {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.total, 2);
        assert!(failed.records.iter().all(|r| r.status == JobStatus::Failed));

        let first_page = store
            .query(&HistoryQuery {
                limit: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first_page.records.len(), 4);
        assert_eq!(first_page.total, 6);
        assert!(first_page.has_more);

        let second_page = store
            .query(&HistoryQuery {
                limit: Some(4),
                offset: 4,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second_page.records.len(), 2);
        assert!(!second_page.has_more);

        // A negative offset pages from the start, same as zero.
        let negative = store
            .query(&HistoryQuery {
                limit: Some(4),
                offset: -3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(negative.records.len(), 4);
        assert!(negative.has_more);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [JobStatus::Running, JobStatus::Success, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("dead_letter").is_err());
    }
}
