//! Distributed locking for scheduled jobs.
//!
//! Multiple instances of the server may run side by side (horizontal
//! scaling, blue-green deploys). Each scheduled job takes a lease in the
//! `cron_locks` table before executing, so a firing runs on exactly one
//! instance. Leases expire: a crashed holder is reclaimed once its
//! `expires_at` passes, at the cost of a short overlap window near expiry.
//! Long-running holders must renew (the scheduler renews at TTL/3).
//!
//! Storage failures are treated as "lock not held": the system prefers to
//! skip a scheduled run over risking duplicate execution.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A held (or expired but not yet purged) lease row from `cron_locks`.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Lease {
    pub lock_name: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    /// A lease is live while its expiry is still in the future.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Storage primitives backing [`DistributedLock`].
///
/// Correctness rests on the store's uniqueness guarantee for `lock_name`
/// (the primary key in Postgres), not on application-level mutexes.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert a lease row, ignoring the insert if one already exists.
    /// Returns whether the row was created.
    async fn try_insert(&self, lease: &Lease) -> Result<bool>;

    /// Read the current lease row for a lock name, expired or not.
    async fn find(&self, lock_name: &str) -> Result<Option<Lease>>;

    /// Extend a lease iff it is held by `holder_id`. Returns whether a row
    /// was updated.
    async fn extend(
        &self,
        lock_name: &str,
        holder_id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a lease iff it is held by `holder_id`. Returns whether a row
    /// was deleted.
    async fn delete_held(&self, lock_name: &str, holder_id: &str) -> Result<bool>;

    /// Delete the lease for one lock name if it has expired.
    async fn delete_expired(&self, lock_name: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Delete every expired lease. Returns the number removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Delete every lease unconditionally. Returns the number removed.
    async fn delete_all(&self) -> Result<u64>;
}

/// Postgres-backed lock store over the `cron_locks` table.
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    async fn try_insert(&self, lease: &Lease) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cron_locks (lock_name, instance_id, acquired_at, expires_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (lock_name) DO NOTHING
            "#,
        )
        .bind(&lease.lock_name)
        .bind(&lease.instance_id)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .bind(lease.heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, lock_name: &str) -> Result<Option<Lease>> {
        let lease = sqlx::query_as::<_, Lease>(
            r#"
            SELECT lock_name, instance_id, acquired_at, expires_at, heartbeat_at
            FROM cron_locks
            WHERE lock_name = $1
            "#,
        )
        .bind(lock_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(lease)
    }

    async fn extend(
        &self,
        lock_name: &str,
        holder_id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cron_locks
            SET heartbeat_at = $3, expires_at = $4
            WHERE lock_name = $1 AND instance_id = $2
            "#,
        )
        .bind(lock_name)
        .bind(holder_id)
        .bind(heartbeat_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_held(&self, lock_name: &str, holder_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM cron_locks WHERE lock_name = $1 AND instance_id = $2",
        )
        .bind(lock_name)
        .bind(holder_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(&self, lock_name: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM cron_locks WHERE lock_name = $1 AND expires_at < $2",
        )
        .bind(lock_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cron_locks WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cron_locks")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Lease-based mutual exclusion for named jobs.
///
/// Not a hard mutex: exclusion holds as long as holders renew within the
/// TTL and clocks are roughly synchronized across instances.
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    lease_ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, lease_ttl: Duration) -> Self {
        Self { store, lease_ttl }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Try to take the lease for `lock_name`.
    ///
    /// Purges an expired lease first, then inserts. If a row already exists
    /// and is held by this same `holder_id`, the lease is extended instead
    /// (re-entrant renewal). `Ok(false)` means another holder is active;
    /// `Err` means the store itself failed.
    pub async fn try_acquire(&self, lock_name: &str, holder_id: &str) -> Result<bool> {
        let now = Utc::now();
        self.store.delete_expired(lock_name, now).await?;

        let lease = Lease {
            lock_name: lock_name.to_string(),
            instance_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono_ttl(self.lease_ttl),
            heartbeat_at: now,
        };

        if self.store.try_insert(&lease).await? {
            debug!(lock = %lock_name, holder = %holder_id, "acquired lock");
            return Ok(true);
        }

        // Row exists: re-entrant renewal when we already hold it.
        match self.store.find(lock_name).await? {
            Some(existing) if existing.instance_id == holder_id => {
                let renewed = self
                    .store
                    .extend(lock_name, holder_id, now, now + chrono_ttl(self.lease_ttl))
                    .await?;
                Ok(renewed)
            }
            _ => Ok(false),
        }
    }

    /// Fail-safe acquire: a storage error is logged and treated as
    /// "lock not held".
    pub async fn acquire(&self, lock_name: &str, holder_id: &str) -> bool {
        match self.try_acquire(lock_name, holder_id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(lock = %lock_name, error = %e, "lock store error during acquire, treating lock as held");
                false
            }
        }
    }

    /// Extend the lease iff still held by `holder_id`.
    ///
    /// Returns false when the lease expired and was reclaimed - the holder
    /// has lost the lock and should treat its claim as gone.
    pub async fn renew(&self, lock_name: &str, holder_id: &str) -> bool {
        let now = Utc::now();
        match self
            .store
            .extend(lock_name, holder_id, now, now + chrono_ttl(self.lease_ttl))
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(lock = %lock_name, error = %e, "lock store error during renew");
                false
            }
        }
    }

    /// Release the lease iff held by `holder_id`.
    ///
    /// Releasing a lock that expired or was reclaimed is not an error;
    /// it is logged and ignored.
    pub async fn release(&self, lock_name: &str, holder_id: &str) {
        match self.store.delete_held(lock_name, holder_id).await {
            Ok(true) => debug!(lock = %lock_name, holder = %holder_id, "released lock"),
            Ok(false) => {
                debug!(lock = %lock_name, holder = %holder_id, "lock already expired or reclaimed, nothing to release");
            }
            Err(e) => {
                warn!(lock = %lock_name, error = %e, "lock store error during release");
            }
        }
    }

    /// Whether a live lease exists for `lock_name`. Errors degrade to false.
    pub async fn is_locked(&self, lock_name: &str) -> bool {
        self.info(lock_name).await.is_some()
    }

    /// Current live lease for `lock_name`, if any. Purges an expired row
    /// first so callers never observe a dead lease.
    pub async fn info(&self, lock_name: &str) -> Option<Lease> {
        let now = Utc::now();
        if let Err(e) = self.store.delete_expired(lock_name, now).await {
            warn!(lock = %lock_name, error = %e, "lock store error during expiry purge");
            return None;
        }
        match self.store.find(lock_name).await {
            // The purge above races with concurrent acquires; filter on
            // liveness so a just-expired row is never reported as held.
            Ok(lease) => lease.filter(|l| l.is_live(Utc::now())),
            Err(e) => {
                warn!(lock = %lock_name, error = %e, "lock store error during lookup");
                None
            }
        }
    }

    /// Delete every lease regardless of holder. Administrative escape hatch
    /// for stuck locks; intentionally bypasses ownership checks.
    pub async fn force_release_all(&self) -> Result<u64> {
        let count = self.store.delete_all().await?;
        if count > 0 {
            info!(count, "force-released all locks");
        }
        Ok(count)
    }

    /// Spawn the background sweep that reclaims expired leases even when
    /// nobody queries that lock name again.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let lock = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match lock.store.sweep_expired(Utc::now()).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "swept expired locks"),
                            Err(e) => error!(error = %e, "lock sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

/// Identity for this process instance: host, pid, and startup time are
/// unique enough to distinguish concurrent holders without a central
/// allocator.
pub fn generate_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}-{}-{}", host, std::process::id(), Utc::now().timestamp_millis())
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36500))
}
