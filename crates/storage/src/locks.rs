use std::time::Duration;

use anyhow::Result;

use crate::Storage;

/// Lock namespaces. Cross-pipeline locks are independent: the scanner may
/// work a target while the crawler holds its own lease on it.
pub const PIPELINE_CRAWL: &str = "crawl";
pub const PIPELINE_SCAN: &str = "scan";
pub const PIPELINE_DIRSCAN: &str = "dirscan";

impl Storage {
    /// Take the per-target lease for one pipeline: purge an expired holder,
    /// then insert. Succeeds when no live lock existed or the caller
    /// already owns it (the TTL restarts).
    pub async fn acquire_lock(
        &self,
        pipeline: &str,
        onion_address: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "DELETE FROM service_locks
             WHERE pipeline = $1 AND onion_address = $2 AND expires_at <= NOW()",
        )
        .bind(pipeline)
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "INSERT INTO service_locks (pipeline, onion_address, worker_id, expires_at)
             VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
             ON CONFLICT (pipeline, onion_address) DO UPDATE SET
                 expires_at = EXCLUDED.expires_at,
                 acquired_at = NOW()
             WHERE service_locks.worker_id = EXCLUDED.worker_id",
        )
        .bind(pipeline)
        .bind(onion_address)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Owner-matched release.
    pub async fn release_lock(
        &self,
        pipeline: &str,
        onion_address: &str,
        worker_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM service_locks
             WHERE pipeline = $1 AND onion_address = $2 AND worker_id = $3",
        )
        .bind(pipeline)
        .bind(onion_address)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Owner-matched TTL reset.
    pub async fn extend_lock(
        &self,
        pipeline: &str,
        onion_address: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE service_locks
             SET expires_at = NOW() + make_interval(secs => $4)
             WHERE pipeline = $1 AND onion_address = $2 AND worker_id = $3",
        )
        .bind(pipeline)
        .bind(onion_address)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Startup recovery after a crash: stale owners never come back, so
    /// every lease across every pipeline is purged.
    pub async fn clear_all_locks(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM service_locks")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Combined round trip for the crawler: lease the target and flip its
    /// crawl status in one transaction.
    pub async fn acquire_crawl_lock_and_mark(
        &self,
        onion_address: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "DELETE FROM service_locks
             WHERE pipeline = 'crawl' AND onion_address = $1 AND expires_at <= NOW()",
        )
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "INSERT INTO service_locks (pipeline, onion_address, worker_id, expires_at)
             VALUES ('crawl', $1, $2, NOW() + make_interval(secs => $3))
             ON CONFLICT (pipeline, onion_address) DO UPDATE SET
                 expires_at = EXCLUDED.expires_at,
                 acquired_at = NOW()
             WHERE service_locks.worker_id = EXCLUDED.worker_id",
        )
        .bind(onion_address)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await?;
        let acquired = result.rows_affected() > 0;
        if acquired {
            sqlx::query(
                "UPDATE targets SET crawl_status = 'crawling' WHERE onion_address = $1",
            )
            .bind(onion_address)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(acquired)
    }

    /// Counterpart to [`Storage::acquire_crawl_lock_and_mark`]: release and
    /// record the finished crawl pass.
    pub async fn release_crawl_lock_and_complete(
        &self,
        onion_address: &str,
        worker_id: &str,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "DELETE FROM service_locks
             WHERE pipeline = 'crawl' AND onion_address = $1 AND worker_id = $2",
        )
        .bind(onion_address)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE targets SET crawl_status = 'completed', last_crawled_at = NOW()
             WHERE onion_address = $1 AND crawl_status <> 'failed'",
        )
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
