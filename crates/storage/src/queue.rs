use anyhow::Result;
use sqlx::Row;

use asherah_core::types::{CrawlItem, DirscanItem, DirscanProfile, ScanItem, ScanProfile};

use crate::Storage;

/// Root URLs jump ahead of deep paths at equal requested priority: the best
/// discovery signal for a fresh target is its front page.
pub const ROOT_PRIORITY_BOOST: i32 = 50;

/// Stored priority for a crawl enqueue (lower is dequeued first).
pub fn stored_priority(url: &str, requested: i32) -> i32 {
    let is_root = url::Url::parse(url)
        .map(|u| matches!(u.path(), "" | "/") && u.query().is_none())
        .unwrap_or(false);
    if is_root {
        requested - ROOT_PRIORITY_BOOST
    } else {
        requested
    }
}

/// Tiered candidate ranking for the crawl scheduler, kept in SQL so the
/// lease is one statement. Tier semantics:
///   0  fresh target, root URL, reliable source domain
///   1  fresh target, root URL
///   2  domain untouched for 30+ minutes
///   3  shallow target (under 10 pages), deep URL
///   4  moderate target (under 50 pages), deep URL
///   6  spammy target (over 100 pending URLs)
///   5  everything else
/// Source reliability: of the distinct onion targets a domain has linked to
/// (3+ required), the fraction the crawler later processed successfully.
const LEASE_CRAWL_SQL: &str = r#"
WITH reliability AS (
    SELECT p.onion_address AS domain,
           COUNT(DISTINCT l.target_onion) FILTER (WHERE t2.page_count > 0)::float
               / COUNT(DISTINCT l.target_onion) AS rate
    FROM links l
    JOIN pages p ON p.id = l.source_page_id
    JOIN targets t2 ON t2.onion_address = l.target_onion
    WHERE l.target_onion IS NOT NULL
      AND l.target_onion <> p.onion_address
    GROUP BY p.onion_address
    HAVING COUNT(DISTINCT l.target_onion) >= 3
),
candidates AS (
    SELECT cq.id,
           CASE
               WHEN t.page_count = 0 AND cq.url ~ '\.onion/?$' AND COALESCE(r.rate, 0.3) > 0.5 THEN 0
               WHEN t.page_count = 0 AND cq.url ~ '\.onion/?$' THEN 1
               WHEN t.last_crawled_at IS NULL
                    OR t.last_crawled_at < NOW() - INTERVAL '30 minutes' THEN 2
               WHEN t.page_count > 0 AND t.page_count < 10 AND cq.url !~ '\.onion/?$' THEN 3
               WHEN t.page_count < 50 AND cq.url !~ '\.onion/?$' THEN 4
               WHEN (SELECT COUNT(*) FROM crawl_queue c2
                     WHERE c2.onion_address = cq.onion_address
                       AND c2.status = 'pending') > 100 THEN 6
               ELSE 5
           END AS tier,
           COALESCE(EXTRACT(EPOCH FROM (NOW() - t.last_crawled_at)) / 60, 1e9) AS idle_minutes,
           COALESCE(r.rate, 0.3) AS rate,
           cq.priority AS priority,
           cq.attempts AS attempts,
           cq.added_at AS added_at
    FROM crawl_queue cq
    JOIN targets t ON t.onion_address = cq.onion_address
    LEFT JOIN reliability r ON r.domain = cq.source_domain
    WHERE cq.status = 'pending'
      AND cq.attempts < 3
      AND (cq.last_attempt_at IS NULL
           OR cq.last_attempt_at < NOW() - INTERVAL '1 minute' * POWER(2, LEAST(cq.attempts, 6)))
      AND t.is_active
      AND t.crawl_status <> 'failed'
      AND NOT EXISTS (
          SELECT 1 FROM service_locks sl
          WHERE sl.pipeline = 'crawl'
            AND sl.onion_address = cq.onion_address
            AND sl.expires_at > NOW()
            AND sl.worker_id <> $1
      )
    ORDER BY tier ASC, idle_minutes DESC, rate DESC, priority ASC, attempts ASC, added_at ASC
    LIMIT 50
),
picked AS (
    -- RANDOM() breaks rank ties so simultaneous workers spread across
    -- equally-ranked candidates; distinct ranks stay deterministic.
    SELECT id FROM candidates
    ORDER BY tier ASC, idle_minutes DESC, rate DESC, priority ASC, attempts ASC, added_at ASC,
             RANDOM()
    LIMIT $2
)
UPDATE crawl_queue cq
SET status = 'processing',
    worker_id = $1,
    attempts = cq.attempts + 1,
    last_attempt_at = NOW()
WHERE cq.id IN (
    SELECT q.id FROM crawl_queue q
    WHERE q.id IN (SELECT id FROM picked)
      AND q.status = 'pending'
    FOR UPDATE SKIP LOCKED
)
RETURNING cq.id, cq.url, cq.onion_address, cq.priority, cq.attempts
"#;

impl Storage {
    /// Insert-or-lower-priority enqueue. An existing row keeps its minimum
    /// priority; a failed row comes back as pending; processing and
    /// completed rows are left alone.
    pub async fn enqueue_crawl(
        &self,
        url: &str,
        onion_address: &str,
        source_domain: Option<&str>,
        priority: i32,
    ) -> Result<()> {
        let priority = stored_priority(url, priority);
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO targets (onion_address) VALUES ($1)
             ON CONFLICT (onion_address) DO NOTHING",
        )
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO crawl_queue (url, onion_address, source_domain, priority)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (url) DO UPDATE SET
                 priority = LEAST(crawl_queue.priority, EXCLUDED.priority),
                 source_domain = COALESCE(crawl_queue.source_domain, EXCLUDED.source_domain),
                 status = CASE WHEN crawl_queue.status = 'failed'
                               THEN 'pending' ELSE crawl_queue.status END,
                 attempts = CASE WHEN crawl_queue.status = 'failed'
                                 THEN 0 ELSE crawl_queue.attempts END,
                 error_message = CASE WHEN crawl_queue.status = 'failed'
                                      THEN NULL ELSE crawl_queue.error_message END",
        )
        .bind(url)
        .bind(onion_address)
        .bind(source_domain)
        .bind(priority)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn enqueue_scan(
        &self,
        onion_address: &str,
        profile: ScanProfile,
        ports: Option<&[u16]>,
        priority: i32,
    ) -> Result<()> {
        let ports: Option<Vec<i32>> =
            ports.map(|list| list.iter().map(|p| *p as i32).collect());
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO targets (onion_address) VALUES ($1)
             ON CONFLICT (onion_address) DO NOTHING",
        )
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO scan_queue (onion_address, profile, ports, priority)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (onion_address) DO UPDATE SET
                 priority = LEAST(scan_queue.priority, EXCLUDED.priority),
                 status = CASE WHEN scan_queue.status = 'failed'
                               THEN 'pending' ELSE scan_queue.status END,
                 attempts = CASE WHEN scan_queue.status = 'failed'
                                 THEN 0 ELSE scan_queue.attempts END",
        )
        .bind(onion_address)
        .bind(profile.as_str())
        .bind(&ports)
        .bind(priority)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn enqueue_dirscan(
        &self,
        onion_address: &str,
        profile: DirscanProfile,
        priority: i32,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO targets (onion_address) VALUES ($1)
             ON CONFLICT (onion_address) DO NOTHING",
        )
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO dirscan_queue (onion_address, profile, priority)
             VALUES ($1, $2, $3)
             ON CONFLICT (onion_address) DO UPDATE SET
                 priority = LEAST(dirscan_queue.priority, EXCLUDED.priority),
                 status = CASE WHEN dirscan_queue.status = 'failed'
                               THEN 'pending' ELSE dirscan_queue.status END,
                 attempts = CASE WHEN dirscan_queue.status = 'failed'
                                 THEN 0 ELSE dirscan_queue.attempts END",
        )
        .bind(onion_address)
        .bind(profile.as_str())
        .bind(priority)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Lease up to `n` crawl rows in one statement: rank, shuffle the top
    /// 50 to keep simultaneous workers apart, then claim with
    /// FOR UPDATE SKIP LOCKED.
    pub async fn lease_crawl_batch(&self, worker_id: &str, n: i64) -> Result<Vec<CrawlItem>> {
        let rows = sqlx::query(LEASE_CRAWL_SQL)
            .bind(worker_id)
            .bind(n)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| CrawlItem {
                id: row.get(0),
                url: row.get(1),
                onion_address: row.get(2),
                priority: row.get(3),
                attempts: row.get(4),
            })
            .collect())
    }

    pub async fn lease_scan_batch(&self, worker_id: &str, n: i64) -> Result<Vec<ScanItem>> {
        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT sq.id
                FROM scan_queue sq
                JOIN targets t ON t.onion_address = sq.onion_address
                WHERE sq.status = 'pending'
                  AND sq.attempts < 3
                  AND (sq.last_attempt_at IS NULL
                       OR sq.last_attempt_at < NOW() - INTERVAL '1 minute' * POWER(2, LEAST(sq.attempts, 6)))
                  AND t.is_active
                  AND NOT EXISTS (
                      SELECT 1 FROM service_locks sl
                      WHERE sl.pipeline = 'scan'
                        AND sl.onion_address = sq.onion_address
                        AND sl.expires_at > NOW()
                        AND sl.worker_id <> $1
                  )
                ORDER BY sq.priority ASC, sq.added_at ASC
                LIMIT $2
            )
            UPDATE scan_queue sq
            SET status = 'processing',
                worker_id = $1,
                attempts = sq.attempts + 1,
                last_attempt_at = NOW()
            WHERE sq.id IN (
                SELECT q.id FROM scan_queue q
                WHERE q.id IN (SELECT id FROM candidates)
                  AND q.status = 'pending'
                FOR UPDATE SKIP LOCKED
            )
            RETURNING sq.id, sq.onion_address, sq.profile, sq.ports, sq.attempts
            "#,
        )
        .bind(worker_id)
        .bind(n)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let profile: String = row.get(2);
                let ports: Option<Vec<i32>> = row.get(3);
                ScanItem {
                    id: row.get(0),
                    onion_address: row.get(1),
                    profile: profile.parse().unwrap_or_default(),
                    ports: ports.map(|list| list.into_iter().map(|p| p as u16).collect()),
                    attempts: row.get(4),
                }
            })
            .collect())
    }

    pub async fn lease_dirscan_batch(&self, worker_id: &str, n: i64) -> Result<Vec<DirscanItem>> {
        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT dq.id
                FROM dirscan_queue dq
                JOIN targets t ON t.onion_address = dq.onion_address
                WHERE dq.status = 'pending'
                  AND dq.attempts < 3
                  AND (dq.last_attempt_at IS NULL
                       OR dq.last_attempt_at < NOW() - INTERVAL '1 minute' * POWER(2, LEAST(dq.attempts, 6)))
                  AND t.is_active
                  AND NOT EXISTS (
                      SELECT 1 FROM service_locks sl
                      WHERE sl.pipeline = 'dirscan'
                        AND sl.onion_address = dq.onion_address
                        AND sl.expires_at > NOW()
                        AND sl.worker_id <> $1
                  )
                ORDER BY dq.priority ASC, dq.added_at ASC
                LIMIT $2
            )
            UPDATE dirscan_queue dq
            SET status = 'processing',
                worker_id = $1,
                attempts = dq.attempts + 1,
                last_attempt_at = NOW()
            WHERE dq.id IN (
                SELECT q.id FROM dirscan_queue q
                WHERE q.id IN (SELECT id FROM candidates)
                  AND q.status = 'pending'
                FOR UPDATE SKIP LOCKED
            )
            RETURNING dq.id, dq.onion_address, dq.profile, dq.attempts
            "#,
        )
        .bind(worker_id)
        .bind(n)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let profile: String = row.get(2);
                DirscanItem {
                    id: row.get(0),
                    onion_address: row.get(1),
                    profile: profile.parse().unwrap_or_default(),
                    attempts: row.get(3),
                }
            })
            .collect())
    }

    /// Worker-scoped settle: only the owning worker can complete its row.
    pub async fn complete_crawl_item(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE crawl_queue SET status = 'completed', error_message = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Failed attempts go back to pending until the third, which is
    /// terminal.
    pub async fn fail_crawl_item(&self, id: i64, worker_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE crawl_queue SET
                 status = CASE WHEN attempts >= 3 THEN 'failed' ELSE 'pending' END,
                 worker_id = CASE WHEN attempts >= 3 THEN worker_id ELSE NULL END,
                 error_message = $3
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return a contended row to pending without charging the attempt the
    /// lease added.
    pub async fn unlease_crawl_item(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE crawl_queue SET
                 status = 'pending',
                 attempts = GREATEST(attempts - 1, 0),
                 worker_id = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn complete_scan_item(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scan_queue SET status = 'completed', error_message = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fail_scan_item(&self, id: i64, worker_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scan_queue SET
                 status = CASE WHEN attempts >= 3 THEN 'failed' ELSE 'pending' END,
                 worker_id = CASE WHEN attempts >= 3 THEN worker_id ELSE NULL END,
                 error_message = $3
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn unlease_scan_item(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scan_queue SET
                 status = 'pending',
                 attempts = GREATEST(attempts - 1, 0),
                 worker_id = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn complete_dirscan_item(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dirscan_queue SET status = 'completed', error_message = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fail_dirscan_item(&self, id: i64, worker_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dirscan_queue SET
                 status = CASE WHEN attempts >= 3 THEN 'failed' ELSE 'pending' END,
                 worker_id = CASE WHEN attempts >= 3 THEN worker_id ELSE NULL END,
                 error_message = $3
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn unlease_dirscan_item(&self, id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dirscan_queue SET
                 status = 'pending',
                 attempts = GREATEST(attempts - 1, 0),
                 worker_id = NULL
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Domain-wide connection failure: every live crawl row for the target
    /// fails and the target goes inactive, atomically.
    pub async fn fail_domain(&self, onion_address: &str, error: &str) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE crawl_queue SET
                 status = 'failed',
                 attempts = 3,
                 worker_id = NULL,
                 error_message = $2
             WHERE onion_address = $1 AND status IN ('pending', 'processing')",
        )
        .bind(onion_address)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE targets SET is_active = FALSE, crawl_status = 'failed'
             WHERE onion_address = $1",
        )
        .bind(onion_address)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Startup recovery: rows stranded in processing by a dead worker go
    /// back to pending. The backoff gate still applies before re-lease.
    pub async fn reset_orphaned(&self, queue_table: &str) -> Result<u64> {
        let sql = match queue_table {
            "crawl_queue" => {
                "UPDATE crawl_queue SET status = 'pending', worker_id = NULL
                 WHERE status = 'processing'"
            }
            "scan_queue" => {
                "UPDATE scan_queue SET status = 'pending', worker_id = NULL
                 WHERE status = 'processing'"
            }
            "dirscan_queue" => {
                "UPDATE dirscan_queue SET status = 'pending', worker_id = NULL
                 WHERE status = 'processing'"
            }
            other => anyhow::bail!("unknown queue table: {other}"),
        };
        let result = sqlx::query(sql).execute(self.pool()).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.onion";

    #[test]
    fn root_urls_get_the_boost() {
        assert_eq!(stored_priority(&format!("http://{HOST}/"), 100), 50);
        assert_eq!(stored_priority(&format!("http://{HOST}"), 100), 50);
    }

    #[test]
    fn deep_paths_keep_requested_priority() {
        assert_eq!(stored_priority(&format!("http://{HOST}/deep/path"), 100), 100);
        assert_eq!(stored_priority(&format!("http://{HOST}/?q=1"), 100), 100);
    }

    #[test]
    fn unparseable_urls_are_not_boosted() {
        assert_eq!(stored_priority("not a url", 100), 100);
    }
}
