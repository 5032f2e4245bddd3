use anyhow::Result;
use sqlx::Row;

use crate::Storage;

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueDepth {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueDepth {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub targets: i64,
    pub active_targets: i64,
    pub pages: i64,
    pub links: i64,
    pub crawl_queue: QueueDepth,
    pub scan_queue: QueueDepth,
    pub dirscan_queue: QueueDepth,
    pub open_ports: i64,
    pub detected_services: i64,
    pub interesting_paths: i64,
}

impl Storage {
    pub async fn stats(&self) -> Result<StoreStats> {
        let (targets, active_targets): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_active) FROM targets",
        )
        .fetch_one(self.pool())
        .await?;
        let pages: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pages")
            .fetch_one(self.pool())
            .await?;
        let links: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM links")
            .fetch_one(self.pool())
            .await?;
        let open_ports: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM port_scans WHERE state = 'open'")
                .fetch_one(self.pool())
                .await?;
        let detected_services: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM detected_services")
            .fetch_one(self.pool())
            .await?;
        let interesting_paths: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dirscan_results WHERE is_interesting")
                .fetch_one(self.pool())
                .await?;

        Ok(StoreStats {
            targets,
            active_targets,
            pages: pages.0,
            links: links.0,
            crawl_queue: self.queue_depth("crawl_queue").await?,
            scan_queue: self.queue_depth("scan_queue").await?,
            dirscan_queue: self.queue_depth("dirscan_queue").await?,
            open_ports: open_ports.0,
            detected_services: detected_services.0,
            interesting_paths: interesting_paths.0,
        })
    }

    pub async fn queue_depth(&self, queue_table: &str) -> Result<QueueDepth> {
        let sql = match queue_table {
            "crawl_queue" => "SELECT status, COUNT(*) FROM crawl_queue GROUP BY status",
            "scan_queue" => "SELECT status, COUNT(*) FROM scan_queue GROUP BY status",
            "dirscan_queue" => "SELECT status, COUNT(*) FROM dirscan_queue GROUP BY status",
            other => anyhow::bail!("unknown queue table: {other}"),
        };
        let mut depth = QueueDepth::default();
        for row in sqlx::query(sql).fetch_all(self.pool()).await? {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            match status.as_str() {
                "pending" => depth.pending = count,
                "processing" => depth.processing = count,
                "completed" => depth.completed = count,
                "failed" => depth.failed = count,
                _ => {}
            }
        }
        Ok(depth)
    }
}
