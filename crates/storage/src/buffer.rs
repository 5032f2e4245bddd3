use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use asherah_core::types::ScanProfile;

use crate::Storage;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_THRESHOLD: usize = 50;
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct CrawlLogEntry {
    pub url: String,
    pub onion_address: String,
    pub status_code: Option<i32>,
    pub content_size: i64,
    pub worker_id: String,
    pub duration_ms: i64,
}

enum Entry {
    Log(CrawlLogEntry),
    ScanEnqueue { onion_address: String, priority: i32 },
}

/// Write-behind actor for the chatty, low-value writes: crawl-log appends
/// and cross-pipeline scan enqueues. Flushes on a 2 s timer or at 50
/// buffered entries; a failed flush is reinjected ahead of newer entries.
/// [`BufferedWriter::shutdown`] drains everything before returning.
pub struct BufferedWriter {
    tx: mpsc::Sender<Entry>,
    handle: JoinHandle<()>,
}

impl BufferedWriter {
    pub fn spawn(storage: Storage) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(storage, rx));
        Self { tx, handle }
    }

    pub async fn log_crawl(&self, entry: CrawlLogEntry) {
        let _ = self.tx.send(Entry::Log(entry)).await;
    }

    pub async fn enqueue_scan(&self, onion_address: String, priority: i32) {
        let _ = self
            .tx
            .send(Entry::ScanEnqueue {
                onion_address,
                priority,
            })
            .await;
    }

    /// Close the channel and wait for the final flush.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

async fn run(storage: Storage, mut rx: mpsc::Receiver<Entry>) {
    let mut logs: Vec<CrawlLogEntry> = Vec::new();
    let mut scans: Vec<(String, i32)> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(Entry::Log(log)) => {
                    logs.push(log);
                    if logs.len() + scans.len() >= FLUSH_THRESHOLD {
                        flush(&storage, &mut logs, &mut scans).await;
                    }
                }
                Some(Entry::ScanEnqueue { onion_address, priority }) => {
                    scans.push((onion_address, priority));
                    if logs.len() + scans.len() >= FLUSH_THRESHOLD {
                        flush(&storage, &mut logs, &mut scans).await;
                    }
                }
                None => {
                    flush(&storage, &mut logs, &mut scans).await;
                    info!("buffered writer drained");
                    break;
                }
            },
            _ = ticker.tick() => {
                if !logs.is_empty() || !scans.is_empty() {
                    flush(&storage, &mut logs, &mut scans).await;
                }
            }
        }
    }
}

async fn flush(storage: &Storage, logs: &mut Vec<CrawlLogEntry>, scans: &mut Vec<(String, i32)>) {
    if !logs.is_empty() {
        let batch = std::mem::take(logs);
        debug!(count = batch.len(), "flushing crawl log batch");
        if let Err(e) = storage.insert_crawl_logs(&batch).await {
            warn!(count = batch.len(), error = %e, "crawl log flush failed, reinjecting");
            let mut restored = batch;
            restored.append(logs);
            *logs = restored;
        }
    }

    if !scans.is_empty() {
        let batch = std::mem::take(scans);
        let mut failed = Vec::new();
        for (onion_address, priority) in batch {
            if let Err(e) = storage
                .enqueue_scan(&onion_address, ScanProfile::Standard, None, priority)
                .await
            {
                warn!(onion_address, error = %e, "scan enqueue flush failed, reinjecting");
                failed.push((onion_address, priority));
            }
        }
        if !failed.is_empty() {
            failed.append(scans);
            *scans = failed;
        }
    }
}

impl Storage {
    pub(crate) async fn insert_crawl_logs(&self, entries: &[CrawlLogEntry]) -> anyhow::Result<()> {
        let mut urls: Vec<String> = Vec::with_capacity(entries.len());
        let mut onions: Vec<String> = Vec::with_capacity(entries.len());
        let mut statuses: Vec<Option<i32>> = Vec::with_capacity(entries.len());
        let mut sizes: Vec<i64> = Vec::with_capacity(entries.len());
        let mut workers: Vec<String> = Vec::with_capacity(entries.len());
        let mut durations: Vec<i32> = Vec::with_capacity(entries.len());
        for entry in entries {
            urls.push(entry.url.clone());
            onions.push(entry.onion_address.clone());
            statuses.push(entry.status_code);
            sizes.push(entry.content_size);
            workers.push(entry.worker_id.clone());
            durations.push(entry.duration_ms as i32);
        }
        sqlx::query(
            "INSERT INTO crawl_log (url, onion_address, status_code, content_size, worker_id, duration_ms)
             SELECT * FROM UNNEST($1::text[], $2::varchar[], $3::int[], $4::bigint[], $5::varchar[], $6::int[])",
        )
        .bind(&urls)
        .bind(&onions)
        .bind(&statuses)
        .bind(&sizes)
        .bind(&workers)
        .bind(&durations)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
