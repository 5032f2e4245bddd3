use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use asherah_core::types::{PageDocument, PageMetadata};
use asherah_core::AppConfig;
use asherah_fingerprint as fingerprint;
use asherah_storage::{BufferedWriter, CrawlLogEntry, Storage, PIPELINE_CRAWL};
use asherah_transport::{FetchOptions, HttpClient, ProxyConnector};

use crate::seeds::DEFAULT_SEEDS;

/// Element-sourced URLs from a good page.
const LINK_PRIORITY: i32 = 100;
/// Element-sourced URLs from an error page: still worth following, later.
const ERROR_LINK_PRIORITY: i32 = 150;
/// Root URLs for domains only mentioned in text: prime discovery signal.
const TEXT_MENTION_PRIORITY: i32 = 50;
/// Discovered onion addresses cross-enqueued for port scanning.
const SCAN_PRIORITY: i32 = 100;
/// Seed URLs go to the head of the queue.
const SEED_PRIORITY: i32 = 10;

pub async fn run_crawl(config: AppConfig, seeds: Option<String>, seed: Option<String>) -> Result<()> {
    let workers = config.crawler.workers;
    let pool_size = (workers as u32 + 5).max(10);
    let storage = Storage::with_pool_size(&config.database.url(), pool_size).await?;
    storage.run_migrations().await?;

    // Startup recovery: stale owners cannot return, so every lease goes.
    let cleared = storage.clear_all_locks().await?;
    if cleared > 0 {
        info!(cleared, "cleared stale locks");
    }
    let reset = storage.reset_orphaned("crawl_queue").await?;
    if reset > 0 {
        info!(reset, "reset orphaned crawl rows");
    }

    let connector = Arc::new(ProxyConnector::new(
        config.tor.socks_addr(),
        Duration::from_millis(config.crawler.request_timeout_ms),
    ));
    connector
        .probe()
        .await
        .map_err(|e| anyhow!("SOCKS5 relay not reachable, refusing to start: {e}"))?;
    info!(addr = %config.tor.socks_addr(), "SOCKS5 relay reachable");

    let http = Arc::new(HttpClient::new(Arc::clone(&connector), true)?);

    let seeded = seed_queue(&storage, seeds, seed).await?;
    if seeded > 0 {
        info!(seeded, "seed URLs enqueued");
    }

    let writer = Arc::new(BufferedWriter::spawn(storage.clone()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let stats_handle = {
        let storage = storage.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        match storage.queue_depth("crawl_queue").await {
                            Ok(depth) => info!(
                                pending = depth.pending,
                                processing = depth.processing,
                                completed = depth.completed,
                                failed = depth.failed,
                                "crawl queue"
                            ),
                            Err(e) => warn!(error = %e, "stats query failed"),
                        }
                    }
                }
            }
        })
    };

    info!(workers, "spawning crawl workers");
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let worker_id = format!("crawl-{}-{}", std::process::id(), index);
        let config = config.clone();
        let storage = storage.clone();
        let http = Arc::clone(&http);
        let writer = Arc::clone(&writer);
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            crawl_worker(worker_id, config, storage, http, writer, shutdown).await;
        }));
    }

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(());

    for handle in handles {
        let _ = handle.await;
    }
    let _ = stats_handle.await;
    if let Ok(writer) = Arc::try_unwrap(writer) {
        writer.shutdown().await;
    }
    storage.close().await;
    info!("shutdown complete");
    Ok(())
}

/// SIGINT or SIGTERM, whichever lands first.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// True once the shutdown broadcast has fired (or the sender is gone).
pub fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

/// Jittered pause between items so N workers drift apart.
pub async fn item_pause() {
    let ms = rand::thread_rng().gen_range(500..=1500);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn seed_queue(storage: &Storage, seeds: Option<String>, seed: Option<String>) -> Result<usize> {
    let mut seed_urls: Vec<String> = Vec::new();
    if let Some(s) = seed {
        seed_urls.push(s);
    }
    if let Some(seeds_arg) = seeds {
        if std::path::Path::new(&seeds_arg).exists() {
            let content = std::fs::read_to_string(&seeds_arg)?;
            seed_urls.extend(
                content
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty() && !l.starts_with('#')),
            );
        } else {
            seed_urls.extend(seeds_arg.split(',').map(|s| s.trim().to_string()));
        }
    }
    if seed_urls.is_empty() {
        seed_urls.extend(DEFAULT_SEEDS.iter().map(|s| s.to_string()));
        info!("no seeds provided, using default directory seeds");
    }

    let mut added = 0;
    for url_str in &seed_urls {
        let Some(onion) = fingerprint::extract_onion(url_str).map(str::to_string) else {
            warn!(url = %url_str, "seed has no valid onion address, skipping");
            continue;
        };
        storage
            .enqueue_crawl(url_str, &onion, None, SEED_PRIORITY)
            .await?;
        added += 1;
    }
    Ok(added)
}

async fn crawl_worker(
    worker_id: String,
    config: AppConfig,
    storage: Storage,
    http: Arc<HttpClient>,
    writer: Arc<BufferedWriter>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(worker_id, "worker started");
    let batch_delay = Duration::from_millis(config.crawler.crawl_delay_ms);

    loop {
        if shutdown_requested(&mut shutdown) {
            break;
        }

        let batch = match storage
            .lease_crawl_batch(&worker_id, config.crawler.batch_size as i64)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker_id, error = %e, "lease failed, backing off");
                tokio::time::sleep(batch_delay * 2).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(batch_delay) => {}
            }
            continue;
        }

        for item in batch {
            process_item(&worker_id, &config, &storage, &http, &writer, &item).await;
            item_pause().await;
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(batch_delay) => {}
        }
    }
    info!(worker_id, "worker stopped");
}

async fn process_item(
    worker_id: &str,
    config: &AppConfig,
    storage: &Storage,
    http: &HttpClient,
    writer: &BufferedWriter,
    item: &asherah_core::types::CrawlItem,
) {
    let started = Instant::now();
    let lock_ttl = Duration::from_secs(config.crawler.lock_ttl_secs);

    match storage
        .acquire_crawl_lock_and_mark(&item.onion_address, worker_id, lock_ttl)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            // Another worker is on this target; hand the row back uncharged.
            debug!(worker_id, onion = %item.onion_address, "crawl lock contended");
            let _ = storage.unlease_crawl_item(item.id, worker_id).await;
            return;
        }
        Err(e) => {
            error!(worker_id, error = %e, "lock acquire failed");
            let _ = storage.unlease_crawl_item(item.id, worker_id).await;
            return;
        }
    }

    let opts = FetchOptions {
        max_bytes: Some(config.crawler.max_content_size),
        retries: config.crawler.retries,
        retry_delay: Duration::from_millis(config.crawler.retry_delay_ms),
        timeout: Duration::from_millis(config.crawler.request_timeout_ms),
    };

    let response = match http.fetch(&item.url, &opts).await {
        Ok(response) => response,
        Err(e) if e.is_connection_failure() => {
            // The whole service is down or gone; retrying its other URLs
            // one by one would only burn circuits.
            info!(worker_id, onion = %item.onion_address, error = %e, "domain-wide connection failure");
            let _ = storage.fail_domain(&item.onion_address, &e.to_string()).await;
            let _ = storage
                .release_lock(PIPELINE_CRAWL, &item.onion_address, worker_id)
                .await;
            return;
        }
        Err(e) => {
            warn!(worker_id, url = %item.url, error = %e, "fetch failed");
            let _ = storage.fail_crawl_item(item.id, worker_id, &e.to_string()).await;
            let _ = storage
                .release_lock(PIPELINE_CRAWL, &item.onion_address, worker_id)
                .await;
            return;
        }
    };

    let Ok(page_url) = Url::parse(&item.url) else {
        let _ = storage
            .fail_crawl_item(item.id, worker_id, "unparseable queue URL")
            .await;
        let _ = storage
            .release_lock(PIPELINE_CRAWL, &item.onion_address, worker_id)
            .await;
        return;
    };

    let (document, text_mentions) = build_document(item, &page_url, &response);
    debug!(
        worker_id,
        url = %item.url,
        status = response.status,
        links = document.links.len(),
        truncated = response.truncated,
        "fetched"
    );

    if let Err(e) = storage.store_page(&document).await {
        error!(worker_id, url = %item.url, error = %e, "store failed");
        let _ = storage.fail_crawl_item(item.id, worker_id, &e.to_string()).await;
        let _ = storage
            .release_lock(PIPELINE_CRAWL, &item.onion_address, worker_id)
            .await;
        return;
    }

    enqueue_discoveries(storage, writer, item, response.status, &document, &text_mentions).await;

    let _ = storage.complete_crawl_item(item.id, worker_id).await;
    writer
        .log_crawl(CrawlLogEntry {
            url: item.url.clone(),
            onion_address: item.onion_address.clone(),
            status_code: Some(response.status as i32),
            content_size: document.content_size,
            worker_id: worker_id.to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
        })
        .await;
    let _ = storage
        .release_crawl_lock_and_complete(&item.onion_address, worker_id)
        .await;
}

/// Turn a fetched response into the persisted document plus the onion
/// addresses mentioned only in text. HTTP errors are data: error pages are
/// parsed like anything else, just with a tagged title. Non-HTML bodies get
/// minimal synthesized metadata.
fn build_document(
    item: &asherah_core::types::CrawlItem,
    page_url: &Url,
    response: &asherah_core::types::FetchedResponse,
) -> (PageDocument, Vec<String>) {
    let status = response.status;
    let is_error = status >= 400;

    let (mut metadata, links, text_onions, body_text, body_html) = if response.is_html() {
        let html = response.body_text();
        let extract = fingerprint::parse_page(&html, page_url);
        let body_text = fingerprint::html::extract_text(&html);
        (
            extract.metadata,
            extract.links,
            extract.text_onions,
            body_text,
            Some(html),
        )
    } else {
        let mut metadata = PageMetadata::default();
        metadata.title = response.content_type.clone();
        (metadata, Vec::new(), Vec::new(), String::new(), None)
    };

    if is_error {
        metadata.title = Some(match metadata.title.take() {
            Some(title) => format!("[{status}] {title}"),
            None => format!("[{status}]"),
        });
    }

    let document = PageDocument {
        url: item.url.clone(),
        onion_address: item.onion_address.clone(),
        path: page_url.path().to_string(),
        status: status as i32,
        content_size: response.body.len() as i64,
        body_text,
        body_html,
        metadata,
        headers: response.headers.clone(),
        links,
        fetched_at: chrono::Utc::now(),
    };
    (document, text_onions)
}

async fn enqueue_discoveries(
    storage: &Storage,
    writer: &BufferedWriter,
    item: &asherah_core::types::CrawlItem,
    status: u16,
    document: &PageDocument,
    text_mentions: &[String],
) {
    let link_priority = if status >= 400 {
        ERROR_LINK_PRIORITY
    } else {
        LINK_PRIORITY
    };

    let mut scan_targets: HashSet<String> = HashSet::new();

    for link in &document.links {
        let Some(onion) = &link.onion else { continue };
        scan_targets.insert(onion.clone());
        if let Err(e) = storage
            .enqueue_crawl(&link.url, onion, Some(&item.onion_address), link_priority)
            .await
        {
            warn!(url = %link.url, error = %e, "link enqueue failed");
        }
    }

    for onion in text_mentions {
        scan_targets.insert(onion.clone());
        let root = fingerprint::root_url(onion);
        if let Err(e) = storage
            .enqueue_crawl(&root, onion, Some(&item.onion_address), TEXT_MENTION_PRIORITY)
            .await
        {
            warn!(url = %root, error = %e, "text-mention enqueue failed");
        }
    }

    for onion in scan_targets {
        writer.enqueue_scan(onion, SCAN_PRIORITY).await;
    }
}
