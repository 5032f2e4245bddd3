use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use asherah_core::types::{DirObservation, DirscanItem, DirscanProfile};
use asherah_core::AppConfig;
use asherah_fingerprint::classifier::{self, Baseline, ProbeResponse};
use asherah_fingerprint::is_valid_onion;
use asherah_storage::{Storage, PIPELINE_DIRSCAN};
use asherah_transport::{FetchOptions, HttpClient, ProxyConnector};

use crate::crawl::{item_pause, shutdown_requested, wait_for_shutdown_signal};
use crate::wordlists;

/// Consecutive transport failures before the target is declared gone.
const ABORT_AFTER_FAILURES: u32 = 5;

pub async fn run_dirscan(config: AppConfig, target: Option<String>, profile: String) -> Result<()> {
    let profile: DirscanProfile = profile.parse().map_err(|e: String| anyhow!(e))?;

    let workers = config.dirscanner.workers;
    let pool_size = (workers as u32 + 5).max(10);
    let storage = Storage::with_pool_size(&config.database.url(), pool_size).await?;
    storage.run_migrations().await?;

    let cleared = storage.clear_all_locks().await?;
    if cleared > 0 {
        info!(cleared, "cleared stale locks");
    }
    let reset = storage.reset_orphaned("dirscan_queue").await?;
    if reset > 0 {
        info!(reset, "reset orphaned dirscan rows");
    }

    let connector = Arc::new(ProxyConnector::new(
        config.tor.socks_addr(),
        Duration::from_millis(config.dirscanner.request_timeout_ms),
    ));
    connector
        .probe()
        .await
        .map_err(|e| anyhow!("SOCKS5 relay not reachable, refusing to start: {e}"))?;
    info!(addr = %config.tor.socks_addr(), "SOCKS5 relay reachable");

    // Redirects stay unfollowed: the classifier reads the Location header.
    let http = Arc::new(HttpClient::new(Arc::clone(&connector), false)?);

    if let Some(target) = target {
        if !is_valid_onion(&target) {
            return Err(anyhow!("not a v3 onion address: {target}"));
        }
        storage.enqueue_dirscan(&target, profile, 50).await?;
        info!(target, profile = profile.as_str(), "target enqueued");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let stats_handle = {
        let storage = storage.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        match storage.queue_depth("dirscan_queue").await {
                            Ok(depth) => info!(
                                pending = depth.pending,
                                processing = depth.processing,
                                completed = depth.completed,
                                failed = depth.failed,
                                "dirscan queue"
                            ),
                            Err(e) => warn!(error = %e, "stats query failed"),
                        }
                    }
                }
            }
        })
    };

    info!(workers, "spawning dirscan workers");
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let worker_id = format!("dirscan-{}-{}", std::process::id(), index);
        let config = config.clone();
        let storage = storage.clone();
        let http = Arc::clone(&http);
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            dirscan_worker(worker_id, config, storage, http, shutdown).await;
        }));
    }

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    let _ = stats_handle.await;
    storage.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn dirscan_worker(
    worker_id: String,
    config: AppConfig,
    storage: Storage,
    http: Arc<HttpClient>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(worker_id, "worker started");
    let idle_delay = Duration::from_secs(2);

    loop {
        if shutdown_requested(&mut shutdown) {
            break;
        }

        let batch = match storage.lease_dirscan_batch(&worker_id, 1).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker_id, error = %e, "lease failed, backing off");
                tokio::time::sleep(idle_delay * 2).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(idle_delay) => {}
            }
            continue;
        }

        for item in batch {
            process_item(&worker_id, &config, &storage, &http, &item, &mut shutdown).await;
            item_pause().await;
        }
    }
    info!(worker_id, "worker stopped");
}

async fn process_item(
    worker_id: &str,
    config: &AppConfig,
    storage: &Storage,
    http: &HttpClient,
    item: &DirscanItem,
    shutdown: &mut broadcast::Receiver<()>,
) {
    let lock_ttl = Duration::from_secs(config.dirscanner.lock_ttl_secs);
    match storage
        .acquire_lock(PIPELINE_DIRSCAN, &item.onion_address, worker_id, lock_ttl)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(worker_id, onion = %item.onion_address, "dirscan lock contended");
            let _ = storage.unlease_dirscan_item(item.id, worker_id).await;
            return;
        }
        Err(e) => {
            error!(worker_id, error = %e, "lock acquire failed");
            let _ = storage.unlease_dirscan_item(item.id, worker_id).await;
            return;
        }
    }

    let opts = FetchOptions {
        max_bytes: Some(64 * 1024),
        retries: 1,
        retry_delay: Duration::from_secs(1),
        timeout: Duration::from_millis(config.dirscanner.request_timeout_ms),
    };

    // Probe a path that cannot exist; a 200 here means the server disguises
    // its error pages and the classifier needs the reference response.
    let baseline = match fetch_baseline(http, &item.onion_address, &opts).await {
        Ok(baseline) => baseline,
        Err(e) => {
            warn!(worker_id, onion = %item.onion_address, error = %e, "baseline probe failed");
            let _ = storage.fail_dirscan_item(item.id, worker_id, &e.to_string()).await;
            let _ = storage
                .release_lock(PIPELINE_DIRSCAN, &item.onion_address, worker_id)
                .await;
            return;
        }
    };

    let paths = wordlists::paths(item.profile);
    info!(
        worker_id,
        onion = %item.onion_address,
        profile = item.profile.as_str(),
        paths = paths.len(),
        baseline_status = baseline.as_ref().map(|b| b.status),
        "brute forcing"
    );

    let path_delay = Duration::from_millis(config.dirscanner.path_delay_ms);
    let mut consecutive_failures = 0u32;
    let mut hits = 0usize;
    for (index, path) in paths.iter().enumerate() {
        if shutdown_requested(shutdown) {
            break;
        }
        if index > 0 {
            tokio::time::sleep(path_delay).await;
        }

        let url = format!("http://{}/{}", item.onion_address, path);
        let started = Instant::now();
        let response = match http.fetch(&url, &opts).await {
            Ok(response) => {
                consecutive_failures = 0;
                response
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(worker_id, url, error = %e, "path probe failed");
                if consecutive_failures >= ABORT_AFTER_FAILURES {
                    warn!(worker_id, onion = %item.onion_address, "target unresponsive, aborting pass");
                    break;
                }
                continue;
            }
        };

        let body = response.body_text();
        let probe_path = format!("/{path}");
        let probe = ProbeResponse {
            path: &probe_path,
            status: response.status,
            content_length: response.body.len() as i64,
            body: &body,
            redirect_url: response.headers.get("location").map(String::as_str),
        };
        let verdict = classifier::classify(&probe, baseline.as_ref());
        if verdict.interesting {
            hits += 1;
            info!(
                worker_id,
                url,
                status = response.status,
                category = verdict.category.map(|c| c.as_str()).unwrap_or("other"),
                "interesting path"
            );
        }

        let observation = DirObservation {
            path: probe_path,
            status: response.status as i32,
            content_length: response.body.len() as i64,
            content_type: response.content_type.clone(),
            response_time_ms: started.elapsed().as_millis() as u64,
            server_header: response.headers.get("server").cloned(),
            redirect_url: response.headers.get("location").cloned(),
            body_snippet: classifier::snippet_of(&body),
            interesting: verdict.interesting,
            category: verdict.category,
        };
        if let Err(e) = storage
            .store_dir_observation(&item.onion_address, &observation)
            .await
        {
            error!(worker_id, error = %e, "observation store failed");
        }
    }

    info!(worker_id, onion = %item.onion_address, hits, "pass complete");
    let _ = storage.complete_dirscan_item(item.id, worker_id).await;
    let _ = storage
        .release_lock(PIPELINE_DIRSCAN, &item.onion_address, worker_id)
        .await;
}

/// Fetch the soft-404 reference from a freshly generated nonsense path.
/// Returns Ok(None) when the server answers with a real error status, in
/// which case plain status rules are enough.
async fn fetch_baseline(
    http: &HttpClient,
    onion_address: &str,
    opts: &FetchOptions,
) -> Result<Option<Baseline>> {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    let epoch = chrono::Utc::now().timestamp();
    let url = format!(
        "http://{onion_address}/{nonce}-definitely-not-a-real-path-{epoch}"
    );

    let response = http.fetch(&url, opts).await?;
    if response.status != 200 {
        return Ok(None);
    }
    let body = response.body_text();
    Ok(Some(Baseline::new(
        response.status,
        response.body.len() as i64,
        &body,
    )))
}
