use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use asherah_core::types::{PortObservation, PortState, ScanItem, ScanProfile};
use asherah_core::AppConfig;
use asherah_fingerprint::{detect_service, is_valid_onion, probe_string};
use asherah_storage::{Storage, PIPELINE_SCAN};
use asherah_transport::{grab_banner, ProxyConnector};

use crate::crawl::{item_pause, shutdown_requested, wait_for_shutdown_signal};

pub async fn run_scan(
    config: AppConfig,
    target: Option<String>,
    profile: String,
    ports: Option<Vec<u16>>,
) -> Result<()> {
    let profile: ScanProfile = profile
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    let workers = config.scanner.workers;
    let pool_size = (workers as u32 + 5).max(10);
    let storage = Storage::with_pool_size(&config.database.url(), pool_size).await?;
    storage.run_migrations().await?;

    let cleared = storage.clear_all_locks().await?;
    if cleared > 0 {
        info!(cleared, "cleared stale locks");
    }
    let reset = storage.reset_orphaned("scan_queue").await?;
    if reset > 0 {
        info!(reset, "reset orphaned scan rows");
    }

    let connector = Arc::new(ProxyConnector::new(
        config.tor.socks_addr(),
        Duration::from_millis(config.scanner.connect_timeout_ms),
    ));
    connector
        .probe()
        .await
        .map_err(|e| anyhow!("SOCKS5 relay not reachable, refusing to start: {e}"))?;
    info!(addr = %config.tor.socks_addr(), "SOCKS5 relay reachable");

    if let Some(target) = target {
        if !is_valid_onion(&target) {
            return Err(anyhow!("not a v3 onion address: {target}"));
        }
        storage
            .enqueue_scan(&target, profile, ports.as_deref(), 50)
            .await?;
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
                        match storage.queue_depth("scan_queue").await {
                            Ok(depth) => info!(
                                pending = depth.pending,
                                processing = depth.processing,
                                completed = depth.completed,
                                failed = depth.failed,
                                "scan queue"
                            ),
                            Err(e) => warn!(error = %e, "stats query failed"),
                        }
                    }
                }
            }
        })
    };

    info!(workers, "spawning scan workers");
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let worker_id = format!("scan-{}-{}", std::process::id(), index);
        let config = config.clone();
        let storage = storage.clone();
        let connector = Arc::clone(&connector);
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            scan_worker(worker_id, config, storage, connector, shutdown).await;
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

async fn scan_worker(
    worker_id: String,
    config: AppConfig,
    storage: Storage,
    connector: Arc<ProxyConnector>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(worker_id, "worker started");
    let idle_delay = Duration::from_secs(2);

    loop {
        if shutdown_requested(&mut shutdown) {
            break;
        }

        let batch = match storage.lease_scan_batch(&worker_id, 1).await {
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
            process_item(&worker_id, &config, &storage, &connector, &item).await;
            item_pause().await;
        }
    }
    info!(worker_id, "worker stopped");
}

async fn process_item(
    worker_id: &str,
    config: &AppConfig,
    storage: &Storage,
    connector: &Arc<ProxyConnector>,
    item: &ScanItem,
) {
    let lock_ttl = Duration::from_secs(config.scanner.lock_ttl_secs);
    match storage
        .acquire_lock(PIPELINE_SCAN, &item.onion_address, worker_id, lock_ttl)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(worker_id, onion = %item.onion_address, "scan lock contended");
            let _ = storage.unlease_scan_item(item.id, worker_id).await;
            return;
        }
        Err(e) => {
            error!(worker_id, error = %e, "lock acquire failed");
            let _ = storage.unlease_scan_item(item.id, worker_id).await;
            return;
        }
    }

    let ports: Vec<u16> = item
        .ports
        .clone()
        .unwrap_or_else(|| item.profile.ports().to_vec());
    info!(
        worker_id,
        onion = %item.onion_address,
        profile = item.profile.as_str(),
        ports = ports.len(),
        "scanning"
    );

    let observations = probe_ports(config, connector, &item.onion_address, &ports).await;

    let open = observations
        .iter()
        .filter(|o| o.state == PortState::Open)
        .count();
    debug!(worker_id, onion = %item.onion_address, open, probed = observations.len(), "probe pass done");

    let mut store_failed = false;
    for obs in &observations {
        match storage.store_port_observation(&item.onion_address, obs).await {
            Ok(port_scan_id) => {
                if let Some(service) = detect_service(obs.port, obs.banner.as_deref()) {
                    info!(
                        worker_id,
                        onion = %item.onion_address,
                        port = obs.port,
                        service = %service.service,
                        confidence = service.confidence,
                        "service detected"
                    );
                    if let Err(e) = storage.store_detected_service(port_scan_id, &service).await {
                        warn!(error = %e, "detected service store failed");
                    }
                }
            }
            Err(e) => {
                error!(worker_id, port = obs.port, error = %e, "observation store failed");
                store_failed = true;
            }
        }
    }

    if store_failed {
        let _ = storage
            .fail_scan_item(item.id, worker_id, "observation store failed")
            .await;
    } else {
        let _ = storage.complete_scan_item(item.id, worker_id).await;
    }
    let _ = storage
        .release_lock(PIPELINE_SCAN, &item.onion_address, worker_id)
        .await;
}

/// Unresponsive-target early abort: this many launched probes in a row
/// coming back timeout/filtered means the service is likely gone.
const EARLY_ABORT_STREAK: usize = 12;

/// Probe every port with bounded concurrency and a per-target launch floor;
/// Tor circuits saturate fast when probes land together.
async fn probe_ports(
    config: &AppConfig,
    connector: &Arc<ProxyConnector>,
    onion_address: &str,
    ports: &[u16],
) -> Vec<PortObservation> {
    let semaphore = Arc::new(Semaphore::new(config.scanner.max_concurrent));
    let probe_delay = Duration::from_millis(config.scanner.probe_delay_ms);
    let banner_timeout = Duration::from_millis(config.scanner.banner_timeout_ms);

    let mut observations: Vec<PortObservation> = Vec::with_capacity(ports.len());
    let mut join_set: JoinSet<PortObservation> = JoinSet::new();
    let mut dead_streak = 0usize;
    for (index, port) in ports.iter().copied().enumerate() {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if index > 0 {
            tokio::time::sleep(probe_delay).await;
        }

        // Harvest whatever already finished so the streak counter sees it.
        while let Some(Ok(obs)) = join_set.try_join_next() {
            match obs.state {
                PortState::Timeout | PortState::Filtered => dead_streak += 1,
                _ => dead_streak = 0,
            }
            observations.push(obs);
        }
        if dead_streak >= EARLY_ABORT_STREAK {
            warn!(onion_address, dead_streak, "target unresponsive, aborting scan pass");
            break;
        }

        let connector = Arc::clone(connector);
        let onion = onion_address.to_string();
        join_set.spawn(async move {
            let _permit = permit;
            probe_port(&connector, &onion, port, banner_timeout).await
        });
    }

    while let Some(result) = join_set.join_next().await {
        if let Ok(obs) = result {
            observations.push(obs);
        }
    }
    observations.sort_by_key(|o| o.port);
    observations
}

async fn probe_port(
    connector: &ProxyConnector,
    onion_address: &str,
    port: u16,
    banner_timeout: Duration,
) -> PortObservation {
    let started = Instant::now();
    match connector.connect(onion_address, port).await {
        Ok(stream) => {
            let banner = grab_banner(stream, probe_string(port), banner_timeout).await;
            PortObservation {
                port,
                state: PortState::Open,
                response_time_ms: started.elapsed().as_millis() as u64,
                banner,
            }
        }
        Err(e) => {
            debug!(onion_address, port, error = %e, "probe failed");
            PortObservation {
                port,
                state: e.port_state(),
                response_time_ms: started.elapsed().as_millis() as u64,
                banner: None,
            }
        }
    }
}
