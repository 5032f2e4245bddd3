mod cli;
mod crawl;
mod dirscan;
mod scan;
mod seeds;
mod status;
mod wordlists;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

// glibc malloc holds on to memory under sustained worker churn
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use asherah_core::AppConfig;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;
    apply_env_overrides(&mut config);

    match cli.command {
        Commands::Crawl { seeds, seed } => crawl::run_crawl(config, seeds, seed).await?,
        Commands::Scan {
            target,
            profile,
            ports,
        } => scan::run_scan(config, target, profile, ports).await?,
        Commands::Dirscan { target, profile } => {
            dirscan::run_dirscan(config, target, profile).await?
        }
        Commands::Status => status::run(config).await?,
    }

    Ok(())
}

/// Environment overrides on top of the config file, for container
/// deployments that tune without remounting config.
fn apply_env_overrides(config: &mut AppConfig) {
    let parse_workers =
        |v: &str| -> Option<usize> { v.parse::<usize>().ok().filter(|&n| n > 0 && n <= 128) };

    if let Ok(v) = std::env::var("TOR_HOST") {
        config.tor.host = v;
    }
    if let Ok(v) = std::env::var("TOR_PORT") {
        if let Ok(n) = v.parse() {
            config.tor.port = n;
        }
    }
    if let Ok(v) = std::env::var("DB_HOST") {
        config.database.host = v;
    }
    if let Ok(v) = std::env::var("DB_PORT") {
        if let Ok(n) = v.parse() {
            config.database.port = n;
        }
    }
    if let Ok(v) = std::env::var("DB_NAME") {
        config.database.name = v;
    }
    if let Ok(v) = std::env::var("DB_USER") {
        config.database.user = v;
    }
    if let Ok(v) = std::env::var("DB_PASSWORD") {
        config.database.password = v;
    }
    if let Ok(v) = std::env::var("WORKER_COUNT") {
        if let Some(n) = parse_workers(&v) {
            config.crawler.workers = n;
        }
    }
    if let Ok(v) = std::env::var("SCANNER_WORKERS") {
        if let Some(n) = parse_workers(&v) {
            config.scanner.workers = n;
        }
    }
    if let Ok(v) = std::env::var("DIRSCAN_WORKERS") {
        if let Some(n) = parse_workers(&v) {
            config.dirscanner.workers = n;
        }
    }
    if let Ok(v) = std::env::var("CRAWL_DELAY") {
        if let Ok(n) = v.parse() {
            config.crawler.crawl_delay_ms = n;
        }
    }
    if let Ok(v) = std::env::var("SCANNER_PROBE_DELAY") {
        if let Ok(n) = v.parse() {
            config.scanner.probe_delay_ms = n;
        }
    }
    if let Ok(v) = std::env::var("DIRSCAN_PATH_DELAY") {
        if let Ok(n) = v.parse() {
            config.dirscanner.path_delay_ms = n;
        }
    }
    if let Ok(v) = std::env::var("REQUEST_TIMEOUT") {
        if let Ok(n) = v.parse() {
            config.crawler.request_timeout_ms = n;
        }
    }
    if let Ok(v) = std::env::var("SCANNER_TIMEOUT") {
        if let Ok(n) = v.parse() {
            config.scanner.connect_timeout_ms = n;
        }
    }
    if let Ok(v) = std::env::var("DIRSCAN_TIMEOUT") {
        if let Ok(n) = v.parse() {
            config.dirscanner.request_timeout_ms = n;
        }
    }
    if let Ok(v) = std::env::var("MAX_CONTENT_SIZE") {
        if let Ok(n) = v.parse() {
            config.crawler.max_content_size = n;
        }
    }
    if let Ok(v) = std::env::var("SCANNER_MAX_CONCURRENT") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 {
                config.scanner.max_concurrent = n;
            }
        }
    }
}
