use anyhow::Result;

use asherah_core::AppConfig;
use asherah_storage::{QueueDepth, Storage};

pub async fn run(config: AppConfig) -> Result<()> {
    let storage = Storage::new(&config.database.url()).await?;

    match storage.check_connectivity().await {
        Ok(()) => println!("Database: connected"),
        Err(e) => {
            println!("Database: ERROR - {}", e);
            return Ok(());
        }
    }

    storage.run_migrations().await?;
    let stats = storage.stats().await?;

    println!("\n╔══════════════════════════════════════════════╗");
    println!("║               Asherah Status                 ║");
    println!("╠══════════════════════════════════════════════╣");
    println!("║ Targets (active):   {:>12} ({:>8})   ║", stats.targets, stats.active_targets);
    println!("║ Pages indexed:      {:>20}    ║", stats.pages);
    println!("║ Links discovered:   {:>20}    ║", stats.links);
    println!("║ Open ports:         {:>20}    ║", stats.open_ports);
    println!("║ Services detected:  {:>20}    ║", stats.detected_services);
    println!("║ Interesting paths:  {:>20}    ║", stats.interesting_paths);
    println!("╚══════════════════════════════════════════════╝");

    print_queue("crawl", stats.crawl_queue);
    print_queue("scan", stats.scan_queue);
    print_queue("dirscan", stats.dirscan_queue);
    println!();

    Ok(())
}

fn print_queue(name: &str, depth: QueueDepth) {
    println!(
        "{name:>8} queue: {} pending, {} processing, {} completed, {} failed",
        depth.pending, depth.processing, depth.completed, depth.failed
    );
}
