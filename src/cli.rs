use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "asherah", about = "Hidden service crawler, port scanner & directory brute-forcer")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the crawler pipeline
    Crawl {
        /// Seed URLs (comma-separated or file path)
        #[arg(short, long)]
        seeds: Option<String>,

        /// Single seed URL
        #[arg(long)]
        seed: Option<String>,
    },
    /// Run the port-scanner pipeline
    Scan {
        /// Enqueue a single onion address before starting
        #[arg(long)]
        target: Option<String>,

        /// Port profile (quick|standard|full|crypto)
        #[arg(short, long, default_value = "standard")]
        profile: String,

        /// Explicit comma-separated port list, overrides the profile
        #[arg(long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,
    },
    /// Run the directory-scanner pipeline
    Dirscan {
        /// Enqueue a single onion address before starting
        #[arg(long)]
        target: Option<String>,

        /// Wordlist profile (quick|standard|full)
        #[arg(short, long, default_value = "standard")]
        profile: String,
    },
    /// Show pipeline queues and database stats
    Status,
}
