//! CLI entry point for mwah
//!
//! Loads configuration, starts the media service and serves until Ctrl-C.

use clap::Parser;
use mwah_daemon::{Config, MediaService};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// mwah - serve a folder of videos with on-demand HLS conversion
#[derive(Parser, Debug)]
#[command(name = "mwah")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; missing means defaults
    #[arg(short, long, default_value = "mwah.toml")]
    config: PathBuf,

    /// Media root, overrides media.root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Try to expose the media server through a public tunnel
    #[arg(long)]
    tunnel: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "mwah=debug,mwah_daemon=debug,tower_http=debug"
    } else {
        "mwah=info,mwah_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = args.root {
        config.media.root = root;
    }
    if args.tunnel {
        config.tunnel.enabled = true;
    }

    let service = match MediaService::new(config) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to initialize media service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let binding = match service.start_media_server().await {
        Ok(binding) => binding,
        Err(e) => {
            eprintln!("Failed to start media server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("Media root: {}", service.config().media.root.display());
    println!("Media server: {}", binding.url());
    println!("Control API: http://{}", service.config().server.control_addr);
    let plan = service.concurrency_plan();
    println!(
        "Encoder slots: {} ({} cores)",
        plan.max_concurrent_jobs, plan.total_cores
    );

    match service.open_tunnel().await {
        Ok(url) if url != binding.url() => println!("Public URL: {}", url),
        Ok(_) => {}
        Err(e) => tracing::warn!("{}", e),
    }

    if let Err(e) = service.run().await {
        eprintln!("Service error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
