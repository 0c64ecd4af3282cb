mod agents;
mod compression;
mod config;
mod core;
mod cycle;
mod daemon;
mod errors;
mod events;
mod orchestrator;
mod plan;
mod providers;
mod sandbox;
mod scoring;
mod state;
pub mod utils;
mod watcher;

#[cfg(test)]
mod integration_tests;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() {
    // Environment file first: provider API keys and DATABASE_URL commonly
    // arrive via .env in containerized deployments.
    let _ = dotenvy::dotenv();

    let mut config_path = PathBuf::from("config.yaml");
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-V" => {
                println!("tumbler {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "--help" | "-h" => {
                println!("tumbler {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: tumbler [--config <path>]\n");
                println!("Options:");
                println!("  --config <path>  Configuration file (default: config.yaml)");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return;
            }
            "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = PathBuf::from(path),
                    None => {
                        eprintln!("--config requires a path");
                        std::process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    // Config before tracing so the configured level can seed the filter;
    // RUST_LOG always wins when set.
    let config = match config::AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Fatal: cannot build runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(core::run(config)) {
        eprintln!("Fatal: {e}");
        std::process::exit(1);
    }
}
