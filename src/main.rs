//! Database Backup Tool
//!
//! Dumps a MySQL, PostgreSQL, MongoDB or Redis instance, packages the dump
//! into a dated archive, optionally uploads it and prunes old remote copies.

// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use config::load_run_config;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    // Optional path to a JSON config file; environment variables override it.
    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = match load_run_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let shutdown = backup::termination_signal();
    match backup::run_backup_flow(&config, shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code()),
    }
}

/// `RUST_LOG` controls the filter (default `info`); `LOG_FORMAT=json`
/// switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}
