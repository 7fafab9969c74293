mod logic;
pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod rclone;
pub(crate) mod retention;
pub(crate) mod s3_upload;
pub(crate) mod transport;

#[cfg(test)]
mod test_support;

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::config::RunConfig;
use crate::errors::{Result, ShutdownSignal};
use crate::utils::command::{CommandRunner, SystemRunner};
use db_dump::{DatabaseCatalog, SqlxCatalog};
use s3_upload::{AwsObjectStore, ObjectStore};

pub use logic::RunSummary;

/// External collaborators the backup flow talks to.
pub struct Toolbox {
    pub catalog: Arc<dyn DatabaseCatalog>,
    pub runner: Arc<dyn CommandRunner>,
    pub object_store: Arc<dyn ObjectStore>,
}

impl Toolbox {
    pub fn system() -> Self {
        Self {
            catalog: Arc::new(SqlxCatalog),
            runner: Arc::new(SystemRunner),
            object_store: Arc::new(AwsObjectStore),
        }
    }
}

/// Public entry point for the backup process.
pub async fn run_backup_flow<S>(config: &RunConfig, shutdown: S) -> Result<RunSummary>
where
    S: Future<Output = ShutdownSignal>,
{
    logic::perform_backup_orchestration(config, &Toolbox::system(), shutdown).await
}

/// Resolves with the first SIGINT, SIGTERM or SIGHUP. Handlers are installed
/// when this is called, not when it is first polled.
#[cfg(unix)]
pub fn termination_signal() -> impl Future<Output = ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let listeners = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );
    async move {
        match listeners {
            (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup)) => tokio::select! {
                _ = interrupt.recv() => ShutdownSignal::Interrupt,
                _ = terminate.recv() => ShutdownSignal::Terminate,
                _ = hangup.recv() => ShutdownSignal::Hangup,
            },
            _ => {
                warn!("Failed to install signal handlers; falling back to Ctrl-C only");
                ctrl_c_only().await
            }
        }
    }
}

#[cfg(not(unix))]
pub fn termination_signal() -> impl Future<Output = ShutdownSignal> {
    ctrl_c_only()
}

async fn ctrl_c_only() -> ShutdownSignal {
    match tokio::signal::ctrl_c().await {
        Ok(()) => ShutdownSignal::Interrupt,
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending().await
        }
    }
}
