// dbbackup/src/backup/logic.rs
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::Toolbox;
use crate::backup::archive;
use crate::backup::db_dump::dump_databases;
use crate::backup::retention::enforce_retention;
use crate::backup::transport::upload_artifact;
use crate::config::{EngineKind, RunConfig};
use crate::errors::{BackupError, Result, ShutdownSignal};

const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const ARTIFACT_DATE_FORMAT: &str = "%Y-%m-%d";

/// `<prefix>-<engine>-<UTC timestamp>`, unique per run timestamp.
pub fn staging_dir_name(prefix: &str, kind: EngineKind, started_at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", prefix, kind, started_at.format(RUN_TIMESTAMP_FORMAT))
}

/// Archive build running on the blocking pool.
#[derive(Debug)]
pub struct PackagingTask {
    handle: JoinHandle<anyhow::Result<PathBuf>>,
    cancel: Arc<AtomicBool>,
}

/// Mutable state of a single run. Only the stage responsible for a field
/// writes it: packaging sets `artifact` (and `packaging` while it runs), the
/// upload step sets `uploaded`.
#[derive(Debug)]
pub struct RunContext {
    pub started_at: DateTime<Utc>,
    pub staging_dir: PathBuf,
    pub artifact: Option<PathBuf>,
    pub uploaded: bool,
    packaging: Option<PackagingTask>,
}

impl RunContext {
    pub fn new(config: &RunConfig, started_at: DateTime<Utc>) -> Self {
        let staging_dir = config.staging_root.join(staging_dir_name(
            &config.archive_prefix,
            config.engine_kind(),
            started_at,
        ));
        Self {
            started_at,
            staging_dir,
            artifact: None,
            uploaded: false,
            packaging: None,
        }
    }

    pub fn artifact_base_name(&self, config: &RunConfig) -> String {
        let date = self.started_at.format(ARTIFACT_DATE_FORMAT).to_string();
        archive::artifact_base_name(&date, config.artifact_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub artifact: PathBuf,
    pub uploaded: bool,
}

/// Runs dump → package → upload, racing the pipeline against `shutdown`.
/// Cleanup always runs afterwards and never changes the outcome.
pub async fn perform_backup_orchestration<S>(
    config: &RunConfig,
    toolbox: &Toolbox,
    shutdown: S,
) -> Result<RunSummary>
where
    S: Future<Output = ShutdownSignal>,
{
    let mut ctx = RunContext::new(config, Utc::now());
    info!(
        engine = %config.engine_kind(),
        staging = %ctx.staging_dir.display(),
        output = %config.output_dir.display(),
        "🚀 Starting database backup"
    );

    let result = tokio::select! {
        biased;
        signal = shutdown => {
            warn!("Received {}, abandoning remaining backup steps", signal);
            Err(BackupError::Interrupted(signal))
        }
        result = run_pipeline(config, toolbox, &mut ctx) => result,
    };

    settle_packaging(&mut ctx).await;
    finalize(config, toolbox, &ctx, &result).await;

    result.and_then(|()| match ctx.artifact {
        Some(artifact) => Ok(RunSummary {
            started_at: ctx.started_at,
            artifact,
            uploaded: ctx.uploaded,
        }),
        None => Err(BackupError::Packaging(anyhow::anyhow!(
            "Pipeline finished without an artifact"
        ))),
    })
}

async fn run_pipeline(config: &RunConfig, toolbox: &Toolbox, ctx: &mut RunContext) -> Result<()> {
    prepare_directories(config, ctx).await?;

    let report = dump_databases(
        config,
        toolbox.catalog.as_ref(),
        toolbox.runner.as_ref(),
        &ctx.staging_dir,
    )
    .await?;

    let artifact = package_artifact(config, ctx).await?;
    ctx.artifact = Some(artifact.clone());

    match &config.upload {
        Some(target) => {
            upload_artifact(
                target,
                &artifact,
                toolbox.runner.as_ref(),
                toolbox.object_store.as_ref(),
            )
            .await?;
            ctx.uploaded = true;
        }
        None => info!(
            "No upload destination configured; artifact stays at {}",
            artifact.display()
        ),
    }

    if !report.failed.is_empty() {
        return Err(BackupError::PartialDump { failed: report.failed });
    }
    Ok(())
}

async fn prepare_directories(config: &RunConfig, ctx: &RunContext) -> Result<()> {
    tokio::fs::create_dir_all(&ctx.staging_dir).await?;
    tokio::fs::create_dir_all(&config.output_dir).await?;
    info!("📂 Staging directory created at {}", ctx.staging_dir.display());
    Ok(())
}

/// The task handle is parked in `ctx` while it runs, so an interrupted run
/// can stop and wait for it before cleanup touches the staging directory.
async fn package_artifact(config: &RunConfig, ctx: &mut RunContext) -> Result<PathBuf> {
    let staging_dir = ctx.staging_dir.clone();
    let output_dir = config.output_dir.clone();
    let base_name = ctx.artifact_base_name(config);
    let compression = config.compression;
    let cancel = Arc::new(AtomicBool::new(false));
    let task_cancel = Arc::clone(&cancel);

    let handle = tokio::task::spawn_blocking(move || {
        archive::package(&staging_dir, &output_dir, &base_name, compression, &task_cancel)
    });
    let task = ctx.packaging.insert(PackagingTask { handle, cancel });
    let joined = (&mut task.handle).await;
    ctx.packaging = None;

    let artifact = joined
        .map_err(|e| BackupError::Packaging(anyhow::anyhow!("Packaging task failed: {}", e)))?
        .map_err(BackupError::Packaging)?;

    info!("📦 Artifact ready at {}", artifact.display());
    Ok(artifact)
}

/// Stops a packaging task abandoned by an interrupted pipeline and waits for
/// it to exit. A build that completed anyway becomes the run's artifact.
async fn settle_packaging(ctx: &mut RunContext) {
    let Some(task) = ctx.packaging.take() else {
        return;
    };
    task.cancel.store(true, Ordering::Relaxed);
    info!("Waiting for packaging to stop before cleanup");

    match task.handle.await {
        Ok(Ok(artifact)) => ctx.artifact = Some(artifact),
        Ok(Err(e)) => debug!("Packaging stopped: {:#}", e),
        Err(e) => warn!("Packaging task failed: {}", e),
    }
}

/// Retention, local artifact removal and staging removal, in that order.
/// Each step's failure is logged and does not stop the next one.
async fn finalize(config: &RunConfig, toolbox: &Toolbox, ctx: &RunContext, result: &Result<()>) {
    enforce_retention(config, toolbox.runner.as_ref()).await;

    if let Some(artifact) = &ctx.artifact {
        if ctx.uploaded && !config.keep_local {
            remove_local_artifact(artifact).await;
        }
    }

    remove_staging_dir(&ctx.staging_dir).await;

    match result {
        Ok(()) => info!("🎉 Backup completed successfully"),
        Err(e) => error!(exit_code = e.exit_code(), "❌ Backup failed: {}", e),
    }
}

async fn remove_local_artifact(artifact: &Path) {
    match tokio::fs::remove_file(artifact).await {
        Ok(()) => info!("🗑 Removed local artifact {} (KEEP_LOCAL=false)", artifact.display()),
        Err(e) => warn!("Failed to remove local artifact {}: {}", artifact.display(), e),
    }
}

async fn remove_staging_dir(staging_dir: &Path) {
    match tokio::fs::remove_dir_all(staging_dir).await {
        Ok(()) => debug!("Removed staging directory {}", staging_dir.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove staging directory {}: {}",
            staging_dir.display(),
            e
        ),
    }
}
