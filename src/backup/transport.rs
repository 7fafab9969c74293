// dbbackup/src/backup/transport.rs
use std::path::Path;

use tracing::info;

use crate::backup::rclone;
use crate::backup::s3_upload::{ObjectStore, S3Options};
use crate::config::UploadTarget;
use crate::errors::{BackupError, Result};
use crate::utils::command::CommandRunner;

/// Copies the artifact to the configured destination. Failures are fatal to
/// the run and are not retried here.
pub async fn upload_artifact(
    target: &UploadTarget,
    artifact: &Path,
    runner: &dyn CommandRunner,
    store: &dyn ObjectStore,
) -> Result<()> {
    let destination = target.destination().to_string();
    info!("Uploading {} to {}", artifact.display(), destination);

    let outcome: anyhow::Result<()> = match target {
        UploadTarget::Rclone { remote, flags } => runner
            .run(&rclone::copy_command(artifact, remote, flags))
            .await
            .map_err(anyhow::Error::from),
        UploadTarget::S3 { location, options, .. } => match artifact.file_name() {
            Some(file_name) => {
                let key = location.object_key(&file_name.to_string_lossy());
                store
                    .put_file(&location.bucket, &key, artifact, &S3Options::parse(options))
                    .await
            }
            None => Err(anyhow::anyhow!("Artifact path has no file name: {}", artifact.display())),
        },
    };

    outcome.map_err(|source| BackupError::Transport {
        destination: destination.clone(),
        source,
    })?;
    info!("✅ Upload to {} complete", destination);
    Ok(())
}
