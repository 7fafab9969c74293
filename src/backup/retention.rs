// dbbackup/src/backup/retention.rs
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backup::archive::{GZIP_EXTENSION, TAR_EXTENSION};
use crate::backup::rclone;
use crate::config::{RunConfig, UploadTarget};
use crate::utils::command::CommandRunner;

/// Remote name patterns this tool owns for `name`, covering both
/// compression modes. Nothing outside these patterns is ever deleted;
/// `name` is free of filter metacharacters once the config is resolved.
pub fn retention_patterns(name: &str) -> Vec<String> {
    vec![
        format!("*-{}.{}", name, TAR_EXTENSION),
        format!("*-{}.{}.{}", name, TAR_EXTENSION, GZIP_EXTENSION),
    ]
}

/// Deletes matching objects older than `days` from an rclone remote, then
/// removes directories left empty.
pub async fn prune(
    runner: &dyn CommandRunner,
    remote: &str,
    days: u32,
    name: &str,
    flags: &[String],
) -> Result<()> {
    let patterns = retention_patterns(name);
    info!(
        "Pruning backups older than {} day(s) from {} matching {:?}",
        days, remote, patterns
    );

    runner
        .run(&rclone::delete_older_than_command(remote, days, &patterns, flags))
        .await
        .with_context(|| format!("Failed to delete expired backups from {}", remote))?;
    runner
        .run(&rclone::remove_empty_dirs_command(remote, flags))
        .await
        .with_context(|| format!("Failed to remove empty directories from {}", remote))?;

    info!("✓ Retention applied to {}", remote);
    Ok(())
}

/// Applies the configured retention window. Best effort: every failure or
/// unsupported combination is logged and swallowed.
pub async fn enforce_retention(config: &RunConfig, runner: &dyn CommandRunner) {
    let Some(days) = config.retention_days else {
        return;
    };

    match &config.upload {
        Some(UploadTarget::Rclone { remote, flags }) => {
            if let Err(e) = prune(runner, remote, days, config.artifact_name(), flags).await {
                warn!("Retention cleanup failed: {:#}", e);
            }
        }
        Some(UploadTarget::S3 { url, .. }) => {
            warn!(
                "RETENTION_DAYS is not applied to S3 destination {}; \
                 configure a bucket lifecycle rule instead",
                url
            );
        }
        None => {
            warn!("RETENTION_DAYS is set but no rclone remote is configured; skipping retention");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_support::{RecordingRunner, config_from};
    use crate::utils::command::{CommandError, MockCommandRunner};

    #[test]
    fn test_patterns_follow_artifact_naming() {
        assert_eq!(retention_patterns("billing"), vec!["*-billing.tar", "*-billing.tar.gz"]);
    }

    #[test]
    fn test_wildcard_name_never_reaches_the_include_filter() {
        let err = config_from(&[
            ("DB_TYPE", "mysql"),
            ("BACKUP_NAME", "*"),
            ("RCLONE_REMOTE", "b2:db"),
            ("RETENTION_DAYS", "7"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("BACKUP_NAME"));
    }

    #[test]
    fn test_dotted_names_stay_literal() {
        assert_eq!(
            retention_patterns("shop-eu.prod"),
            vec!["*-shop-eu.prod.tar", "*-shop-eu.prod.tar.gz"]
        );
    }

    #[tokio::test]
    async fn test_prune_deletes_then_removes_empty_dirs() -> anyhow::Result<()> {
        let config = config_from(&[
            ("DB_TYPE", "mysql"),
            ("RCLONE_REMOTE", "b2:db/mysql"),
            ("RCLONE_FLAGS", "--config /etc/rclone.conf"),
            ("RETENTION_DAYS", "30"),
        ])?;
        let runner = RecordingRunner::default();

        enforce_retention(&config, &runner).await;

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].arg_values(),
            vec![
                "delete",
                "b2:db/mysql",
                "--min-age",
                "30d",
                "--include",
                "*-mysql.tar",
                "--include",
                "*-mysql.tar.gz",
                "--config",
                "/etc/rclone.conf",
            ]
        );
        assert_eq!(calls[1].arg_values()[..3], ["rmdirs", "b2:db/mysql", "--leave-root"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_uses_name_override() -> anyhow::Result<()> {
        let config = config_from(&[
            ("DB_TYPE", "postgres"),
            ("BACKUP_NAME", "billing"),
            ("RCLONE_REMOTE", "s3remote:bk"),
            ("RETENTION_DAYS", "7"),
        ])?;
        let runner = RecordingRunner::default();

        enforce_retention(&config, &runner).await;

        let delete = &runner.calls()[0];
        let includes: Vec<&str> = delete
            .args
            .windows(2)
            .filter(|pair| pair[0].value == "--include")
            .map(|pair| pair[1].value.as_str())
            .collect();
        assert_eq!(includes, vec!["*-billing.tar", "*-billing.tar.gz"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_skipped_without_rclone_remote() -> anyhow::Result<()> {
        for pairs in [
            vec![("DB_TYPE", "redis"), ("RETENTION_DAYS", "3")],
            vec![("DB_TYPE", "redis"), ("RETENTION_DAYS", "3"), ("S3_URL", "s3://bucket/redis/")],
            vec![("DB_TYPE", "redis"), ("RCLONE_REMOTE", "b2:redis")],
        ] {
            let config = config_from(&pairs)?;
            // Any call on this mock would panic.
            let runner = MockCommandRunner::new();
            enforce_retention(&config, &runner).await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_failure_is_swallowed() -> anyhow::Result<()> {
        let config = config_from(&[
            ("DB_TYPE", "redis"),
            ("RCLONE_REMOTE", "b2:redis"),
            ("RETENTION_DAYS", "3"),
        ])?;
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_| {
            Err(CommandError::Failed {
                program: "rclone".into(),
                code: Some(1),
                stderr: "directory not found".into(),
            })
        });

        enforce_retention(&config, &runner).await;
        Ok(())
    }
}
