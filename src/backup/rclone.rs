// dbbackup/src/backup/rclone.rs
use std::path::Path;

use crate::utils::command::ToolCommand;

const RCLONE: &str = "rclone";

/// `rclone copy <artifact> <remote>` with the configured passthrough flags.
pub fn copy_command(artifact: &Path, remote: &str, flags: &[String]) -> ToolCommand {
    ToolCommand::new(RCLONE)
        .arg("copy")
        .arg(artifact.to_string_lossy())
        .arg(remote)
        .args(flags.iter().cloned())
}

/// Deletes objects older than `days` that match one of `include` patterns.
pub fn delete_older_than_command(
    remote: &str,
    days: u32,
    include: &[String],
    flags: &[String],
) -> ToolCommand {
    let mut command = ToolCommand::new(RCLONE)
        .arg("delete")
        .arg(remote)
        .arg("--min-age")
        .arg(format!("{}d", days));
    for pattern in include {
        command = command.arg("--include").arg(pattern.as_str());
    }
    command.args(flags.iter().cloned())
}

/// Removes empty directories below `remote`, keeping `remote` itself.
pub fn remove_empty_dirs_command(remote: &str, flags: &[String]) -> ToolCommand {
    ToolCommand::new(RCLONE)
        .arg("rmdirs")
        .arg(remote)
        .arg("--leave-root")
        .args(flags.iter().cloned())
}
