// Fakes shared by the backup module tests.
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::{ConfigSource, RunConfig};
use crate::utils::command::{CommandError, CommandRunner, ToolCommand};

pub fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<RunConfig> {
    Ok(RunConfig::resolve(&ConfigSource::from_pairs(pairs.iter().copied()))?)
}

/// Records every command and writes a placeholder at the command's output
/// path so packaging has something to bundle.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolCommand>>,
    fail_on_database: Option<String>,
}

impl RecordingRunner {
    pub fn failing_on(database: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on_database: Some(database.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Databases named by per-database dump commands, in call order.
    pub fn dumped_databases(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| database_of(c).map(str::to_string))
            .collect()
    }
}

fn database_of(command: &ToolCommand) -> Option<&str> {
    command.flag_value("--databases").or_else(|| command.flag_value("--dbname"))
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &ToolCommand) -> Result<(), CommandError> {
        self.calls.lock().unwrap().push(command.clone());

        if let (Some(fail), Some(db)) = (&self.fail_on_database, database_of(command)) {
            if fail == db {
                return Err(CommandError::Failed {
                    program: command.program.clone(),
                    code: Some(2),
                    stderr: format!("dump of {} failed", db),
                });
            }
        }

        for flag in ["--result-file", "--file", "--rdb"] {
            if let Some(out) = command.flag_value(flag) {
                std::fs::write(Path::new(out), b"dump").map_err(|source| CommandError::Spawn {
                    program: command.program.clone(),
                    source,
                })?;
            }
        }
        if let Some(out) = command.flag_value("--out") {
            let dir = Path::new(out).join("admin");
            std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::write(dir.join("system.users.bson"), b"bson"))
                .map_err(|source| CommandError::Spawn {
                    program: command.program.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}
