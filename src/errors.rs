use std::fmt;

use thiserror::Error;

use crate::config::EngineKind;
use crate::utils::command::CommandError;

/// Exit code reserved for invalid or missing configuration.
pub const CONFIG_EXIT_CODE: u8 = 2;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to enumerate {engine} databases: {source:#}")]
    Enumeration {
        engine: EngineKind,
        source: anyhow::Error,
    },

    #[error("Dump of {target} failed: {source:#}")]
    Dump {
        target: String,
        source: anyhow::Error,
    },

    #[error("Dump failed for {} database(s): {}", .failed.len(), .failed.join(", "))]
    PartialDump { failed: Vec<String> },

    #[error("Packaging failed: {0:#}")]
    Packaging(anyhow::Error),

    #[error("Upload to {destination} failed: {source:#}")]
    Transport {
        destination: String,
        source: anyhow::Error,
    },

    #[error("Interrupted by {0}")]
    Interrupted(ShutdownSignal),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Process exit code for this failure. External tool exit codes are
    /// propagated unchanged when they fit in a process status.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) => CONFIG_EXIT_CODE,
            BackupError::Interrupted(signal) => 128 + signal.number(),
            BackupError::Enumeration { source, .. }
            | BackupError::Dump { source, .. }
            | BackupError::Transport { source, .. }
            | BackupError::Packaging(source) => tool_exit_code(source).unwrap_or(1),
            BackupError::PartialDump { .. } | BackupError::Io(_) => 1,
        }
    }
}

fn tool_exit_code(err: &anyhow::Error) -> Option<u8> {
    err.chain()
        .find_map(|cause| match cause.downcast_ref::<CommandError>() {
            Some(CommandError::Failed { code: Some(code), .. }) => Some(*code),
            _ => None,
        })
        .map(|code| u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1))
}

/// External termination requests the run controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Hangup,
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn number(self) -> u8 {
        match self {
            ShutdownSignal::Hangup => 1,
            ShutdownSignal::Interrupt => 2,
            ShutdownSignal::Terminate => 15,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(code: Option<i32>) -> anyhow::Error {
        anyhow::Error::new(CommandError::Failed {
            program: "mysqldump".to_string(),
            code,
            stderr: "access denied".to_string(),
        })
    }

    #[test]
    fn test_config_error_exits_with_two() {
        assert_eq!(BackupError::Config("DB_TYPE is not set".into()).exit_code(), 2);
    }

    #[test]
    fn test_tool_exit_code_is_propagated_through_context() {
        let err = BackupError::Dump {
            target: "shop".into(),
            source: failed(Some(7)).context("mysqldump for shop"),
        };
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_tool_exit_code_out_of_range_or_missing_falls_back_to_one() {
        let killed = BackupError::Transport {
            destination: "remote:backups".into(),
            source: failed(None),
        };
        assert_eq!(killed.exit_code(), 1);

        let huge = BackupError::Dump {
            target: "shop".into(),
            source: failed(Some(300)),
        };
        assert_eq!(huge.exit_code(), 1);
    }

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(BackupError::Interrupted(ShutdownSignal::Interrupt).exit_code(), 130);
        assert_eq!(BackupError::Interrupted(ShutdownSignal::Terminate).exit_code(), 143);
        assert_eq!(BackupError::Interrupted(ShutdownSignal::Hangup).exit_code(), 129);
    }

    #[test]
    fn test_partial_dump_lists_failed_databases() {
        let err = BackupError::PartialDump {
            failed: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Dump failed for 2 database(s): a, b");
        assert_eq!(err.exit_code(), 1);
    }
}
