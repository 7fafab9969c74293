// dbbackup/src/config/mod.rs
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::errors::{BackupError, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_OUTPUT_DIR: &str = "/backup/output";
pub const DEFAULT_ARCHIVE_PREFIX: &str = "backup";
pub const DEFAULT_RCLONE_FLAGS: &str = "--transfers 4 --checkers 8";

/// Environment variable naming an optional JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "BACKUP_CONFIG_FILE";

/// Every key read from the environment or the config file.
pub const CONFIG_KEYS: &[&str] = &[
    CONFIG_FILE_ENV,
    "DB_TYPE",
    "DB_HOST",
    "DB_PORT",
    "DB_USER",
    "DB_PASSWORD",
    "MONGO_URI",
    "STAGING_DIR",
    "OUTPUT_DIR",
    "ARCHIVE_PREFIX",
    "BACKUP_NAME",
    "COMPRESSION",
    "KEEP_LOCAL",
    "EXCLUDE_DATABASES",
    "RCLONE_REMOTE",
    "RCLONE_FLAGS",
    "S3_URL",
    "S3_FLAGS",
    "RETENTION_DAYS",
    "CONTINUE_ON_DUMP_ERROR",
];

// rclone filter metacharacters plus the path separator. A backup name must
// match literally inside the retention include patterns.
const BACKUP_NAME_RESERVED: &[char] = &['*', '?', '[', ']', '{', '}', '\\', '/'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Mysql,
    Postgres,
    Redis,
    Mongodb,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Mysql => "mysql",
            EngineKind::Postgres => "postgres",
            EngineKind::Redis => "redis",
            EngineKind::Mongodb => "mongodb",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            EngineKind::Mysql => 3306,
            EngineKind::Postgres => 5432,
            EngineKind::Redis => 6379,
            EngineKind::Mongodb => 27017,
        }
    }
}

impl FromStr for EngineKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(EngineKind::Mysql),
            "postgres" => Ok(EngineKind::Postgres),
            "redis" => Ok(EngineKind::Redis),
            "mongodb" => Ok(EngineKind::Mongodb),
            other => Err(BackupError::Config(format!(
                "DB_TYPE '{}' is not supported (expected one of mysql, postgres, redis, mongodb)",
                other
            ))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(******)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnection {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<Secret>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MongoConnection {
    /// A full connection string; supersedes host, user and password.
    Uri(Secret),
    Server(ServerConnection),
}

/// The database engine to back up, with the connection details it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engine {
    Mysql(ServerConnection),
    Postgres(ServerConnection),
    Mongodb(MongoConnection),
    Redis(ServerConnection),
}

impl Engine {
    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Mysql(_) => EngineKind::Mysql,
            Engine::Postgres(_) => EngineKind::Postgres,
            Engine::Mongodb(_) => EngineKind::Mongodb,
            Engine::Redis(_) => EngineKind::Redis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    #[default]
    Gzip,
    None,
}

impl FromStr for CompressionMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" => Ok(CompressionMode::Gzip),
            "none" => Ok(CompressionMode::None),
            other => Err(BackupError::Config(format!(
                "COMPRESSION '{}' is not supported (expected gzip or none)",
                other
            ))),
        }
    }
}

/// Bucket and key (or key prefix) parsed from an `s3://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub path: String,
}

impl S3Location {
    pub fn parse(s3_url: &str) -> Result<Self> {
        let uri = Url::parse(s3_url)
            .map_err(|e| BackupError::Config(format!("Invalid S3_URL '{}': {}", s3_url, e)))?;
        if uri.scheme() != "s3" {
            return Err(BackupError::Config(format!(
                "S3_URL must start with s3:// (got '{}')",
                s3_url
            )));
        }
        let bucket = uri
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                BackupError::Config(format!("S3_URL '{}' is missing a bucket name", s3_url))
            })?
            .to_string();
        Ok(Self {
            bucket,
            path: uri.path().trim_start_matches('/').to_string(),
        })
    }

    /// Object key for `file_name`. An empty path or one ending in `/` is a
    /// prefix; anything else is the exact key.
    pub fn object_key(&self, file_name: &str) -> String {
        if self.path.is_empty() || self.path.ends_with('/') {
            format!("{}{}", self.path, file_name)
        } else {
            self.path.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Rclone {
        remote: String,
        flags: Vec<String>,
    },
    S3 {
        url: String,
        location: S3Location,
        options: Vec<String>,
    },
}

impl UploadTarget {
    pub fn destination(&self) -> &str {
        match self {
            UploadTarget::Rclone { remote, .. } => remote,
            UploadTarget::S3 { url, .. } => url,
        }
    }
}

/// Settings for one backup run, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub engine: Engine,
    pub staging_root: PathBuf,
    pub output_dir: PathBuf,
    pub archive_prefix: String,
    pub name_override: Option<String>,
    pub compression: CompressionMode,
    pub keep_local: bool,
    pub exclude: Option<Regex>,
    pub upload: Option<UploadTarget>,
    pub retention_days: Option<u32>,
    pub continue_on_dump_error: bool,
}

impl RunConfig {
    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    /// Name used in the artifact file name and the retention pattern.
    pub fn artifact_name(&self) -> &str {
        self.name_override
            .as_deref()
            .unwrap_or_else(|| self.engine_kind().as_str())
    }

    pub fn resolve(source: &ConfigSource) -> Result<Self> {
        let kind: EngineKind = source
            .get("DB_TYPE")
            .ok_or_else(|| {
                BackupError::Config(
                    "DB_TYPE must be set to one of mysql, postgres, redis, mongodb".into(),
                )
            })?
            .parse()?;

        let server = ServerConnection {
            host: source.get("DB_HOST").unwrap_or(DEFAULT_HOST).to_string(),
            port: match source.get("DB_PORT") {
                Some(raw) => parse_port(raw)?,
                None => kind.default_port(),
            },
            user: source.get_owned("DB_USER"),
            password: source.get("DB_PASSWORD").map(Secret::new),
        };

        let engine = match kind {
            EngineKind::Mysql => Engine::Mysql(server),
            EngineKind::Postgres => Engine::Postgres(server),
            EngineKind::Redis => Engine::Redis(server),
            EngineKind::Mongodb => match source.get("MONGO_URI") {
                Some(uri) => Engine::Mongodb(MongoConnection::Uri(parse_mongo_uri(uri)?)),
                None => Engine::Mongodb(MongoConnection::Server(server)),
            },
        };

        let exclude = source
            .get("EXCLUDE_DATABASES")
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    BackupError::Config(format!("EXCLUDE_DATABASES is not a valid regex: {}", e))
                })
            })
            .transpose()?;

        let retention_days = source
            .get("RETENTION_DAYS")
            .map(|raw| match raw.parse::<u32>() {
                Ok(days) if days > 0 => Ok(days),
                _ => Err(BackupError::Config(format!(
                    "RETENTION_DAYS must be a positive integer (got '{}')",
                    raw
                ))),
            })
            .transpose()?;

        Ok(RunConfig {
            engine,
            staging_root: source
                .get("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            output_dir: PathBuf::from(source.get("OUTPUT_DIR").unwrap_or(DEFAULT_OUTPUT_DIR)),
            archive_prefix: source
                .get("ARCHIVE_PREFIX")
                .unwrap_or(DEFAULT_ARCHIVE_PREFIX)
                .to_string(),
            name_override: source
                .get("BACKUP_NAME")
                .map(parse_backup_name)
                .transpose()?,
            compression: source
                .get("COMPRESSION")
                .map(str::parse::<CompressionMode>)
                .transpose()?
                .unwrap_or_default(),
            keep_local: source.get_bool("KEEP_LOCAL", true)?,
            exclude,
            upload: resolve_upload_target(source)?,
            retention_days,
            continue_on_dump_error: source.get_bool("CONTINUE_ON_DUMP_ERROR", false)?,
        })
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(BackupError::Config(format!("DB_PORT '{}' is not a valid port", raw))),
    }
}

fn parse_backup_name(raw: &str) -> Result<String> {
    if raw.contains(BACKUP_NAME_RESERVED) || raw.chars().any(char::is_control) {
        return Err(BackupError::Config(format!(
            "BACKUP_NAME '{}' must not contain any of * ? [ ] {{ }} \\ / or control characters",
            raw
        )));
    }
    Ok(raw.to_string())
}

fn parse_mongo_uri(raw: &str) -> Result<Secret> {
    let uri = Url::parse(raw)
        .map_err(|e| BackupError::Config(format!("MONGO_URI is not a valid URI: {}", e)))?;
    if !matches!(uri.scheme(), "mongodb" | "mongodb+srv") {
        return Err(BackupError::Config(
            "MONGO_URI must use the mongodb:// or mongodb+srv:// scheme".into(),
        ));
    }
    Ok(Secret::new(raw))
}

/// The rclone remote wins when both destinations are configured.
fn resolve_upload_target(source: &ConfigSource) -> Result<Option<UploadTarget>> {
    let s3_url = source.get("S3_URL");
    if let Some(remote) = source.get("RCLONE_REMOTE") {
        if s3_url.is_some() {
            info!("Both RCLONE_REMOTE and S3_URL are set; uploading with rclone only");
        }
        let flags = source.get("RCLONE_FLAGS").unwrap_or(DEFAULT_RCLONE_FLAGS);
        return Ok(Some(UploadTarget::Rclone {
            remote: remote.to_string(),
            flags: split_flags(flags),
        }));
    }
    if let Some(url) = s3_url {
        return Ok(Some(UploadTarget::S3 {
            url: url.to_string(),
            location: S3Location::parse(url)?,
            options: source.get("S3_FLAGS").map(split_flags).unwrap_or_default(),
        }));
    }
    Ok(None)
}

fn split_flags(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(BackupError::Config(format!("{} must be true or false (got '{}')", key, raw))),
    }
}

// Values from a JSON config file may be strings, numbers or booleans.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawJsonValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
    Null(()),
}

/// Flat key/value view over the environment and an optional JSON file.
/// Keys are upper-cased. Empty or blank values are dropped, so they never
/// mask a value from a lower layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    values: HashMap<String, String>,
}

impl ConfigSource {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into().to_ascii_uppercase(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        Self { values }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_os_pairs(std::env::vars_os())
    }

    /// Skips pairs that are not valid UTF-8, unless the key is one this tool
    /// reads, in which case the value is rejected.
    pub fn from_os_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut valid = Vec::new();
        for (key, value) in pairs {
            let Ok(key) = key.into_string() else {
                continue;
            };
            match value.into_string() {
                Ok(value) => valid.push((key, value)),
                Err(_) if CONFIG_KEYS.contains(&key.to_ascii_uppercase().as_str()) => {
                    return Err(BackupError::Config(format!("{} is not valid UTF-8", key)));
                }
                Err(_) => {}
            }
        }
        Ok(Self::from_pairs(valid))
    }

    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        let raw: HashMap<String, RawJsonValue> =
            serde_json::from_str(content).context("Config file must be a flat JSON object")?;
        let pairs = raw.into_iter().filter_map(|(key, value)| {
            let value = match value {
                RawJsonValue::Text(s) => s,
                RawJsonValue::Number(n) => n.to_string(),
                RawJsonValue::Flag(b) => b.to_string(),
                RawJsonValue::Null(()) => return None,
            };
            Some((key, value))
        });
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Failed to parse JSON from config file at {}", path.display()))
    }

    /// Values in `other` replace values in `self`.
    pub fn overlay(mut self, other: ConfigSource) -> Self {
        self.values.extend(other.values);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn get_owned(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        self.get(key).map_or(Ok(default), |raw| parse_bool(key, raw))
    }
}

/// Builds the run configuration from an optional JSON file (command-line
/// path, then `BACKUP_CONFIG_FILE`) overlaid by the process environment.
pub fn load_run_config(config_path: Option<PathBuf>) -> Result<RunConfig> {
    let env = ConfigSource::from_env()?;
    let file_path = config_path.or_else(|| env.get(CONFIG_FILE_ENV).map(PathBuf::from));

    let source = match file_path {
        Some(path) => ConfigSource::from_json_file(&path)
            .map_err(|e| BackupError::Config(format!("{:#}", e)))?
            .overlay(env),
        None => env,
    };
    RunConfig::resolve(&source)
}
