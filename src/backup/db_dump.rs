// dbbackup/src/backup/db_dump.rs
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::{info, warn};

use crate::config::{Engine, EngineKind, MongoConnection, RunConfig, ServerConnection};
use crate::errors::{BackupError, Result};
use crate::utils::command::{CommandRunner, ToolCommand};
use crate::utils::databases::{MYSQL_SYSTEM_SCHEMAS, POSTGRES_ADMIN_DATABASE, filter_databases};

pub const DEFAULT_POSTGRES_USER: &str = "postgres";
pub const MYSQL_SYSTEM_DATABASE: &str = "mysql";
pub const POSTGRES_GLOBALS_FILE: &str = "globals.sql";
pub const REDIS_SNAPSHOT_FILE: &str = "dump.rdb";

// Same result as `SHOW DATABASES`; the cast keeps the column a text type.
const MYSQL_LIST_DATABASES: &str = "SELECT CAST(SCHEMA_NAME AS CHAR) AS name \
     FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME";

/// Lists the databases present on a MySQL or PostgreSQL server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    async fn list_databases(
        &self,
        kind: EngineKind,
        server: &ServerConnection,
    ) -> anyhow::Result<Vec<String>>;
}

/// Catalog backed by short-lived sqlx connections.
#[derive(Debug, Default)]
pub struct SqlxCatalog;

#[async_trait]
impl DatabaseCatalog for SqlxCatalog {
    async fn list_databases(
        &self,
        kind: EngineKind,
        server: &ServerConnection,
    ) -> anyhow::Result<Vec<String>> {
        match kind {
            EngineKind::Mysql => list_mysql_databases(server).await,
            EngineKind::Postgres => list_postgres_databases(server).await,
            other => anyhow::bail!("{} does not support database enumeration", other),
        }
    }
}

async fn list_mysql_databases(server: &ServerConnection) -> anyhow::Result<Vec<String>> {
    let mut options = MySqlConnectOptions::new().host(&server.host).port(server.port);
    if let Some(user) = &server.user {
        options = options.username(user);
    }
    if let Some(password) = &server.password {
        options = options.password(password.expose());
    }

    let mut conn = MySqlConnection::connect_with(&options.disable_statement_logging())
        .await
        .with_context(|| format!("Failed to connect to MySQL at {}:{}", server.host, server.port))?;
    let rows = sqlx::query(MYSQL_LIST_DATABASES)
        .fetch_all(&mut conn)
        .await
        .context("Failed to fetch database list from information_schema")?;
    let names = rows
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to read schema name from row")?;
    conn.close().await.ok();
    Ok(names)
}

async fn list_postgres_databases(server: &ServerConnection) -> anyhow::Result<Vec<String>> {
    let mut options = PgConnectOptions::new()
        .host(&server.host)
        .port(server.port)
        .username(server.user.as_deref().unwrap_or(DEFAULT_POSTGRES_USER))
        .database(POSTGRES_ADMIN_DATABASE);
    if let Some(password) = &server.password {
        options = options.password(password.expose());
    }

    let mut conn = PgConnection::connect_with(&options.disable_statement_logging())
        .await
        .with_context(|| {
            format!("Failed to connect to PostgreSQL at {}:{}", server.host, server.port)
        })?;
    let names = sqlx::query_scalar::<_, String>(
        "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
    )
    .fetch_all(&mut conn)
    .await
    .context("Failed to fetch database list from pg_database")?;
    conn.close().await.ok();
    Ok(names)
}

/// What a dump produced. `failed` is only populated when per-database
/// failures are tolerated.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DumpReport {
    pub files: Vec<PathBuf>,
    pub failed: Vec<String>,
}

/// Dumps the configured engine into `<staging>/<engine>/`.
pub async fn dump_databases(
    config: &RunConfig,
    catalog: &dyn DatabaseCatalog,
    runner: &dyn CommandRunner,
    staging_dir: &Path,
) -> Result<DumpReport> {
    let kind = config.engine_kind();
    let engine_dir = staging_dir.join(kind.as_str());
    tokio::fs::create_dir_all(&engine_dir).await?;
    info!(engine = %kind, dir = %engine_dir.display(), "Starting database dump");

    let report = match &config.engine {
        Engine::Mysql(server) => {
            dump_mysql(config, server, catalog, runner, &engine_dir).await?
        }
        Engine::Postgres(server) => {
            dump_postgres(config, server, catalog, runner, &engine_dir).await?
        }
        Engine::Mongodb(connection) => {
            let command = mongodump_command(connection, &engine_dir);
            run_dump(runner, "mongodb (all databases)", &command).await?;
            DumpReport {
                files: vec![engine_dir.clone()],
                failed: Vec::new(),
            }
        }
        Engine::Redis(server) => {
            let out = engine_dir.join(REDIS_SNAPSHOT_FILE);
            run_dump(runner, "redis snapshot", &redis_snapshot_command(server, &out)).await?;
            DumpReport {
                files: vec![out],
                failed: Vec::new(),
            }
        }
    };

    info!(engine = %kind, files = report.files.len(), "Database dump finished");
    Ok(report)
}

async fn dump_mysql(
    config: &RunConfig,
    server: &ServerConnection,
    catalog: &dyn DatabaseCatalog,
    runner: &dyn CommandRunner,
    engine_dir: &Path,
) -> Result<DumpReport> {
    let found = catalog
        .list_databases(EngineKind::Mysql, server)
        .await
        .map_err(|source| BackupError::Enumeration {
            engine: EngineKind::Mysql,
            source,
        })?;
    let databases = filter_databases(found, MYSQL_SYSTEM_SCHEMAS, config.exclude.as_ref());
    if databases.is_empty() {
        warn!("No MySQL databases left to dump after filtering");
    } else {
        info!("MySQL databases to back up: {:?}", databases);
    }

    let mut report = DumpReport::default();
    dump_each(runner, &databases, config.continue_on_dump_error, &mut report, |db| {
        let out = engine_dir.join(format!("{}.sql", db));
        (mysqldump_command(server, db, &out), out)
    })
    .await?;

    // Users and grants live in the `mysql` schema; it is always captured.
    let system = [MYSQL_SYSTEM_DATABASE.to_string()];
    dump_each(runner, &system, config.continue_on_dump_error, &mut report, |db| {
        let out = engine_dir.join(format!("{}.sql", db));
        (mysqldump_command(server, db, &out), out)
    })
    .await?;

    Ok(report)
}

async fn dump_postgres(
    config: &RunConfig,
    server: &ServerConnection,
    catalog: &dyn DatabaseCatalog,
    runner: &dyn CommandRunner,
    engine_dir: &Path,
) -> Result<DumpReport> {
    let mut report = DumpReport::default();

    let globals = engine_dir.join(POSTGRES_GLOBALS_FILE);
    run_dump(runner, "postgres globals", &pg_dumpall_globals_command(server, &globals)).await?;
    report.files.push(globals);

    let found = catalog
        .list_databases(EngineKind::Postgres, server)
        .await
        .map_err(|source| BackupError::Enumeration {
            engine: EngineKind::Postgres,
            source,
        })?;
    let databases = filter_databases(found, &[POSTGRES_ADMIN_DATABASE], config.exclude.as_ref());
    if databases.is_empty() {
        warn!("No PostgreSQL databases left to dump after filtering");
    } else {
        info!("PostgreSQL databases to back up: {:?}", databases);
    }

    dump_each(runner, &databases, config.continue_on_dump_error, &mut report, |db| {
        let out = engine_dir.join(format!("{}.dump", db));
        (pg_dump_command(server, db, &out), out)
    })
    .await?;

    Ok(report)
}

/// Runs one dump per database. Stops at the first failure unless
/// `continue_on_error` is set, in which case failures are collected.
async fn dump_each<F>(
    runner: &dyn CommandRunner,
    databases: &[String],
    continue_on_error: bool,
    report: &mut DumpReport,
    build: F,
) -> Result<()>
where
    F: Fn(&str) -> (ToolCommand, PathBuf),
{
    for db in databases {
        let (command, out) = build(db.as_str());
        match run_dump(runner, db, &command).await {
            Ok(()) => report.files.push(out),
            Err(e) if continue_on_error => {
                warn!("Continuing after failed dump of {}: {}", db, e);
                report.failed.push(db.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn run_dump(runner: &dyn CommandRunner, target: &str, command: &ToolCommand) -> Result<()> {
    info!("Dumping {} with {}", target, command.program);
    runner.run(command).await.map_err(|e| BackupError::Dump {
        target: target.to_string(),
        source: e.into(),
    })?;
    info!("✓ Dumped {}", target);
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Consistent, routine/trigger/event-inclusive, binary-safe dump of one
/// database. The password travels in `MYSQL_PWD`.
pub fn mysqldump_command(server: &ServerConnection, database: &str, out: &Path) -> ToolCommand {
    let mut command = ToolCommand::new("mysqldump")
        .args(["--host", &server.host, "--port", &server.port.to_string()]);
    if let Some(user) = &server.user {
        command = command.args(["--user", user]);
    }
    command = command
        .args([
            "--single-transaction",
            "--routines",
            "--triggers",
            "--events",
            "--hex-blob",
            "--databases",
            database,
            "--result-file",
        ])
        .arg(path_arg(out));
    if let Some(password) = &server.password {
        command = command.env("MYSQL_PWD", password.expose());
    }
    command
}

fn postgres_connection_args(command: ToolCommand, server: &ServerConnection) -> ToolCommand {
    let command = command
        .args(["--host", &server.host, "--port", &server.port.to_string()])
        .args(["--username", server.user.as_deref().unwrap_or(DEFAULT_POSTGRES_USER)])
        .arg("--no-password");
    match &server.password {
        Some(password) => command.env("PGPASSWORD", password.expose()),
        None => command,
    }
}

pub fn pg_dumpall_globals_command(server: &ServerConnection, out: &Path) -> ToolCommand {
    postgres_connection_args(ToolCommand::new("pg_dumpall"), server)
        .args(["--globals-only", "--file"])
        .arg(path_arg(out))
}

/// Custom-format dump, restorable with `pg_restore`.
pub fn pg_dump_command(server: &ServerConnection, database: &str, out: &Path) -> ToolCommand {
    postgres_connection_args(ToolCommand::new("pg_dump"), server)
        .args(["--format=custom", "--file"])
        .arg(path_arg(out))
        .args(["--dbname", database])
}

pub fn mongodump_command(connection: &MongoConnection, out_dir: &Path) -> ToolCommand {
    let command = ToolCommand::new("mongodump");
    let command = match connection {
        MongoConnection::Uri(uri) => command.arg("--uri").secret_arg(uri.expose()),
        MongoConnection::Server(server) => {
            let mut command =
                command.args(["--host", &server.host, "--port", &server.port.to_string()]);
            if let Some(user) = &server.user {
                command = command.args(["--username", user, "--authenticationDatabase", "admin"]);
            }
            if let Some(password) = &server.password {
                command = command.arg("--password").secret_arg(password.expose());
            }
            command
        }
    };
    command.arg("--out").arg(path_arg(out_dir))
}

/// Point-in-time RDB snapshot transferred from the live server.
pub fn redis_snapshot_command(server: &ServerConnection, out: &Path) -> ToolCommand {
    let mut command = ToolCommand::new("redis-cli").args([
        "-h",
        &server.host,
        "-p",
        &server.port.to_string(),
    ]);
    if let Some(user) = &server.user {
        command = command.args(["--user", user]);
    }
    if let Some(password) = &server.password {
        command = command.arg("-a").secret_arg(password.expose()).arg("--no-auth-warning");
    }
    command.arg("--rdb").arg(path_arg(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_support::{RecordingRunner, config_from};
    use crate::config::Secret;
    use mockall::predicate::eq;
    use tempfile::tempdir;

    fn server(password: Option<&str>) -> ServerConnection {
        ServerConnection {
            host: "db.internal".into(),
            port: 3306,
            user: Some("backup".into()),
            password: password.map(Secret::new),
        }
    }

    fn catalog_returning(kind: EngineKind, names: &[&str]) -> MockDatabaseCatalog {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut catalog = MockDatabaseCatalog::new();
        catalog
            .expect_list_databases()
            .with(eq(kind), mockall::predicate::always())
            .times(1)
            .returning(move |_, _| Ok(names.clone()));
        catalog
    }

    fn file_names(report: &DumpReport) -> Vec<String> {
        report
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_mysqldump_keeps_password_out_of_arguments() {
        let cmd =
            mysqldump_command(&server(Some("s3cret")), "shop", Path::new("/stage/mysql/shop.sql"));

        assert!(!cmd.arg_values().contains(&"s3cret"));
        assert_eq!(cmd.envs, vec![("MYSQL_PWD".to_string(), "s3cret".to_string())]);
        for flag in ["--single-transaction", "--routines", "--triggers", "--events", "--hex-blob"] {
            assert!(cmd.has_arg(flag), "missing {}", flag);
        }
        assert_eq!(cmd.flag_value("--databases"), Some("shop"));
        assert_eq!(cmd.flag_value("--result-file"), Some("/stage/mysql/shop.sql"));
    }

    #[test]
    fn test_pg_commands_use_default_superuser_and_env_password() {
        let conn = ServerConnection {
            host: "pg".into(),
            port: 5432,
            user: None,
            password: Some(Secret::new("pw")),
        };
        let globals = pg_dumpall_globals_command(&conn, Path::new("/s/globals.sql"));
        assert_eq!(globals.flag_value("--username"), Some("postgres"));
        assert!(globals.has_arg("--globals-only"));
        assert_eq!(globals.envs, vec![("PGPASSWORD".to_string(), "pw".to_string())]);

        let dump = pg_dump_command(&conn, "orders", Path::new("/s/orders.dump"));
        assert!(dump.has_arg("--format=custom"));
        assert_eq!(dump.flag_value("--dbname"), Some("orders"));
        assert!(!dump.arg_values().contains(&"pw"));
    }

    #[test]
    fn test_mongodump_uri_supersedes_server_arguments() {
        let uri = MongoConnection::Uri(Secret::new("mongodb://u:p@mongo/"));
        let cmd = mongodump_command(&uri, Path::new("/s/mongodb"));
        assert!(!cmd.has_arg("--host"));
        assert_eq!(cmd.to_string(), "mongodump --uri ****** --out /s/mongodb");

        let params = MongoConnection::Server(server(Some("p")));
        let cmd = mongodump_command(&params, Path::new("/s/mongodb"));
        assert_eq!(cmd.flag_value("--username"), Some("backup"));
        assert_eq!(cmd.flag_value("--authenticationDatabase"), Some("admin"));
        assert!(cmd.args.iter().any(|a| a.secret && a.value == "p"));
    }

    #[test]
    fn test_redis_snapshot_command() {
        let anonymous = ServerConnection {
            host: "cache".into(),
            port: 6379,
            user: None,
            password: None,
        };
        let cmd = redis_snapshot_command(&anonymous, Path::new("/s/redis/dump.rdb"));
        assert_eq!(cmd.to_string(), "redis-cli -h cache -p 6379 --rdb /s/redis/dump.rdb");

        let mut secured = anonymous.clone();
        secured.password = Some(Secret::new("pw"));
        let cmd = redis_snapshot_command(&secured, Path::new("/s/redis/dump.rdb"));
        assert_eq!(cmd.flag_value("-a"), Some("pw"));
        assert!(cmd.has_arg("--no-auth-warning"));
    }

    #[tokio::test]
    async fn test_mysql_exclusion_leaves_one_database_plus_system_dump() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[
            ("DB_TYPE", "mysql"),
            ("EXCLUDE_DATABASES", "^(legacy|archive_.*)$"),
        ])?;
        let catalog = catalog_returning(
            EngineKind::Mysql,
            &[
                "archive_2019",
                "information_schema",
                "legacy",
                "mysql",
                "performance_schema",
                "shop",
                "sys",
            ],
        );
        let runner = RecordingRunner::default();

        let report = dump_databases(&config, &catalog, &runner, staging.path()).await?;

        assert_eq!(file_names(&report), vec!["shop.sql", "mysql.sql"]);
        assert!(staging.path().join("mysql/shop.sql").is_file());
        assert!(staging.path().join("mysql/mysql.sql").is_file());
        assert_eq!(runner.dumped_databases(), vec!["shop", "mysql"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_mysql_system_dump_survives_pattern_matching_mysql() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[("DB_TYPE", "mysql"), ("EXCLUDE_DATABASES", ".*")])?;
        let catalog = catalog_returning(EngineKind::Mysql, &["mysql", "shop"]);
        let runner = RecordingRunner::default();

        let report = dump_databases(&config, &catalog, &runner, staging.path()).await?;

        assert_eq!(file_names(&report), vec!["mysql.sql"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_fatal() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[("DB_TYPE", "mysql")])?;
        let mut catalog = MockDatabaseCatalog::new();
        catalog
            .expect_list_databases()
            .returning(|_, _| Err(anyhow::anyhow!("Access denied for user")));
        let runner = RecordingRunner::default();

        let err = dump_databases(&config, &catalog, &runner, staging.path()).await.unwrap_err();

        assert!(matches!(err, BackupError::Enumeration { engine: EngineKind::Mysql, .. }));
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_postgres_dumps_globals_then_each_database() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[("DB_TYPE", "postgres"), ("EXCLUDE_DATABASES", "^scratch")])?;
        let catalog =
            catalog_returning(EngineKind::Postgres, &["billing", "postgres", "scratch_1", "users"]);
        let runner = RecordingRunner::default();

        let report = dump_databases(&config, &catalog, &runner, staging.path()).await?;

        assert_eq!(file_names(&report), vec!["globals.sql", "billing.dump", "users.dump"]);
        let programs: Vec<String> = runner.calls().into_iter().map(|c| c.program).collect();
        assert_eq!(programs, vec!["pg_dumpall", "pg_dump", "pg_dump"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_postgres_zero_databases_is_not_an_error() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[("DB_TYPE", "postgres")])?;
        let catalog = catalog_returning(EngineKind::Postgres, &["postgres"]);
        let runner = RecordingRunner::default();

        let report = dump_databases(&config, &catalog, &runner, staging.path()).await?;

        assert_eq!(file_names(&report), vec!["globals.sql"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_first_failed_database_aborts_the_loop() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[("DB_TYPE", "postgres")])?;
        let catalog = catalog_returning(EngineKind::Postgres, &["a", "b", "c"]);
        let runner = RecordingRunner::failing_on("b");

        let err = dump_databases(&config, &catalog, &runner, staging.path()).await.unwrap_err();

        match err {
            BackupError::Dump { target, .. } => assert_eq!(target, "b"),
            other => panic!("expected dump error, got {:?}", other),
        }
        assert_eq!(runner.dumped_databases(), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_continue_on_dump_error_collects_failures() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let config = config_from(&[("DB_TYPE", "postgres"), ("CONTINUE_ON_DUMP_ERROR", "true")])?;
        let catalog = catalog_returning(EngineKind::Postgres, &["a", "b", "c"]);
        let runner = RecordingRunner::failing_on("b");

        let report = dump_databases(&config, &catalog, &runner, staging.path()).await?;

        assert_eq!(file_names(&report), vec!["globals.sql", "a.dump", "c.dump"]);
        assert_eq!(report.failed, vec!["b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_mongodb_and_redis_skip_enumeration() -> anyhow::Result<()> {
        for (kind, expected) in [("mongodb", "mongodump"), ("redis", "redis-cli")] {
            let staging = tempdir()?;
            let config = config_from(&[("DB_TYPE", kind)])?;
            let catalog = MockDatabaseCatalog::new();
            let runner = RecordingRunner::default();

            let report = dump_databases(&config, &catalog, &runner, staging.path()).await?;

            assert_eq!(report.files.len(), 1);
            let calls = runner.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].program, expected);
        }
        Ok(())
    }
}
