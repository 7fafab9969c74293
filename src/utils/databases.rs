// Database name filtering shared by the MySQL and PostgreSQL adapters.
use regex::Regex;

/// MySQL schemas that are never dumped per-database. `mysql` itself is
/// captured separately for users and grants.
pub const MYSQL_SYSTEM_SCHEMAS: &[&str] =
    &["information_schema", "performance_schema", "sys", "mysql"];

/// The PostgreSQL maintenance database, skipped during enumeration.
pub const POSTGRES_ADMIN_DATABASE: &str = "postgres";

/// Keeps the names that are neither in `builtin` nor matched by `exclude`,
/// preserving enumeration order. Names are passed through untouched; only
/// empty ones are skipped.
pub fn filter_databases(
    names: Vec<String>,
    builtin: &[&str],
    exclude: Option<&Regex>,
) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| !name.is_empty())
        .filter(|name| !builtin.contains(&name.as_str()))
        .filter(|name| exclude.map_or(true, |re| !re.is_match(name)))
        .collect()
}
