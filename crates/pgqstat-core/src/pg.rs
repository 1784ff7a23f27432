//! PostgreSQL connection helpers.
//!
//! Connection parameters come from the standard libpq environment variables:
//! - PGHOST (default: localhost)
//! - PGPORT (default: 5432)
//! - PGUSER (default: $USER)
//! - PGPASSWORD (default: empty)
//! - PGDATABASE (default: same as PGUSER)

use postgres::{Client, NoTls};

/// Builds a key=value connection string from the libpq environment variables.
///
/// Returns `None` if neither PGUSER nor USER is set.
pub fn connection_string_from_env() -> Option<String> {
    let user = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .ok()?;

    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
    let password = std::env::var("PGPASSWORD").unwrap_or_default();
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

    Some(build_connection_string(&host, &port, &user, &password, &database))
}

fn build_connection_string(
    host: &str,
    port: &str,
    user: &str,
    password: &str,
    database: &str,
) -> String {
    if password.is_empty() {
        format!("host={} port={} user={} dbname={}", host, port, user, database)
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, database
        )
    }
}

/// Opens a plaintext connection.
pub fn connect(connection_string: &str) -> Result<Client, postgres::Error> {
    Client::connect(connection_string, NoTls)
}

/// Formats a PostgreSQL error for display.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
