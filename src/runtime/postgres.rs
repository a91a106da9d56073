use super::{run_command, DatastoreClient, Result, RuntimeError};
use crate::backup::DatastoreKind;
use crate::config::DatastoreConfig;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgreSQL client: `pg_dump`/`pg_restore`/`psql` for bulk work, sqlx for
/// pings and database recreation.
#[derive(Debug, Clone)]
pub struct PostgresClient {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
}

impl PostgresClient {
    pub fn new(config: &DatastoreConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.name.clone(),
        }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(database)
            .disable_statement_logging()
    }

    async fn connect(&self, database: &str) -> Result<PgConnection> {
        let options = self.connect_options(database);
        match tokio::time::timeout(CONNECT_TIMEOUT, PgConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(RuntimeError::Unreachable {
                target: format!("postgres://{}:{}/{}", self.host, self.port, database),
                message: e.to_string(),
            }),
            Err(_) => Err(RuntimeError::Unreachable {
                target: format!("postgres://{}:{}/{}", self.host, self.port, database),
                message: format!("no response within {}s", CONNECT_TIMEOUT.as_secs()),
            }),
        }
    }

    /// Base command with connection flags; the password travels in the
    /// environment, never on the command line.
    fn tool(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("PGPASSWORD", &self.password)
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--username")
            .arg(&self.user);
        cmd
    }

    async fn recreate_database(&self) -> Result<()> {
        let mut admin = self.connect("postgres").await?;
        let ident = quote_ident(&self.database);

        warn!("Dropping and recreating database {}", self.database);

        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(&self.database)
        .execute(&mut admin)
        .await?;

        sqlx::query(&format!("DROP DATABASE IF EXISTS {ident}"))
            .execute(&mut admin)
            .await?;
        sqlx::query(&format!("CREATE DATABASE {ident}"))
            .execute(&mut admin)
            .await?;

        admin.close().await?;
        info!("Database {} recreated", self.database);
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Entries of `pg_restore --list` output, without comment lines.
fn parse_toc(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .map(str::to_string)
        .collect()
}

/// Public-schema table names declared by `pg_restore --list` entries such as
/// `215; 1259 16390 TABLE public orders printhub`.
fn toc_tables(toc: &[String]) -> Vec<String> {
    toc.iter()
        .filter_map(|entry| {
            let fields: Vec<&str> = entry.split_whitespace().collect();
            match fields.as_slice() {
                [_, _, _, "TABLE", "public", name, ..] => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Tables the dump declared that the restored database lacks.
fn missing_tables(expected: &[String], restored: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|table| !restored.contains(table))
        .cloned()
        .collect()
}

#[async_trait]
impl DatastoreClient for PostgresClient {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::Relational
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connect(&self.database).await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    async fn dump_native(&self, dest: &Path) -> Result<()> {
        debug!("Executing pg_dump (custom format) to {}", dest.display());
        let mut cmd = self.tool("pg_dump");
        cmd.arg("--format=custom")
            .arg("--compress=9")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--dbname")
            .arg(&self.database)
            .arg("--file")
            .arg(dest);
        run_command(&mut cmd, "pg_dump --format=custom").await?;
        Ok(())
    }

    async fn dump_portable(&self, dest: &Path) -> Result<()> {
        debug!("Executing pg_dump (plain format) to {}", dest.display());
        let mut cmd = self.tool("pg_dump");
        cmd.arg("--format=plain")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--dbname")
            .arg(&self.database)
            .arg("--file")
            .arg(dest);
        run_command(&mut cmd, "pg_dump --format=plain").await?;
        Ok(())
    }

    async fn list_native(&self, dump: &Path) -> Result<Vec<String>> {
        let mut cmd = Command::new("pg_restore");
        cmd.arg("--list").arg(dump);
        let output = run_command(&mut cmd, "pg_restore --list").await?;
        Ok(parse_toc(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn restore_native(&self, dump: &Path) -> Result<()> {
        let mut cmd = self.tool("pg_restore");
        cmd.arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--dbname")
            .arg(&self.database)
            .arg(dump);
        run_command(&mut cmd, "pg_restore").await?;
        Ok(())
    }

    async fn restore_portable(&self, source: &Path) -> Result<()> {
        self.recreate_database().await?;

        let mut cmd = self.tool("psql");
        cmd.arg("--quiet")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--dbname")
            .arg(&self.database)
            .arg("--file")
            .arg(source);
        run_command(&mut cmd, "psql --file").await?;
        Ok(())
    }

    async fn check_consistency(&self, toc: &[String]) -> Result<()> {
        let mut conn = self.connect(&self.database).await?;
        let restored: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        debug!("Restored database exposes {} public tables", restored.len());
        let missing = missing_tables(&toc_tables(toc), &restored);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Inconsistent(format!(
                "tables listed in the dump are missing: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("printhub"), "\"printhub\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_parse_toc_skips_comments() {
        let listing = ";\n; Archive created at 2024-05-01\n;\n\
                       215; 1259 16390 TABLE public orders printhub\n\
                       216; 1259 16398 TABLE public colors printhub\n\n";
        let toc = parse_toc(listing);
        assert_eq!(toc.len(), 2);
        assert!(toc[0].contains("orders"));
    }

    #[test]
    fn test_toc_tables_ignore_data_and_other_schemas() {
        let toc: Vec<String> = [
            "215; 1259 16390 TABLE public orders printhub",
            "216; 1259 16398 TABLE public colors printhub",
            "3301; 0 16390 TABLE DATA public orders printhub",
            "217; 1259 16410 TABLE audit events printhub",
            "218; 1259 16420 SEQUENCE public orders_id_seq printhub",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(toc_tables(&toc), ["orders", "colors"]);
    }

    #[test]
    fn test_missing_tables_after_restore() {
        let expected = vec!["orders".to_string(), "colors".to_string()];

        // An empty restore of a non-empty dump is inconsistent
        assert_eq!(missing_tables(&expected, &[]), expected);
        assert_eq!(
            missing_tables(&expected, &["colors".to_string()]),
            ["orders"]
        );
        assert!(missing_tables(&expected, &expected).is_empty());
        // Nothing to compare against without a table of contents
        assert!(missing_tables(&[], &[]).is_empty());
    }
}
