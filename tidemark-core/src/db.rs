//! Database connection, TLS support, and transaction/savepoint primitives.

use std::sync::Arc;
use std::time::Duration;

use tokio_postgres::{Client, SimpleQueryMessage};

use crate::config::SslMode;
use crate::error::{reason_of, Result, TidemarkError};

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate that a SQL identifier contains only `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TidemarkError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TidemarkError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Build a rustls ClientConfig using the Mozilla CA bundle and the ring provider.
fn make_rustls_config() -> std::result::Result<rustls::ClientConfig, rustls::Error> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

/// Authentication failures are permanent and never retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

fn tls_connector() -> Result<tokio_postgres_rustls::MakeRustlsConnect> {
    let config = make_rustls_config()
        .map_err(|e| TidemarkError::ConfigError(format!("Failed to build TLS config: {}", e)))?;
    Ok(tokio_postgres_rustls::MakeRustlsConnect::new(config))
}

/// Connect over `tls` and drive the connection on a background task.
async fn connect_with<T>(conn_string: &str, tls: T) -> Result<Client>
where
    T: tokio_postgres::tls::MakeTlsConnect<tokio_postgres::Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = tokio_postgres::connect(conn_string, tls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "Database connection error");
        }
    });
    Ok(client)
}

async fn connect_once(conn_string: &str, ssl_mode: &SslMode) -> Result<Client> {
    match ssl_mode {
        SslMode::Disable => connect_with(conn_string, tokio_postgres::NoTls).await,
        SslMode::Require => connect_with(conn_string, tls_connector()?).await,
        SslMode::Prefer => {
            if let Ok(tls) = tls_connector() {
                match connect_with(conn_string, tls).await {
                    Ok(client) => return Ok(client),
                    Err(e) => tracing::debug!(error = %e, "TLS connection failed, falling back to plaintext"),
                }
            }
            connect_with(conn_string, tokio_postgres::NoTls).await
        }
    }
}

async fn connect_bounded(conn_string: &str, ssl_mode: &SslMode, timeout_secs: u32) -> Result<Client> {
    if timeout_secs == 0 {
        return connect_once(conn_string, ssl_mode).await;
    }
    tokio::time::timeout(
        Duration::from_secs(timeout_secs as u64),
        connect_once(conn_string, ssl_mode),
    )
    .await
    .unwrap_or_else(|_| {
        Err(TidemarkError::DatabaseError(
            tokio_postgres::Error::__private_api_timeout(),
        ))
    })
}

/// Backoff before retry `attempt` (1-based): `min(2^attempt, 30)s` plus up to 1s of jitter.
fn retry_delay(attempt: u32) -> Duration {
    let base_secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(30);
    Duration::from_secs(base_secs) + Duration::from_millis(fastrand::u64(0..1000))
}

/// Connect with the default TLS mode, no retries and a 30s timeout.
pub async fn connect(conn_string: &str) -> Result<Client> {
    connect_with_config(conn_string, &SslMode::Prefer, 0, 30, 0).await
}

/// Connect to the database, retrying up to `retries` times with exponential backoff.
///
/// Authentication failures are returned immediately.
pub async fn connect_with_config(
    conn_string: &str,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
    statement_timeout_secs: u32,
) -> Result<Client> {
    let mut attempt = 0;
    let client = loop {
        match connect_bounded(conn_string, ssl_mode, connect_timeout_secs).await {
            Ok(client) => break client,
            Err(TidemarkError::DatabaseError(e)) if is_permanent_error(&e) => {
                tracing::error!(error = %e, "Permanent connection error, not retrying");
                return Err(TidemarkError::DatabaseError(e));
            }
            Err(e) if attempt >= retries => return Err(e),
            Err(e) => {
                attempt += 1;
                let delay = retry_delay(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason_of(&e),
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    if attempt > 0 {
        tracing::info!(attempts = attempt + 1, "Connected after retry");
    }
    if statement_timeout_secs > 0 {
        client
            .batch_execute(&format!("SET statement_timeout = '{}s'", statement_timeout_secs))
            .await?;
    }
    Ok(client)
}

pub async fn begin(client: &Client) -> Result<()> {
    client.batch_execute("BEGIN").await?;
    Ok(())
}

pub async fn commit(client: &Client) -> Result<()> {
    client.batch_execute("COMMIT").await?;
    Ok(())
}

/// Roll back the open transaction, logging instead of failing.
pub async fn rollback_quietly(client: &Client) {
    if let Err(e) = client.batch_execute("ROLLBACK").await {
        tracing::warn!(error = %e, "Failed to rollback transaction");
    }
}

/// Savepoint name for a migration version. Quoted, so any version text is safe.
pub fn savepoint_name(version: &str) -> String {
    quote_ident(&format!("migration_{}", version))
}

pub async fn savepoint(client: &Client, name: &str) -> Result<()> {
    client.batch_execute(&format!("SAVEPOINT {}", name)).await?;
    Ok(())
}

pub async fn release_savepoint(client: &Client, name: &str) -> Result<()> {
    client
        .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
        .await?;
    Ok(())
}

pub async fn rollback_to_savepoint(client: &Client, name: &str) -> Result<()> {
    client
        .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
        .await?;
    Ok(())
}

/// Run a SQL batch and return the total number of rows reported by the server.
pub async fn execute_counting(client: &Client, sql: &str) -> Result<u64> {
    let messages = client.simple_query(sql).await?;
    Ok(messages
        .iter()
        .map(|m| match m {
            SimpleQueryMessage::CommandComplete(rows) => *rows,
            _ => 0,
        })
        .sum())
}
