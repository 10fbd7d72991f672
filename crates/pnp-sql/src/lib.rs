//! All Postgres access for the pipeline, one module per table. Callers hand
//! in a pool for reads and a `Transaction` for anything that mutates, so
//! multi-row writes commit atomically.

pub mod notifications;
pub mod subscriptions;
pub mod watches;

use clap::Args;

pub use notifications::NotificationRow;
pub use subscriptions::SubscriptionRow;
pub use watches::WatchRow;

/// Database connection settings, taken from the environment. Flattened into
/// each service's CLI.
#[derive(Debug, Clone, Args)]
pub struct PgArgs {
    #[arg(long = "pg-host", env = "PG_HOST", default_value = "127.0.0.1")]
    pub host: String,
    // Explicit id: the service CLIs carry their own `port` argument.
    #[arg(id = "pg-port", long = "pg-port", env = "PG_PORT", default_value = "5432")]
    pub port: u16,
    #[arg(long = "pg-db", env = "PG_DB", default_value = "pnp")]
    pub database: String,
    #[arg(long = "pg-db-user", env = "PG_DB_USER", default_value = "pnp")]
    pub user: String,
    #[arg(long = "pg-db-pass", env = "PG_DB_PASS", hide_env_values = true, default_value = "")]
    pub password: String,
    /// One of disable, prefer, require, verify-ca, verify-full.
    #[arg(long = "pg-sslmode", env = "PG_SSLMODE", default_value = "prefer")]
    pub sslmode: String,
    /// Path to the CA certificate; implies full verification.
    #[arg(long = "pg-sslrootcert", env = "PG_SSLROOTCERTFILEPATH")]
    pub ssl_root_cert: Option<String>,
    /// Cap on open connections in the shared pool.
    #[arg(long = "db-max-open-conns", env = "DB_MAX_OPEN_CONNS", default_value = "10")]
    pub max_connections: u32,
}

impl PgArgs {
    /// Build and connect the shared pool, with TLS semantics matching the
    /// configuration: a provided root certificate requires full
    /// verification, otherwise the configured (or preferred) mode is used.
    pub async fn connect(&self, application_name: &str) -> anyhow::Result<sqlx::PgPool> {
        use anyhow::Context;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .application_name(application_name);

        if let Some(ca) = &self.ssl_root_cert {
            options = options.ssl_mode(PgSslMode::VerifyFull).ssl_root_cert(ca);
        } else {
            let mode = self
                .sslmode
                .parse::<PgSslMode>()
                .with_context(|| format!("parsing PG_SSLMODE '{}'", self.sslmode))?;
            options = options.ssl_mode(mode);
        }

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await
            .context("connecting to database")
    }
}

/// Whether a database error is worth a bounded retry: connection trouble
/// and serialization failures are; constraint violations are not.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => {
            // 40001 serialization_failure, 40P01 deadlock_detected,
            // 57P03 cannot_connect_now.
            matches!(db.code().as_deref(), Some("40001" | "40P01" | "57P03"))
        }
        _ => false,
    }
}
