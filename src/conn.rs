//! Connection pool to the source Postgres database.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use sqlx::{
    Pool, Postgres,
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
};
use tracing::{instrument, warn};

use crate::config::{ConfigError, PostgresConnectionDetails};

/// Errors that can occur when connecting to the source DB.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Error connecting to the DB.
    #[error("Error connecting to db: {0}")]
    ConnectionError(#[source] sqlx::Error),

    /// Connection details failed validation.
    #[error(transparent)]
    InvalidDetails(#[from] ConfigError),
}

/// A connection pool to the source DB.
#[derive(Debug, Clone)]
pub struct DbConnPool(Pool<Postgres>);

impl DbConnPool {
    /// Set up a connection pool sized for the Stage B worker fleet, with
    /// exponential backoff retry on transient connection errors.
    ///
    /// The pool is sized `max = no_of_workers`, `min = no_of_workers / 2`
    /// so it is never the bottleneck when all range workers are active.
    #[instrument(skip_all, err)]
    pub async fn connect(
        details: &PostgresConnectionDetails,
        no_of_workers: usize,
    ) -> Result<Self, ConnError> {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_max_times(10);

        fn is_connection_error(err: &sqlx::Error) -> bool {
            match err {
                sqlx::Error::Database(db_err) => {
                    // PostgreSQL error codes for connection issues
                    db_err.code().is_some_and(|code| {
                        matches!(
                            code.as_ref(),
                            "57P03" | // The database system is starting up
                            "53300" | // Too many connections
                            "08006" | // Connection failure
                            "08001" | // Unable to connect to server
                            "08004" // Server rejected the connection
                        )
                    })
                }
                sqlx::Error::Io(_) => true,
                sqlx::Error::Tls(_) => true,
                sqlx::Error::PoolClosed => true,
                sqlx::Error::PoolTimedOut => true,
                _ => false,
            }
        }

        fn notify_retry(err: &sqlx::Error, dur: Duration) {
            warn!(
                error = %err,
                retry_delay_secs = dur.as_secs_f32(),
                "db_connection_retry"
            );
        }

        let connect_options = PgConnectOptions::new()
            .host(&details.host)
            .port(details.port_number()?)
            .username(&details.username)
            .password(&details.password)
            .database(&details.database)
            .ssl_mode(PgSslMode::Prefer)
            .application_name("dorisync");

        let max_connections = no_of_workers.max(1) as u32;
        let pool_options = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(max_connections / 2)
            .acquire_timeout(Duration::from_secs(5));

        (|| {
            let pool_options = pool_options.clone();
            let connect_options = connect_options.clone();
            async move { pool_options.connect_with(connect_options).await }
        })
        .retry(retry_policy)
        .when(is_connection_error)
        .notify(notify_retry)
        .await
        .map(Self)
        .map_err(ConnError::ConnectionError)
    }
}

impl std::ops::Deref for DbConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
