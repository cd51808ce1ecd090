pub mod error;
pub mod memory;
pub mod repository;
#[cfg(feature = "database")]
pub mod transaction_repository;

pub use memory::MemoryTransactionStore;
pub use repository::{
    CallbackEvent, NewPendingTransaction, OutcomeSource, TerminalOutcome, TerminalStatus,
    TransactionRecord, TransactionStatus, TransactionStore, TransitionOutcome,
};
#[cfg(feature = "database")]
pub use transaction_repository::TransactionRepository;

#[cfg(feature = "database")]
pub use pool::*;

#[cfg(feature = "database")]
mod pool {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{error as log_error, info};

    use super::error::DatabaseError;

    const SCHEMA: &str = include_str!("../../migrations/0001_mpesa_transactions.sql");

    /// Database pool configuration
    #[derive(Debug, Clone)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub connection_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                max_connections: 20,
                min_connections: 2,
                connection_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(1800),
            }
        }
    }

    /// Initialize the database connection pool
    pub async fn init_pool(
        database_url: &str,
        config: Option<PoolConfig>,
    ) -> Result<PgPool, DatabaseError> {
        let config = config.unwrap_or_default();

        info!(
            "Initializing database pool: max_connections={}, min_connections={}, connection_timeout={:?}",
            config.max_connections, config.min_connections, config.connection_timeout
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                log_error!("Failed to initialize database pool: {}", e);
                DatabaseError::from_sqlx(e)
            })?;

        info!("Database pool initialized successfully");
        Ok(pool)
    }

    /// Create the payment tables if they do not exist yet
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::raw_sql(SCHEMA).execute(pool).await.map_err(|e| {
            log_error!("Failed to apply payment schema: {}", e);
            DatabaseError::from_sqlx(e)
        })?;
        Ok(())
    }

}
