use anyhow::Context;
use mpesa_stk_backend::api::{self, AppState, ServiceInfo};
use mpesa_stk_backend::config::Config;
use mpesa_stk_backend::database::{MemoryTransactionStore, TransactionStore};
use mpesa_stk_backend::payments::{
    CallbackGuard, CallbackReceiver, PaymentProvider, PaymentService, PendingSweeper,
    StatusReconciler,
};
use mpesa_stk_backend::payments::providers::MpesaProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cache")]
use mpesa_stk_backend::cache::{init_cache_pool, CacheConfig, RedisCache};
#[cfg(feature = "database")]
use mpesa_stk_backend::database::{ensure_schema, init_pool, PoolConfig, TransactionRepository};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn TransactionStore>> {
    #[cfg(feature = "database")]
    if let Some(database) = &config.database {
        let pool = init_pool(
            &database.url,
            Some(PoolConfig {
                max_connections: database.max_connections,
                ..PoolConfig::default()
            }),
        )
        .await
        .context("Failed to connect to Postgres")?;
        ensure_schema(&pool)
            .await
            .context("Failed to apply payment schema")?;
        info!("Database connection pool initialized");
        return Ok(Arc::new(TransactionRepository::new(pool)));
    }

    if config.database.is_some() {
        warn!("DATABASE_URL is set but the database feature is disabled");
    }
    warn!("Using in-memory transaction store; payment records will not survive a restart");
    Ok(Arc::new(MemoryTransactionStore::new()))
}

async fn build_provider(config: &Config) -> anyhow::Result<MpesaProvider> {
    let provider = MpesaProvider::new(config.mpesa.clone())
        .context("Failed to initialize M-Pesa provider")?;

    #[cfg(feature = "cache")]
    if let Some(redis) = &config.redis {
        let pool = init_cache_pool(CacheConfig {
            redis_url: redis.url.clone(),
            ..CacheConfig::default()
        })
        .await
        .context("Failed to initialize Redis pool")?;
        info!("Sharing M-Pesa access token through Redis");
        return Ok(provider.with_shared_tokens(RedisCache::new(pool)));
    }

    Ok(provider)
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    info!("Starting M-Pesa payments backend");
    info!("Environment: {}", config.server.environment);
    info!("M-Pesa environment: {}", config.mpesa.environment.as_str());

    let store = build_store(&config).await?;
    let provider: Arc<dyn PaymentProvider> = Arc::new(build_provider(&config).await?);

    let reconciler = Arc::new(StatusReconciler::new(provider.clone(), store.clone()));
    let guard = CallbackGuard::new(
        config.mpesa.callback_secret.as_deref(),
        config.mpesa.callback_allowed_ips.clone(),
    );
    if !guard.requires_secret() && config.mpesa.callback_allowed_ips.is_empty() {
        warn!("M-Pesa callback endpoint accepts deliveries from any source");
    }

    let state = AppState {
        payments: Arc::new(PaymentService::new(provider.clone(), store.clone())),
        reconciler: reconciler.clone(),
        callbacks: Arc::new(CallbackReceiver::new(store.clone()).with_guard(guard)),
        info: Arc::new(ServiceInfo {
            environment: config.server.environment.clone(),
            mpesa_environment: config.mpesa.environment.as_str().to_string(),
            mpesa_configured: config.mpesa.is_configured(),
        }),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = PendingSweeper::new(reconciler, store, config.sweeper.clone());
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    let app = api::router(state);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .context("HOST must be an IP address")?;
    let addr = SocketAddr::new(host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;

    if let Err(e) = sweeper_handle.await {
        warn!("Pending sweeper task ended abnormally: {}", e);
    }

    info!("Server stopped");
    Ok(())
}
