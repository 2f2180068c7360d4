//! Entry point: load config, wire dependencies, and run the server.

use roomcast::config::{Backend, Config};
use roomcast::db::{self, DbPool, MemoryVoiceSessionStore, PgVoiceSessionStore, VoiceSessionStore};
use roomcast::repositories::{EphemeralStore, FanOut, MemoryFanOut, MemoryStore, RedisRepository};
use roomcast::{create_app, AppState, Gateway};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut db_pool: Option<DbPool> = None;
    let (fanout, store, sessions): (
        Arc<dyn FanOut>,
        Arc<dyn EphemeralStore>,
        Arc<dyn VoiceSessionStore>,
    ) = match config.backend {
        Backend::Redis => {
            let repo = Arc::new(RedisRepository::connect(&config.redis_url, config.fanout_buffer).await?);
            repo.ping().await?;
            let pool = db::create_pool(&config.database_url).await?;
            db::run_migrations(&pool).await?;
            let fanout: Arc<dyn FanOut> = repo.clone();
            let store: Arc<dyn EphemeralStore> = repo;
            let sessions: Arc<dyn VoiceSessionStore> = Arc::new(PgVoiceSessionStore::new(pool.clone()));
            db_pool = Some(pool);
            (fanout, store, sessions)
        }
        Backend::Memory => {
            tracing::warn!("in-memory backend: state is not shared with other instances");
            let fanout: Arc<dyn FanOut> = Arc::new(MemoryFanOut::new(config.fanout_buffer));
            let store: Arc<dyn EphemeralStore> = Arc::new(MemoryStore::new());
            let sessions: Arc<dyn VoiceSessionStore> = Arc::new(MemoryVoiceSessionStore::new());
            (fanout, store, sessions)
        }
    };

    let gateway = Gateway::new(
        &config.instance_id,
        fanout,
        store,
        sessions,
        config.presence_ttl,
    );
    gateway.start().await?;

    let state = AppState::new(gateway.clone(), config.ping_interval, config.ping_timeout);
    let app = create_app(state, &config.ws_path, &config.cors_origin);

    tracing::info!(
        addr = %config.server_addr,
        instance = %config.instance_id,
        backend = ?config.backend,
        "listening"
    );
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    if let Some(pool) = db_pool {
        pool.close().await;
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
