use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use labreq_server::bot::dispatch_loop;
use labreq_server::config::Config;
use labreq_server::db::SqliteDb;
use labreq_server::feed::ChangeFeed;
use labreq_server::lifecycle::LifecycleManager;
use labreq_server::relay::notification_loop;
use labreq_server::store::{Repository, SqliteRepository};
use labreq_server::{api, AppState};
use telegram_bot::TelegramClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting lab-request service");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let db_path = config.state_dir.join("labreq.db");
    info!("Using state database: {}", db_path.display());
    let db = SqliteDb::new(&db_path).expect("Failed to initialize SQLite database");
    let repository = Arc::new(SqliteRepository::new(Arc::new(db))) as Arc<dyn Repository>;

    let feed = ChangeFeed::default();
    let manager = LifecycleManager::new(repository, feed.clone());
    let telegram_client = Arc::new(TelegramClient::new(config.telegram_bot_token.clone()));

    let app_state = Arc::new(AppState {
        manager,
        feed,
        delivery_max_attempts: config.delivery_max_attempts,
    });

    // One shutdown signal shared by the relay, the bot dispatcher, and the
    // HTTP server. Flipping it cancels in-flight backoff sleeps too.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let relay_state = app_state.clone();
    let relay_messenger = telegram_client.clone();
    let relay_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        notification_loop(relay_state, relay_messenger, relay_shutdown).await;
    });

    let bot_state = app_state.clone();
    let bot_client = telegram_client.clone();
    let bot_shutdown = shutdown_rx.clone();
    let group_id = config.telegram_group_id;
    let poll_timeout = config.bot_poll_timeout_secs;
    tokio::spawn(async move {
        dispatch_loop(bot_state, bot_client, group_id, poll_timeout, bot_shutdown).await;
    });

    let app = api::router(app_state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await?;

    Ok(())
}
