use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use axum::http::Method;
use axum::http::header::CONTENT_TYPE;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_gateway::Room;

use parley_server::config::UploadConfig;
use parley_server::routes::{self, AppState};
use parley_server::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_server=debug,parley_gateway=debug,tower_http=info".into()),
        )
        .init();

    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3080".into())
        .parse()?;

    let config = Arc::new(UploadConfig::from_env());
    // State is memory-only: wipe anything a previous run left behind.
    let storage = Arc::new(
        Storage::new(config.upload_dir.clone(), config.chunk_dir.clone()).await?,
    );

    let state = AppState {
        room: Room::new(),
        storage,
        config: config.clone(),
    };

    // Permissive CORS — clients connect from arbitrary LAN origins.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(false);

    // One chunk plus multipart framing slack.
    let body_limit = config.chunk_size_bytes() as usize + 64 * 1024;

    let app = Router::new()
        .route("/api/upload/init", post(routes::upload_init))
        .route("/api/upload/chunk", post(routes::upload_chunk))
        .route("/api/upload/complete", post(routes::upload_complete))
        .route("/api/client-log", post(routes::client_log))
        .route("/media/{file_id}", get(routes::serve_media))
        .route("/ws", get(routes::ws_upgrade))
        .route("/health", get(routes::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("parley server listening on {}", addr);
    info!(
        "chunk size {} MiB, concurrency {}, max file {} MiB",
        config.chunk_size_mb, config.max_concurrency, config.max_file_size_mb
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C, shutting down...");
    }
}
