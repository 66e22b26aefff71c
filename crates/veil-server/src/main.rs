use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use veil_gateway::connection;
use veil_gateway::directory::Directory;
use veil_gateway::registry::Registry;
use veil_gateway::relay::Relay;
use veil_gateway::rooms::Rooms;
use veil_store::MessageLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil=debug,tower_http=info".into()),
        )
        .init();

    // Config
    let host = std::env::var("VEIL_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("VEIL_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let data_path = std::env::var("VEIL_DATA_PATH").unwrap_or_else(|_| "messages.json".into());

    // The snapshot is loaded in full before any connection is accepted.
    let log = MessageLog::open(&PathBuf::from(&data_path))?;

    // Component state is owned here and injected; lifecycle is the
    // process lifecycle.
    let relay = Relay::new(Registry::new(), Directory::new(), Rooms::new(), log.clone());

    let app = Router::new()
        .route("/", get(status))
        .route("/gateway", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(relay);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("veil relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // One last awaited flush so the snapshot reflects everything accepted
    // before shutdown.
    log.flush().await?;
    info!("snapshot flushed, goodbye");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn ws_upgrade(State(relay): State<Relay>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, relay))
}

async fn status(State(relay): State<Relay>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": relay.connection_count().await,
    }))
}
