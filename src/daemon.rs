use axum::{routing::get, Json, Router};
use serde_json::json;
use tracing::info;

/// Start the health probe HTTP server. Operational monitoring only — the
/// project-control API is a separate, out-of-process façade.
pub async fn start_health_server(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(health_handler));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}
