use crate::assets;
use crate::config::RelayConfig;
use crate::proxy;
use crate::registry::{SessionInfo, SessionRegistry};
use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use proflink_store::DynArtifactStore;
use serde_json::json;
use tokio::sync::broadcast;

/// One router serves everything: the management API, viewer traffic under
/// the route prefix, and the dashboard bundle for the rest.
pub fn router(registry: SessionRegistry) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .fallback(route_request)
        .with_state(registry)
}

async fn health(State(registry): State<SessionRegistry>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "sessions": registry.snapshot().len() }))
}

async fn list_sessions(State(registry): State<SessionRegistry>) -> Json<Vec<SessionInfo>> {
    Json(registry.snapshot())
}

async fn route_request(State(registry): State<SessionRegistry>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    if under_prefix(&path, &registry.config().route_prefix) {
        return proxy::dispatch(State(registry), req).await;
    }
    match registry.config().assets_dir.clone() {
        Some(dir) => assets::serve(&dir, &path).await,
        None => (StatusCode::NOT_FOUND, "not found\n").into_response(),
    }
}

/// Prefix matching on whole segments: `/profile` owns `/profile` and
/// `/profile/...` but not `/profiles`.
fn under_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Run the relay until ctrl-c, then tear down every live viewer.
pub async fn serve(config: RelayConfig, store: DynArtifactStore) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .build()
        .context("build http client")?;
    let registry = SessionRegistry::new(config.clone(), store, client);
    let app = router(registry.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!("listening on http://{}", config.bind);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(());
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("serve")?;

    registry.shutdown();
    Ok(())
}
