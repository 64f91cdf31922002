//! HTTP surface for the bridge sandbox
//!
//! Routes:
//! - `POST /sessions/{username}/events`: provider webhook, the real work
//! - `PUT /sessions/{username}`: register a session in the store
//! - `GET /sessions/{username}`: inspect a registered session
//! - `GET /api/health`: liveness probe
//! - `/static`: media files the provider fetches (looped ring audio)

pub mod catapult;
pub mod events;
pub mod router;
pub mod store;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::models::{RegisterSessionRequest, Session};
use catapult::{CatapultClient, TelephonyGateway};
use router::CallRouter;
use store::{FileBackedStore, SessionStore};

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub router: Arc<CallRouter>,
}

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/sessions/{username}",
            put(register_session).get(get_session),
        )
        .route("/sessions/{username}/events", post(handle_provider_event))
        .nest_service("/static", ServeDir::new("static"))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn register_session(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Json(req): Json<RegisterSessionRequest>,
) -> Result<Json<Session>, StatusCode> {
    let session = Session {
        username,
        phone_number: req.phone_number,
        endpoint_id: req.endpoint_id,
    };

    state.store.put_session(session.clone()).await.map_err(|e| {
        tracing::error!("failed to store session {}: {}", session.username, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::info!(
        "registered session {} with number {}",
        session.username,
        session.phone_number
    );
    Ok(Json(session))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Session>, StatusCode> {
    state
        .store
        .get_session(&username)
        .await
        .map_err(|e| {
            tracing::error!("session lookup failed for {}: {}", username, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Provider webhook. Unknown usernames are rejected with 403; once the
/// session resolves, the response is always `200 "ok"` so the provider
/// never redelivers an event we already looked at. Classification and
/// routing failures are observable only in the logs.
async fn handle_provider_event(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    body: Bytes,
) -> Result<&'static str, StatusCode> {
    let session = match state.store.get_session(&username).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::debug!("received event for unknown username {}", username);
            return Err(StatusCode::FORBIDDEN);
        }
        Err(e) => {
            tracing::error!("session lookup failed for {}: {}", username, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let event = match events::classify(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("dropping event for {}: {}", username, e);
            return Ok("ok");
        }
    };

    tracing::debug!("received {:?} event for call {}", event.kind, event.call_id);

    if let Err(e) = state.router.route(&event, &session).await {
        tracing::error!("routing failed for call {}: {}", event.call_id, e);
    }

    Ok("ok")
}

/// Initialize and start the server
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store: Arc<dyn SessionStore> =
        Arc::new(FileBackedStore::load(&config.store_path).await?);
    let gateway: Arc<dyn TelephonyGateway> = Arc::new(CatapultClient::new(
        config.catapult_user_id.clone(),
        config.catapult_api_token.clone(),
        config.catapult_api_secret.clone(),
        config.catapult_domain_id.clone(),
    ));
    let call_router = Arc::new(CallRouter::new(gateway, store.clone(), config.clone()));

    let app = create_router(AppState {
        store,
        router: call_router,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
