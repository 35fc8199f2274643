//! Management API for multicast sessions.
//!
//! A small JSON surface over [`MulticastEngine`] for operators and the
//! deployment controller, plus a liveness probe:
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/healthz` | liveness |
//! | GET, POST | `/v1/multicast/sessions` | list, prepare (and start when `imageId` is given) |
//! | GET, DELETE | `/v1/multicast/sessions/{id}` | snapshot, remove a finished session |
//! | POST | `/v1/multicast/sessions/{id}/start` | bind an image |
//! | POST | `/v1/multicast/sessions/{id}/begin` | begin transmission |
//! | POST | `/v1/multicast/sessions/{id}/cancel` | cancel |
//! | POST | `/v1/multicast/addresses` | allocate a group address |
//!
//! Errors are returned as `{"error": "..."}`.

use crate::error::PxeError;
use crate::multicast::{MulticastEngine, SessionId, SessionSnapshot, StartRequest};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use imaging_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type Engine = Arc<MulticastEngine>;

/// Body of `POST /v1/multicast/sessions`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    /// Generated (UUID v4) when absent
    pub session_id: Option<SessionId>,
    pub image_id: Option<String>,
    /// Allocated from the pool when absent
    pub multicast_address: Option<Ipv4Addr>,
    pub port: Option<u16>,
}

/// Body of `POST /v1/multicast/sessions/{id}/start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub image_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub multicast_address: Ipv4Addr,
}

/// Maps engine errors to HTTP statuses.
#[derive(Debug)]
pub struct ApiError(PxeError);

impl From<PxeError> for ApiError {
    fn from(err: PxeError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PxeError::SessionNotFound(_)
            | PxeError::ClientNotFound { .. }
            | PxeError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            PxeError::SessionExists(_)
            | PxeError::InvalidState { .. }
            | PxeError::NoClients(_)
            | PxeError::AddressPoolExhausted => StatusCode::CONFLICT,
            PxeError::ChunkOutOfRange { .. }
            | PxeError::InvalidRequest(_)
            | PxeError::Configuration(_)
            | PxeError::Packet(_)
            | PxeError::Serialization(_)
            | PxeError::Store(StoreError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Management API request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Builds the API router.
pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/multicast/sessions", get(list_sessions).post(create_session))
        .route("/v1/multicast/sessions/{id}", get(get_session).delete(remove_session))
        .route("/v1/multicast/sessions/{id}/start", post(start_session))
        .route("/v1/multicast/sessions/{id}/begin", post(begin_session))
        .route("/v1/multicast/sessions/{id}/cancel", post(cancel_session))
        .route("/v1/multicast/addresses", post(allocate_address))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_sessions(State(engine): State<Engine>) -> Json<Vec<SessionSnapshot>> {
    Json(engine.sessions().await)
}

async fn create_session(
    State(engine): State<Engine>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    let id = request.session_id.unwrap_or_else(SessionId::generate);
    let snapshot = engine
        .create_session(
            id,
            request.multicast_address,
            request.port,
            request.image_id.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_session(
    State(engine): State<Engine>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let snapshot = engine
        .session(&id)
        .await
        .ok_or_else(|| PxeError::SessionNotFound(id.to_string()))?;
    Ok(Json(snapshot))
}

async fn start_session(
    State(engine): State<Engine>,
    Path(id): Path<SessionId>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    // Only existing sessions; creation goes through POST /sessions
    engine
        .session(&id)
        .await
        .ok_or_else(|| PxeError::SessionNotFound(id.to_string()))?;
    let snapshot = engine
        .start_session(StartRequest {
            session_id: id,
            image_id: request.image_id,
            multicast_address: None,
            port: None,
        })
        .await?;
    Ok(Json(snapshot))
}

async fn begin_session(
    State(engine): State<Engine>,
    Path(id): Path<SessionId>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    // The chunk loop runs detached; progress is visible through GET
    let _transmission = engine.begin_transmission(&id).await?;
    let snapshot = engine
        .session(&id)
        .await
        .ok_or_else(|| PxeError::SessionNotFound(id.to_string()))?;
    info!(session_id = %id, "Transmission begun via API");
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn cancel_session(
    State(engine): State<Engine>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(engine.cancel_session(&id).await?))
}

async fn remove_session(
    State(engine): State<Engine>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(engine.remove_session(&id).await?))
}

async fn allocate_address(State(engine): State<Engine>) -> Result<Json<AddressResponse>, ApiError> {
    let multicast_address = engine.allocate_address().await?;
    Ok(Json(AddressResponse { multicast_address }))
}

/// HTTP server for the management API.
pub struct ApiServer {
    engine: Engine,
    bind: SocketAddr,
}

impl ApiServer {
    pub fn new(engine: Engine, bind: SocketAddr) -> Self {
        Self { engine, bind }
    }

    pub async fn bind(&self) -> Result<TcpListener, PxeError> {
        let listener = TcpListener::bind(self.bind).await?;
        info!(addr = %self.bind, "Management API listening");
        Ok(listener)
    }

    /// Serves requests on `listener` until the task is aborted.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), PxeError> {
        axum::serve(listener, router(Arc::clone(&self.engine))).await?;
        Ok(())
    }

    /// Binds and serves.
    pub async fn start(&self) -> Result<(), PxeError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}
