use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        FromRequest, Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    admission::{AdmissionError, AdmissionRequest},
    config::ConnectionConfig,
    connection::{self, ConnectionId, Frame, Payload, PumpExit, TransportError},
    hub::HubHandle,
    rooms::{RoomError, RoomRepository},
};

const MAX_CREATE_BODY_BYTES: usize = 4 * 1024;

pub struct AppState {
    pub hub: HubHandle,
    pub rooms: Arc<dyn RoomRepository>,
    pub room_ttl: Duration,
    pub connection: ConnectionConfig,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .route("/rooms", post(create_room))
        .route("/rooms/:id", get(room_status))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomStatusResponse {
    pub room_id: String,
    pub exists: bool,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    reason: &'static str,
    message: String,
}

pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
        }
    }
}

impl From<RoomError> for ApiError {
    fn from(err: RoomError) -> Self {
        let (status, reason) = match &err {
            RoomError::AlreadyExists => (StatusCode::CONFLICT, "room_exists"),
            RoomError::RoomNotFound => (StatusCode::NOT_FOUND, "room_not_found"),
            RoomError::InvalidRoomId(_) => (StatusCode::BAD_REQUEST, "invalid_room_id"),
            RoomError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        };
        ApiError::new(status, reason, err.to_string())
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::MissingRoom => {
                ApiError::new(StatusCode::BAD_REQUEST, "room_required", err.to_string())
            }
            AdmissionError::Room(room) => room.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), "invalid_body", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            reason: self.reason,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// An empty body asks for a generated id. Anything else must be a valid
/// JSON `CreateRoomRequest`.
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<CreateRoomResponse>), ApiError> {
    let room_id = requested_room_id(request)
        .await?
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    state.rooms.create_room(&room_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            room_id,
            ttl_seconds: state.room_ttl.as_secs(),
        }),
    ))
}

async fn requested_room_id(request: Request) -> Result<Option<String>, ApiError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_CREATE_BODY_BYTES).await.map_err(|err| {
        ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "invalid_body", err.to_string())
    })?;
    if bytes.is_empty() {
        return Ok(None);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    let Json(body) = Json::<CreateRoomRequest>::from_request(request, &()).await?;
    Ok(body.room_id)
}

pub async fn room_status(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomStatusResponse>, ApiError> {
    let exists = state.rooms.room_exists(&room_id).await?;
    Ok(Json(RoomStatusResponse { room_id, exists }))
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.snapshot().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "hub_stopped",
            "hub is not running",
        )
        .into_response(),
    }
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Runs admission before looking at the upgrade, so rejected peers get a
/// plain HTTP error and never reach the hub.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let request = AdmissionRequest {
        connection_id: ConnectionId::new(),
        room_id: query.room,
    };

    if let Err(err) = state.hub.authorize(&request).await {
        warn!(
            connection_id = %request.connection_id,
            room_id = ?request.room_id,
            error = %err,
            "admission rejected"
        );
        return ApiError::from(err).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let config = state.connection.clone();
    ws.max_message_size(config.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, request, hub, config))
}

async fn handle_socket(
    socket: WebSocket,
    request: AdmissionRequest,
    hub: HubHandle,
    config: ConnectionConfig,
) {
    let id = request.connection_id;
    info!(connection_id = %id, room_id = ?request.room_id, "peer connected");

    let (sink, stream) = socket.split();
    let reader = stream.map(|message| {
        message
            .map(Frame::from)
            .map_err(|err| TransportError::Read(err.to_string()))
    });
    let writer = sink
        .sink_map_err(|err| TransportError::Write(err.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));

    match connection::run(id, reader, writer, hub, config).await {
        PumpExit::Closed => info!(connection_id = %id, "peer disconnected"),
        PumpExit::Failed(err) => info!(connection_id = %id, error = %err, "peer dropped"),
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Data(Payload::text(text)),
            Message::Binary(bytes) => Frame::Data(Payload::binary(bytes)),
            Message::Ping(bytes) => Frame::Ping(bytes.into()),
            Message::Pong(bytes) => Frame::Pong(bytes.into()),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Data(Payload::Text(text)) => Message::Text(text.to_string()),
            Frame::Data(Payload::Binary(bytes)) => Message::Binary(bytes.to_vec()),
            Frame::Ping(bytes) => Message::Ping(bytes.to_vec()),
            Frame::Pong(bytes) => Message::Pong(bytes.to_vec()),
            Frame::Close => Message::Close(None),
        }
    }
}
