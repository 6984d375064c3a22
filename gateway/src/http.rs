use crate::auth::bearer_token;
use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::metrics;
use crate::model::Command;
use crate::mqtt::ConnectionState;
use crate::registry::{AdmitError, ChannelSink, ConnectionRegistry};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: CommandDispatcher,
    pub broker_state: watch::Receiver<ConnectionState>,
    pub ws_send_buffer: usize,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/devices/:id/command", post(send_command))
        .route("/api/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Token is checked before the upgrade: a rejected client gets a plain 401
/// and never sees a WebSocket frame.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    match state.registry.authorize(params.token.as_deref()) {
        Ok(claims) => ws.on_upgrade(move |socket| serve_subscriber(socket, claims, state)),
        Err(e) => {
            warn!("WebSocket handshake rejected: {}", e);
            ApiError::Unauthorized.into_response()
        }
    }
}

async fn serve_subscriber(socket: WebSocket, claims: crate::auth::Claims, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.ws_send_buffer);

    let id = match state
        .registry
        .admit_verified(claims, Arc::new(ChannelSink::new(tx)))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            error!("Failed to register WebSocket subscriber: {}", e);
            return;
        }
    };

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
                debug!("WebSocket write failed: {}", e);
                break;
            }
        }
    });

    let mut reader = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket read failed: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.registry.remove(id).await;
    info!("WebSocket subscriber {} disconnected", id);
}

async fn send_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    state.registry.authorize(token)?;

    let command: Command = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Command field is required".to_string()))?;

    state.dispatcher.publish_command(&device_id, &command).await?;

    Ok(Json(json!({
        "message": "Command sent successfully",
        "command": command,
    })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let broker = *state.broker_state.borrow();
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "websocket_clients": state.registry.len().await,
        "broker": broker,
    }))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl From<AdmitError> for ApiError {
    fn from(_: AdmitError) -> Self {
        ApiError::Unauthorized
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            e if e.is_rejection() => ApiError::BadRequest(e.to_string()),
            DispatchError::Broker(e) => ApiError::BadGateway(format!("Failed to send command: {}", e)),
            e => ApiError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Invalid or missing token".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(e) => {
                error!("API error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
