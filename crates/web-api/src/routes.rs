use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::{auth::bearer_token, error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    instance: String,
    connections: usize,
    users: usize,
    rooms: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new().route("/ws", get(websocket_upgrade))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.registry().stats();
    Json(HealthResponse {
        status: "ok",
        instance: state.instance.to_string(),
        connections: stats.connections,
        users: stats.users,
        rooms: stats.rooms,
    })
}

async fn not_found() -> ApiError {
    ApiError::not_found("route not found")
}

/// 凭证来自 `?token=` 或 `Authorization: Bearer`，在握手之后校验
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let credential = match query.token {
        Some(token) => Some(token),
        None => bearer_token(&headers)?,
    };

    Ok(ws.on_upgrade(move |socket| WebSocketConnection::new(socket, state, credential).run()))
}
