use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::error::RelayError;
use crate::room::short;
use crate::session::Connection;
use crate::signal::{ClientEvent, ServerEvent};

pub fn router(state: AppState) -> Router {
    let public = ServeDir::new(&state.config.public_dir);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/:room_id", get(ws_room_handler))
        .route("/health", get(|| async { "ok" }))
        .fallback_service(public)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Bearer-токен из заголовка или из `?token=` (браузеры не умеют
/// ставить заголовки на WebSocket)
fn bearer_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or_else(|| query.get("token").cloned())
        .filter(|t| !t.is_empty())
}

// WebSocket обработчики

async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, headers, query, state, None)
}

async fn ws_room_handler(
    ws: Option<WebSocketUpgrade>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, headers, query, state, Some(room_id))
}

fn upgrade(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    query: HashMap<String, String>,
    state: AppState,
    room_id: Option<String>,
) -> Response {
    let token = bearer_token(&headers, &query);
    if state.config.require_auth && token.is_none() {
        return (StatusCode::UNAUTHORIZED, "Требуется bearer-токен").into_response();
    }
    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, room_id, token))
            .into_response(),
        None => (StatusCode::BAD_REQUEST, "Ожидался WebSocket").into_response(),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    room_id: Option<String>,
    token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut conn = Connection::open(state, tx, token.as_deref()).await;
    let id = conn.id().to_string();
    if let Some(room_id) = room_id {
        conn.dispatch(ClientEvent::JoinRoom(room_id)).await;
    }

    // Отправка клиенту событий из канала
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Не удалось сериализовать событие: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => conn.handle_text(&text).await,
                Ok(Message::Binary(bytes)) => conn.handle_binary(bytes).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("{} ({}): {}", RelayError::TransportDisconnect, short(&id), e);
                    break;
                }
            }
        }
    };

    // Ожидаем завершения одной из сторон
    tokio::select! {
        _ = &mut send_task => (),
        _ = recv => (),
    }

    send_task.abort();
    conn.close().await;
}
