//! Axum entry point for the Snapdash room server.
//!
//! # Routes
//!
//! | Method | Path         | Description                                         |
//! |--------|--------------|-----------------------------------------------------|
//! | `GET`  | `/ws`        | WebSocket upgrade (`?room=CODE`, opt. `reconnectId`) |
//! | `GET`  | `/api/rooms` | List active room codes (JSON)                       |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use snapdash_server::room::RoomManager;
use snapdash_server::ws_handler;

/// Shared application state available to all handlers.
#[derive(Clone)]
struct AppState {
    room_manager: Arc<RoomManager>,
}

#[derive(Deserialize)]
struct WsQuery {
    room: String,
    #[serde(rename = "reconnectId")]
    reconnect_id: Option<String>,
}

#[tokio::main]
async fn main() {
    // Initialise tracing (respects RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state = AppState {
        room_manager: Arc::new(RoomManager::new()),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/rooms", get(rooms_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Snapdash server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// `GET /ws` — upgrade and hand off to [`ws_handler::handle_socket`].
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        ws_handler::handle_socket(socket, state.room_manager, query.room, query.reconnect_id)
    })
}

/// `GET /api/rooms` — return a JSON array of active room codes.
async fn rooms_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.room_manager.list_rooms().await)
}
