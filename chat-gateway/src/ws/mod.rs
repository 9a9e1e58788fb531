//! WebSocket Gateway (C6, spec §4.6): the `/ws/v1` upgrade route plus
//! everything one live connection needs — wire protocol, Bus forwarding,
//! and the per-connection actor.

pub mod connection;
pub mod forwarder;
pub mod protocol;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;

use crate::app::GatewayState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}
