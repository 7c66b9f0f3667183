//! Realtime transport
//!
//! One WebSocket per party connection. The party id arrives as a query
//! parameter on the upgrade request.

pub mod gateway;
pub mod protocol;
pub mod registry;

pub use gateway::SessionGateway;
pub use registry::{ConnectionHandle, ConnectionRegistry};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::handlers::check_party_id;
use crate::AppState;
use parley_common::errors::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub party_id: String,
}

/// Upgrade handler for `/v1/ws?partyId=..`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let party_id = check_party_id(&params.party_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, party_id, state)))
}

async fn handle_socket(socket: WebSocket, party_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = state.connections.register(&party_id);
    info!(party_id = %party_id, connection_id = handle.id, "Realtime connection opened");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(reply) = state.gateway.handle_text(&party_id, text.as_str()).await {
                    state.connections.send_to(&handle, reply);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(party_id = %party_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    state.connections.unregister(&handle);
    writer.abort();
    debug!(party_id = %party_id, connection_id = handle.id, "Realtime connection closed");
}
