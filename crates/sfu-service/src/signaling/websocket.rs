//! HTTP surface for signaling.
//!
//! - `GET /` - plain-text greeting
//! - `GET /mediasoup[?roomId=<id>]` - WebSocket upgrade; one `Dispatcher`
//!   per socket
//!
//! Each socket runs two tasks: the reader below, which dispatches frames in
//! order, and a writer that drains the connection's outbound queue. The
//! reader finishes the request in flight before it notices a closed socket;
//! the writer is already gone by then, so the response is discarded.

use super::connection::{ConnectionHandle, OutboundQueue, CONNECTION_CHANNEL_BUFFER};
use super::dispatcher::{Dispatcher, SignalingContext};
use super::protocol::ServerMessage;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Largest accepted signaling frame. SDP-sized payloads fit comfortably.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Clone)]
struct SignalingState {
    ctx: Arc<SignalingContext>,
    shutdown_token: CancellationToken,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectQuery {
    #[serde(default)]
    room_id: Option<String>,
}

/// Build the signaling router. Cancelling `shutdown_token` closes every
/// socket.
pub fn signaling_router(ctx: Arc<SignalingContext>, shutdown_token: CancellationToken) -> Router {
    Router::new()
        .route("/", get(greeting_handler))
        .route("/mediasoup", get(upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(SignalingState {
            ctx,
            shutdown_token,
        })
}

async fn greeting_handler() -> &'static str {
    "Hello from mediasoup app!"
}

async fn upgrade_handler(
    State(state): State<SignalingState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, query.room_id))
}

async fn handle_socket(socket: WebSocket, state: SignalingState, room_id: Option<String>) {
    let connection_id = ConnectionId::new();
    let cancel_token = state.shutdown_token.child_token();
    let (connection, outbound) =
        ConnectionHandle::channel(connection_id, CONNECTION_CHANNEL_BUFFER, cancel_token.clone());

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        connection_id,
        sink,
        outbound,
        cancel_token.clone(),
    ));

    let mut dispatcher = Dispatcher::new(state.ctx, connection);
    dispatcher.on_connect(room_id).await;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(target: "sfu.signaling", connection_id = %connection_id, "Connection cancelled");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatcher.handle_text(&text).await,
                Some(Ok(Message::Binary(_))) => {
                    debug!(target: "sfu.signaling", connection_id = %connection_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    debug!(target: "sfu.signaling", connection_id = %connection_id, error = %e, "Socket error");
                    break;
                }
            }
        }
    }

    // Cancels the connection token, which stops the writer
    dispatcher.disconnect().await;

    if let Err(e) = writer.await {
        if e.is_panic() {
            error!(target: "sfu.signaling", connection_id = %connection_id, "Socket writer panicked");
        }
    }
}

async fn write_loop(
    connection_id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: OutboundQueue,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else {
                    return;
                };
                if !send_frame(connection_id, &mut sink, &message).await {
                    return;
                }
            }
        }
    }

    // Flush what was queued before the cancel (e.g. router-closed on shutdown)
    while let Some(message) = outbound.try_recv() {
        if !send_frame(connection_id, &mut sink, &message).await {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn send_frame(
    connection_id: ConnectionId,
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> bool {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "sfu.signaling", connection_id = %connection_id, error = %e, "Failed to encode frame");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
