//! WebSocket signaling client for end-to-end tests.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A client speaking the JSON signaling protocol over a real socket.
pub struct WsClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    /// Notifications received while waiting for a response.
    events: VecDeque<Value>,
}

impl WsClient {
    /// Connect to `ws://{addr}/mediasoup`, optionally with `?roomId=`.
    ///
    /// # Panics
    ///
    /// Panics if the handshake fails.
    pub async fn connect(addr: SocketAddr, room_id: Option<&str>) -> Self {
        let url = match room_id {
            Some(room_id) => format!("ws://{addr}/mediasoup?roomId={room_id}"),
            None => format!("ws://{addr}/mediasoup"),
        };
        let (socket, _response) = connect_async(url).await.expect("websocket handshake");

        Self {
            socket,
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) {
        self.socket
            .send(Message::Text(text.to_string()))
            .await
            .expect("send frame");
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// # Panics
    ///
    /// Panics if the socket closes or no response arrives in time.
    pub async fn request(&mut self, method: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send_text(&json!({"id": id, "method": method, "data": data}).to_string())
            .await;

        loop {
            let frame = self.recv_json().await.expect("response before close");
            if frame.get("id").and_then(Value::as_u64) == Some(id) {
                return frame["data"].clone();
            }
            self.events.push_back(frame);
        }
    }

    /// Next notification (`{"event": ..., "data": ...}`), or `None` on
    /// close or timeout.
    pub async fn next_event(&mut self) -> Option<Value> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        loop {
            let frame = self.recv_json().await?;
            if frame.get("event").is_some() {
                return Some(frame);
            }
        }
    }

    /// Close from the client side.
    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }

    async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .ok()??;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("server frames are JSON"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}
