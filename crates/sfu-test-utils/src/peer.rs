//! In-process signaling client.
//!
//! `TestPeer` drives a [`Dispatcher`] directly, the way the WebSocket loop
//! does, and reads responses and notifications from the connection's
//! outbound queue.

use crate::fixtures::{client_dtls_parameters, client_rtp_capabilities, to_json, vp8_rtp_parameters};
use common::media::{MediaKind, RtpCapabilities, RtpParameters};
use common::types::{ConnectionId, ConsumerId, ProducerId, TransportId};
use serde_json::{json, Value};
use sfu_service::signaling::protocol::{Notification, ServerMessage};
use sfu_service::signaling::{Dispatcher, OutboundQueue};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

/// How long helpers wait for a notification.
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connected peer.
pub struct TestPeer {
    dispatcher: Dispatcher,
    outbound: OutboundQueue,
    next_id: u64,
    /// Notifications received while waiting for something else.
    events: VecDeque<Notification>,
}

impl TestPeer {
    #[must_use]
    pub fn new(dispatcher: Dispatcher, outbound: OutboundQueue) -> Self {
        Self {
            dispatcher,
            outbound,
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.dispatcher.peer_id()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Send a request and return its response payload.
    ///
    /// # Panics
    ///
    /// Panics if the dispatcher does not answer with the request's id.
    pub async fn request(&mut self, method: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;

        let frame = json!({"id": id, "method": method, "data": data}).to_string();
        self.dispatcher.handle_text(&frame).await;

        loop {
            match self.outbound.try_recv() {
                Some(ServerMessage::Response { id: got, data }) => {
                    assert_eq!(got, id, "response for another request");
                    return data;
                }
                Some(ServerMessage::Event(notification)) => self.events.push_back(notification),
                None => panic!("no response to {method} (id {id})"),
            }
        }
    }

    /// Send a request without an id.
    pub async fn send(&mut self, method: &str, data: Value) {
        let frame = json!({"method": method, "data": data}).to_string();
        self.dispatcher.handle_text(&frame).await;
    }

    /// Send a raw text frame.
    pub async fn send_raw(&mut self, frame: &str) {
        self.dispatcher.handle_text(frame).await;
    }

    /// Next notification, waiting up to two seconds.
    pub async fn next_event(&mut self) -> Option<Notification> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        loop {
            match tokio::time::timeout(EVENT_TIMEOUT, self.outbound.recv()).await {
                Ok(Some(ServerMessage::Event(notification))) => return Some(notification),
                Ok(Some(ServerMessage::Response { .. })) => {}
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Next notification, skipping ones that don't match.
    pub async fn wait_for(&mut self, matches: impl Fn(&Notification) -> bool) -> Option<Notification> {
        while let Some(event) = self.next_event().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Whether a notification is already queued.
    pub fn has_pending_event(&mut self) -> bool {
        while let Some(message) = self.outbound.try_recv() {
            if let ServerMessage::Event(notification) = message {
                self.events.push_back(notification);
            }
        }
        !self.events.is_empty()
    }

    pub(crate) async fn expect_connection_success(&mut self) {
        match self.next_event().await {
            Some(Notification::ConnectionSuccess { socket_id }) => assert_eq!(socket_id, self.id()),
            other => panic!("expected connection-success, got {other:?}"),
        }
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        self.dispatcher.disconnect().await;
    }

    // ------------------------------------------------------------------
    // Flow helpers. Each asserts success.
    // ------------------------------------------------------------------

    pub async fn join(&mut self, room_id: &str) -> Value {
        let data = self.request("joinRoom", json!({"roomId": room_id})).await;
        assert!(data.get("error").is_none(), "joinRoom failed: {data}");
        data
    }

    pub async fn rtp_capabilities(&mut self) -> RtpCapabilities {
        let data = self.request("getRtpCapabilities", json!({})).await;
        serde_json::from_value(data["rtpCapabilities"].clone()).expect("rtpCapabilities")
    }

    pub async fn create_transport(&mut self, sender: bool) -> TransportId {
        let data = self.request("createTransport", json!({"sender": sender})).await;
        let id = data["params"]["id"]
            .as_str()
            .unwrap_or_else(|| panic!("createTransport failed: {data}"));
        TransportId::from_str(id).expect("transport id")
    }

    /// Create and connect a send transport.
    pub async fn create_send_transport(&mut self) -> TransportId {
        let transport_id = self.create_transport(true).await;
        let data = self
            .request(
                "connectProducerTransport",
                json!({"dtlsParameters": to_json(&client_dtls_parameters())}),
            )
            .await;
        assert_eq!(data, json!({}), "connectProducerTransport failed");
        transport_id
    }

    /// Create and connect a receive transport.
    pub async fn create_recv_transport(&mut self) -> TransportId {
        let transport_id = self.create_transport(false).await;
        let data = self
            .request(
                "connectConsumerTransport",
                json!({"dtlsParameters": to_json(&client_dtls_parameters())}),
            )
            .await;
        assert_eq!(data, json!({}), "connectConsumerTransport failed");
        transport_id
    }

    pub async fn produce(&mut self, kind: MediaKind, rtp_parameters: &RtpParameters) -> Value {
        self.request(
            "produce",
            json!({"kind": kind, "rtpParameters": to_json(rtp_parameters)}),
        )
        .await
    }

    pub async fn produce_video(&mut self) -> ProducerId {
        let data = self.produce(MediaKind::Video, &vp8_rtp_parameters(1111)).await;
        let id = data["id"]
            .as_str()
            .unwrap_or_else(|| panic!("produce failed: {data}"));
        ProducerId::from_str(id).expect("producer id")
    }

    /// Consume with browser capabilities. Returns the raw response.
    pub async fn consume(&mut self, producer_id: ProducerId) -> Value {
        self.consume_with(producer_id, &client_rtp_capabilities()).await
    }

    pub async fn consume_with(
        &mut self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Value {
        self.request(
            "consume",
            json!({
                "producerId": producer_id.to_string(),
                "rtpCapabilities": to_json(rtp_capabilities),
            }),
        )
        .await
    }

    pub async fn resume(&mut self, consumer_id: ConsumerId) -> Value {
        self.request(
            "resumeConsumer",
            json!({"consumerId": consumer_id.to_string()}),
        )
        .await
    }
}

/// Consumer id from a successful consume response.
///
/// # Panics
///
/// Panics if the response is an error.
#[must_use]
pub fn consumer_id_of(response: &Value) -> ConsumerId {
    let id = response["params"]["id"]
        .as_str()
        .unwrap_or_else(|| panic!("consume failed: {response}"));
    ConsumerId::from_str(id).expect("consumer id")
}
