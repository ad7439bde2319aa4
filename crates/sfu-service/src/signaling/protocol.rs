//! Signaling wire protocol.
//!
//! Every frame is a JSON text message:
//!
//! ```text
//! client -> server   {"id": 7, "method": "produce", "data": {...}}
//! server -> client   {"id": 7, "data": {...}}            (response)
//! server -> client   {"event": "new-producer", "data": {...}}
//! ```
//!
//! A request without `id` is fire-and-forget. A request with `id` gets
//! exactly one response carrying the same `id`, whether it succeeded or not.

use crate::actors::messages::{CloseReason, TransportDirection};
use crate::errors::SfuError;
use common::media::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use common::types::{ConnectionId, ConsumerId, ProducerId, TransportId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An inbound request frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id; absent for fire-and-forget requests.
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response { id: u64, data: Value },
    Event(Notification),
}

impl ServerMessage {
    #[must_use]
    pub fn response(id: u64, data: Value) -> Self {
        ServerMessage::Response { id, data }
    }

    /// Serialize to the text frame sent on the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload cannot be represented as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        ServerMessage::Event(notification)
    }
}

/// Server-initiated events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    /// Sent once when the connection is accepted.
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess { socket_id: ConnectionId },

    /// Another peer in the room started producing.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        peer_id: ConnectionId,
        kind: MediaKind,
    },

    /// A consumer was closed because its producer closed.
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },

    /// A transport was closed by the engine (DTLS closed).
    #[serde(rename_all = "camelCase")]
    TransportClosed {
        transport_id: TransportId,
        reason: String,
    },

    /// The room's router is gone. The peer must rejoin.
    #[serde(rename_all = "camelCase")]
    RouterClosed { room_id: String, reason: CloseReason },

    /// An inbound frame could not be decoded.
    ProtocolError { error: String },
}

impl Notification {
    /// Event name as it appears on the wire.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Notification::ConnectionSuccess { .. } => "connection-success",
            Notification::NewProducer { .. } => "new-producer",
            Notification::ProducerClosed { .. } => "producer-closed",
            Notification::TransportClosed { .. } => "transport-closed",
            Notification::RouterClosed { .. } => "router-closed",
            Notification::ProtocolError { .. } => "protocol-error",
        }
    }
}

/// Where an error goes in a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSlot {
    /// `{"params": {"error": ..., "code": ...}}`
    Params,
    /// `{"error": ..., "code": ...}`
    Root,
}

impl ErrorSlot {
    /// `createTransport` and `consume` report errors inside `params`, where
    /// the client expects its success payload.
    #[must_use]
    pub fn for_method(method: &str) -> Self {
        match canonical_method(method) {
            Some("createTransport" | "consume") => ErrorSlot::Params,
            _ => ErrorSlot::Root,
        }
    }

    /// Render an error into this slot.
    #[must_use]
    pub fn render(self, err: &SfuError) -> Value {
        let body = json!({
            "error": err.client_message(),
            "code": err.error_code(),
        });
        match self {
            ErrorSlot::Params => json!({ "params": body }),
            ErrorSlot::Root => body,
        }
    }
}

/// Resolve a method name (or legacy alias) to its canonical name.
#[must_use]
pub fn canonical_method(method: &str) -> Option<&'static str> {
    let canonical = match method {
        "getRtpCapabilities" => "getRtpCapabilities",
        "joinRoom" => "joinRoom",
        "leaveRoom" => "leaveRoom",
        "createTransport" | "createWebRtcTransport" => "createTransport",
        "connectProducerTransport" | "transport-connect" => "connectProducerTransport",
        "connectConsumerTransport" | "transport-recv-connect" => "connectConsumerTransport",
        "produce" | "transport-produce" => "produce",
        "consume" => "consume",
        "resumeConsumer" | "consumer-resume" => "resumeConsumer",
        "closeProducer" => "closeProducer",
        "closeConsumer" => "closeConsumer",
        "closeTransport" => "closeTransport",
        _ => return None,
    };
    Some(canonical)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    /// `true` for a send transport, `false` for a receive transport.
    pub sender: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    #[serde(default)]
    pub transport_id: Option<TransportId>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    #[serde(default)]
    pub transport_id: Option<TransportId>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default)]
    pub transport_id: Option<TransportId>,
    #[serde(default)]
    pub producer_id: Option<ProducerId>,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    #[serde(default)]
    pub consumer_id: Option<ConsumerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseConsumerRequest {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTransportRequest {
    pub transport_id: TransportId,
}

/// A decoded signaling request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetRtpCapabilities,
    JoinRoom(JoinRoomRequest),
    LeaveRoom,
    CreateTransport(CreateTransportRequest),
    ConnectTransport {
        direction: TransportDirection,
        request: ConnectTransportRequest,
    },
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    ResumeConsumer(ResumeConsumerRequest),
    CloseProducer(CloseProducerRequest),
    CloseConsumer(CloseConsumerRequest),
    CloseTransport(CloseTransportRequest),
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, SfuError> {
    serde_json::from_value(data).map_err(|e| SfuError::InvalidPayload(e.to_string()))
}

impl Request {
    /// Decode a request from its method name and payload.
    ///
    /// A missing or `null` payload is treated as `{}`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOperation` for an unrecognized method and
    /// `InvalidPayload` when the payload does not match the method.
    pub fn decode(method: &str, data: Value) -> Result<Self, SfuError> {
        let data = if data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            data
        };

        let canonical = canonical_method(method)
            .ok_or_else(|| SfuError::UnknownOperation(method.to_string()))?;

        let request = match canonical {
            "getRtpCapabilities" => Request::GetRtpCapabilities,
            "joinRoom" => Request::JoinRoom(parse(data)?),
            "leaveRoom" => Request::LeaveRoom,
            "createTransport" => Request::CreateTransport(parse(data)?),
            "connectProducerTransport" => Request::ConnectTransport {
                direction: TransportDirection::Send,
                request: parse(data)?,
            },
            "connectConsumerTransport" => Request::ConnectTransport {
                direction: TransportDirection::Recv,
                request: parse(data)?,
            },
            "produce" => Request::Produce(parse(data)?),
            "consume" => Request::Consume(parse(data)?),
            "resumeConsumer" => Request::ResumeConsumer(parse(data)?),
            "closeProducer" => Request::CloseProducer(parse(data)?),
            "closeConsumer" => Request::CloseConsumer(parse(data)?),
            "closeTransport" => Request::CloseTransport(parse(data)?),
            other => return Err(SfuError::UnknownOperation(other.to_string())),
        };

        Ok(request)
    }

    /// Canonical method name (bounded; used as a metric label).
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Request::GetRtpCapabilities => "getRtpCapabilities",
            Request::JoinRoom(_) => "joinRoom",
            Request::LeaveRoom => "leaveRoom",
            Request::CreateTransport(_) => "createTransport",
            Request::ConnectTransport {
                direction: TransportDirection::Send,
                ..
            } => "connectProducerTransport",
            Request::ConnectTransport {
                direction: TransportDirection::Recv,
                ..
            } => "connectConsumerTransport",
            Request::Produce(_) => "produce",
            Request::Consume(_) => "consume",
            Request::ResumeConsumer(_) => "resumeConsumer",
            Request::CloseProducer(_) => "closeProducer",
            Request::CloseConsumer(_) => "closeConsumer",
            Request::CloseTransport(_) => "closeTransport",
        }
    }

    /// Whether the request operates on the peer's room.
    #[must_use]
    pub const fn requires_room(&self) -> bool {
        !matches!(self, Request::JoinRoom(_) | Request::LeaveRoom)
    }
}
