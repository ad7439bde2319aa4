//! RTP, ICE and DTLS parameter types.
//!
//! These mirror the JSON shapes exchanged with WebRTC clients (camelCase
//! field names) and are passed unchanged to the media engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Codec-specific parameters (`fmtp` style key/value pairs).
pub type CodecParameters = serde_json::Map<String, serde_json::Value>;

/// Media kind of a codec, producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as it appears on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Derive the kind from a mime type such as `video/VP8`.
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (kind, _) = mime_type.split_once('/')?;
        if kind.eq_ignore_ascii_case("audio") {
            Some(MediaKind::Audio)
        } else if kind.eq_ignore_ascii_case("video") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTCP feedback mechanism supported by a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    #[must_use]
    pub fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// A codec the router (or a remote endpoint) is able to send or receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: CodecParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// An audio codec capability, e.g. `audio/opus` at 48000 Hz with 2 channels.
    #[must_use]
    pub fn audio(mime_type: &str, clock_rate: u32, channels: u8) -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: mime_type.to_string(),
            preferred_payload_type: None,
            clock_rate,
            channels: Some(channels),
            parameters: CodecParameters::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    /// A video codec capability, e.g. `video/VP8` at 90000 Hz.
    #[must_use]
    pub fn video(mime_type: &str, clock_rate: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: mime_type.to_string(),
            preferred_payload_type: None,
            clock_rate,
            channels: None,
            parameters: CodecParameters::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    /// Add a codec-specific parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Set the preferred payload type.
    #[must_use]
    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.preferred_payload_type = Some(payload_type);
        self
    }

    /// Add an RTCP feedback entry.
    #[must_use]
    pub fn with_feedback(mut self, kind: &str, parameter: &str) -> Self {
        self.rtcp_feedback.push(RtcpFeedback::new(kind, parameter));
        self
    }
}

/// An RTP header extension supported by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
    pub preferred_id: u8,
    #[serde(default)]
    pub preferred_encrypt: bool,
}

/// The full set of codecs and header extensions an endpoint supports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Whether any codec of the given kind is present.
    #[must_use]
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|codec| codec.kind == kind)
    }
}

/// A negotiated codec inside [`RtpParameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: CodecParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// A negotiated RTP header extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
    #[serde(default)]
    pub encrypt: bool,
}

/// Retransmission stream of an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

/// One RTP stream (simulcast layer or single encoding).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
}

/// RTCP settings of an RTP session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
}

fn default_reduced_size() -> bool {
    true
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
        }
    }
}

/// Parameters describing what a producer sends or a consumer receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

/// ICE credentials of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Local ICE candidate of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: TransportProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// DTLS role of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

/// Certificate fingerprint advertised in DTLS parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of a transport (local) or of the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_from_mime_type() {
        assert_eq!(MediaKind::from_mime_type("audio/opus"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_mime_type("Video/VP8"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime_type("application/data"), None);
        assert_eq!(MediaKind::from_mime_type("opus"), None);
    }

    #[test]
    fn test_codec_capability_wire_format() {
        let codec = RtpCodecCapability::video("video/VP8", 90000)
            .with_parameter("x-google-start-bitrate", 1000)
            .with_payload_type(101);

        let value = serde_json::to_value(&codec).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": { "x-google-start-bitrate": 1000 }
            })
        );
    }

    #[test]
    fn test_rtp_parameters_defaults_on_decode() {
        let params: RtpParameters = serde_json::from_value(json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }]
        }))
        .unwrap();

        assert!(params.mid.is_none());
        assert!(params.encodings.is_empty());
        assert!(params.rtcp.reduced_size);
        assert_eq!(params.codecs[0].payload_type, 111);
    }

    #[test]
    fn test_dtls_parameters_role_defaults_to_auto() {
        let params: DtlsParameters = serde_json::from_value(json!({
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
        }))
        .unwrap();

        assert_eq!(params.role, DtlsRole::Auto);
        assert_eq!(params.fingerprints.len(), 1);
    }

    #[test]
    fn test_ice_candidate_type_field_name() {
        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1,
            ip: "127.0.0.1".to_string(),
            protocol: TransportProtocol::Udp,
            port: 2000,
            candidate_type: "host".to_string(),
            tcp_type: None,
        };

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["type"], "host");
        assert_eq!(value["protocol"], "udp");
        assert!(value.get("tcpType").is_none());
    }
}
