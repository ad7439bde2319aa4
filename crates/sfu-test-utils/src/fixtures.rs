//! Pre-built client-side media parameters.

use common::media::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
};
use serde_json::Value;
use std::collections::HashMap;

/// Capabilities of a browser that receives opus and VP8.
#[must_use]
pub fn client_rtp_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability::audio("audio/opus", 48000, 2),
            RtpCodecCapability::video("video/VP8", 90000),
        ],
        header_extensions: Vec::new(),
    }
}

/// Capabilities of a client that can only receive audio.
#[must_use]
pub fn audio_only_rtp_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability::audio("audio/opus", 48000, 2)],
        header_extensions: Vec::new(),
    }
}

fn rtp_parameters(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>, ssrc: u32) -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: serde_json::Map::new(),
            rtcp_feedback: Vec::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("test-cname".to_string()),
            reduced_size: true,
        },
    }
}

/// Send parameters for a VP8 track.
#[must_use]
pub fn vp8_rtp_parameters(ssrc: u32) -> RtpParameters {
    rtp_parameters("video/VP8", 96, 90000, None, ssrc)
}

/// Send parameters for an opus track.
#[must_use]
pub fn opus_rtp_parameters(ssrc: u32) -> RtpParameters {
    rtp_parameters("audio/opus", 111, 48000, Some(2), ssrc)
}

/// Send parameters for a codec the default router does not offer.
#[must_use]
pub fn h264_rtp_parameters(ssrc: u32) -> RtpParameters {
    rtp_parameters("video/H264", 102, 90000, None, ssrc)
}

/// Parameters for `kind` using the default codecs.
#[must_use]
pub fn rtp_parameters_for(kind: MediaKind, ssrc: u32) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_rtp_parameters(ssrc),
        MediaKind::Video => vp8_rtp_parameters(ssrc),
    }
}

/// Remote DTLS parameters as a browser would send them.
#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD"
                .to_string(),
        }],
    }
}

/// Serialize a fixture for a request payload.
///
/// # Panics
///
/// Panics if the value cannot be serialized.
#[must_use]
pub fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("fixture serializes")
}

/// Environment for a test service: a private port range and no surprises.
#[must_use]
pub fn test_config_vars(rtc_min_port: u16, rtc_max_port: u16) -> HashMap<String, String> {
    HashMap::from([
        ("SFU_SIGNALING_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("SFU_HEALTH_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("SFU_ID".to_string(), "sfu-test".to_string()),
        ("SFU_RTC_MIN_PORT".to_string(), rtc_min_port.to_string()),
        ("SFU_RTC_MAX_PORT".to_string(), rtc_max_port.to_string()),
        ("SFU_LISTEN_IP".to_string(), "127.0.0.1".to_string()),
        ("SFU_ANNOUNCED_IP".to_string(), String::new()),
        ("SFU_WORKER_RESPAWN_BACKOFF_MS".to_string(), "10".to_string()),
    ])
}
