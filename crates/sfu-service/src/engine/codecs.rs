//! RTP capability negotiation.
//!
//! A router's capabilities are derived once from the configured media codec
//! list and never change afterwards. Producers are validated against them
//! and rewritten into "consumable" parameters (router payload types), from
//! which per-consumer parameters are derived.

use super::EngineError;
use common::media::{
    CodecParameters, MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension,
    RtpHeaderExtensionParameters, RtpParameters, RtxParameters,
};
use std::collections::HashSet;

const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Codecs every router gets unless configured otherwise.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::audio("audio/opus", 48000, 2),
        RtpCodecCapability::video("video/VP8", 90000).with_parameter("x-google-start-bitrate", 1000),
    ]
}

/// Dynamic payload types in assignment order.
fn dynamic_payload_types() -> impl Iterator<Item = u8> {
    (100..=127).chain(96..=99)
}

/// Whether the mime type names a retransmission codec.
#[must_use]
pub fn is_rtx(mime_type: &str) -> bool {
    mime_type
        .split_once('/')
        .is_some_and(|(_, subtype)| subtype.eq_ignore_ascii_case("rtx"))
}

fn apt_of(parameters: &CodecParameters) -> Option<u8> {
    parameters
        .get("apt")
        .and_then(serde_json::Value::as_u64)
        .and_then(|value| u8::try_from(value).ok())
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn header_extensions(kinds: &HashSet<MediaKind>) -> Vec<RtpHeaderExtension> {
    [
        (MediaKind::Audio, MID_URI, 1),
        (MediaKind::Video, MID_URI, 1),
        (MediaKind::Video, ABS_SEND_TIME_URI, 4),
        (MediaKind::Video, TRANSPORT_CC_URI, 5),
        (MediaKind::Audio, AUDIO_LEVEL_URI, 10),
    ]
    .into_iter()
    .filter(|(kind, _, _)| kinds.contains(kind))
    .map(|(kind, uri, preferred_id)| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
    })
    .collect()
}

fn capability_matches(capability: &RtpCodecCapability, codec: &RtpCodecParameters) -> bool {
    capability.mime_type.eq_ignore_ascii_case(&codec.mime_type)
        && capability.clock_rate == codec.clock_rate
        && capability.channels.unwrap_or(1) == codec.channels.unwrap_or(1)
}

/// Build the router capabilities for a media codec list.
///
/// Assigns dynamic payload types to codecs without a preferred one, adds
/// default RTCP feedback and an RTX codec per video codec.
///
/// # Errors
///
/// Returns `InvalidParameters` for an empty list, a codec whose mime type
/// contradicts its kind, an explicit RTX codec, duplicate preferred payload
/// types, or when the dynamic payload range is exhausted.
pub fn router_rtp_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities, EngineError> {
    if media_codecs.is_empty() {
        return Err(EngineError::InvalidParameters(
            "media codec list is empty".to_string(),
        ));
    }

    let mut preferred = HashSet::new();
    for codec in media_codecs {
        if let Some(payload_type) = codec.preferred_payload_type {
            if !preferred.insert(payload_type) {
                return Err(EngineError::InvalidParameters(format!(
                    "duplicate preferred payload type {payload_type}"
                )));
            }
        }
    }

    let mut free = dynamic_payload_types().filter(|pt| !preferred.contains(pt));
    let mut next_free = || {
        free.next().ok_or_else(|| {
            EngineError::InvalidParameters("no free dynamic payload types".to_string())
        })
    };

    let mut codecs = Vec::with_capacity(media_codecs.len() * 2);
    let mut kinds = HashSet::new();

    for codec in media_codecs {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
            return Err(EngineError::InvalidParameters(format!(
                "mime type {} does not match kind {}",
                codec.mime_type, codec.kind
            )));
        }
        if is_rtx(&codec.mime_type) {
            return Err(EngineError::InvalidParameters(
                "RTX codecs are added automatically".to_string(),
            ));
        }
        if codec.clock_rate == 0 {
            return Err(EngineError::InvalidParameters(format!(
                "codec {} has no clock rate",
                codec.mime_type
            )));
        }

        let payload_type = match codec.preferred_payload_type {
            Some(payload_type) => payload_type,
            None => next_free()?,
        };

        let mut capability = codec.clone();
        capability.preferred_payload_type = Some(payload_type);
        if capability.kind == MediaKind::Audio && capability.channels.is_none() {
            capability.channels = Some(1);
        }
        if capability.rtcp_feedback.is_empty() {
            capability.rtcp_feedback = default_rtcp_feedback(capability.kind);
        }
        kinds.insert(capability.kind);
        codecs.push(capability);

        if codec.kind == MediaKind::Video {
            let rtx = RtpCodecCapability::video("video/rtx", codec.clock_rate)
                .with_parameter("apt", payload_type)
                .with_payload_type(next_free()?);
            codecs.push(rtx);
        }
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: header_extensions(&kinds),
    })
}

/// Validate a producer's parameters against the router and rewrite them
/// into consumable parameters that use the router's payload types.
///
/// # Errors
///
/// Returns `InvalidParameters` when codecs or encodings are missing or a
/// codec contradicts `kind`, and `UnsupportedCodec` when a codec is not in
/// the router capabilities.
pub fn consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_capabilities: &RtpCapabilities,
) -> Result<RtpParameters, EngineError> {
    if rtp_parameters.encodings.is_empty() {
        return Err(EngineError::InvalidParameters(
            "rtpParameters has no encodings".to_string(),
        ));
    }

    let mut codecs = Vec::new();
    for codec in rtp_parameters
        .codecs
        .iter()
        .filter(|codec| !is_rtx(&codec.mime_type))
    {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
            return Err(EngineError::InvalidParameters(format!(
                "codec {} does not match kind {kind}",
                codec.mime_type
            )));
        }

        let router_codec = router_capabilities
            .codecs
            .iter()
            .find(|capability| !is_rtx(&capability.mime_type) && capability_matches(capability, codec))
            .ok_or_else(|| {
                EngineError::UnsupportedCodec(format!(
                    "{}/{} is not supported by the router",
                    codec.mime_type, codec.clock_rate
                ))
            })?;
        let payload_type = router_codec.preferred_payload_type.ok_or_else(|| {
            EngineError::InvalidParameters("router codec has no payload type".to_string())
        })?;

        codecs.push(RtpCodecParameters {
            mime_type: router_codec.mime_type.clone(),
            payload_type,
            clock_rate: router_codec.clock_rate,
            channels: router_codec.channels,
            parameters: codec.parameters.clone(),
            rtcp_feedback: router_codec.rtcp_feedback.clone(),
        });

        let rtx = router_capabilities.codecs.iter().find(|capability| {
            is_rtx(&capability.mime_type) && apt_of(&capability.parameters) == Some(payload_type)
        });
        if let Some(rtx) = rtx {
            if let Some(rtx_payload_type) = rtx.preferred_payload_type {
                codecs.push(RtpCodecParameters {
                    mime_type: rtx.mime_type.clone(),
                    payload_type: rtx_payload_type,
                    clock_rate: rtx.clock_rate,
                    channels: None,
                    parameters: rtx.parameters.clone(),
                    rtcp_feedback: Vec::new(),
                });
            }
        }
    }

    if codecs.is_empty() {
        return Err(EngineError::InvalidParameters(
            "rtpParameters has no media codecs".to_string(),
        ));
    }

    let header_extensions = router_capabilities
        .header_extensions
        .iter()
        .filter(|ext| ext.kind == kind)
        .map(|ext| RtpHeaderExtensionParameters {
            uri: ext.uri.clone(),
            id: ext.preferred_id,
            encrypt: false,
        })
        .collect();

    let encodings = rtp_parameters
        .encodings
        .iter()
        .map(|encoding| RtpEncodingParameters {
            ssrc: None,
            rid: encoding.rid.clone(),
            rtx: None,
            max_bitrate: encoding.max_bitrate,
            scalability_mode: encoding.scalability_mode.clone(),
        })
        .collect();

    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings,
        rtcp: RtcpParameters {
            cname: rtp_parameters.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

/// Whether an endpoint with `capabilities` can receive a producer.
#[must_use]
pub fn can_consume(consumable: &RtpParameters, capabilities: &RtpCapabilities) -> bool {
    consumable
        .codecs
        .iter()
        .filter(|codec| !is_rtx(&codec.mime_type))
        .any(|codec| {
            capabilities
                .codecs
                .iter()
                .any(|capability| !is_rtx(&capability.mime_type) && capability_matches(capability, codec))
        })
}

/// Derive the parameters a consumer receives.
///
/// Keeps the first producer codec the endpoint supports (plus its RTX codec
/// when the endpoint supports RTX), intersects RTCP feedback and header
/// extensions, and assigns fresh SSRCs.
///
/// # Errors
///
/// Returns `UnsupportedCodec` if no producer codec is supported.
pub fn consumer_rtp_parameters(
    consumable: &RtpParameters,
    capabilities: &RtpCapabilities,
    mid: &str,
    ssrc: u32,
    rtx_ssrc: u32,
) -> Result<RtpParameters, EngineError> {
    let mut codecs: Vec<RtpCodecParameters> = consumable
        .codecs
        .iter()
        .filter(|codec| !is_rtx(&codec.mime_type))
        .find_map(|codec| {
            let capability = capabilities.codecs.iter().find(|capability| {
                !is_rtx(&capability.mime_type) && capability_matches(capability, codec)
            })?;
            let mut negotiated = codec.clone();
            negotiated
                .rtcp_feedback
                .retain(|feedback| capability.rtcp_feedback.contains(feedback));
            Some(negotiated)
        })
        .into_iter()
        .collect();

    let Some(primary_payload_type) = codecs.first().map(|codec| codec.payload_type) else {
        return Err(EngineError::UnsupportedCodec(
            "no producer codec is supported by the consumer".to_string(),
        ));
    };

    let endpoint_supports_rtx = capabilities
        .codecs
        .iter()
        .any(|capability| is_rtx(&capability.mime_type));
    let rtx_codec = consumable
        .codecs
        .iter()
        .find(|codec| is_rtx(&codec.mime_type) && apt_of(&codec.parameters) == Some(primary_payload_type))
        .filter(|_| endpoint_supports_rtx)
        .cloned();
    let rtx = rtx_codec.is_some().then_some(RtxParameters { ssrc: rtx_ssrc });
    codecs.extend(rtx_codec);

    let header_extensions = consumable
        .header_extensions
        .iter()
        .filter(|ext| {
            capabilities
                .header_extensions
                .iter()
                .any(|supported| supported.uri == ext.uri)
        })
        .cloned()
        .collect();

    let max_bitrate = consumable
        .encodings
        .iter()
        .filter_map(|encoding| encoding.max_bitrate)
        .max();

    Ok(RtpParameters {
        mid: Some(mid.to_string()),
        codecs,
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            rtx,
            max_bitrate,
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: consumable.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn client_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                RtpCodecCapability::audio("audio/opus", 48000, 2)
                    .with_payload_type(111)
                    .with_feedback("transport-cc", ""),
                RtpCodecCapability::video("video/VP8", 90000)
                    .with_payload_type(96)
                    .with_feedback("nack", "")
                    .with_feedback("nack", "pli")
                    .with_feedback("transport-cc", ""),
                RtpCodecCapability::video("video/rtx", 90000)
                    .with_payload_type(97)
                    .with_parameter("apt", 96),
            ],
            header_extensions: vec![RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: MID_URI.to_string(),
                preferred_id: 1,
                preferred_encrypt: false,
            }],
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                max_bitrate: Some(500_000),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("client".to_string()),
                reduced_size: true,
            },
        }
    }

    #[test]
    fn test_default_router_capabilities() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();

        assert_eq!(caps.codecs.len(), 3);
        assert!(caps.has_kind(MediaKind::Audio));
        assert!(caps.has_kind(MediaKind::Video));

        let opus = &caps.codecs[0];
        assert_eq!(opus.mime_type, "audio/opus");
        assert_eq!(opus.preferred_payload_type, Some(100));
        assert_eq!(opus.channels, Some(2));
        assert_eq!(opus.rtcp_feedback, vec![RtcpFeedback::new("transport-cc", "")]);

        let vp8 = &caps.codecs[1];
        assert_eq!(vp8.preferred_payload_type, Some(101));
        assert_eq!(vp8.rtcp_feedback.len(), 5);

        let rtx = &caps.codecs[2];
        assert!(is_rtx(&rtx.mime_type));
        assert_eq!(rtx.preferred_payload_type, Some(102));
        assert_eq!(apt_of(&rtx.parameters), Some(101));

        assert!(caps.header_extensions.iter().any(|ext| ext.uri == MID_URI));
    }

    #[test]
    fn test_preferred_payload_types_are_kept() {
        let codecs = vec![
            RtpCodecCapability::audio("audio/opus", 48000, 2).with_payload_type(100),
            RtpCodecCapability::video("video/VP8", 90000),
        ];
        let caps = router_rtp_capabilities(&codecs).unwrap();

        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        // 100 is taken, so VP8 and its RTX get the next free ones
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert_eq!(caps.codecs[2].preferred_payload_type, Some(102));
    }

    #[test]
    fn test_invalid_media_codecs_rejected() {
        let duplicate = vec![
            RtpCodecCapability::audio("audio/opus", 48000, 2).with_payload_type(100),
            RtpCodecCapability::video("video/VP8", 90000).with_payload_type(100),
        ];
        assert!(router_rtp_capabilities(&duplicate).is_err());

        let wrong_kind = RtpCodecCapability::video("audio/opus", 48000);
        assert!(router_rtp_capabilities(&[wrong_kind]).is_err());

        let rtx = RtpCodecCapability::video("video/rtx", 90000);
        assert!(router_rtp_capabilities(&[rtx]).is_err());

        assert!(router_rtp_capabilities(&[]).is_err());
    }

    #[test]
    fn test_consumable_parameters_use_router_payload_types() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();
        let consumable =
            consumable_rtp_parameters(MediaKind::Video, &vp8_parameters(), &caps).unwrap();

        assert_eq!(consumable.codecs.len(), 2);
        assert_eq!(consumable.codecs[0].payload_type, 101);
        assert!(is_rtx(&consumable.codecs[1].mime_type));
        assert_eq!(consumable.encodings[0].ssrc, None);
        assert_eq!(consumable.encodings[0].max_bitrate, Some(500_000));
        assert_eq!(consumable.rtcp.cname.as_deref(), Some("client"));
    }

    #[test]
    fn test_unsupported_producer_codec_rejected() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();
        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/H264".to_string();

        let result = consumable_rtp_parameters(MediaKind::Video, &params, &caps);
        assert!(matches!(result, Err(EngineError::UnsupportedCodec(_))));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();
        let result = consumable_rtp_parameters(MediaKind::Audio, &vp8_parameters(), &caps);
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));

        let mut no_encodings = vp8_parameters();
        no_encodings.encodings.clear();
        let result = consumable_rtp_parameters(MediaKind::Video, &no_encodings, &caps);
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));
    }

    #[test]
    fn test_can_consume() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();
        let consumable =
            consumable_rtp_parameters(MediaKind::Video, &vp8_parameters(), &caps).unwrap();

        assert!(can_consume(&consumable, &client_capabilities()));

        let audio_only = RtpCapabilities {
            codecs: vec![RtpCodecCapability::audio("audio/opus", 48000, 2)],
            header_extensions: Vec::new(),
        };
        assert!(!can_consume(&consumable, &audio_only));
        assert!(!can_consume(&consumable, &RtpCapabilities::default()));
    }

    #[test]
    fn test_consumer_parameters() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();
        let consumable =
            consumable_rtp_parameters(MediaKind::Video, &vp8_parameters(), &caps).unwrap();

        let params =
            consumer_rtp_parameters(&consumable, &client_capabilities(), "0", 1234, 5678).unwrap();

        assert_eq!(params.mid.as_deref(), Some("0"));
        assert_eq!(params.codecs.len(), 2);
        assert_eq!(params.codecs[0].mime_type, "video/VP8");
        // goog-remb and ccm fir are not in the client capabilities
        assert_eq!(params.codecs[0].rtcp_feedback.len(), 3);
        assert_eq!(params.encodings.len(), 1);
        assert_eq!(params.encodings[0].ssrc, Some(1234));
        assert_eq!(params.encodings[0].rtx, Some(RtxParameters { ssrc: 5678 }));
        assert_eq!(params.header_extensions.len(), 1);
    }

    #[test]
    fn test_consumer_parameters_without_rtx_support() {
        let caps = router_rtp_capabilities(&default_media_codecs()).unwrap();
        let consumable =
            consumable_rtp_parameters(MediaKind::Video, &vp8_parameters(), &caps).unwrap();

        let mut client = client_capabilities();
        client.codecs.retain(|codec| !is_rtx(&codec.mime_type));

        let params = consumer_rtp_parameters(&consumable, &client, "1", 1, 2).unwrap();
        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.encodings[0].rtx, None);
    }
}
