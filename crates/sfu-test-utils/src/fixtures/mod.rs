//! Pre-configured test data fixtures for signaling tests.
//!
//! Provides:
//! - RTP parameters as a browser would send them (VP8, Opus, no codecs)
//! - DTLS parameters for `connectTransport`
//! - Router capabilities matching the default router codecs
//! - Wire request helpers for the WebSocket channel

use media_engine::{
    DtlsFingerprint, DtlsParameters, EngineConfig, RouterCapabilities, RtpCodecParameters,
    RtpParameters,
};
use serde_json::{json, Map, Value};

/// VP8 video RTP parameters with a single encoding.
#[must_use]
pub fn vp8_rtp_parameters() -> RtpParameters {
    let mut parameters = Map::new();
    parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            parameters,
            rtcp_feedback: vec![json!({ "type": "nack" }), json!({ "type": "goog-remb" })],
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({ "ssrc": 111_111 })],
        rtcp: Some(json!({ "cname": "test-client" })),
    }
}

/// Opus audio RTP parameters with a single encoding.
#[must_use]
pub fn opus_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({ "ssrc": 222_222 })],
        rtcp: Some(json!({ "cname": "test-client" })),
    }
}

/// RTP parameters with an empty codec list.
#[must_use]
pub fn empty_rtp_parameters() -> RtpParameters {
    RtpParameters::default()
}

/// Client DTLS parameters with one SHA-256 fingerprint.
#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some("client".to_string()),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD".to_string(),
        }],
    }
}

/// Router capabilities matching the default router codecs (Opus + VP8).
#[must_use]
pub fn router_capabilities() -> RouterCapabilities {
    RouterCapabilities {
        codecs: EngineConfig::default().media_codecs,
        header_extensions: Vec::new(),
    }
}

/// A JSON request frame for the signaling channel.
#[must_use]
pub fn request_frame(id: u64, event: &str, data: Value) -> String {
    json!({ "id": id, "event": event, "data": data }).to_string()
}
