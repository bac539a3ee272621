//! Negotiation types exchanged between clients, the signaling service and the
//! media engine.
//!
//! These mirror the ORTC-style JSON shapes browsers send (camelCase on the
//! wire). Fields the signaling layer never inspects are kept as raw JSON so
//! they pass through to the engine untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as the lowercase wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not `audio` or `video`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMediaKind(pub String);

impl fmt::Display for UnknownMediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown media kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownMediaKind {}

impl FromStr for MediaKind {
    type Err = UnknownMediaKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(UnknownMediaKind(other.to_string())),
        }
    }
}

/// A codec the router supports.
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
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Opus, 48 kHz stereo.
    #[must_use]
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    /// VP8 at 90 kHz with a 1000 kbps start bitrate hint.
    #[must_use]
    pub fn vp8() -> Self {
        let mut parameters = Map::new();
        parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters,
            rtcp_feedback: Vec::new(),
        }
    }
}

/// Process-wide description of what the router supports.
///
/// Produced once by [`crate::MediaEngine::initialize`] and shared read-only
/// by every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// Codec entry inside [`RtpParameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

/// RTP send/receive parameters of a producer or consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

/// ICE parameters of a server-side transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// A server-side ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// A DTLS certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of either side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Network options for a new WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    /// Local IP the transport listens on.
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates (behind NAT).
    pub announced_address: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            prefer_tcp: false,
        }
    }
}

/// Engine-wide settings handed to [`crate::MediaEngine::initialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Lowest RTC port the engine may bind.
    pub rtc_min_port: u16,
    /// Highest RTC port the engine may bind.
    pub rtc_max_port: u16,
    /// Codecs the router is created with.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 10_000,
            rtc_max_port: 10_100,
            media_codecs: vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()],
        }
    }
}
