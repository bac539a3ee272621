//! Wire protocol of the signaling channel.
//!
//! Every frame is a JSON text message with camelCase field names.
//!
//! ```text
//! client -> server  { "id": 7, "event": "createProducer", "data": { ... } }
//! server -> client  { "id": 7, "ok": true, "data": { "id": "..." } }
//!                   { "id": 7, "ok": false, "error": { "code": "...", "message": "..." } }
//!                   { "notification": "producerClosed", "data": { ... } }
//! ```

use crate::config::check_transport_options;
use crate::errors::SignalingError;

use common::types::{ConsumerId, ProducerId};
use media_engine::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RouterCapabilities, RtpParameters,
    WebRtcTransportOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
pub const EVENT_CREATE_TRANSPORT: &str = "createTransport";
pub const EVENT_CONNECT_TRANSPORT: &str = "connectTransport";
pub const EVENT_CREATE_PRODUCER: &str = "createProducer";
pub const EVENT_CREATE_CONSUMER: &str = "createConsumer";

/// Raw request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Per-request override of the configured transport network options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub enable_udp: Option<bool>,
    pub enable_tcp: Option<bool>,
    pub prefer_udp: Option<bool>,
    pub prefer_tcp: Option<bool>,
}

impl NetworkPolicy {
    /// Apply this policy on top of the configured defaults.
    ///
    /// Preferences the client left unset are dropped when they would conflict
    /// with what the client did set.
    pub fn resolve(
        &self,
        defaults: &WebRtcTransportOptions,
    ) -> Result<WebRtcTransportOptions, SignalingError> {
        let enable_udp = self.enable_udp.unwrap_or(defaults.enable_udp);
        let enable_tcp = self.enable_tcp.unwrap_or(defaults.enable_tcp);

        let prefer_udp = match self.prefer_udp {
            Some(prefer) => prefer,
            None => defaults.prefer_udp && enable_udp && self.prefer_tcp != Some(true),
        };
        let prefer_tcp = match self.prefer_tcp {
            Some(prefer) => prefer,
            None => defaults.prefer_tcp && enable_tcp && self.prefer_udp != Some(true),
        };

        let options = WebRtcTransportOptions {
            listen_ip: defaults.listen_ip,
            announced_address: defaults.announced_address.clone(),
            enable_udp,
            enable_tcp,
            prefer_udp,
            prefer_tcp,
        };
        check_transport_options(&options).map_err(SignalingError::InvalidNetworkPolicy)?;
        Ok(options)
    }
}

/// A decoded signaling request.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingRequest {
    GetRouterRtpCapabilities,
    CreateTransport {
        network_policy: NetworkPolicy,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    CreateProducer {
        transport_id: String,
        /// Validated by the handler so a bad kind is an RTP parameter error.
        kind: String,
        rtp_parameters: RtpParameters,
    },
    CreateConsumer {
        producer_id: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    transport_id: String,
    dtls_parameters: DtlsParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProducerData {
    transport_id: String,
    kind: String,
    rtp_parameters: RtpParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConsumerData {
    #[serde(default)]
    producer_id: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, SignalingError> {
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| SignalingError::MalformedRequest(format!("{event}: {e}")))
}

impl SignalingRequest {
    /// Decode the event-specific payload of an envelope.
    pub fn from_envelope(event: &str, data: Value) -> Result<Self, SignalingError> {
        match event {
            EVENT_GET_ROUTER_RTP_CAPABILITIES => Ok(SignalingRequest::GetRouterRtpCapabilities),
            EVENT_CREATE_TRANSPORT => Ok(SignalingRequest::CreateTransport {
                network_policy: decode(event, data)?,
            }),
            EVENT_CONNECT_TRANSPORT => {
                let data: ConnectTransportData = decode(event, data)?;
                Ok(SignalingRequest::ConnectTransport {
                    transport_id: data.transport_id,
                    dtls_parameters: data.dtls_parameters,
                })
            }
            EVENT_CREATE_PRODUCER => {
                let data: CreateProducerData = decode(event, data)?;
                Ok(SignalingRequest::CreateProducer {
                    transport_id: data.transport_id,
                    kind: data.kind,
                    rtp_parameters: data.rtp_parameters,
                })
            }
            EVENT_CREATE_CONSUMER => {
                let data: CreateConsumerData = decode(event, data)?;
                Ok(SignalingRequest::CreateConsumer {
                    producer_id: data.producer_id,
                })
            }
            other => Err(SignalingError::UnknownEvent(other.to_string())),
        }
    }

    /// Event name, used as a bounded metric label.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            SignalingRequest::GetRouterRtpCapabilities => EVENT_GET_ROUTER_RTP_CAPABILITIES,
            SignalingRequest::CreateTransport { .. } => EVENT_CREATE_TRANSPORT,
            SignalingRequest::ConnectTransport { .. } => EVENT_CONNECT_TRANSPORT,
            SignalingRequest::CreateProducer { .. } => EVENT_CREATE_PRODUCER,
            SignalingRequest::CreateConsumer { .. } => EVENT_CREATE_CONSUMER,
        }
    }
}

/// A frame read from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Request {
        id: u64,
        request: SignalingRequest,
    },
    /// A frame that could not be decoded. Answered with an error response,
    /// echoing the id when one could be read.
    Invalid {
        id: Option<u64>,
        error: SignalingError,
    },
}

impl InboundFrame {
    /// The request id to echo in the response, when one could be read.
    #[must_use]
    pub const fn request_id(&self) -> Option<u64> {
        match self {
            InboundFrame::Request { id, .. } => Some(*id),
            InboundFrame::Invalid { id, .. } => *id,
        }
    }
}

/// Decode a text frame. Never fails: undecodable frames become `Invalid`.
#[must_use]
pub fn parse_frame(text: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return InboundFrame::Invalid {
                id: None,
                error: SignalingError::MalformedRequest(format!("invalid JSON: {e}")),
            };
        }
    };

    let id = value.get("id").and_then(Value::as_u64);
    let envelope: RequestEnvelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => {
            return InboundFrame::Invalid {
                id,
                error: SignalingError::MalformedRequest(format!("invalid envelope: {e}")),
            };
        }
    };

    match SignalingRequest::from_envelope(&envelope.event, envelope.data) {
        Ok(request) => InboundFrame::Request {
            id: envelope.id,
            request,
        },
        Err(error) => InboundFrame::Invalid {
            id: Some(envelope.id),
            error,
        },
    }
}

/// Server-side transport description returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalingResponse {
    RouterCapabilities(RouterCapabilities),
    TransportCreated(TransportInfo),
    TransportConnected {
        connected: bool,
    },
    ProducerCreated {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        transport: TransportInfo,
    },
}

/// `{ code, message }` failure payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&SignalingError> for ErrorBody {
    fn from(error: &SignalingError) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.client_message(),
        }
    }
}

/// Response to one request, on the same exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SignalingResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn from_result(id: Option<u64>, result: Result<SignalingResponse, SignalingError>) -> Self {
        match result {
            Ok(data) => Self {
                id,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                id,
                ok: false,
                data: None,
                error: Some(ErrorBody::from(&error)),
            },
        }
    }
}

/// Server-initiated notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notification", content = "data", rename_all = "camelCase")]
pub enum Notification {
    /// The producer a consumer was reading from went away.
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    },
}

/// Anything the server writes to the channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    Notification(Notification),
}
