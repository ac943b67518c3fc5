#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::error::SessionError;
use crate::media::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room and allocate this peer's transport
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    /// Complete the DTLS handshake of the peer's transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport { dtls_parameters: DtlsParameters },
    /// Publish a stream into the room
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Subscribe to the room's producer
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },
    /// Tear down the transport but keep the connection
    LeaveRoom,
}

impl ClientMessage {
    /// Wire name of the request, echoed in acks and errors
    pub fn request_type(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume-consumer",
            ClientMessage::PauseConsumer { .. } => "pause-consumer",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::LeaveRoom => "leave-room",
        }
    }
}

/// A frame that could not be turned into a [`ClientMessage`]
#[derive(Debug)]
pub struct DecodeError {
    /// The frame's `type` field when it was readable
    pub request: Option<String>,
    pub error: SessionError,
}

/// Parses one text frame. Errors name the request type whenever the frame
/// was at least a JSON object with a string `type`.
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError {
        request: None,
        error: SessionError::Validation(format!("malformed JSON: {e}")),
    })?;
    let request = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);
    serde_json::from_value(value).map_err(|e| DecodeError {
        request,
        error: SessionError::Validation(format!("invalid message: {e}")),
    })
}

/// Server-to-Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to join-room
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        router_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ProducerCreated { producer_id: String },
    /// Another peer started publishing
    #[serde(rename_all = "camelCase")]
    NewProducer { producer_id: String, kind: MediaKind },
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// A producer went away; `consumer_ids` are the recipient's consumers
    /// that were closed with it
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        consumer_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    TransportClosed { transport_id: String, reason: String },
    /// The media engine died; every session is gone
    #[serde(rename_all = "camelCase")]
    EngineFailed { message: String },
    #[serde(rename_all = "camelCase")]
    Ack { request: String },
    #[serde(rename_all = "camelCase")]
    Error {
        request: Option<String>,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn ack(request: &str) -> Self {
        ServerMessage::Ack {
            request: request.to_string(),
        }
    }

    pub fn error(request: Option<&str>, error: &SessionError) -> Self {
        ServerMessage::Error {
            request: request.map(str::to_string),
            code: error.code().as_str().to_string(),
            message: error.to_string(),
        }
    }
}
