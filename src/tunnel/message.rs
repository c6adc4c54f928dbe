//! Wire protocol: one JSON-encoded [`TunnelMessage`] per WebSocket text frame.
//!
//! Every message carries an `id` (correlation key) and a `type` discriminator.
//! Bodies are standard base64 on the wire and omitted when empty.
//!
//! ```text
//! {"type":"request","id":"r1","method":"GET","path":"/api/health"}
//! {"type":"response","id":"r1","status":200,"body":"b2s="}
//! {"type":"ws_data","id":"s1","ws_message_type":1,"body":"aGVsbG8="}
//! ```

use std::collections::HashMap;
use std::fmt;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Header map as carried on the wire. Multi-valued headers are joined with `", "`.
pub type WireHeaders = HashMap<String, String>;

/// A single tunnel frame. Exactly one variant per message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Manager → agent: execute an HTTP request against the local handler.
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        query: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: WireHeaders,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "body_b64")]
        body: Vec<u8>,
    },
    /// Agent → manager: result of a `Request`.
    Response {
        id: String,
        status: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: WireHeaders,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "body_b64")]
        body: Vec<u8>,
    },
    /// Agent → manager liveness ping.
    Heartbeat { id: String },
    /// Manager → agent reply to a heartbeat, same `id`.
    HeartbeatAck { id: String },
    /// Agent → manager chunk of a one-way stream.
    StreamData {
        id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "body_b64")]
        body: Vec<u8>,
    },
    /// Agent → manager end of a one-way stream.
    StreamEnd { id: String },
    /// Manager → agent: open a local WebSocket and bridge it under `id`.
    WsStart {
        id: String,
        path: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        query: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: WireHeaders,
    },
    /// One WebSocket data message, either direction.
    WsData {
        id: String,
        ws_message_type: WsMessageType,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "body_b64")]
        body: Vec<u8>,
    },
    /// Either side closed the bridged WebSocket.
    WsClose { id: String },
}

/// Payload-free discriminator, used for logging and dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Heartbeat,
    HeartbeatAck,
    StreamData,
    StreamEnd,
    WsStart,
    WsData,
    WsClose,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::StreamData => "stream_data",
            Self::StreamEnd => "stream_end",
            Self::WsStart => "ws_start",
            Self::WsData => "ws_data",
            Self::WsClose => "ws_close",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text/binary discriminator for `ws_data`, encoded as the RFC 6455 opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum WsMessageType {
    Text,
    Binary,
}

impl From<WsMessageType> for u8 {
    fn from(t: WsMessageType) -> Self {
        match t {
            WsMessageType::Text => 1,
            WsMessageType::Binary => 2,
        }
    }
}

impl TryFrom<u8> for WsMessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            other => Err(format!("unsupported ws_message_type {other}")),
        }
    }
}

impl TunnelMessage {
    /// Correlation key of this message.
    pub fn id(&self) -> &str {
        match self {
            Self::Request { id, .. }
            | Self::Response { id, .. }
            | Self::Heartbeat { id }
            | Self::HeartbeatAck { id }
            | Self::StreamData { id, .. }
            | Self::StreamEnd { id }
            | Self::WsStart { id, .. }
            | Self::WsData { id, .. }
            | Self::WsClose { id } => id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request { .. } => MessageKind::Request,
            Self::Response { .. } => MessageKind::Response,
            Self::Heartbeat { .. } => MessageKind::Heartbeat,
            Self::HeartbeatAck { .. } => MessageKind::HeartbeatAck,
            Self::StreamData { .. } => MessageKind::StreamData,
            Self::StreamEnd { .. } => MessageKind::StreamEnd,
            Self::WsStart { .. } => MessageKind::WsStart,
            Self::WsData { .. } => MessageKind::WsData,
            Self::WsClose { .. } => MessageKind::WsClose,
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// A response carrying a plain-text error body.
    pub fn error_response(id: impl Into<String>, status: u16, message: &str) -> Self {
        let mut headers = WireHeaders::new();
        headers.insert(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        );
        Self::Response {
            id: id.into(),
            status,
            headers,
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn encode(&self) -> Result<String, TunnelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Flatten an HTTP header map for the wire. Non-UTF-8 values are skipped.
pub fn headers_to_wire(headers: &HeaderMap) -> WireHeaders {
    let mut out = WireHeaders::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Rebuild an HTTP header map from the wire. Invalid names or values are skipped.
pub fn headers_from_wire(wire: &WireHeaders) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(wire.len());
    for (name, value) in wire {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Base64 (standard alphabet, padded) encoding for byte bodies.
mod body_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn request_wire_shape() {
        let msg = TunnelMessage::Request {
            id: "r1".into(),
            method: "GET".into(),
            path: "/api/health".into(),
            query: String::new(),
            headers: WireHeaders::new(),
            body: Vec::new(),
        };
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({"type": "request", "id": "r1", "method": "GET", "path": "/api/health"})
        );
    }

    #[test]
    fn body_is_base64() {
        let msg = TunnelMessage::Response {
            id: "r1".into(),
            status: 200,
            headers: WireHeaders::new(),
            body: b"ok".to_vec(),
        };
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v["body"], "b2s=");
        assert_eq!(v["status"], 200);
    }

    #[test]
    fn ws_data_uses_opcode() {
        let msg = TunnelMessage::WsData {
            id: "s1".into(),
            ws_message_type: WsMessageType::Binary,
            body: vec![0, 1, 2],
        };
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v["type"], "ws_data");
        assert_eq!(v["ws_message_type"], 2);
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let mut headers = WireHeaders::new();
        headers.insert("x-forwarded-for".into(), "10.0.0.1, 10.0.0.2".into());
        let messages = vec![
            TunnelMessage::Request {
                id: "r1".into(),
                method: "POST".into(),
                path: "/api/containers/abc/start".into(),
                query: "force=true&t=10".into(),
                headers: headers.clone(),
                body: br#"{"x":1}"#.to_vec(),
            },
            TunnelMessage::Response {
                id: "r1".into(),
                status: 204,
                headers: headers.clone(),
                body: Vec::new(),
            },
            TunnelMessage::heartbeat(),
            TunnelMessage::HeartbeatAck { id: "h1".into() },
            TunnelMessage::StreamData {
                id: "s1".into(),
                body: vec![0xff, 0x00, 0x10],
            },
            TunnelMessage::StreamEnd { id: "s1".into() },
            TunnelMessage::WsStart {
                id: "s2".into(),
                path: "/api/containers/abc/logs/ws".into(),
                query: "follow=1".into(),
                headers,
            },
            TunnelMessage::WsData {
                id: "s2".into(),
                ws_message_type: WsMessageType::Text,
                body: b"hello".to_vec(),
            },
            TunnelMessage::WsClose { id: "s2".into() },
        ];
        for msg in messages {
            let decoded = TunnelMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = TunnelMessage::decode(r#"{"type":"bogus","id":"x"}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }

    #[test]
    fn bad_opcode_rejected() {
        let err =
            TunnelMessage::decode(r#"{"type":"ws_data","id":"s","ws_message_type":9}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }

    #[test]
    fn multi_valued_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-one", HeaderValue::from_static("1"));
        let wire = headers_to_wire(&headers);
        assert_eq!(wire["accept"], "text/html, application/json");
        assert_eq!(wire["x-one"], "1");

        let back = headers_from_wire(&wire);
        assert_eq!(back["x-one"], "1");
        assert_eq!(back["accept"], "text/html, application/json");
    }

    #[test]
    fn kind_and_id() {
        let msg = TunnelMessage::WsClose { id: "s9".into() };
        assert_eq!(msg.kind(), MessageKind::WsClose);
        assert_eq!(msg.kind().as_str(), "ws_close");
        assert_eq!(msg.id(), "s9");
    }
}
