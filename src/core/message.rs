//! # Message Envelope
//!
//! The wire unit of the link protocol. Every frame is one [`Envelope`]:
//!
//! ```text
//! {"seq": int|null, "type": string, "data": object}
//! ```
//!
//! Handshake and heartbeat envelopes have a `null` seq and a typed body
//! ([`HelloData`], [`ReadyData`], ...). Session traffic (`request`, `response`,
//! `responseError`, `event`) is numbered per connection direction, starting at 1, and carries an
//! [`ApplicationData`] body naming the message class and the source/destination addresses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::address::{Address, AddressKind};
use crate::error::{ProtocolError, Result};

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Hello,
    Ready,
    Continue,
    Resume,
    Invalidate,
    Heartbeat,
    Request,
    Response,
    ResponseError,
    Event,
}

impl MessageKind {
    /// Whether this kind is numbered, buffered and replayed by the session
    pub fn is_session_traffic(self) -> bool {
        matches!(
            self,
            MessageKind::Request
                | MessageKind::Response
                | MessageKind::ResponseError
                | MessageKind::Event
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::Ready => "ready",
            MessageKind::Continue => "continue",
            MessageKind::Resume => "resume",
            MessageKind::Invalidate => "invalidate",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::ResponseError => "responseError",
            MessageKind::Event => "event",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: Option<u64>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an unnumbered envelope from a typed body
    pub fn control<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self> {
        Ok(Self {
            seq: None,
            kind,
            data: serde_json::to_value(body)?,
        })
    }

    pub fn hello(body: &HelloData) -> Result<Self> {
        Self::control(MessageKind::Hello, body)
    }

    pub fn ready(body: &ReadyData) -> Result<Self> {
        Self::control(MessageKind::Ready, body)
    }

    pub fn resume(body: &ResumeData) -> Result<Self> {
        Self::control(MessageKind::Resume, body)
    }

    pub fn continue_session(body: &ContinueData) -> Result<Self> {
        Self::control(MessageKind::Continue, body)
    }

    pub fn invalidate() -> Self {
        Self {
            seq: None,
            kind: MessageKind::Invalidate,
            data: Value::Object(Default::default()),
        }
    }

    pub fn heartbeat(last_received: u64) -> Self {
        Self {
            seq: None,
            kind: MessageKind::Heartbeat,
            data: serde_json::json!({ "seq": last_received }),
        }
    }

    /// Decode the body, mapping any mismatch to a schema violation
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| {
            ProtocolError::SchemaViolation(format!("invalid {} body: {e}", self.kind))
        })
    }

    /// Decode the body, insisting on the envelope kind first
    pub fn expect<T: DeserializeOwned>(&self, kind: MessageKind) -> Result<T> {
        if self.kind != kind {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected {kind}, got {}",
                self.kind
            )));
        }
        self.decode()
    }
}

/// What an initiator registers as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Registration {
    Host { id: u32 },
    Instance { id: u32 },
    Control,
}

impl Registration {
    pub fn kind(&self) -> AddressKind {
        match self {
            Registration::Host { .. } => AddressKind::Host,
            Registration::Instance { .. } => AddressKind::Instance,
            Registration::Control => AddressKind::Control,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloData {
    pub version: String,
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
    pub registration: Registration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyData {
    pub address: Address,
    pub session_token: String,
    /// Milliseconds the acceptor keeps the session while the socket is down
    pub session_timeout: u64,
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub session_token: String,
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueData {
    pub last_seq: u64,
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub seq: u64,
}

/// Body of every session-traffic envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationData {
    pub src: Address,
    pub dst: Address,
    pub name: String,
    /// Seq the originating link assigned to the request; copied into its response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl ApplicationData {
    /// Response body answering `self`
    pub fn reply(&self, data: Value) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            name: self.name.clone(),
            request_id: self.request_id,
            data,
        }
    }

    /// `responseError` body answering `self`
    pub fn reply_error(&self, message: impl fmt::Display) -> Self {
        self.reply(serde_json::json!({ "message": message.to_string() }))
    }
}

/// Payload of a `responseError`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let env = Envelope::heartbeat(41);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json, json!({"seq": null, "type": "heartbeat", "data": {"seq": 41}}));
    }

    #[test]
    fn test_response_error_tag() {
        let env = Envelope {
            seq: Some(3),
            kind: MessageKind::ResponseError,
            data: json!({}),
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"responseError\""));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let parsed = serde_json::from_value::<Envelope>(json!({"seq": 1, "type": "ack", "data": {}}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_decode_reports_schema_violation() {
        let env = Envelope {
            seq: None,
            kind: MessageKind::Ready,
            data: json!({"address": {"kind": "host", "id": 1}}),
        };
        match env.decode::<ReadyData>() {
            Err(ProtocolError::SchemaViolation(msg)) => assert!(msg.contains("ready")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_expect_checks_kind() {
        let env = Envelope::invalidate();
        assert!(matches!(
            env.expect::<ReadyData>(MessageKind::Ready),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_registration_shape() {
        let hello = HelloData {
            version: "2.0.0".into(),
            plugins: BTreeMap::from([("inventory".to_string(), "1.2.0".to_string())]),
            registration: Registration::Host { id: 5 },
            token: None,
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["registration"], json!({"kind": "host", "id": 5}));
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let request = ApplicationData {
            src: Address::control(2),
            dst: Address::host(9),
            name: "get_status".into(),
            request_id: Some(17),
            data: json!({}),
        };
        let reply = request.reply_error("host 9 is offline");
        assert_eq!(reply.src, Address::host(9));
        assert_eq!(reply.dst, Address::control(2));
        assert_eq!(reply.request_id, Some(17));
        assert_eq!(reply.data, json!({"message": "host 9 is offline"}));
    }
}
