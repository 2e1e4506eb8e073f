//! Wire protocol: envelopes and typed payloads.
//!
//! Every message on the wire is one `Envelope` serialized as a single
//! JSON line. The envelope header identifies the sender; the `data`
//! object carries a kind-specific payload. Payload structs keep
//! unknown fields via `#[serde(flatten)]` so peers can forward data
//! they do not understand.

pub mod codec;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default broker TCP port (loopback).
pub const DEFAULT_PORT: u16 = 8765;

/// Client id used on envelopes the broker synthesizes itself.
pub const BROKER_CLIENT_ID: &str = "broker";

/// Envelope kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Register,
    Sync,
    Heartbeat,
    Clarification,
    Yap,
    Response,
    Error,
}

/// Session role, fixed at registration.
///
/// Producers (agent processes) send clarifications and yaps; consumers
/// (terminal processes) receive them and send responses. The wire
/// names come from the original deployment shape: producers register
/// as `"mcp-server"`, consumers as `"cli"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "mcp-server")]
    Producer,
    #[serde(rename = "cli")]
    Consumer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "mcp-server",
            Role::Consumer => "cli",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clarification urgency, opaque to routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Clarification lifecycle status.
///
/// Transitions only pending -> active -> (answered | timeout); a
/// terminal status is never revisited. A queued request is pending,
/// the one shown to the human is active, and a terminal status on a
/// delivered clarification is a dismissal cue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Active,
    Answered,
    Timeout,
}

/// The outermost framed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientType")]
    pub client_type: Role,
    /// Sender wall clock, milliseconds since epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: Kind, client_id: &str, client_type: Role, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            client_id: client_id.to_string(),
            client_type,
            timestamp: now_ms(),
            sequence: None,
            data,
        }
    }

    /// Envelope with a serializable payload as `data`.
    pub fn with_payload<T: Serialize>(
        kind: Kind,
        client_id: &str,
        client_type: Role,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, client_id, client_type, serde_json::to_value(payload)?))
    }

    /// Envelope originated by the broker itself.
    pub fn broker(kind: Kind, data: Value) -> Self {
        Self::new(kind, BROKER_CLIENT_ID, Role::Consumer, data)
    }

    /// Decode `data` into a typed payload.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Clarification request payload (producer -> broker -> consumer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClarificationPayload {
    pub id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub urgency: Urgency,
    pub timestamp: u64,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClarificationPayload {
    pub fn new(id: &str, question: &str, urgency: Urgency) -> Self {
        Self {
            id: id.to_string(),
            question: question.to_string(),
            context: None,
            urgency,
            timestamp: now_ms(),
            status: RequestStatus::Pending,
            response: None,
            extra: Map::new(),
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }
}

/// Yap payload (producer -> broker -> consumers). One-way; the mode
/// and category tags are opaque to routing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct YapPayload {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_context: Option<String>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl YapPayload {
    pub fn new(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            message: message.to_string(),
            mode: None,
            category: None,
            task_context: None,
            timestamp: now_ms(),
            extra: Map::new(),
        }
    }
}

/// Producer-bound response payload. `response` is null when `error`
/// explains a routing failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "cliId", default, skip_serializing_if = "Option::is_none")]
    pub cli_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsePayload {
    pub fn answered(request_id: &str, response: Value, cli_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            response,
            error: None,
            cli_id: Some(cli_id.to_string()),
            extra: Map::new(),
        }
    }

    pub fn failed(request_id: &str, error: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            response: Value::Null,
            error: Some(error.to_string()),
            cli_id: None,
            extra: Map::new(),
        }
    }
}

/// Consumer reply payload (consumer -> broker).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub response: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReplyPayload {
    pub fn new(request_id: &str, response: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            response,
            extra: Map::new(),
        }
    }
}

/// Error payload. The broker closes the connection only when the
/// error concerns registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Registration acknowledgement payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub status: String,
}

impl SyncPayload {
    pub fn registered() -> Self {
        Self {
            status: "registered".to_string(),
        }
    }
}

/// Current wall time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let payload = ClarificationPayload::new("q1", "deploy to prod?", Urgency::High)
            .with_context("release checklist step 4");
        let envelope =
            Envelope::with_payload(Kind::Clarification, "agent-1", Role::Producer, &payload)
                .unwrap();

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, Kind::Clarification);
        assert_eq!(parsed.client_id, "agent-1");
        assert_eq!(parsed.client_type, Role::Producer);
        let back: ClarificationPayload = parsed.decode_data().unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(
            serde_json::to_string(&Role::Producer).unwrap(),
            "\"mcp-server\""
        );
        assert_eq!(serde_json::to_string(&Role::Consumer).unwrap(), "\"cli\"");
    }

    #[test]
    fn kind_wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&Kind::Clarification).unwrap(),
            "\"clarification\""
        );
        assert_eq!(serde_json::to_string(&Kind::Register).unwrap(), "\"register\"");
    }

    #[test]
    fn unknown_data_fields_are_preserved() {
        let json = r#"{"id":"y1","message":"done","timestamp":1000,"trace_id":"abc"}"#;
        let payload: YapPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.extra["trace_id"], "abc");

        let out = serde_json::to_value(&payload).unwrap();
        assert_eq!(out["trace_id"], "abc");
    }

    #[test]
    fn sequence_is_omitted_when_absent() {
        let envelope = Envelope::new(Kind::Heartbeat, "c1", Role::Consumer, Value::Null);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("sequence"));
    }

    #[test]
    fn response_payload_null_response_with_error() {
        let payload = ResponsePayload::failed("q9", "No CLI clients available");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["requestId"], "q9");
        assert!(json["response"].is_null());
        assert_eq!(json["error"], "No CLI clients available");
    }
}
