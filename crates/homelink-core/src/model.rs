//! Wire-level and session data model: identifiers, requests, phases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A 64-bit correlation identifier assigned to every outbound command except
/// the initial `auth` frame.
pub type Identifier = u64;

/// A command awaiting transmission or already sent, described independently
/// of its transport framing.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: String,
    pub payload: Value,
    /// Whether this request may be silently replayed after a reconnect.
    pub should_retry: bool,
}

impl Request {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            should_retry: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.should_retry = true;
        self
    }

    /// Serializes this request as the JSON object written to the wire, given
    /// the identifier the controller allocated for it.
    pub fn to_wire(&self, id: Identifier) -> Value {
        let mut obj = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        obj.insert("id".to_string(), Value::from(id));
        obj.insert("type".to_string(), Value::String(self.kind.clone()));
        Value::Object(obj)
    }
}

/// Server-reported failure attached to a `result` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// The authentication sub-states exchanged before the session reaches `Command`.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Required,
    Ok { server_version: String },
    Invalid { message: String },
}

/// The coarse connection lifecycle state, observed by callers via the
/// orchestrator's state stream.
///
/// `Phase` is single-writer: only the response controller constructs new
/// values of it.
#[derive(Debug, Clone)]
pub enum Phase {
    Disconnected {
        error: Option<String>,
        for_reset: bool,
    },
    Authenticating,
    Command {
        server_version: String,
    },
}

impl Phase {
    pub fn initial() -> Self {
        Phase::Disconnected {
            error: None,
            for_reset: true,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Phase::Command { .. })
    }
}

impl PartialEq for Phase {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Phase::Disconnected { error: e1, for_reset: r1 },
                Phase::Disconnected { error: e2, for_reset: r2 },
            ) => r1 == r2 && e1 == e2,
            (Phase::Authenticating, Phase::Authenticating) => true,
            (Phase::Command { server_version: v1 }, Phase::Command { server_version: v2 }) => {
                v1 == v2
            }
            _ => false,
        }
    }
}

/// A parsed inbound WebSocket frame, classified by its `type` field.
#[derive(Debug, Clone)]
pub enum WebSocketResponse {
    Auth(AuthState),
    Event { id: Identifier, data: Value },
    Result {
        id: Identifier,
        outcome: Result<Value, ErrorInfo>,
    },
}

/// A raw wire frame as deserialized directly from JSON, before classification.
#[derive(Debug, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub frame_type: Option<String>,
    pub id: Option<Identifier>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub event: Option<Value>,
    #[serde(default)]
    pub ha_version: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outbound `auth` frame, serialized directly without going through the
/// request controller's identifier allocation.
#[derive(Debug, Serialize)]
pub struct AuthFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub access_token: &'a str,
}

impl<'a> AuthFrame<'a> {
    pub fn new(access_token: &'a str) -> Self {
        Self {
            frame_type: "auth",
            access_token,
        }
    }
}
