// Envelope types for the gateway <-> backend worker protocol.
//
// Framing is one JSON object per line. Both directions share the same
// shape: `{"request_id": string, "action": string, "params": object}`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form JSON object carried in every envelope.
pub type Params = Map<String, Value>;

/// A single protocol message, tagged by an action and correlated by
/// `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<A> {
    pub request_id: String,
    pub action: A,
    #[serde(default, deserialize_with = "params_or_empty")]
    pub params: Params,
}

/// Gateway -> backend.
pub type BackendEnvelope = Envelope<BackendAction>;

/// Backend -> gateway.
pub type ServerEnvelope = Envelope<ServerAction>;

impl<A> Envelope<A> {
    pub fn new(request_id: impl Into<String>, action: A, params: Params) -> Self {
        Self { request_id: request_id.into(), action, params }
    }

    /// Build an envelope with a freshly generated request id.
    pub fn with_fresh_id(action: A, params: Params) -> Self {
        Self::new(Uuid::new_v4().to_string(), action, params)
    }
}

/// Actions the gateway asks a backend worker to handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendAction {
    /// Authorize a pending WebSocket upgrade. Expects a `response`.
    ConnectionRequest,
    NewMessage,
    Disconnected,
    /// A client finished registration.
    #[serde(rename = "new_connection")]
    ConnectionSuccess,
    Error,
}

impl BackendAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionRequest => "connection_request",
            Self::NewMessage => "new_message",
            Self::Disconnected => "disconnected",
            Self::ConnectionSuccess => "new_connection",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BackendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions a backend worker sends to the gateway.
///
/// Anything outside the built-in set is preserved as [`ServerAction::Custom`]
/// so it can be routed to a handler registered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerAction {
    Response,
    MessageToRoom,
    MessageToConnection,
    Broadcast,
    Custom(String),
}

impl ServerAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Response => "response",
            Self::MessageToRoom => "message_to_room",
            Self::MessageToConnection => "message_to_connection",
            Self::Broadcast => "broadcast",
            Self::Custom(action) => action,
        }
    }
}

impl From<String> for ServerAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "response" => Self::Response,
            "message_to_room" => Self::MessageToRoom,
            "message_to_connection" => Self::MessageToConnection,
            "broadcast" => Self::Broadcast,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for ServerAction {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<ServerAction> for String {
    fn from(value: ServerAction) -> Self {
        match value {
            ServerAction::Custom(action) => action,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for ServerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn params_or_empty<'de, D>(deserializer: D) -> Result<Params, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Params>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Serialize an envelope as a single newline-terminated line.
pub fn encode_line<A: Serialize>(envelope: &Envelope<A>) -> Result<Vec<u8>, serde_json::Error> {
    let mut encoded = serde_json::to_vec(envelope)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Parse one inbound line. Trailing `\r`/`\n` are ignored.
pub fn decode_line(line: &[u8]) -> Result<ServerEnvelope, serde_json::Error> {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    serde_json::from_slice(&line[..end])
}
