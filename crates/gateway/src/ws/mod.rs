// Client-facing WebSocket side: upgrade handling, per-client sessions and
// the room/client registry they register into.

pub mod handler;
pub mod registry;

use std::{collections::BTreeMap, future::Future, net::SocketAddr};

use axum::http::HeaderMap;
use serde_json::{json, Value};
use strand_common::protocol::{ClientContext, Params};

use crate::error::GatewayResult;

pub use handler::{router, GatewayState, WS_PATH_PREFIX};
pub use registry::{
    outbound_channel, BroadcastReport, Client, ClientOutbound, RoomRegistry,
    OUTBOUND_QUEUE_CAPACITY,
};

/// Callbacks the gateway invokes over a client's lifetime.
pub trait GatewayHooks: Send + Sync + 'static {
    /// Decide whether a pending upgrade may proceed. The returned params
    /// become the client's metadata.
    fn authorize(
        &self,
        request: ConnectionRequest,
    ) -> impl Future<Output = GatewayResult<Params>> + Send;

    fn on_connected(&self, context: ClientContext) -> impl Future<Output = ()> + Send;

    fn on_message(&self, context: ClientContext, message: String)
        -> impl Future<Output = ()> + Send;

    fn on_disconnect(&self, context: ClientContext) -> impl Future<Output = ()> + Send;
}

/// The parts of an upgrade request forwarded to the backend for
/// authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRequest {
    pub headers: BTreeMap<String, Vec<String>>,
    pub url: String,
    pub remote_addr: SocketAddr,
}

impl ConnectionRequest {
    pub fn from_parts(headers: &HeaderMap, path: &str, remote_addr: SocketAddr) -> Self {
        let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                collected.entry(name.as_str().to_owned()).or_default().push(value.to_owned());
            }
        }
        Self { headers: collected, url: path.to_owned(), remote_addr }
    }

    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("headers".into(), json!(self.headers));
        params.insert("url".into(), Value::String(self.url.clone()));
        params.insert("remote_addr".into(), Value::String(self.remote_addr.to_string()));
        params
    }
}

/// Identity assigned to an accepted connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub client_id: String,
    pub room_id: String,
    pub metadata: Params,
}

impl Admission {
    /// Interpret the backend's authorization response. Returns `None` only
    /// when `accepted` is literally `false`.
    ///
    /// `roomID` falls back to the request path below [`WS_PATH_PREFIX`];
    /// `clientID` falls back to the peer address.
    pub fn from_metadata(metadata: Params, path: &str, remote_addr: SocketAddr) -> Option<Self> {
        if metadata.get("accepted") == Some(&Value::Bool(false)) {
            return None;
        }

        let room_id = metadata
            .get("roomID")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| room_from_path(path));
        let client_id = metadata
            .get("clientID")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| remote_addr.to_string());

        Some(Self { client_id, room_id, metadata })
    }
}

fn room_from_path(path: &str) -> String {
    path.strip_prefix(WS_PATH_PREFIX).unwrap_or(path).trim_matches('/').to_owned()
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use serde_json::json;

    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.9:51000".parse().expect("test address should parse")
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn explicit_false_rejects() {
        let metadata = params(json!({ "accepted": false, "roomID": "room-42" }));
        assert_eq!(Admission::from_metadata(metadata, "/ws/room-42", addr()), None);
    }

    #[test]
    fn missing_or_non_boolean_accepted_is_not_a_rejection() {
        let admitted = Admission::from_metadata(
            params(json!({ "roomID": "room-42", "clientID": "c1" })),
            "/ws/room-42",
            addr(),
        )
        .expect("connection should be admitted");
        assert_eq!(admitted.client_id, "c1");
        assert_eq!(admitted.room_id, "room-42");

        assert!(Admission::from_metadata(
            params(json!({ "accepted": "false" })),
            "/ws/x",
            addr()
        )
        .is_some());
    }

    #[test]
    fn identity_falls_back_to_path_and_peer_address() {
        let admitted = Admission::from_metadata(Params::new(), "/ws/lobby/", addr())
            .expect("connection should be admitted");
        assert_eq!(admitted.room_id, "lobby");
        assert_eq!(admitted.client_id, "203.0.113.9:51000");
    }

    #[test]
    fn connection_request_params_match_wire_shape() {
        let mut headers = HeaderMap::new();
        headers.append("x-token", HeaderValue::from_static("a"));
        headers.append("x-token", HeaderValue::from_static("b"));
        let request = ConnectionRequest::from_parts(&headers, "/ws/room-42", addr());

        assert_eq!(
            Value::Object(request.to_params()),
            json!({
                "headers": { "x-token": ["a", "b"] },
                "url": "/ws/room-42",
                "remote_addr": "203.0.113.9:51000",
            })
        );
    }
}
