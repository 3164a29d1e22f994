// Typed params for backend-initiated push commands and client context
// snapshots sent with lifecycle notifications.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::envelope::{Params, ServerAction};

/// A built-in push command decoded from a backend envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCommand {
    MessageToRoom { room_id: String, message: String },
    MessageToConnection { conn_id: String, message: String },
    Broadcast { message: String },
}

#[derive(Debug, Error)]
pub enum PushDecodeError {
    #[error("invalid params for `{action}`: {source}")]
    InvalidParams {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct MessageToRoomParams {
    room_id: String,
    message: String,
}

#[derive(Deserialize)]
struct MessageToConnectionParams {
    conn_id: String,
    message: String,
}

#[derive(Deserialize)]
struct BroadcastParams {
    message: String,
}

impl PushCommand {
    /// Decode a push command. Returns `Ok(None)` for actions that are not
    /// built-in push commands (`response` and custom actions).
    pub fn decode(action: &ServerAction, params: Params) -> Result<Option<Self>, PushDecodeError> {
        let command = match action {
            ServerAction::MessageToRoom => {
                let MessageToRoomParams { room_id, message } =
                    parse_params("message_to_room", params)?;
                Self::MessageToRoom { room_id, message }
            }
            ServerAction::MessageToConnection => {
                let MessageToConnectionParams { conn_id, message } =
                    parse_params("message_to_connection", params)?;
                Self::MessageToConnection { conn_id, message }
            }
            ServerAction::Broadcast => {
                let BroadcastParams { message } = parse_params("broadcast", params)?;
                Self::Broadcast { message }
            }
            ServerAction::Response | ServerAction::Custom(_) => return Ok(None),
        };
        Ok(Some(command))
    }

    pub fn action(&self) -> ServerAction {
        match self {
            Self::MessageToRoom { .. } => ServerAction::MessageToRoom,
            Self::MessageToConnection { .. } => ServerAction::MessageToConnection,
            Self::Broadcast { .. } => ServerAction::Broadcast,
        }
    }
}

fn parse_params<T: DeserializeOwned>(
    action: &'static str,
    params: Params,
) -> Result<T, PushDecodeError> {
    serde_json::from_value(Value::Object(params))
        .map_err(|source| PushDecodeError::InvalidParams { action, source })
}

/// Snapshot of a registered client, sent as `params.context` with every
/// lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientContext {
    pub client_id: String,
    pub room_id: String,
    pub metadata: Params,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            other => panic!("test params must be an object, got {other}"),
        }
    }

    #[test]
    fn decodes_message_to_room() {
        let command = PushCommand::decode(
            &ServerAction::MessageToRoom,
            params(json!({ "room_id": "room-42", "message": "hi" })),
        )
        .expect("params should decode");

        assert_eq!(
            command,
            Some(PushCommand::MessageToRoom { room_id: "room-42".into(), message: "hi".into() })
        );
    }

    #[test]
    fn decodes_message_to_connection_and_broadcast() {
        let direct = PushCommand::decode(
            &ServerAction::MessageToConnection,
            params(json!({ "conn_id": "c1", "message": "ping" })),
        )
        .expect("params should decode");
        assert_eq!(
            direct,
            Some(PushCommand::MessageToConnection { conn_id: "c1".into(), message: "ping".into() })
        );

        let broadcast =
            PushCommand::decode(&ServerAction::Broadcast, params(json!({ "message": "all" })))
                .expect("params should decode");
        assert_eq!(broadcast, Some(PushCommand::Broadcast { message: "all".into() }));
    }

    #[test]
    fn wrong_type_or_missing_key_is_an_error() {
        let wrong_type = PushCommand::decode(
            &ServerAction::MessageToRoom,
            params(json!({ "room_id": "a", "message": 5 })),
        );
        assert!(matches!(
            wrong_type,
            Err(PushDecodeError::InvalidParams { action: "message_to_room", .. })
        ));

        let missing =
            PushCommand::decode(&ServerAction::MessageToConnection, params(json!({ "message": "x" })));
        assert!(missing.is_err());
    }

    #[test]
    fn response_and_custom_are_not_push_commands() {
        assert_eq!(
            PushCommand::decode(&ServerAction::Response, Params::new()).expect("no decode"),
            None
        );
        assert_eq!(
            PushCommand::decode(&ServerAction::Custom("kick".into()), Params::new())
                .expect("no decode"),
            None
        );
    }

    #[test]
    fn client_context_uses_snake_case_keys() {
        let context = ClientContext {
            client_id: "c1".into(),
            room_id: "room-42".into(),
            metadata: params(json!({ "accepted": true })),
        };
        assert_eq!(
            serde_json::to_value(&context).expect("context should serialize"),
            json!({ "client_id": "c1", "room_id": "room-42", "metadata": { "accepted": true } })
        );
    }
}
