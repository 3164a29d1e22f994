// Orchestrator wiring the client side to the backend side.
//
// Client lifecycle events become backend notifications; backend push
// commands become registry deliveries.

use std::sync::Arc;

use serde_json::{json, Value};
use strand_common::protocol::{BackendAction, ClientContext, Params, PushCommand};
use tracing::{debug, warn};

use crate::{
    backend::{BackendEngine, PushHandler},
    error::GatewayResult,
    ws::{ConnectionRequest, GatewayHooks, RoomRegistry},
};

#[derive(Clone)]
pub struct Bridge {
    engine: Arc<BackendEngine>,
    registry: Arc<RoomRegistry>,
}

impl Bridge {
    pub fn new(engine: Arc<BackendEngine>, registry: Arc<RoomRegistry>) -> Self {
        Self { engine, registry }
    }

    pub fn engine(&self) -> &Arc<BackendEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Notifications are best effort; a missing backend only costs the event.
    async fn notify(&self, action: BackendAction, params: Params) {
        if let Err(error) = self.engine.notify(action, params).await {
            warn!(%action, code = error.code(), %error, "backend notification dropped");
        }
    }
}

fn context_params(context: &ClientContext) -> Params {
    let mut params = Params::new();
    params.insert("context".into(), json!(context));
    params
}

impl GatewayHooks for Bridge {
    async fn authorize(&self, request: ConnectionRequest) -> GatewayResult<Params> {
        let request_params = request.to_params();
        match self.engine.call(BackendAction::ConnectionRequest, request_params.clone()).await {
            Ok(metadata) => Ok(metadata),
            Err(error) => {
                let mut params = Params::new();
                params.insert("context".into(), Value::Object(request_params));
                params.insert("error".into(), Value::String(error.to_string()));
                self.notify(BackendAction::Error, params).await;
                Err(error)
            }
        }
    }

    async fn on_connected(&self, context: ClientContext) {
        self.notify(BackendAction::ConnectionSuccess, context_params(&context)).await;
    }

    async fn on_message(&self, context: ClientContext, message: String) {
        let mut params = context_params(&context);
        params.insert("message".into(), Value::String(message));
        self.notify(BackendAction::NewMessage, params).await;
    }

    async fn on_disconnect(&self, context: ClientContext) {
        self.notify(BackendAction::Disconnected, context_params(&context)).await;
    }
}

impl PushHandler for Bridge {
    fn handle(&self, command: PushCommand) -> GatewayResult<()> {
        match command {
            PushCommand::MessageToRoom { room_id, message } => {
                let report = self.registry.broadcast_to_room(&room_id, &message);
                debug!(%room_id, delivered = report.delivered, "room message delivered");
                Ok(())
            }
            PushCommand::MessageToConnection { conn_id, message } => {
                self.registry.send_to_client(&conn_id, &message)
            }
            PushCommand::Broadcast { message } => {
                let report = self.registry.broadcast_all(&message);
                debug!(delivered = report.delivered, "broadcast delivered");
                Ok(())
            }
        }
    }
}
