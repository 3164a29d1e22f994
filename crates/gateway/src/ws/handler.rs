use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use strand_common::protocol::ClientContext;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    registry::{outbound_channel, Client},
    Admission, ConnectionRequest, GatewayHooks, RoomRegistry,
};
use crate::error::GatewayError;

/// Path prefix clients upgrade on. Whatever follows it names the default
/// room.
pub const WS_PATH_PREFIX: &str = "/ws";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// How long a ping may stay unanswered, and how long a single frame write
/// may block, before the session is dropped.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_FRAME_BYTES: usize = 262_144;

pub struct GatewayState<H> {
    pub registry: Arc<RoomRegistry>,
    pub hooks: Arc<H>,
}

impl<H> Clone for GatewayState<H> {
    fn clone(&self) -> Self {
        Self { registry: Arc::clone(&self.registry), hooks: Arc::clone(&self.hooks) }
    }
}

pub fn router<H: GatewayHooks>(registry: Arc<RoomRegistry>, hooks: Arc<H>) -> Router {
    let state = GatewayState { registry, hooks };

    Router::new()
        .route(WS_PATH_PREFIX, get(ws_upgrade::<H>))
        .route(&format!("{WS_PATH_PREFIX}/"), get(ws_upgrade::<H>))
        .route(&format!("{WS_PATH_PREFIX}/{{*path}}"), get(ws_upgrade::<H>))
        .with_state(state)
}

/// Authorize with the backend before upgrading. A failed or rejected
/// authorization answers the HTTP request and no client is registered.
pub async fn ws_upgrade<H: GatewayHooks>(
    State(state): State<GatewayState<H>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_owned();
    let request = ConnectionRequest::from_parts(&headers, &path, remote_addr);

    let metadata = match state.hooks.authorize(request).await {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!(%remote_addr, %path, code = error.code(), %error, "connection authorization failed");
            return reject(&error);
        }
    };

    let Some(admission) = Admission::from_metadata(metadata, &path, remote_addr) else {
        info!(%remote_addr, %path, "connection rejected by backend");
        return reject(&GatewayError::AuthorizationRejected);
    };

    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, admission, socket))
}

fn reject(error: &GatewayError) -> Response {
    (error.status(), error.code()).into_response()
}

async fn handle_socket<H: GatewayHooks>(
    state: GatewayState<H>,
    admission: Admission,
    mut socket: WebSocket,
) {
    let (outbound, mut outbound_receiver) = outbound_channel();
    let client = Client::new(admission.client_id, admission.room_id, admission.metadata, outbound);
    let session_id = client.session_id;
    let context = client.context();

    match state.registry.add_client(client) {
        Ok(Some(replaced)) => warn!(
            client_id = %context.client_id,
            previous_room = %replaced.room_id,
            "client id reused, replacing earlier registration"
        ),
        Ok(None) => {}
        Err(error) => {
            info!(client_id = %context.client_id, code = error.code(), "gateway closed, dropping new session");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }
    info!(
        client_id = %context.client_id,
        room_id = %context.room_id,
        clients = state.registry.client_count(),
        "client connected"
    );
    state.hooks.on_connected(context.clone()).await;

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                match ping_sent_at {
                    Some(sent) if sent.elapsed() > HEARTBEAT_TIMEOUT => {
                        warn!(client_id = %context.client_id, "heartbeat timeout, disconnecting");
                        break;
                    }
                    Some(_) => {}
                    None => {
                        if !send_frame(&mut socket, Message::Ping(Vec::new().into())).await {
                            break;
                        }
                        ping_sent_at = Some(Instant::now());
                    }
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(payload) => {
                        if !send_frame(&mut socket, Message::Text(payload.into())).await {
                            break;
                        }
                    }
                    // Unregistered elsewhere: replaced or closed on shutdown.
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(text)) => {
                        state.hooks.on_message(context.clone(), text.as_str().to_owned()).await;
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => state.hooks.on_message(context.clone(), text).await,
                        Err(_) => warn!(
                            client_id = %context.client_id,
                            len = bytes.len(),
                            "dropping non-UTF-8 binary frame"
                        ),
                    },
                    Ok(Message::Ping(payload)) => {
                        if !send_frame(&mut socket, Message::Pong(payload)).await {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => ping_sent_at = None,
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(client_id = %context.client_id, %error, "client socket read failed");
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, &context, session_id).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Write one frame. A peer that stops reading fails the write after
/// [`HEARTBEAT_TIMEOUT`] instead of stalling the session.
async fn send_frame(socket: &mut WebSocket, message: Message) -> bool {
    matches!(tokio::time::timeout(HEARTBEAT_TIMEOUT, socket.send(message)).await, Ok(Ok(())))
}

/// Unregister this session and emit its disconnect notification. Only the
/// call that actually removes the registration notifies, so repeated
/// teardown and teardown of a replaced session are silent.
pub(crate) async fn teardown<H: GatewayHooks>(
    state: &GatewayState<H>,
    context: &ClientContext,
    session_id: Uuid,
) -> bool {
    if state.registry.remove_session(&context.client_id, session_id).is_none() {
        return false;
    }
    info!(
        client_id = %context.client_id,
        room_id = %context.room_id,
        clients = state.registry.client_count(),
        "client disconnected"
    );
    state.hooks.on_disconnect(context.clone()).await;
    true
}
