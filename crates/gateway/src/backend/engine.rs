// Request/response correlation and push dispatch over the backend links.
//
// Every backend connection feeds parsed envelopes into one shared queue.
// A single dispatch task drains it: `response` envelopes complete the
// matching pending call, built-in push commands go to the `PushHandler`,
// and custom actions go to handlers registered at runtime.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use strand_common::protocol::{
    encode_line, BackendAction, BackendEnvelope, Params, PushCommand, ServerAction,
    ServerEnvelope,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::links::LinkRegistry;
use crate::error::{GatewayError, GatewayResult};

const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Receives the built-in push commands a backend worker sends.
pub trait PushHandler: Send + Sync {
    fn handle(&self, command: PushCommand) -> GatewayResult<()>;
}

/// Handler for a backend action outside the built-in set.
pub type CustomHandler = Arc<dyn Fn(Params) -> GatewayResult<()> + Send + Sync>;

type CallOutcome = GatewayResult<Params>;

#[derive(Default)]
struct PendingCalls {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<String, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

impl PendingCalls {
    fn register(&self, request_id: &str) -> GatewayResult<oneshot::Receiver<CallOutcome>> {
        let mut state = self.lock();
        if state.closed {
            return Err(GatewayError::Shutdown);
        }
        let (sender, receiver) = oneshot::channel();
        state.calls.insert(request_id.to_owned(), sender);
        Ok(receiver)
    }

    fn resolve(&self, request_id: &str, params: Params) -> bool {
        let Some(sender) = self.lock().calls.remove(request_id) else {
            return false;
        };
        sender.send(Ok(params)).is_ok()
    }

    fn forget(&self, request_id: &str) {
        self.lock().calls.remove(request_id);
    }

    fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.calls.drain().collect()
        };
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(GatewayError::Shutdown));
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().expect("pending call table lock poisoned")
    }
}

/// Removes the pending entry when a call finishes, fails, times out or is
/// cancelled by its caller.
struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.forget(&self.request_id);
    }
}

/// Receiving end of the shared inbound envelope queue.
pub struct InboundQueue {
    receiver: mpsc::Receiver<ServerEnvelope>,
}

pub struct BackendEngine {
    links: LinkRegistry,
    pending: PendingCalls,
    custom_handlers: RwLock<HashMap<String, CustomHandler>>,
    inbound: mpsc::Sender<ServerEnvelope>,
    closed: watch::Sender<bool>,
    call_timeout: Option<Duration>,
}

impl BackendEngine {
    /// `call_timeout` of `None` waits for a response indefinitely.
    pub fn new(call_timeout: Option<Duration>) -> (Arc<Self>, InboundQueue) {
        let (inbound, receiver) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (closed, _) = watch::channel(false);
        let engine = Arc::new(Self {
            links: LinkRegistry::default(),
            pending: PendingCalls::default(),
            custom_handlers: RwLock::new(HashMap::new()),
            inbound,
            closed,
            call_timeout,
        });
        (engine, InboundQueue { receiver })
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Send `action` and wait for the backend's `response` with the same
    /// request id.
    pub async fn call(&self, action: BackendAction, params: Params) -> GatewayResult<Params> {
        let envelope = BackendEnvelope::with_fresh_id(action, params);
        let receiver = self.pending.register(&envelope.request_id)?;
        let _guard =
            PendingGuard { calls: &self.pending, request_id: envelope.request_id.clone() };

        self.send(&envelope).await?;
        debug!(request_id = %envelope.request_id, %action, "awaiting backend response");

        let outcome = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, receiver)
                .await
                .map_err(|_| GatewayError::BackendTimeout(limit))?,
            None => receiver.await,
        };
        outcome.unwrap_or(Err(GatewayError::Shutdown))
    }

    /// Fire-and-forget send. No response is awaited.
    pub async fn notify(&self, action: BackendAction, params: Params) -> GatewayResult<()> {
        let envelope = BackendEnvelope::with_fresh_id(action, params);
        self.send(&envelope).await
    }

    async fn send(&self, envelope: &BackendEnvelope) -> GatewayResult<()> {
        let line =
            encode_line(envelope).map_err(|error| GatewayError::Transport(error.to_string()))?;
        let link = self.links.select().ok_or(GatewayError::NoBackendAvailable)?;
        link.send_line(&line).await?;
        debug!(
            request_id = %envelope.request_id,
            action = %envelope.action,
            backend = link.remote_addr(),
            "sent envelope to backend"
        );
        Ok(())
    }

    pub fn register_custom(&self, action: impl Into<String>, handler: CustomHandler) {
        self.custom_handlers
            .write()
            .expect("custom handler table lock poisoned")
            .insert(action.into(), handler);
    }

    /// Queue an inbound envelope for the dispatch task.
    pub(crate) async fn enqueue(&self, envelope: ServerEnvelope) -> GatewayResult<()> {
        self.inbound.send(envelope).await.map_err(|_| GatewayError::Shutdown)
    }

    /// Resolves once [`BackendEngine::shutdown`] has been called.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.closed.subscribe();
        async move {
            let _ = receiver.wait_for(|closed| *closed).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fail every in-flight call, close every backend link and stop the
    /// dispatch and read loops.
    pub async fn shutdown(&self) {
        self.closed.send_replace(true);
        let failed = self.pending.fail_all();
        let links = self.links.drain();
        let closed_links = links.len();
        for link in links {
            link.close().await;
        }
        info!(failed_calls = failed, closed_links, "backend engine shut down");
    }

    /// Drain the inbound queue until shutdown. Handler failures are logged
    /// and never stop the loop.
    pub async fn run_dispatch<H: PushHandler>(&self, mut queue: InboundQueue, handler: H) {
        let closed = self.closed();
        tokio::pin!(closed);

        loop {
            let envelope = tokio::select! {
                _ = &mut closed => break,
                next = queue.receiver.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let action = envelope.action.clone();
            if let Err(error) = self.dispatch(envelope, &handler) {
                warn!(%action, code = error.code(), %error, "backend action failed");
            }
        }

        debug!("dispatch loop stopped");
    }

    fn dispatch<H: PushHandler>(&self, envelope: ServerEnvelope, handler: &H) -> GatewayResult<()> {
        let ServerEnvelope { request_id, action, params } = envelope;
        match action {
            ServerAction::Response => {
                if !self.pending.resolve(&request_id, params) {
                    debug!(%request_id, "dropping response without a pending call");
                }
                Ok(())
            }
            ServerAction::Custom(name) => {
                let handler = self
                    .custom_handlers
                    .read()
                    .expect("custom handler table lock poisoned")
                    .get(&name)
                    .cloned();
                match handler {
                    Some(handler) => handler(params),
                    None => {
                        debug!(action = %name, "dropping unregistered backend action");
                        Ok(())
                    }
                }
            }
            builtin => match PushCommand::decode(&builtin, params) {
                Ok(Some(command)) => {
                    debug!(action = %command.action(), "dispatching push command");
                    handler.handle(command)
                }
                Ok(None) => Ok(()),
                Err(error) => Err(GatewayError::MalformedParams(error.to_string())),
            },
        }
    }
}
