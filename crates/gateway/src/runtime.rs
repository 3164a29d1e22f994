use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backend::{serve_backend, BackendEngine},
    bridge::Bridge,
    config::GatewayConfig,
    ws::{self, GatewayHooks, RoomRegistry},
};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// A running gateway. Dropping the handle requests shutdown.
pub struct GatewayHandle {
    ws_addr: SocketAddr,
    tcp_addr: SocketAddr,
    engine: Arc<BackendEngine>,
    registry: Arc<RoomRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn engine(&self) -> &Arc<BackendEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Request shutdown and wait until every gateway task has finished.
    pub async fn wait(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind both listeners and spawn the dispatch task, the backend accept
/// loop and the WebSocket server.
pub async fn start(config: &GatewayConfig) -> Result<GatewayHandle> {
    let tcp_listener = TcpListener::bind(config.tcp_addr)
        .await
        .with_context(|| format!("failed to bind backend listener on {}", config.tcp_addr))?;
    let ws_listener = TcpListener::bind(config.ws_addr)
        .await
        .with_context(|| format!("failed to bind websocket listener on {}", config.ws_addr))?;
    let tcp_addr = tcp_listener.local_addr().context("backend listener has no local address")?;
    let ws_addr = ws_listener.local_addr().context("websocket listener has no local address")?;

    let (engine, queue) = BackendEngine::new(config.call_timeout);
    let registry = Arc::new(RoomRegistry::default());
    let bridge = Bridge::new(Arc::clone(&engine), Arc::clone(&registry));

    let dispatch_task = {
        let engine = Arc::clone(&engine);
        let bridge = bridge.clone();
        tokio::spawn(async move { engine.run_dispatch(queue, bridge).await })
    };
    let backend_task = tokio::spawn(serve_backend(tcp_listener, Arc::clone(&engine)));

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(4);
    let mut serve_shutdown = shutdown_tx.subscribe();
    let app = build_router(Arc::clone(&registry), Arc::new(bridge));
    let ws_task = tokio::spawn(async move {
        axum::serve(ws_listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.recv().await;
            })
            .await
    });

    let task = {
        let engine = Arc::clone(&engine);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;

            engine.shutdown().await;
            let closed_clients = registry.close_all();
            info!(closed_clients, "client sessions closed");

            match ws_task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(?error, "websocket server terminated unexpectedly"),
                Err(error) => warn!(?error, "websocket server task failed"),
            }
            match backend_task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(?error, "backend listener terminated unexpectedly"),
                Err(error) => warn!(?error, "backend listener task failed"),
            }
            let _ = dispatch_task.await;
            info!("gateway stopped");
        })
    };

    info!(%ws_addr, %tcp_addr, "gateway started");
    Ok(GatewayHandle { ws_addr, tcp_addr, engine, registry, shutdown_tx, task: Some(task) })
}

/// Run until ctrl-c or SIGTERM, then shut down in order.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let handle = start(&config).await?;
    shutdown_signal().await;
    handle.wait().await;
    Ok(())
}

pub fn build_router<H: GatewayHooks>(registry: Arc<RoomRegistry>, hooks: Arc<H>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(ws::router(registry, hooks))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
