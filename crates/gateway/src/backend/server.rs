use std::sync::Arc;

use anyhow::Result;
use strand_common::protocol::decode_line;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::engine::BackendEngine;
use crate::error::{GatewayError, GatewayResult};

/// Accept backend worker connections until the engine shuts down.
///
/// Framing is newline-delimited JSON. Each connection gets its own read
/// loop feeding the engine's shared inbound queue.
pub async fn serve_backend(listener: TcpListener, engine: Arc<BackendEngine>) -> Result<()> {
    let closed = engine.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            _ = &mut closed => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(?error, "failed to accept backend connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    serve_link(stream, remote_addr.to_string(), engine).await;
                });
            }
        }
    }
}

/// Register one backend connection and read envelopes from it until EOF,
/// a read or parse failure, or engine shutdown. The link is always removed
/// from the registry on exit.
pub async fn serve_link<IO>(stream: IO, remote_addr: String, engine: Arc<BackendEngine>)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = io::split(stream);
    let link = engine.links().insert(remote_addr.clone(), Box::new(write_half));
    info!(backend = %remote_addr, live_links = engine.links().len(), "backend connected");

    let result = read_envelopes(BufReader::new(read_half), &engine).await;

    engine.links().remove(link.id());
    link.close().await;

    match result {
        Ok(()) => info!(backend = %remote_addr, "backend disconnected"),
        Err(error) => warn!(
            backend = %remote_addr,
            code = error.code(),
            %error,
            "backend connection terminated"
        ),
    }
}

async fn read_envelopes<R>(mut reader: R, engine: &BackendEngine) -> GatewayResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let closed = engine.closed();
    tokio::pin!(closed);

    loop {
        let mut line = Vec::new();
        let bytes_read = tokio::select! {
            _ = &mut closed => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read?,
        };

        if bytes_read == 0 {
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let envelope = decode_line(&line).map_err(GatewayError::MalformedEnvelope)?;
        debug!(request_id = %envelope.request_id, action = %envelope.action, "backend envelope received");
        engine.enqueue(envelope).await?;
    }
}
