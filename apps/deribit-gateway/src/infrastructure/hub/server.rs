//! Subscriber WebSocket Server
//!
//! Accepts local subscriber connections and runs one reader loop and one
//! writer task per connection. The reader applies client frames to the hub;
//! the writer drains the control channel and the outbound update queue onto
//! the socket.
//!
//! Once a connection enters `Closing`, from whichever side, the writer gets
//! at most the hub's drain timeout to flush before it is aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ConnectionHandle;
use super::fanout::FanOutHub;
use super::protocol::{ProtocolError, ServerFrame, encode_update};

/// Time allowed for the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Hub-wide server failures.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The listener could not be bound.
    #[error("failed to bind subscriber listener on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Bind the subscriber listener on all interfaces.
///
/// # Errors
///
/// Returns [`HubError::Bind`] if the port is unavailable.
pub async fn bind(port: u16) -> Result<TcpListener, HubError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .map_err(|source| HubError::Bind { addr, source })
}

/// Accept subscribers until `cancel` fires, then drain every connection.
pub async fn serve(listener: TcpListener, hub: Arc<FanOutHub>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Subscriber server listening");
    }
    hub.set_listening(true);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(stream, peer, Arc::clone(&hub)));
                }
                Err(e) => warn!(error = %e, "Failed to accept subscriber"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let closing = hub.begin_shutdown();
    info!(connections = closing, "Subscriber server shutting down");
    while connections.join_next().await.is_some() {}
    info!("Subscriber server stopped");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<FanOutHub>) {
    let (conn, control_rx) = hub.register(Some(peer));
    let id = conn.id();

    let handshake =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
    let ws = tokio::select! {
        () = conn.closing_token().cancelled() => {
            debug!(connection_id = id, %peer, "Closed during handshake");
            hub.drop_connection(id);
            return;
        }
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!(connection_id = id, %peer, error = %e, "Handshake failed");
                hub.drop_connection(id);
                return;
            }
            Err(_) => {
                debug!(connection_id = id, %peer, "Handshake timed out");
                hub.drop_connection(id);
                return;
            }
        },
    };

    if !conn.mark_open() {
        hub.drop_connection(id);
        return;
    }
    info!(connection_id = id, %peer, "Subscriber connected");

    let (sink, mut incoming) = ws.split();
    let mut writer = tokio::spawn(write_loop(sink, Arc::clone(&conn), control_rx));
    let mut writer_done = false;

    loop {
        tokio::select! {
            () = conn.closing_token().cancelled() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => hub.handle_text(&conn, text.as_str()),
                Some(Ok(Message::Binary(_))) => hub.reject(&conn, &ProtocolError::Binary),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }

    conn.begin_close();
    if !writer_done {
        let drain_timeout = hub.config().drain_timeout;
        if tokio::time::timeout(drain_timeout, &mut writer).await.is_err() {
            warn!(
                connection_id = id,
                queued = conn.queue().len(),
                timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX),
                "Drain timeout elapsed, forcing close"
            );
            conn.cancel_token().cancel();
            writer.abort();
        }
    }

    hub.drop_connection(id);
    info!(connection_id = id, %peer, "Subscriber disconnected");
}

async fn write_loop(
    mut sink: WsSink,
    conn: Arc<ConnectionHandle>,
    mut control_rx: mpsc::Receiver<ServerFrame>,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = conn.cancel_token().cancelled() => return,
            Some(frame) = control_rx.recv() => Message::text(frame.to_json()),
            update = conn.queue().pop() => match update {
                Some(update) => Message::text(encode_update(&update)),
                None => break,
            },
        };

        if let Err(e) = sink.send(message).await {
            debug!(connection_id = conn.id(), error = %e, "Write failed");
            conn.begin_close();
            return;
        }
    }

    // Queue closed and drained.
    if let Err(e) = sink.close().await {
        debug!(connection_id = conn.id(), error = %e, "Close frame not sent");
    }
}
