//! HTTP server side of a transport.
//!
//! Provides the accept loop a [`ServerTransport`] spawns per acceptor,
//! and an async `run` function for driving a single listener with
//! graceful shutdown, spawning a task per connection.

use crate::http::{HttpResponse, StatusCode};
use crate::transport::{self, HttpContext, ServerTransport};
use crate::{Connection, Error, Result, SObj};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, Semaphore},
    time::{timeout, Instant},
};
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections one acceptor will admit.
///
/// When this limit is reached, the acceptor stops taking connections
/// until an active one terminates.
const MAX_CONNECTIONS: usize = 250;

/// Keep-alive connections idle longer than this get a 408 and close.
const IDLE_TTL: Duration = Duration::from_secs(60);

/// After answering a protocol error, the connection lingers briefly so
/// the response can drain before the close.
const DRAIN_TTL: Duration = Duration::from_millis(50);

/// Response bodies above this stream out as chunked coding instead of
/// one `Content-Length` write, so a large page never sits fully staged
/// behind the outbound watermark.
const CHUNK_STREAM_THRESHOLD: usize = 64 * 1024;

/// Slice size of one streamed chunk.
const CHUNK_STREAM_SIZE: usize = 16 * 1024;

/// Per-connection handler. Reads requests from `connection`, routes
/// them through the transport's binding table and writes responses
/// back.
#[derive(Debug)]
struct Handler<S> {
    /// The transport this connection arrived on; owns the routing
    /// table and the request telemetry.
    transport: Arc<ServerTransport>,
    /// The TCP connection decorated with the HTTP encoder / decoder.
    connection: Connection<S>,
    /// Peer address for handler context.
    peer: Option<SocketAddr>,
    /// Paired with the transport's shutdown sender. The handler
    /// processes requests from the connection until the peer
    /// disconnects **or** this resolves (a `()` arrives, or the sender
    /// drops on disable); in-flight work is finished first.
    shutdown: broadcast::Receiver<()>,
    /// Signal used to determine when all handlers have wound down.
    ///
    /// Not used directly; dropping the last clone closes the channel
    /// the drain path waits on.
    _shutdown_complete: mpsc::Sender<()>,
}

/// Run a single listener for `transport` until `shutdown` completes,
/// then drain active connections.
///
/// `tokio::signal::ctrl_c()` can be used as the `shutdown` argument.
pub async fn run(listener: TcpListener, transport: Arc<ServerTransport>, shutdown: impl Future) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    tokio::select! {
        _ = serve(listener, transport, notify_shutdown.clone(), shutdown_complete_tx.clone()) => {
            // The accept loop only returns on a non-recoverable accept
            // failure; the error was already logged there.
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    // When `notify_shutdown` drops, every subscribed handler receives
    // the signal and exits once its in-flight message is done. The
    // completion channel closes when the last handler drops its
    // sender clone.
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;
}

/// Accept loop of one listening socket.
///
/// For each inbound connection a task is spawned to handle it; a
/// failing handler never takes the accept loop down with it.
pub(crate) async fn serve(
    listener: TcpListener,
    transport: Arc<ServerTransport>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    info!(transport = %transport.name(), "accepting inbound connections");

    let limit_connections = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    // Resolves once shutdown is signalled or the sender drops.
    let mut shutdown = notify_shutdown.subscribe();

    loop {
        // `acquire_owned()` returns `Err` only when the semaphore has
        // been closed, which never happens here.
        let permit = limit_connections.clone().acquire_owned().await.unwrap();

        let accepted = tokio::select! {
            res = accept(&listener) => res,
            _ = shutdown.recv() => {
                debug!(transport = %transport.name(), "accept loop stopped");
                return;
            }
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                error!(cause = %err, "failed to accept");
                return;
            }
        };

        transport::note_connection(&transport, 1.0);

        let mut handler = Handler {
            transport: transport.clone(),
            connection: Connection::with_inbound_cap(socket, transport.inbound_cap()),
            peer: Some(peer),
            shutdown: notify_shutdown.subscribe(),
            _shutdown_complete: shutdown_complete_tx.clone(),
        };

        tokio::spawn(async move {
            if let Err(err) = handler.run().await {
                error!(cause = %err, "connection error");
            }
            drop(permit);
        });
    }
}

/// Accept an inbound connection, retrying transient failures with
/// exponential backoff: 1 s after the first failure, doubling up to
/// 64 s, then giving up.
async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "successfully accepted inbound connection");
                return Ok((socket, peer));
            }
            Err(err) => {
                if backoff > 64 {
                    error!(%err, "failed to accept inbound connection too many times");
                    return Err(err.into());
                }
                warn!(%err, "got error accepting inbound connection, trying again in {backoff} seconds");
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

impl Handler<TcpStream> {
    /// Process a single connection.
    ///
    /// Requests are read and answered one at a time until the peer
    /// closes, keep-alive ends, the idle TTL fires, or shutdown is
    /// signalled.
    #[tracing::instrument(skip_all, fields(peer = ?self.peer))]
    async fn run(&mut self) -> Result<()> {
        loop {
            let read = tokio::select! {
                res = timeout(IDLE_TTL, self.connection.read_request()) => res,
                // Stop on the shutdown signal or its sender dropping.
                _ = self.shutdown.recv() => return Ok(()),
            };

            let maybe_request = match read {
                Ok(res) => res,
                Err(_elapsed) => {
                    // Idle keep-alive connection: answer 408 and close.
                    let response =
                        HttpResponse::text(StatusCode::REQUEST_TIMEOUT, "request timeout");
                    let _ = self.connection.write_response(&response, false).await;
                    return Ok(());
                }
            };

            let request = match maybe_request {
                Ok(Some(request)) => request,
                // The peer closed the connection between messages.
                Ok(None) => return Ok(()),
                Err(err) if err.is_protocol() => {
                    // Malformed wire input: answer with a status, let
                    // the response drain, then close.
                    let status = match err {
                        Error::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    let response = HttpResponse::text(status, err.to_string());
                    let _ = self.connection.write_response(&response, false).await;
                    tokio::time::sleep(DRAIN_TTL).await;
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            transport::note_request(&self.transport);

            let keep_alive = request.keep_alive();
            let path = request.uri.path().to_string();
            let started = Instant::now();

            let response = match self.transport.find_handler(&path) {
                None => HttpResponse::text(StatusCode::NOT_FOUND, "not found"),
                Some(handle) => {
                    let context = HttpContext {
                        request,
                        peer: self.peer,
                        transport: self.transport.name().to_string(),
                    };
                    // One capture scope per request: everything the
                    // handler does shares one pool connection.
                    match crate::db::pool::capture_scope(handle(context)).await {
                        Ok(response) => response,
                        Err(err) => {
                            transport::note_handler_failure(&self.transport, &err);
                            error_envelope(&err)
                        }
                    }
                }
            };

            transport::note_execution(&self.transport, started.elapsed());

            self.write_response(&response, keep_alive).await?;

            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Emit a response, streaming large bodies as chunked coding.
    async fn write_response(&mut self, response: &HttpResponse, keep_alive: bool) -> Result<()> {
        if response.body.len() <= CHUNK_STREAM_THRESHOLD {
            return self.connection.write_response(response, keep_alive).await;
        }

        self.connection
            .write_chunked_head(response, keep_alive)
            .await?;
        for chunk in response.body.chunks(CHUNK_STREAM_SIZE) {
            self.connection.write_chunk(chunk).await?;
        }
        self.connection.finish_chunked().await
    }
}

/// Translate a handler failure into the JSON error envelope.
fn error_envelope(err: &Error) -> HttpResponse {
    let mut envelope = SObj::new();
    envelope.emplace("status", false);
    envelope.emplace("message", err.to_string());

    match crate::serialization::create("json")
        .and_then(|codec| codec.encode(&crate::SVal::Object(envelope)))
    {
        Ok(body) => HttpResponse::json(StatusCode::INTERNAL_SERVER_ERROR, body),
        Err(_) => HttpResponse::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_shape() {
        let response = error_envelope(&Error::Handler("boom".into()));
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers.get("Content-Type"), Some("application/json"));
        let body = std::str::from_utf8(&response.body).unwrap();
        assert_eq!(body, r#"{"status":false,"message":"handler error: boom"}"#);
    }
}
