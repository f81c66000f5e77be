//! Inbound WebSocket acceptor
//!
//! Each accepted WebSocket carries many concurrent DNS transactions. The
//! session splits into a reader loop and a single writer task: workers
//! forward accepted queries upstream and push replies onto a rendezvous
//! channel the writer drains, so response frames are written one at a
//! time and a stalled peer backpressures the workers.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::Settings;
use crate::error::Result;
use crate::forwarder::Forwarder;
use crate::message;
use crate::websocket::ws_config;

/// Per-frame read limit on inbound WebSockets
pub const WS_READ_LIMIT: usize = 4096;

/// What the session pushes to its writer task
enum Outbound {
    /// A DNS response to serialize and send as one binary frame
    Reply(Message),
    /// A close control frame; the session is ending
    Close(CloseFrame<'static>),
}

/// Acceptor for inbound WebSocket sessions
pub struct WsAcceptor {
    upstream: Arc<Forwarder>,
    tls: Option<TlsAcceptor>,
    /// Global bound on concurrently served sessions
    sessions: Arc<Semaphore>,
    settings: Arc<Settings>,
}

impl WsAcceptor {
    pub fn new(
        upstream: Arc<Forwarder>,
        tls: Option<TlsAcceptor>,
        settings: Arc<Settings>,
    ) -> Self {
        let sessions = Arc::new(Semaphore::new(settings.max_websockets));
        Self {
            upstream,
            tls,
            sessions,
            settings,
        }
    }

    /// Accept loop; runs until the listener fails fatally
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        log::info!("WebSocket listener on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("accept error: {}", err);
                    continue;
                }
            };

            let upstream = Arc::clone(&self.upstream);
            let sessions = Arc::clone(&self.sessions);
            let settings = Arc::clone(&self.settings);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer, tls, upstream, sessions, settings).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    upstream: Arc<Forwarder>,
    sessions: Arc<Semaphore>,
    settings: Arc<Settings>,
) {
    match tls {
        Some(acceptor) => {
            let tls_stream = match timeout(settings.timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(err)) => {
                    log::debug!("TLS accept error for {}: {}", peer, err);
                    return;
                }
                Err(_) => {
                    log::debug!("TLS handshake with {} timed out", peer);
                    return;
                }
            };
            // Behind TLS the socket peer is authoritative; X-Real-IP is
            // only honored on plaintext listeners fronted by a proxy.
            serve_session(tls_stream, peer, false, upstream, sessions, settings).await;
        }
        None => serve_session(stream, peer, true, upstream, sessions, settings).await,
    }
}

async fn serve_session<S>(
    stream: S,
    peer: SocketAddr,
    allow_real_ip: bool,
    upstream: Arc<Forwarder>,
    sessions: Arc<Semaphore>,
    settings: Arc<Settings>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut remote = peer.to_string();
    let mut permit = None;

    let callback = |request: &Request, response: Response| {
        if allow_real_ip {
            if let Some(value) = request
                .headers()
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
            {
                if !value.is_empty() {
                    remote = value.to_string();
                }
            }
        }

        match sessions.clone().try_acquire_owned() {
            Ok(acquired) => {
                permit = Some(acquired);
                Ok(response)
            }
            Err(_) => {
                log::debug!("denied for {} (maximum WebSockets reached)", remote);
                let mut refusal = ErrorResponse::new(Some(
                    "Service Unavailable: Too busy, try again later".to_string(),
                ));
                *refusal.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                Err(refusal)
            }
        }
    };

    let config = ws_config(settings.ws_buffer_size, Some(WS_READ_LIMIT));
    let ws = match accept_hdr_async_with_config(stream, callback, Some(config)).await {
        Ok(ws) => ws,
        Err(err) => {
            log::debug!("upgrade error for {}: {}", remote, err);
            return;
        }
    };
    let permit = match permit {
        Some(permit) => permit,
        None => return,
    };
    log::debug!("accepted connection from {}", remote);

    let (sink, mut source) = ws.split();

    // Writer task: sole owner of the sink. The channel is a rendezvous
    // point, so a blocked write pauses new response submission.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Outbound>(1);
    let writer_remote = remote.clone();
    let writer = tokio::spawn(async move {
        let mut sink = sink;
        log::debug!("starting write loop for {}", writer_remote);
        while let Some(outbound) = reply_rx.recv().await {
            match outbound {
                Outbound::Reply(resp) => {
                    let wire = match resp.to_vec() {
                        Ok(wire) => wire,
                        Err(err) => {
                            log::error!(
                                "encode error for {} (query {}): {}",
                                writer_remote,
                                resp.id(),
                                err
                            );
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(WsMessage::Binary(wire)).await {
                        log::debug!(
                            "write error for {} (query {}): {}",
                            writer_remote,
                            resp.id(),
                            err
                        );
                    }
                }
                Outbound::Close(frame) => {
                    if let Err(err) = sink.send(WsMessage::Close(Some(frame))).await {
                        log::debug!("close write error for {}: {}", writer_remote, err);
                    }
                }
            }
        }
        let _ = sink.close().await;
        log::debug!("exiting write loop for {}", writer_remote);
    });

    let requests = Arc::new(Semaphore::new(settings.requests_per_ws));
    let mut workers = JoinSet::new();

    loop {
        // Reap finished workers so the set stays bounded.
        while workers.try_join_next().is_some() {}

        let frame = match source.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                log::debug!("read error for {}: {}", remote, err);
                break;
            }
            None => break,
        };

        let req = match frame {
            WsMessage::Binary(data) => Message::from_vec(&data).ok(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
            _ => None,
        };
        let Some(req) = req else {
            log::debug!("invalid message received from {}, closing", remote);
            let frame = CloseFrame {
                code: CloseCode::Unsupported,
                reason: "".into(),
            };
            let _ = reply_tx.send(Outbound::Close(frame)).await;
            break;
        };

        // Admission checks, mirroring the plaintext listeners.
        if req.message_type() == MessageType::Response {
            continue;
        }
        if req.op_code() != OpCode::Query {
            let reject = message::response_with_code(&req, ResponseCode::NotImp);
            let _ = reply_tx.send(Outbound::Reply(reject)).await;
            continue;
        }
        if let Some(reject) = message::validate_query(&req, settings.udp_buffer_size) {
            let _ = reply_tx.send(Outbound::Reply(reject)).await;
            continue;
        }

        match requests.clone().try_acquire_owned() {
            Ok(slot) => {
                let upstream = Arc::clone(&upstream);
                let reply_tx = reply_tx.clone();
                workers.spawn(async move {
                    if let Some(resp) = upstream.forward(req).await {
                        let _ = reply_tx.send(Outbound::Reply(resp)).await;
                    }
                    drop(slot);
                });
            }
            Err(_) => {
                log::debug!(
                    "maximum open requests reached for {}, refusing query {}",
                    remote,
                    req.id()
                );
                let refused = message::failure_response(
                    &req,
                    ResponseCode::Refused,
                    settings.udp_buffer_size,
                    Some(message::BUSY_TEXT),
                );
                let _ = reply_tx.send(Outbound::Reply(refused)).await;
            }
        }
    }

    // Teardown: workers drain into the writer, the writer closes the
    // connection, and the session slot is released last.
    drop(reply_tx);
    while workers.join_next().await.is_some() {}
    let _ = writer.await;
    drop(permit);
    log::debug!("finished for {}", remote);
}
