//! Multiplexed DNS-over-WebSocket upstream client
//!
//! A single outbound WebSocket carries every concurrent DNS transaction.
//! Callers do not coordinate their transaction ids, so each request is
//! rewritten into a private id space before it hits the wire and the
//! caller's id is restored on the way back. A background reader task
//! routes each inbound binary frame to its waiting caller by id.
//!
//! The connection sink and the waiting map share one mutex; frames are
//! written while it is held, which is what serializes writers (the
//! WebSocket protocol forbids concurrent writes).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{client_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::client::resolve_host;
use crate::config::{Settings, WsEndpoint};
use crate::error::{Error, Result};
use crate::message;
use crate::tls;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Forwarder that multiplexes DNS queries over one outbound WebSocket
pub struct WebSocketForwarder {
    endpoint: WsEndpoint,
    tls: Option<TlsConnector>,
    /// Admission gate; acquisition never blocks
    semaphore: Semaphore,
    inner: Arc<Mutex<Inner>>,
    closed: AtomicBool,
    udp_buffer_size: u16,
    ws_buffer_size: usize,
    timeout: Duration,
    bootstrap: Option<SocketAddr>,
}

struct Inner {
    /// Write half of the current connection, if any
    sink: Option<WsSink>,
    /// In-flight transactions keyed by their rewritten id
    waiting: HashMap<u16, oneshot::Sender<Message>>,
    /// Reader task of the current connection
    reader: Option<JoinHandle<()>>,
}

impl WebSocketForwarder {
    /// Create a forwarder for a `ws://` or `wss://` upstream
    pub fn new(endpoint: WsEndpoint, use_tls: bool, settings: &Settings) -> Result<Self> {
        let tls = if use_tls {
            let config = tls::client_tls_config(settings.insecure)?;
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        Ok(Self {
            endpoint,
            tls,
            semaphore: Semaphore::new(settings.requests_per_ws),
            inner: Arc::new(Mutex::new(Inner {
                sink: None,
                waiting: HashMap::new(),
                reader: None,
            })),
            closed: AtomicBool::new(false),
            udp_buffer_size: settings.udp_buffer_size,
            ws_buffer_size: settings.ws_buffer_size,
            timeout: settings.timeout,
            bootstrap: settings.bootstrap,
        })
    }

    /// Upstream URL for logging
    pub fn address(&self) -> String {
        self.endpoint.url.clone()
    }

    /// Forward a query over the shared WebSocket and wait for its reply.
    ///
    /// Returns `None` once the forwarder has been closed. Admission
    /// refusals yield REFUSED, transport failures and timeouts yield
    /// SERVFAIL; every returned response carries the caller's original id.
    pub async fn forward(&self, mut req: Message) -> Option<Message> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        // The slot is held until this call returns.
        let _permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                log::debug!("maximum open requests reached, refusing query {}", req.id());
                return Some(message::failure_response(
                    &req,
                    ResponseCode::Refused,
                    self.udp_buffer_size,
                    Some(message::BUSY_TEXT),
                ));
            }
        };

        let original_id = req.id();
        let mut inner = self.inner.lock().await;

        // Pick an id unused among the transactions in flight on this
        // connection.
        let new_id = loop {
            let candidate: u16 = rand::random();
            if !inner.waiting.contains_key(&candidate) {
                break candidate;
            }
        };
        req.set_id(new_id);

        let wire = match req.to_vec() {
            Ok(wire) => wire,
            Err(err) => {
                drop(inner);
                log::error!("encode error for query {}: {}", new_id, err);
                let mut resp = message::response_with_code(&req, ResponseCode::ServFail);
                resp.set_id(original_id);
                return Some(resp);
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        inner.waiting.insert(new_id, reply_tx);

        if let Some(sink) = inner.sink.as_mut() {
            if let Err(err) = sink.send(WsMessage::Binary(wire.clone())).await {
                log::debug!("write error, will reopen and try again: {}", err);
                drop_connection(&mut inner).await;
            }
        }

        if inner.sink.is_none() {
            log::debug!("opening WebSocket connection to {}", self.endpoint.url);
            let send_result = match self.open().await {
                Ok((mut sink, reader)) => match sink.send(WsMessage::Binary(wire)).await {
                    Ok(()) => {
                        inner.sink = Some(sink);
                        inner.reader = Some(reader);
                        Ok(())
                    }
                    Err(err) => {
                        log::debug!("write error, giving up: {}", err);
                        reader.abort();
                        Err(Error::WebSocket(err.to_string()))
                    }
                },
                Err(err) => {
                    log::debug!("open error: {}", err);
                    Err(err)
                }
            };

            if let Err(err) = send_result {
                inner.waiting.remove(&new_id);
                drop(inner);
                let mut resp = message::failure_response(
                    &req,
                    ResponseCode::ServFail,
                    self.udp_buffer_size,
                    Some(&format!("No response from upstream: {}", err)),
                );
                resp.set_id(original_id);
                return Some(resp);
            }
        }

        drop(inner);

        match timeout(self.timeout, reply_rx).await {
            Ok(Ok(mut resp)) => {
                resp.set_id(original_id);
                Some(resp)
            }
            _ => {
                log::debug!(
                    "timeout waiting for response to query {} ({})",
                    new_id,
                    original_id
                );
                self.inner.lock().await.waiting.remove(&new_id);
                let mut resp = message::failure_response(
                    &req,
                    ResponseCode::ServFail,
                    self.udp_buffer_size,
                    Some("No response from upstream: timeout"),
                );
                resp.set_id(original_id);
                Some(resp)
            }
        }
    }

    /// Close the forwarder: send a GoingAway close frame on the current
    /// connection and join the reader task. Waiters time out on their own.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let reader = {
            let mut inner = self.inner.lock().await;
            if let Some(mut sink) = inner.sink.take() {
                log::debug!("sending close message");
                let frame = WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "".into(),
                }));
                match timeout(self.timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => log::debug!("close write error: {}", err),
                    Err(_) => log::debug!("close write timed out"),
                }
            }
            inner.reader.take()
        };
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
    }

    /// Dial the endpoint and start the reader task for the new connection
    async fn open(&self) -> Result<(WsSink, JoinHandle<()>)> {
        let addr = resolve_host(
            &self.endpoint.host,
            self.endpoint.port,
            self.bootstrap,
            self.timeout,
        )
        .await?;

        let tcp = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::WebSocket(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::WebSocket(format!("connect to {}: {}", addr, e)))?;

        let stream = match &self.tls {
            Some(connector) => {
                let server_name = rustls_pki_types::ServerName::try_from(self.endpoint.host.clone())
                    .map_err(|_| {
                        Error::Tls(format!("invalid server name '{}'", self.endpoint.host))
                    })?;
                let tls_stream = timeout(self.timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| Error::Tls(format!("TLS handshake with {} timed out", addr)))?
                    .map_err(|e| Error::Tls(format!("TLS handshake with {}: {}", addr, e)))?;
                MaybeTlsStream::Rustls(tls_stream)
            }
            None => MaybeTlsStream::Plain(tcp),
        };

        let request = self.handshake_request()?;
        let config = ws_config(self.ws_buffer_size, None);
        let (ws, _response) =
            timeout(self.timeout, client_async_with_config(request, stream, Some(config)))
                .await
                .map_err(|_| Error::WebSocket("handshake timed out".into()))?
                .map_err(|e| Error::WebSocket(format!("handshake: {}", e)))?;

        let (sink, source) = ws.split();
        let reader = tokio::spawn(read_loop(source, Arc::clone(&self.inner)));
        Ok((sink, reader))
    }

    fn handshake_request(&self) -> Result<Request<()>> {
        Request::builder()
            .uri(&self.endpoint.url)
            .header("Host", self.endpoint.authority())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|e| Error::WebSocket(format!("build handshake request: {}", e)))
    }
}

/// Frame buffer configuration shared by both WebSocket ends
pub(crate) fn ws_config(buffer_size: usize, read_limit: Option<usize>) -> WebSocketConfig {
    WebSocketConfig {
        write_buffer_size: buffer_size,
        max_message_size: read_limit,
        max_frame_size: read_limit,
        ..WebSocketConfig::default()
    }
}

/// Tear down the current connection after a write error
async fn drop_connection(inner: &mut Inner) {
    if let Some(mut sink) = inner.sink.take() {
        let _ = sink.close().await;
    }
    if let Some(reader) = inner.reader.take() {
        reader.abort();
    }
}

/// Reader task: route each inbound binary frame to its waiter by id.
///
/// Non-binary frames are dropped; frames without a registered waiter are
/// stale (their caller already timed out) and only logged. Exits on the
/// first read error.
async fn read_loop(mut source: WsSource, inner: Arc<Mutex<Inner>>) {
    log::debug!("starting read loop");
    loop {
        match source.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                let resp = match Message::from_vec(&data) {
                    Ok(resp) => resp,
                    Err(err) => {
                        log::debug!("invalid message from upstream: {}", err);
                        continue;
                    }
                };
                let waiter = inner.lock().await.waiting.remove(&resp.id());
                match waiter {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(resp);
                    }
                    None => log::debug!("received response for stale query {}", resp.id()),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                log::debug!("read error: {}", err);
                break;
            }
            None => break,
        }
    }
    log::debug!("exiting read loop");
}
