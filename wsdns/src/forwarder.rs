//! The uniform upstream forwarder
//!
//! A forwarder exposes three operations: `address` for logging, `forward`
//! to exchange one query for one response, and `close`. `forward`
//! returning `None` means "drop the transaction"; it only happens after
//! the forwarder has been closed.

use hickory_proto::op::Message;

use crate::client::DnsForwarder;
use crate::config::{Settings, UpstreamSpec};
use crate::error::Result;
use crate::websocket::WebSocketForwarder;

/// Upstream forwarder, one per process
pub enum Forwarder {
    /// Plaintext or DNS-over-TLS upstream
    Dns(DnsForwarder),
    /// DNS-over-WebSocket upstream
    WebSocket(WebSocketForwarder),
}

impl Forwarder {
    /// Build the forwarder matching an upstream specification
    pub fn new(spec: UpstreamSpec, settings: &Settings) -> Result<Self> {
        match spec {
            UpstreamSpec::Plain { addr } => {
                Ok(Forwarder::Dns(DnsForwarder::plain(addr, settings)))
            }
            UpstreamSpec::Dot { hostname, port } => {
                Ok(Forwarder::Dns(DnsForwarder::dot(hostname, port, settings)?))
            }
            UpstreamSpec::Ws { endpoint } => Ok(Forwarder::WebSocket(WebSocketForwarder::new(
                endpoint, false, settings,
            )?)),
            UpstreamSpec::Wss { endpoint } => Ok(Forwarder::WebSocket(WebSocketForwarder::new(
                endpoint, true, settings,
            )?)),
        }
    }

    /// Upstream address for logging
    pub fn address(&self) -> String {
        match self {
            Forwarder::Dns(inner) => inner.address(),
            Forwarder::WebSocket(inner) => inner.address(),
        }
    }

    /// Forward one query; `None` means the transaction is dropped
    pub async fn forward(&self, req: Message) -> Option<Message> {
        match self {
            Forwarder::Dns(inner) => inner.forward(req).await,
            Forwarder::WebSocket(inner) => inner.forward(req).await,
        }
    }

    /// Close the forwarder; idempotent and safe alongside in-flight calls
    pub async fn close(&self) {
        match self {
            Forwarder::Dns(inner) => inner.close().await,
            Forwarder::WebSocket(inner) => inner.close().await,
        }
    }
}
