//! wsdns - DNS forwarding proxy with a multiplexed WebSocket transport
//!
//! The proxy has two symmetric ends:
//! - Client end: accepts DNS over UDP and TCP from local clients and
//!   forwards each query upstream
//! - Server end: accepts WebSocket-framed DNS from remote clients and
//!   forwards to a classical DNS upstream
//!
//! Supported upstreams:
//! - Plaintext DNS (UDP with TCP retry on truncation)
//! - DNS over TLS (DoT) with a pool of reused connections
//! - DNS over WebSocket (`ws://` / `wss://`), multiplexing every
//!   concurrent transaction over one long-lived connection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wsdns::{parse_upstream, Forwarder, Settings};
//!
//! # async fn example() -> wsdns::Result<()> {
//! let settings = Settings::default();
//! let spec = parse_upstream("wss://resolver.example/dns")?;
//! let upstream = Arc::new(Forwarder::new(spec, &settings)?);
//! println!("forwarding to {}", upstream.address());
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
pub mod error;
pub mod message;
mod forwarder;
mod proxy;
mod server;
mod tls;
mod websocket;

pub use client::DnsForwarder;
pub use config::{parse_listen_addr, parse_upstream, Settings, UpstreamSpec, WsEndpoint};
pub use error::{Error, Result};
pub use forwarder::Forwarder;
pub use proxy::DnsProxy;
pub use server::{WsAcceptor, WS_READ_LIMIT};
pub use tls::server_tls_acceptor;
pub use websocket::WebSocketForwarder;
