//! Plaintext DNS listeners
//!
//! UDP and TCP listeners share the admission filter and forward through
//! the single process-wide forwarder. UDP responses are truncated to the
//! effective EDNS size; TCP responses are written length-prefixed and
//! never truncated.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::config::Settings;
use crate::error::Result;
use crate::forwarder::Forwarder;
use crate::message::{self, Screen};

/// Largest datagram the UDP listener will accept
const MAX_UDP_DATAGRAM: usize = 4096;

/// Largest frame the TCP listener will accept
const MAX_TCP_FRAME: usize = 65535;

/// DNS listener glue for client mode
#[derive(Clone)]
pub struct DnsProxy {
    upstream: Arc<Forwarder>,
    settings: Arc<Settings>,
}

impl DnsProxy {
    pub fn new(upstream: Arc<Forwarder>, settings: Arc<Settings>) -> Self {
        Self { upstream, settings }
    }

    /// Serve DNS over UDP on a bound socket
    pub async fn run_udp(&self, socket: UdpSocket) -> Result<()> {
        log::info!("DNS (udp) listener on {}", socket.local_addr()?);
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_UDP_DATAGRAM];

        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    log::error!("udp recv error: {}", err);
                    continue;
                }
            };
            let packet = buf[..len].to_vec();

            match message::screen_header(&packet) {
                Screen::Ignore => continue,
                Screen::NotImplemented => {
                    let reply = message::reject_from_header(&packet, ResponseCode::NotImp);
                    let _ = socket.send_to(&reply, src).await;
                    continue;
                }
                Screen::FormatError => {
                    let reply = message::reject_from_header(&packet, ResponseCode::FormErr);
                    let _ = socket.send_to(&reply, src).await;
                    continue;
                }
                Screen::Accept => {}
            }

            let socket = Arc::clone(&socket);
            let upstream = Arc::clone(&self.upstream);
            let settings = Arc::clone(&self.settings);
            tokio::spawn(async move {
                handle_udp_query(socket, packet, src, upstream, settings).await;
            });
        }
    }

    /// Serve DNS over TCP on a bound listener
    pub async fn run_tcp(&self, listener: TcpListener) -> Result<()> {
        log::info!("DNS (tcp) listener on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("tcp accept error: {}", err);
                    continue;
                }
            };

            let upstream = Arc::clone(&self.upstream);
            let settings = Arc::clone(&self.settings);
            tokio::spawn(async move {
                handle_tcp_conn(stream, peer, upstream, settings).await;
            });
        }
    }
}

async fn handle_udp_query(
    socket: Arc<UdpSocket>,
    packet: Vec<u8>,
    src: SocketAddr,
    upstream: Arc<Forwarder>,
    settings: Arc<Settings>,
) {
    let req = match Message::from_vec(&packet) {
        Ok(req) => req,
        Err(err) => {
            log::debug!("unparseable query from {}: {}", src, err);
            let reply = message::reject_from_header(&packet, ResponseCode::FormErr);
            let _ = socket.send_to(&reply, src).await;
            return;
        }
    };

    if let Some(reject) = message::validate_query(&req, settings.udp_buffer_size) {
        match reject.to_vec() {
            Ok(wire) => {
                let _ = socket.send_to(&wire, src).await;
            }
            Err(err) => log::error!("encode error for reply to {}: {}", src, err),
        }
        return;
    }

    let announced = req
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload())
        .unwrap_or(0);

    let Some(mut resp) = upstream.forward(req).await else {
        return;
    };

    let limit = message::effective_udp_size(announced, settings.udp_buffer_size);
    match message::encode_truncated(&mut resp, limit) {
        Ok(wire) => {
            let _ = socket.send_to(&wire, src).await;
        }
        Err(err) => log::error!("encode error for reply to {}: {}", src, err),
    }
}

/// Serve length-prefixed queries on one TCP connection until it goes
/// idle past the network deadline, errors, or closes
async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    upstream: Arc<Forwarder>,
    settings: Arc<Settings>,
) {
    let mut len_buf = [0u8; 2];
    loop {
        match timeout(settings.timeout, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return;
        }

        let mut packet = vec![0u8; frame_len];
        match timeout(settings.timeout, stream.read_exact(&mut packet)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }

        match message::screen_header(&packet) {
            Screen::Ignore => continue,
            Screen::NotImplemented => {
                let reply = message::reject_from_header(&packet, ResponseCode::NotImp);
                if write_frame(&mut stream, &reply).await.is_err() {
                    return;
                }
                continue;
            }
            Screen::FormatError => {
                let reply = message::reject_from_header(&packet, ResponseCode::FormErr);
                if write_frame(&mut stream, &reply).await.is_err() {
                    return;
                }
                continue;
            }
            Screen::Accept => {}
        }

        let req = match Message::from_vec(&packet) {
            Ok(req) => req,
            Err(err) => {
                log::debug!("unparseable query from {}: {}", peer, err);
                let reply = message::reject_from_header(&packet, ResponseCode::FormErr);
                if write_frame(&mut stream, &reply).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if let Some(reject) = message::validate_query(&req, settings.udp_buffer_size) {
            match reject.to_vec() {
                Ok(wire) => {
                    if write_frame(&mut stream, &wire).await.is_err() {
                        return;
                    }
                }
                Err(err) => log::error!("encode error for reply to {}: {}", peer, err),
            }
            continue;
        }

        let Some(resp) = upstream.forward(req).await else {
            continue;
        };

        let wire = match resp.to_vec() {
            Ok(wire) => wire,
            Err(err) => {
                log::error!("encode error for reply to {}: {}", peer, err);
                continue;
            }
        };
        if wire.len() > u16::MAX as usize {
            log::error!("response to {} too large for TCP framing", peer);
            continue;
        }
        if write_frame(&mut stream, &wire).await.is_err() {
            return;
        }
    }
}

async fn write_frame(stream: &mut TcpStream, wire: &[u8]) -> std::io::Result<()> {
    stream
        .write_all(&(wire.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(wire).await
}
