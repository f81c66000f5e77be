//! Classic DNS upstream client
//!
//! Implements the plaintext path (UDP exchange with TCP retry on
//! truncation) and the DNS-over-TLS path with a LIFO pool of idle
//! connections. Transport failures never escape: they are converted into
//! SERVFAIL responses carrying an EDE option with the error text.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::message;
use crate::tls;

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP/DoT DNS response size
const MAX_TCP_RESPONSE_SIZE: usize = 65535;

/// Forwarder for plaintext and DNS-over-TLS upstreams
pub struct DnsForwarder {
    upstream: Upstream,
    udp_buffer_size: u16,
    timeout: Duration,
    bootstrap: Option<SocketAddr>,
    closed: AtomicBool,
}

enum Upstream {
    Plain(SocketAddr),
    Dot(Dot),
}

struct Dot {
    hostname: String,
    port: u16,
    connector: TlsConnector,
    /// Idle connections, reused most-recently-returned first
    pool: Mutex<Vec<TlsStream<TcpStream>>>,
}

impl DnsForwarder {
    /// Create a forwarder for a plaintext upstream
    pub fn plain(addr: SocketAddr, settings: &Settings) -> Self {
        Self {
            upstream: Upstream::Plain(addr),
            udp_buffer_size: settings.udp_buffer_size,
            timeout: settings.timeout,
            bootstrap: settings.bootstrap,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a forwarder for a DNS-over-TLS upstream
    pub fn dot(hostname: String, port: u16, settings: &Settings) -> Result<Self> {
        let config = tls::client_tls_config(settings.insecure)?;
        Ok(Self {
            upstream: Upstream::Dot(Dot {
                hostname,
                port,
                connector: TlsConnector::from(Arc::new(config)),
                pool: Mutex::new(Vec::new()),
            }),
            udp_buffer_size: settings.udp_buffer_size,
            timeout: settings.timeout,
            bootstrap: settings.bootstrap,
            closed: AtomicBool::new(false),
        })
    }

    /// Upstream address for logging
    pub fn address(&self) -> String {
        match &self.upstream {
            Upstream::Plain(addr) => addr.to_string(),
            Upstream::Dot(dot) => format!("tls://{}:{}", dot.hostname, dot.port),
        }
    }

    /// Forward a query and return the response.
    ///
    /// Returns `None` once the forwarder has been closed. Transport
    /// failures yield a synthesized SERVFAIL.
    pub async fn forward(&self, mut req: Message) -> Option<Message> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let request_had_opt = req.extensions().is_some();
        message::shape_request_edns(&mut req, self.udp_buffer_size);

        let result = match &self.upstream {
            Upstream::Plain(addr) => self.exchange_plain(&req, *addr).await,
            Upstream::Dot(dot) => self.exchange_dot(&req, dot).await,
        };

        let mut resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                log::debug!("exchange with {} failed: {}", self.address(), err);
                let mut resp = message::failure_response(
                    &req,
                    ResponseCode::ServFail,
                    self.udp_buffer_size,
                    Some(&format!("No response from upstream: {}", err)),
                );
                // The request was shaped above; only callers that sent an
                // OPT themselves get one back.
                message::shape_response_edns(&mut resp, request_had_opt, self.udp_buffer_size);
                return Some(resp);
            }
        };

        message::shape_response_edns(&mut resp, request_had_opt, self.udp_buffer_size);
        Some(resp)
    }

    /// Close the forwarder and drop every pooled connection
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Upstream::Dot(dot) = &self.upstream {
            dot.pool.lock().await.clear();
        }
    }

    async fn exchange_plain(&self, req: &Message, addr: SocketAddr) -> Result<Message> {
        let wire = req
            .to_vec()
            .map_err(|e| Error::Dns(format!("encode query: {}", e)))?;

        let resp_bytes = udp_exchange(&wire, addr, self.timeout).await?;
        let resp = Message::from_vec(&resp_bytes)
            .map_err(|e| Error::Dns(format!("invalid response: {}", e)))?;
        if !resp.truncated() {
            return Ok(resp);
        }

        // Truncated over UDP: retry once over TCP to the same address.
        let resp_bytes = tcp_exchange(&wire, addr, self.timeout).await?;
        Message::from_vec(&resp_bytes).map_err(|e| Error::Dns(format!("invalid response: {}", e)))
    }

    async fn exchange_dot(&self, req: &Message, dot: &Dot) -> Result<Message> {
        let wire = req
            .to_vec()
            .map_err(|e| Error::Dns(format!("encode query: {}", e)))?;

        // Reuse the most recently returned idle connection; one that errors
        // is discarded rather than returned.
        let idle = dot.pool.lock().await.pop();
        if let Some(mut conn) = idle {
            match stream_exchange(&mut conn, &wire, self.timeout).await {
                Ok(resp_bytes) => {
                    dot.pool.lock().await.push(conn);
                    return Message::from_vec(&resp_bytes)
                        .map_err(|e| Error::Dns(format!("invalid response: {}", e)));
                }
                Err(err) => {
                    log::debug!("pooled connection to {} failed: {}", self.address(), err);
                }
            }
        }

        let addr = resolve_host(&dot.hostname, dot.port, self.bootstrap, self.timeout).await?;
        let tcp = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Dns(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::Dns(format!("connect to {}: {}", addr, e)))?;

        let server_name = rustls_pki_types::ServerName::try_from(dot.hostname.clone())
            .map_err(|_| Error::Tls(format!("invalid server name '{}'", dot.hostname)))?;
        let mut conn = timeout(self.timeout, dot.connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Tls(format!("TLS handshake with {} timed out", addr)))?
            .map_err(|e| Error::Tls(format!("TLS handshake with {}: {}", addr, e)))?;

        let resp_bytes = stream_exchange(&mut conn, &wire, self.timeout).await?;
        dot.pool.lock().await.push(conn);
        Message::from_vec(&resp_bytes).map_err(|e| Error::Dns(format!("invalid response: {}", e)))
    }
}

/// One UDP request/response exchange with a fresh connected socket.
///
/// Datagrams whose id does not match the query are ignored until the
/// deadline expires.
pub(crate) async fn udp_exchange(
    query: &[u8],
    addr: SocketAddr,
    timeout_dur: Duration,
) -> Result<Vec<u8>> {
    let bind_addr = if addr.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::Dns(format!("bind UDP socket: {}", e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| Error::Dns(format!("connect UDP socket to {}: {}", addr, e)))?;
    socket
        .send(query)
        .await
        .map_err(|e| Error::Dns(format!("send query to {}: {}", addr, e)))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let result = timeout(timeout_dur, async {
        loop {
            let len = socket.recv(&mut buf).await?;
            if len >= 2 && query.len() >= 2 && buf[..2] != query[..2] {
                continue;
            }
            return Ok::<usize, std::io::Error>(len);
        }
    })
    .await;

    match result {
        Ok(Ok(len)) => {
            buf.truncate(len);
            Ok(buf)
        }
        Ok(Err(e)) => Err(Error::Dns(format!("receive from {}: {}", addr, e))),
        Err(_) => Err(Error::Dns("timeout".into())),
    }
}

/// One TCP request/response exchange with a fresh connection
pub(crate) async fn tcp_exchange(
    query: &[u8],
    addr: SocketAddr,
    timeout_dur: Duration,
) -> Result<Vec<u8>> {
    let mut stream = timeout(timeout_dur, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Dns(format!("connect to {} timed out", addr)))?
        .map_err(|e| Error::Dns(format!("connect to {}: {}", addr, e)))?;
    stream_exchange(&mut stream, query, timeout_dur).await
}

/// Length-prefixed DNS exchange over an established stream
pub(crate) async fn stream_exchange<S>(
    stream: &mut S,
    query: &[u8],
    timeout_dur: Duration,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);

    timeout(timeout_dur, stream.write_all(&framed))
        .await
        .map_err(|_| Error::Dns("stream write timed out".into()))?
        .map_err(|e| Error::Dns(format!("stream write: {}", e)))?;

    let mut len_buf = [0u8; 2];
    timeout(timeout_dur, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| Error::Dns("stream read timed out".into()))?
        .map_err(|e| Error::Dns(format!("stream read: {}", e)))?;

    let resp_len = u16::from_be_bytes(len_buf) as usize;
    if resp_len > MAX_TCP_RESPONSE_SIZE {
        return Err(Error::Dns("response too large".into()));
    }

    let mut resp = vec![0u8; resp_len];
    timeout(timeout_dur, stream.read_exact(&mut resp))
        .await
        .map_err(|_| Error::Dns("stream read timed out".into()))?
        .map_err(|e| Error::Dns(format!("stream read: {}", e)))?;
    Ok(resp)
}

/// Resolve `host:port` to a socket address.
///
/// IP literals pass straight through. When a bootstrap resolver is
/// configured, hostname lookups are DNS queries against it; otherwise the
/// system resolver is used.
pub(crate) async fn resolve_host(
    host: &str,
    port: u16,
    bootstrap: Option<SocketAddr>,
    timeout_dur: Duration,
) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    if let Some(server) = bootstrap {
        return bootstrap_lookup(host, port, server, timeout_dur).await;
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Dns(format!("resolve {}: {}", host, e)))?
        .collect();
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| Error::Dns(format!("no addresses found for {}", host)))
}

/// Resolve a hostname by querying the bootstrap DNS server directly
async fn bootstrap_lookup(
    host: &str,
    port: u16,
    server: SocketAddr,
    timeout_dur: Duration,
) -> Result<SocketAddr> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{}.", host)
    };
    let name =
        Name::from_str(&fqdn).map_err(|e| Error::Dns(format!("invalid hostname {}: {}", host, e)))?;

    for record_type in [RecordType::A, RecordType::AAAA] {
        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_recursion_desired(true);
        query.add_query(Query::query(name.clone(), record_type));
        let wire = query
            .to_vec()
            .map_err(|e| Error::Dns(format!("encode bootstrap query: {}", e)))?;

        let resp_bytes = udp_exchange(&wire, server, timeout_dur).await?;
        let resp = Message::from_vec(&resp_bytes)
            .map_err(|e| Error::Dns(format!("invalid bootstrap response: {}", e)))?;

        let found = resp.answers().iter().find_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        });
        if let Some(ip) = found {
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(Error::Dns(format!(
        "bootstrap resolver returned no addresses for {}",
        host
    )))
}
