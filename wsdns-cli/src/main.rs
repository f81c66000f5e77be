//! wsdns CLI
//!
//! Runs either the client end (plaintext DNS listeners forwarding
//! upstream) or the server end (WebSocket acceptor forwarding to a
//! classical DNS upstream).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wsdns::{parse_listen_addr, parse_upstream, DnsProxy, Forwarder, Settings, WsAcceptor};

/// Environment variable naming a DNS server used to resolve upstream
/// hostnames when dialing
const BOOTSTRAP_ENV: &str = "BOOTSTRAP_DNS";

#[derive(Parser, Debug)]
#[command(name = "wsdns", version, about = "DNS forwarding proxy with WebSocket transport", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(long)]
    verbose: bool,

    /// Listening [IP]:port; leave the IP empty to listen on all
    /// interfaces (default ":53", ":80", or ":443" depending on mode)
    #[arg(long, default_value = "")]
    listen: String,

    /// Upstream DNS server IP address or URL
    #[arg(long)]
    upstream: String,

    /// Skip server certificate verification for upstream encrypted
    /// connections
    #[arg(long)]
    insecure: bool,

    /// Listen for WebSocket connections instead of plaintext DNS
    #[arg(long)]
    server: bool,

    /// TLS certificate file path for encrypting WebSocket connections in
    /// server mode
    #[arg(long = "tls-cert")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file path for encrypting WebSocket connections in
    /// server mode
    #[arg(long = "tls-key")]
    tls_key: Option<PathBuf>,

    /// EDNS UDP buffer size in bytes
    #[arg(long = "udp-buffer", default_value_t = 1232, value_parser = clap::value_parser!(u16).range(512..=4096))]
    udp_buffer: u16,

    /// WebSocket read and write buffer size in bytes
    #[arg(long = "ws-buffer", default_value_t = 512)]
    ws_buffer: usize,

    /// Maximum number of WebSockets to serve simultaneously
    #[arg(long = "max-ws", default_value_t = 50)]
    max_ws: usize,

    /// Maximum number of open DNS requests per WebSocket
    #[arg(long = "requests-per-ws", default_value_t = 50)]
    requests_per_ws: usize,

    /// Maximum time in seconds to wait for network activities
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.tls_cert.is_some() != args.tls_key.is_some() {
        eprintln!("flags --tls-cert and --tls-key must be provided together");
        std::process::exit(2);
    }

    let settings = Settings {
        udp_buffer_size: args.udp_buffer,
        ws_buffer_size: args.ws_buffer,
        max_websockets: args.max_ws,
        requests_per_ws: args.requests_per_ws,
        timeout: Duration::from_secs(args.timeout),
        insecure: args.insecure,
        bootstrap: bootstrap_from_env(),
    };
    if let Err(err) = settings.validate() {
        eprintln!("{}", err);
        std::process::exit(2);
    }

    let default_port = if args.server {
        if args.tls_cert.is_some() {
            443
        } else {
            80
        }
    } else {
        53
    };
    let listen = match parse_listen_addr(&args.listen, default_port) {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!(
                "invalid value {:?} for flag --listen: {}",
                args.listen, err
            );
            std::process::exit(2);
        }
    };

    let spec = match parse_upstream(&args.upstream) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!(
                "invalid value {:?} for flag --upstream: {}",
                args.upstream, err
            );
            std::process::exit(2);
        }
    };
    let upstream =
        Arc::new(Forwarder::new(spec, &settings).context("create upstream forwarder")?);

    debug!(
        upstream = %upstream.address(),
        insecure = settings.insecure,
        udp_buffer = settings.udp_buffer_size,
        ws_buffer = settings.ws_buffer_size,
        max_ws = settings.max_websockets,
        requests_per_ws = settings.requests_per_ws,
        timeout = ?settings.timeout,
        "configuration"
    );

    let settings = Arc::new(settings);

    if args.server {
        let tls = match (&args.tls_cert, &args.tls_key) {
            (Some(cert), Some(key)) => Some(
                wsdns::server_tls_acceptor(cert, key)
                    .context("load server TLS certificate")?,
            ),
            _ => None,
        };
        let scheme = if tls.is_some() { "wss" } else { "ws" };
        info!("starting WebSocket listener on {}://{}", scheme, listen);

        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("bind {}", listen))?;
        let acceptor = WsAcceptor::new(Arc::clone(&upstream), tls, Arc::clone(&settings));
        tokio::spawn(async move {
            if let Err(err) = acceptor.run(listener).await {
                error!("WebSocket listener failed: {}", err);
            }
        });
    } else {
        let udp = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("bind udp {}", listen))?;
        let tcp = TcpListener::bind(listen)
            .await
            .with_context(|| format!("bind tcp {}", listen))?;

        let proxy = DnsProxy::new(Arc::clone(&upstream), Arc::clone(&settings));
        let udp_proxy = proxy.clone();
        tokio::spawn(async move {
            if let Err(err) = udp_proxy.run_udp(udp).await {
                error!("DNS (udp) listener failed: {}", err);
            }
        });
        tokio::spawn(async move {
            if let Err(err) = proxy.run_tcp(tcp).await {
                error!("DNS (tcp) listener failed: {}", err);
            }
        });
    }

    wait_for_shutdown().await?;
    info!("closing upstream forwarder");
    upstream.close().await;

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn bootstrap_from_env() -> Option<SocketAddr> {
    let value = std::env::var(BOOTSTRAP_ENV).ok()?;
    match parse_listen_addr(&value, 53) {
        Ok(addr) => Some(addr),
        Err(err) => {
            eprintln!("invalid value {:?} for {}: {}", value, BOOTSTRAP_ENV, err);
            std::process::exit(2);
        }
    }
}

/// Block until the process is asked to stop
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, stopping"),
            _ = sigint.recv() => info!("SIGINT received, stopping"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("listen for interrupt signal")?;
        info!("interrupt received, stopping");
        Ok(())
    }
}
