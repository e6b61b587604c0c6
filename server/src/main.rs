//! mobimeter-server - measurement peer for the mobimeter agent
//!
//! Serves UDP bursts, UDP echo for RRC inference and the three TCP
//! throughput ports.

mod config;
mod handlers;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use handlers::Service;
use session::SessionManager;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info};

/// Room for a full burst arriving back to back
const UDP_RECV_BUFFER: usize = 1 << 20;

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "mobimeter server - UDP burst, echo and TCP throughput peer", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "server.conf")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
    
    info!("Starting mobimeter server v{}", env!("CARGO_PKG_VERSION"));
    
    // Load configuration
    let config = config::Config::load(&args.config)
        .context("Failed to load configuration")?;
    
    info!(
        "Loaded configuration from: {}",
        args.config
    );
    
    let general = &config.general;
    let limits = Arc::new(config.limits.clone());
    let sessions = Arc::new(SessionManager::new(limits.burst_idle()));
    
    // Echo service
    let echo_socket = Arc::new(bind_udp(&general.bind_address, general.echo_port)?);
    info!("Echo service on port {}", general.echo_port);
    tokio::spawn(handlers::serve_echo(echo_socket));
    
    // Throughput services
    for (port, service) in [
        (general.throughput_down_port, Service::Downlink),
        (general.throughput_up_port, Service::Uplink),
        (general.throughput_config_port, Service::Config),
    ] {
        let listener = bind_tcp(&general.bind_address, port)?;
        info!("Throughput {:?} service on port {}", service, port);
        tokio::spawn(handlers::serve_throughput(listener, service, limits.clone()));
    }
    
    // Burst service
    let socket = Arc::new(bind_udp(&general.bind_address, general.burst_port)?);
    info!("Burst service on port {}", general.burst_port);
    info!("Max burst: {} packets of up to {} bytes", limits.max_burst_count, limits.max_packet_size);
    
    // Answer uplink bursts that lost their last packet
    let flush_sessions = sessions.clone();
    let flush_socket = socket.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(500));
        loop {
            interval.tick().await;
            for (client_addr, response) in flush_sessions.take_stale().await {
                debug!("Flushing idle uplink burst {} from {}", response.seq, client_addr);
                if let Err(e) = flush_socket.send_to(&response.to_bytes(), client_addr).await {
                    error!("Failed to send response to {}: {}", client_addr, e);
                }
            }
            let active = flush_sessions.active_sessions().await;
            if active > 0 {
                debug!("Active uplink bursts: {}", active);
            }
        }
    });
    
    // Main server loop
    let mut buf = vec![0u8; 65535]; // Max UDP packet size
    
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, client_addr)) => {
                let data = buf[..len].to_vec();
                let socket_clone = socket.clone();
                let sessions_clone = sessions.clone();
                let limits_clone = limits.clone();
                
                // Spawn task to handle packet
                tokio::spawn(async move {
                    if let Err(e) =
                        handlers::handle_burst(&data, client_addr, &socket_clone, &sessions_clone, &limits_clone).await
                    {
                        debug!("Burst packet from {} rejected: {}", client_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Error receiving packet: {}", e);
            }
        }
    }
}

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = address
        .parse()
        .with_context(|| format!("Invalid bind address {:?}", address))?;
    Ok(SocketAddr::new(ip, port))
}

fn bind_udp(address: &str, port: u16) -> Result<UdpSocket> {
    let addr = socket_addr(address, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind UDP {}", addr))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn bind_tcp(address: &str, port: u16) -> Result<TcpListener> {
    let addr = socket_addr(address, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TCP {}", addr))?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}
