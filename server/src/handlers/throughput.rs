//! TCP throughput service
//!
//! Three ports: downlink (server sends random bytes until the time is up or
//! the agent hangs up), uplink (server reads until the `*` terminator and
//! answers with its `#`-separated kbps samples) and config (server sends
//! its version string).

use crate::config::LimitsConfig;
use protocol::THROUGHPUT_SERVER_VERSION;
use rand::RngCore;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 8192;

/// Marks the end of uplink data
const UPLINK_FINISH: u8 = b'*';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Downlink,
    Uplink,
    Config,
}

/// Accept loop for one throughput port
pub async fn serve_throughput(listener: TcpListener, service: Service, limits: Arc<LimitsConfig>) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("{:?} accept failed: {}", service, e);
                continue;
            }
        };
        let limits = limits.clone();
        tokio::spawn(async move {
            match handle_connection(stream, service, &limits).await {
                Ok(bytes) => info!("{:?} session with {} done, {} bytes", service, client_addr, bytes),
                Err(e) => warn!("{:?} session with {} failed: {}", service, client_addr, e),
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, service: Service, limits: &LimitsConfig) -> std::io::Result<u64> {
    stream.set_nodelay(true)?;
    let bytes = match service {
        Service::Downlink => downlink(&mut stream, limits).await?,
        Service::Uplink => uplink(&mut stream, limits).await?,
        Service::Config => {
            stream.write_all(THROUGHPUT_SERVER_VERSION.as_bytes()).await?;
            THROUGHPUT_SERVER_VERSION.len() as u64
        }
    };
    // The agent may already be gone
    let _ = stream.shutdown().await;
    Ok(bytes)
}

fn is_hangup(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

async fn downlink(stream: &mut TcpStream, limits: &LimitsConfig) -> std::io::Result<u64> {
    let mut payload = vec![0u8; BUFFER_SIZE];
    rand::thread_rng().fill_bytes(&mut payload);
    
    let deadline = Instant::now() + limits.slow_start() + limits.throughput_duration();
    let mut total = 0u64;
    loop {
        match stream.write_all(&payload).await {
            Ok(()) => total += payload.len() as u64,
            Err(e) if is_hangup(&e) => {
                // Agent reached its data limit
                debug!("Downlink peer hung up after {} bytes", total);
                break;
            }
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            break;
        }
    }
    Ok(total)
}

/// Throughput windows after slow start, in kbps
struct Sampler {
    start: Instant,
    slow_start: Duration,
    period: Duration,
    window_start: Option<Instant>,
    window_bytes: u64,
    samples: Vec<f64>,
}

impl Sampler {
    fn new(start: Instant, slow_start: Duration, period: Duration) -> Self {
        Self {
            start,
            slow_start,
            period,
            window_start: None,
            window_bytes: 0,
            samples: Vec::new(),
        }
    }
    
    fn record(&mut self, bytes: u64, now: Instant) {
        if now.duration_since(self.start) < self.slow_start {
            return;
        }
        let window_start = *self.window_start.get_or_insert(now);
        self.window_bytes += bytes;
        let elapsed = now.duration_since(window_start);
        if elapsed < self.period {
            return;
        }
        self.samples.push(self.window_bytes as f64 * 8.0 / (elapsed.as_secs_f64() * 1000.0));
        self.window_bytes = 0;
        self.window_start = Some(now);
    }
    
    fn report(&self) -> String {
        self.samples
            .iter()
            .map(|s| format!("{:.2}", s))
            .collect::<Vec<_>>()
            .join("#")
    }
}

async fn uplink(stream: &mut TcpStream, limits: &LimitsConfig) -> std::io::Result<u64> {
    let mut sampler = Sampler::new(Instant::now(), limits.slow_start(), limits.sample_period());
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("Uplink peer closed without terminator");
            break;
        }
        total += n as u64;
        sampler.record(n as u64, Instant::now());
        if buf[..n].contains(&UPLINK_FINISH) {
            break;
        }
    }
    let report = sampler.report();
    debug!("Uplink report: {}", report);
    stream.write_all(report.as_bytes()).await?;
    Ok(total)
}
