//! TCP throughput against the throughput server
//!
//! Three ports on the same host: the config port answers with a version
//! string, the downlink port streams data until it closes the connection,
//! the uplink port swallows data until `*` and answers with its own
//! `#`-separated kbps samples.

use super::{resolve, server_target, split_host_port, ProbeControl, ProbeSettings};
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use protocol::{THROUGHPUT_CONFIG_PORT, THROUGHPUT_DOWN_PORT, THROUGHPUT_UP_PORT};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DURATION: Duration = Duration::from_secs(15);
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);
pub const SLOW_START_PERIOD: Duration = Duration::from_secs(5);
pub const TCP_TIMEOUT: Duration = Duration::from_secs(30);
pub const UP_PKT_SIZE_MIN: usize = 700;
pub const UP_PKT_SIZE_MAX: usize = 1357;
pub const DATA_LIMIT_UP: u64 = 5 * MB;
pub const DATA_LIMIT_DOWN: u64 = 10 * MB;
/// Marks the end of uplink data
pub const UPLINK_FINISH_MSG: &[u8] = b"*";

const MB: u64 = 1024 * 1024;
const BUFFER_SIZE: usize = 5000;

#[derive(Debug, Clone, Copy)]
struct Ports {
    down: u16,
    up: u16,
    config: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            down: THROUGHPUT_DOWN_PORT,
            up: THROUGHPUT_UP_PORT,
            config: THROUGHPUT_CONFIG_PORT,
        }
    }
}

/// Positive integer parameter clamped to `max`; absent or non-positive means `default`
fn clamped_param(
    descriptor: &MeasurementDescriptor,
    name: &str,
    default: u64,
    max: u64,
) -> Result<u64, MeasurementError> {
    let value: i64 = descriptor.param_or(name, 0)?;
    if value <= 0 {
        Ok(default)
    } else {
        Ok((value as u64).min(max))
    }
}

/// Throughput samples taken once the slow-start period has passed
#[derive(Debug)]
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
        // bits per millisecond == kbps
        self.samples.push(self.window_bytes as f64 * 8.0 / (elapsed.as_secs_f64() * 1000.0));
        self.window_bytes = 0;
        self.window_start = Some(now);
    }
}

/// Parse the uplink report, e.g. `1111.11#2222.22#3333.33`
pub fn parse_server_samples(report: &str) -> Result<Vec<f64>, MeasurementError> {
    report
        .trim()
        .split('#')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|_| MeasurementError::failed(format!("Malformed throughput sample: {:?}", s)))
        })
        .collect()
}

#[derive(Debug, Default)]
struct Transfer {
    samples: Vec<f64>,
    data_limit_exceeded: bool,
    duration: Duration,
}

pub struct TcpThroughputProbe {
    target: String,
    ports: Ports,
    up: bool,
    duration: Duration,
    sample_period: Duration,
    slow_start: Duration,
    tcp_timeout: Duration,
    pkt_size_up: usize,
    data_limit_up: u64,
    data_limit_down: u64,
    control: ProbeControl,
}

impl TcpThroughputProbe {
    pub fn new(descriptor: &MeasurementDescriptor, settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let server = server_target(descriptor.param("target"), settings.throughput_server.as_ref(), "target")?;
        let (target, _) = split_host_port(&server, THROUGHPUT_DOWN_PORT);
        
        let half = DURATION.as_secs() / 2;
        let pkt_size_up = match descriptor.param_or::<i64>("pkt_size_up_bytes", 0)? {
            n if n <= 0 => UP_PKT_SIZE_MAX,
            n => (n as usize).clamp(UP_PKT_SIZE_MIN, UP_PKT_SIZE_MAX),
        };
        
        Ok(Self {
            target,
            ports: Ports::default(),
            up: descriptor.param("direction").is_some_and(|d| d.eq_ignore_ascii_case("up")),
            duration: Duration::from_secs(clamped_param(descriptor, "duration_period_sec", DURATION.as_secs(), DURATION.as_secs())?),
            sample_period: Duration::from_secs(clamped_param(descriptor, "sample_period_sec", SAMPLE_PERIOD.as_secs(), half)?),
            slow_start: Duration::from_secs(clamped_param(descriptor, "slow_start_period_sec", SLOW_START_PERIOD.as_secs(), half)?),
            tcp_timeout: Duration::from_secs(clamped_param(descriptor, "tcp_timeout_sec", TCP_TIMEOUT.as_secs(), TCP_TIMEOUT.as_secs())?),
            pkt_size_up,
            data_limit_up: clamped_param(descriptor, "data_limit_mb_up", DATA_LIMIT_UP / MB, DATA_LIMIT_UP / MB)? * MB,
            data_limit_down: clamped_param(descriptor, "data_limit_mb_down", DATA_LIMIT_DOWN / MB, DATA_LIMIT_DOWN / MB)? * MB,
            control: ProbeControl::new(),
        })
    }
    
    async fn connect(&self, port: u16) -> Result<TcpStream, MeasurementError> {
        let addr: SocketAddr = resolve(&self.target, port).await?;
        let stream = match self.control.guard(tokio::time::timeout(self.tcp_timeout, TcpStream::connect(addr))).await? {
            Ok(Ok(stream)) => stream,
            _ => {
                return Err(MeasurementError::failed(format!(
                    "Error open socket at {} with port {}",
                    self.target, port
                )))
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| MeasurementError::failed(format!("Failed to configure socket: {}", e)))?;
        Ok(stream)
    }
    
    /// Read once, `Ok(0)` at end of stream
    async fn read_some(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<usize, MeasurementError> {
        match self.control.guard(tokio::time::timeout(self.tcp_timeout, stream.read(buf))).await? {
            Ok(Ok(n)) => {
                self.control.add_bytes(n as u64);
                Ok(n)
            }
            _ => Err(MeasurementError::failed(format!("Error to receive data from {}", self.target))),
        }
    }
    
    async fn server_version(&self) -> Result<String, MeasurementError> {
        let mut stream = self.connect(self.ports.config).await?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let n = self.read_some(&mut stream, &mut buf).await?;
        Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
    }
    
    async fn downlink(&self) -> Result<Transfer, MeasurementError> {
        info!("Start downlink task on {}", self.target);
        let mut stream = self.connect(self.ports.down).await?;
        let start = Instant::now();
        let mut sampler = Sampler::new(start, self.slow_start, self.sample_period);
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        let mut exceeded = false;
        
        loop {
            let n = self.read_some(&mut stream, &mut buf).await?;
            if n == 0 {
                break;
            }
            sampler.record(n as u64, Instant::now());
            total += n as u64;
            if total >= self.data_limit_down {
                info!("Detect downlink data limitation exceed with {} bytes", self.data_limit_down);
                exceeded = true;
                break;
            }
        }
        
        debug!("Total download data is {:.2} MB", total as f64 / MB as f64);
        Ok(Transfer {
            samples: sampler.samples,
            data_limit_exceeded: exceeded,
            duration: start.elapsed(),
        })
    }
    
    async fn uplink(&self) -> Result<Transfer, MeasurementError> {
        info!("Start uplink task on {}", self.target);
        let mut stream = self.connect(self.ports.up).await?;
        let payload: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..self.pkt_size_up).map(|_| rng.gen_range(b'a'..=b'z')).collect()
        };
        let send_error = |_| MeasurementError::failed(format!("Error to send/receive data to {}", self.target));
        
        let start = Instant::now();
        let total_duration = self.duration + self.slow_start;
        let mut total = 0u64;
        let mut exceeded = false;
        
        while start.elapsed() < total_duration {
            self.control.guard(stream.write_all(&payload)).await?.map_err(send_error)?;
            total += payload.len() as u64;
            self.control.add_bytes(payload.len() as u64);
            if total >= self.data_limit_up {
                info!("Detect uplink exceeding limitation {} MB", self.data_limit_up / MB);
                exceeded = true;
                break;
            }
        }
        let duration = start.elapsed();
        
        self.control.guard(stream.write_all(UPLINK_FINISH_MSG)).await?.map_err(send_error)?;
        self.control.add_bytes(UPLINK_FINISH_MSG.len() as u64);
        self.control.guard(stream.flush()).await?.map_err(send_error)?;
        
        let mut report = Vec::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = self.read_some(&mut stream, &mut buf).await?;
            if n == 0 {
                break;
            }
            report.extend_from_slice(&buf[..n]);
        }
        let report = String::from_utf8_lossy(&report);
        debug!("Uplink result from server is {}", report);
        
        Ok(Transfer {
            samples: parse_server_samples(&report)?,
            data_limit_exceeded: exceeded,
            duration,
        })
    }
}

#[async_trait]
impl Probe for TcpThroughputProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        self.control.check()?;
        let server_version = self.server_version().await?;
        let mut transfer = if self.up {
            self.uplink().await?
        } else {
            self.downlink().await?
        };
        transfer.samples.sort_by(|a, b| a.total_cmp(b));
        
        let samples = serde_json::to_string(&transfer.samples)
            .map_err(|e| MeasurementError::failed(format!("Failed to encode samples: {}", e)))?;
        let mut values = ProbeValues::new();
        values.insert("tcp_speed_results".into(), samples);
        values.insert("data_limit_exceeded".into(), transfer.data_limit_exceeded.to_string());
        values.insert("duration".into(), format!("{:.3}", transfer.duration.as_secs_f64()));
        values.insert("server_version".into(), server_version);
        Ok(values)
    }
    
    fn stop(&self) {
        self.control.stop();
    }
    
    fn data_consumed(&self) -> u64 {
        self.control.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementKind;
    use chrono::Utc;
    use tokio::net::TcpListener;
    
    fn descriptor(params: &[(&str, &str)]) -> MeasurementDescriptor {
        let mut b = MeasurementDescriptor::builder(MeasurementKind::TcpThroughput);
        for (k, v) in params {
            b = b.param(*k, *v);
        }
        b.build(Utc::now())
    }
    
    async fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        (l, port)
    }
    
    /// Serves one connection per port
    async fn fake_server(down_bytes: usize, up_report: &'static str) -> Ports {
        let (config, config_port) = listener().await;
        let (down, down_port) = listener().await;
        let (up, up_port) = listener().await;
        
        tokio::spawn(async move {
            let (mut s, _) = config.accept().await.unwrap();
            s.write_all(b"test-version").await.unwrap();
        });
        tokio::spawn(async move {
            let (mut s, _) = down.accept().await.unwrap();
            let _ = s.write_all(&vec![b'x'; down_bytes]).await;
        });
        tokio::spawn(async move {
            let (mut s, _) = up.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 || buf[..n].contains(&b'*') {
                    break;
                }
            }
            s.write_all(up_report.as_bytes()).await.unwrap();
        });
        
        Ports {
            down: down_port,
            up: up_port,
            config: config_port,
        }
    }
    
    #[test]
    fn test_parameters_are_clamped() {
        let d = descriptor(&[
            ("target", "example.com"),
            ("duration_period_sec", "60"),
            ("pkt_size_up_bytes", "100"),
            ("data_limit_mb_down", "50"),
            ("sample_period_sec", "0"),
        ]);
        let probe = TcpThroughputProbe::new(&d, &ProbeSettings::default()).unwrap();
        assert_eq!(probe.duration, DURATION);
        assert_eq!(probe.pkt_size_up, UP_PKT_SIZE_MIN);
        assert_eq!(probe.data_limit_down, DATA_LIMIT_DOWN);
        assert_eq!(probe.sample_period, SAMPLE_PERIOD);
        assert!(!probe.up);
        
        let bad = descriptor(&[("target", "example.com"), ("tcp_timeout_sec", "soon")]);
        assert!(TcpThroughputProbe::new(&bad, &ProbeSettings::default()).is_err());
    }
    
    #[test]
    fn test_parse_server_samples() {
        assert_eq!(parse_server_samples("1111.5#2222#3333.25").unwrap(), vec![1111.5, 2222.0, 3333.25]);
        assert!(parse_server_samples("").unwrap().is_empty());
        assert!(parse_server_samples("12#abc").is_err());
    }
    
    #[test]
    fn test_sampler_skips_slow_start() {
        let start = Instant::now();
        let mut sampler = Sampler::new(start, Duration::from_secs(5), Duration::from_secs(1));
        sampler.record(1_000_000, start + Duration::from_secs(1));
        assert!(sampler.samples.is_empty());
        
        sampler.record(0, start + Duration::from_secs(5));
        sampler.record(125_000, start + Duration::from_millis(5500));
        assert!(sampler.samples.is_empty());
        sampler.record(125_000, start + Duration::from_secs(6));
        // 250 KB over one second
        assert_eq!(sampler.samples, vec![2000.0]);
    }
    
    #[tokio::test]
    async fn test_downlink_hits_data_limit() {
        let ports = fake_server(2 * MB as usize, "").await;
        let mut probe = TcpThroughputProbe::new(
            &descriptor(&[("target", "127.0.0.1"), ("data_limit_mb_down", "1")]),
            &ProbeSettings::default(),
        )
        .unwrap();
        probe.ports = ports;
        
        let values = probe.run().await.unwrap();
        assert_eq!(values["server_version"], "test-version");
        assert_eq!(values["data_limit_exceeded"], "true");
        assert!(probe.data_consumed() >= MB);
    }
    
    #[tokio::test]
    async fn test_uplink_reports_sorted_server_samples() {
        let ports = fake_server(0, "300.5#100#200").await;
        let mut probe = TcpThroughputProbe::new(
            &descriptor(&[("target", "127.0.0.1"), ("direction", "Up")]),
            &ProbeSettings::default(),
        )
        .unwrap();
        probe.ports = ports;
        probe.duration = Duration::from_millis(100);
        probe.slow_start = Duration::ZERO;
        probe.data_limit_up = u64::MAX;
        
        let values = probe.run().await.unwrap();
        assert_eq!(values["tcp_speed_results"], "[100.0,200.0,300.5]");
        assert_eq!(values["data_limit_exceeded"], "false");
    }
}
