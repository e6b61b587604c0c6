//! Uplink burst sessions
//!
//! Data packets of one uplink burst are grouped by client address and
//! sequence number. The summary goes back when the last packet of the
//! burst arrives, or when the burst goes idle with packets missing.

use protocol::metrics::BurstMetrics;
use protocol::packets::BurstPacket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// One uplink burst being received
#[derive(Debug)]
pub struct Session {
    /// First packet seen; echoes burst parameters in the response
    pub template: BurstPacket,
    pub metrics: BurstMetrics,
    pub last_seen: Instant,
    pub bytes_received: u64,
}

impl Session {
    fn response(&self) -> BurstPacket {
        BurstPacket::response(
            &self.template,
            self.metrics.received() as i32,
            self.metrics.inversion_number() as i32,
            self.metrics.jitter_ms().round() as i64,
        )
    }
}

type SessionKey = (SocketAddr, i32);

/// Session manager
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionKey, Session>>>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout,
        }
    }
    
    /// Record an uplink data packet. Returns the summary once the burst's
    /// last packet is in.
    pub async fn record(&self, client_addr: SocketAddr, packet: &BurstPacket, len: usize, now_ms: i64) -> Option<BurstPacket> {
        let key = (client_addr, packet.seq);
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key).or_insert_with(|| Session {
            template: packet.clone(),
            metrics: BurstMetrics::new(),
            last_seen: Instant::now(),
            bytes_received: 0,
        });
        session.metrics.add_packet(packet.packet_num, now_ms - packet.timestamp);
        session.last_seen = Instant::now();
        session.bytes_received += len as u64;
        
        if packet.packet_num < packet.burst_count - 1 {
            return None;
        }
        sessions.remove(&key).map(|s| {
            debug!("Uplink burst {} from {} complete, {} bytes", packet.seq, client_addr, s.bytes_received);
            s.response()
        })
    }
    
    /// Remove bursts idle for longer than the timeout, with their summaries
    pub async fn take_stale(&self) -> Vec<(SocketAddr, BurstPacket)> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let stale: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= self.idle_timeout)
            .map(|(k, _)| *k)
            .collect();
        
        stale
            .into_iter()
            .filter_map(|key| sessions.remove(&key).map(|s| (key.0, s.response())))
            .collect()
    }
    
    /// Get number of active sessions
    pub async fn active_sessions(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}
