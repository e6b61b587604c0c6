//! Checkin protocol client
//!
//! JSON over HTTP POST: `/checkin` returns the server's schedule,
//! `/postmeasurement` accepts finished results, `rrc/*` takes raw RRC
//! inference data. Every request carries the auth cookie when the server
//! wants one; a failed checkin drops the cookie so it is re-fetched.

pub mod credential;

pub use credential::{AuthCookie, CredentialManager, CredentialProvider, DevLoginProvider, StaticCredentialProvider};

use crate::clock::SharedClock;
use crate::device::DeviceInfoProvider;
use crate::output::{self, EventSink};
use crate::resource::{ResourceCapManager, PHONE_UTIL_COST};
use chrono::{DateTime, Utc};
use protocol::wire::{self, CheckinRequest, UploadAck, WireResult, WireTaskDescriptor};
use protocol::ProtocolError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CHECKIN_PATH: &str = "checkin";
pub const UPLOAD_PATH: &str = "postmeasurement";
pub const RRC_INFERENCE_PATH: &str = "rrc/uploadRRCInference";

#[derive(Error, Debug)]
pub enum CheckinError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    
    #[error("Server returned status {0}")]
    Status(u16),
    
    #[error("Malformed response: {0}")]
    Parse(#[from] ProtocolError),
    
    #[error("No authCookie yet")]
    NoCredentialYet,
    
    #[error("Failure posting measurement result")]
    UploadRejected,
    
    #[error("Credential error: {0}")]
    Credential(String),
}

pub struct CheckinClient {
    http: reqwest::Client,
    server_url: String,
    credentials: CredentialManager,
    device: Arc<dyn DeviceInfoProvider>,
    resources: Arc<ResourceCapManager>,
    events: EventSink,
    clock: SharedClock,
    last_checkin: Mutex<Option<DateTime<Utc>>>,
}

impl CheckinClient {
    pub fn new(
        server_url: &str,
        timeout: Duration,
        credentials: CredentialManager,
        device: Arc<dyn DeviceInfoProvider>,
        resources: Arc<ResourceCapManager>,
        events: EventSink,
        clock: SharedClock,
    ) -> Result<Self, CheckinError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            credentials,
            device,
            resources,
            events,
            clock,
            last_checkin: Mutex::new(None),
        })
    }
    
    pub fn last_checkin(&self) -> Option<DateTime<Utc>> {
        *self.last_checkin.lock().unwrap_or_else(|e| e.into_inner())
    }
    
    /// Kick off credential acquisition if needed
    pub fn prepare(&self) {
        self.credentials.request();
    }
    
    fn charge(&self, bytes: u64) {
        if let Err(e) = self.resources.update_data_usage(bytes) {
            warn!("Failed to record checkin data usage: {}", e);
        }
    }
    
    async fn service_request(&self, path: &str, body: String) -> Result<String, CheckinError> {
        let cookie = self.credentials.current().await?;
        let url = format!("{}/{}", self.server_url, path);
        debug!("POST {} ({} bytes)", url, body.len());
        
        let mut request = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(cookie) = cookie {
            request = request.header(reqwest::header::COOKIE, cookie.header_value());
        }
        
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckinError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
    
    /// Report device state and fetch the schedule. Entries that fail to
    /// decode are logged and left out.
    pub async fn checkin(&self) -> Result<Vec<WireTaskDescriptor>, CheckinError> {
        info!("Checking in");
        let outcome = self.try_checkin().await;
        if let Err(e) = &outcome {
            error!("Checkin failed: {}", e);
            if !matches!(e, CheckinError::NoCredentialYet) {
                // Probably an expired credential
                self.credentials.invalidate();
            }
            self.credentials.request();
        }
        outcome
    }
    
    async fn try_checkin(&self) -> Result<Vec<WireTaskDescriptor>, CheckinError> {
        let request = CheckinRequest::new(&self.device.device_info(), self.device.device_property());
        let body = serde_json::to_string(&request).map_err(ProtocolError::from)?;
        self.charge(PHONE_UTIL_COST);
        output::status(&self.events, "Checking in");
        
        let response = self.service_request(CHECKIN_PATH, body).await?;
        self.charge(response.len() as u64);
        
        let entries = wire::parse_schedule(&response)?;
        output::status(&self.events, format!("Checkin got {} tasks.", entries.len()));
        let schedule: Vec<WireTaskDescriptor> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("Could not decode schedule entry {}: {}", i, e);
                    None
                }
            })
            .collect();
        
        *self.last_checkin.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.clock.now());
        info!("Checkin complete, got {} new tasks", schedule.len());
        Ok(schedule)
    }
    
    /// Post results; the server must acknowledge with `success: true`
    pub async fn upload_results(&self, results: &[WireResult]) -> Result<(), CheckinError> {
        output::status(&self.events, format!("Uploading {} measurement results.", results.len()));
        let body = serde_json::to_string(results).map_err(ProtocolError::from)?;
        self.charge(body.len() as u64);
        
        let response = self.service_request(UPLOAD_PATH, body).await?;
        let ack: UploadAck = serde_json::from_str(&response).map_err(ProtocolError::from)?;
        if !ack.success {
            return Err(CheckinError::UploadRejected);
        }
        info!("Uploaded {} results", results.len());
        output::status(&self.events, "Result upload complete.");
        Ok(())
    }
    
    /// Post one JSON document to a side channel, returning the raw response
    pub async fn upload_side_channel(&self, path: &str, document: &serde_json::Value) -> Result<String, CheckinError> {
        let body = document.to_string();
        self.charge(body.len() as u64);
        let response = self.service_request(path, body).await?;
        debug!("Response from {}: {}", path, response);
        Ok(response)
    }
}

/// Backoff bounds for checkin retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub max_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(20),
            max_interval: Duration::from_secs(60),
            max_count: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `k` (0-based)
    pub fn delay_after(&self, k: u32) -> Duration {
        let factor = 1u32.checked_shl(k).unwrap_or(u32::MAX);
        self.min_interval.saturating_mul(factor).min(self.max_interval)
    }
}

/// Retry bookkeeping between a failed checkin and the next success
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    count: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, count: 0 }
    }
    
    pub fn count(&self) -> u32 {
        self.count
    }
    
    pub fn reset(&mut self) {
        self.count = 0;
    }
    
    /// Delay before the next retry, or `None` to wait for the regular
    /// checkin. Giving up after too many retries also resets the state.
    pub fn on_failure(&mut self, checkin_interval: Duration) -> Option<Duration> {
        if self.count > self.policy.max_count {
            info!("Giving up on checkin retries until the next period");
            self.reset();
            return None;
        }
        let delay = self.policy.delay_after(self.count);
        if delay >= checkin_interval {
            return None;
        }
        self.count += 1;
        info!("Retrying checkin in {} seconds", delay.as_secs());
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::resource::DataUsageProfile;
    use crate::test_support::StaticDeviceInfo;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    
    struct Fixture {
        _dir: TempDir,
        client: CheckinClient,
        resources: Arc<ResourceCapManager>,
    }
    
    fn fixture(server: &MockServer, credentials: CredentialManager) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        let device = Arc::new(StaticDeviceInfo::new());
        let resources = Arc::new(
            ResourceCapManager::new(dir.path(), 60, DataUsageProfile::Profile1, 30, device.clone(), clock.clone())
                .unwrap(),
        );
        let client = CheckinClient::new(
            &server.uri(),
            Duration::from_secs(5),
            credentials,
            device,
            resources.clone(),
            output::event_channel(),
            clock,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            client,
            resources,
        }
    }
    
    #[tokio::test]
    async fn test_checkin_parses_schedule_and_skips_bad_entries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(json!({"id": "test-device", "manufacturer": "acme"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"type": "ping", "key": "p1", "interval_sec": 600, "parameters": {"target": "example.com"}},
                {"type": "http", "key": "h1", "start_time": "not a time"},
                {"type": "dns_lookup", "key": "d1", "count": 5, "priority": 3}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        
        let f = fixture(&server, CredentialManager::anonymous());
        let schedule = f.client.checkin().await.unwrap();
        
        let keys: Vec<_> = schedule.iter().map(|t| t.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["p1", "d1"]);
        assert!(f.client.last_checkin().is_some());
        
        let usage = f.resources.usage().unwrap().unwrap();
        assert!(usage.bytes_used > PHONE_UTIL_COST as i64);
    }
    
    #[tokio::test]
    async fn test_checkin_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        
        let f = fixture(&server, CredentialManager::anonymous());
        assert!(matches!(f.client.checkin().await, Err(CheckinError::Status(500))));
        assert!(f.client.last_checkin().is_none());
    }
    
    #[tokio::test]
    async fn test_cookie_header_sent_once_available() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .and(header("cookie", "SACSID=token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        
        let cookie = AuthCookie::parse("SACSID=token").unwrap();
        let f = fixture(&server, CredentialManager::new(Arc::new(StaticCredentialProvider::new(cookie))));
        
        // No fetch started yet: fail fast without touching the network
        assert!(matches!(f.client.checkin().await, Err(CheckinError::NoCredentialYet)));
        
        let mut schedule = None;
        for _ in 0..100 {
            match f.client.checkin().await {
                Ok(s) => {
                    schedule = Some(s);
                    break;
                }
                Err(CheckinError::NoCredentialYet) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(schedule, Some(vec![]));
    }
    
    #[tokio::test]
    async fn test_upload_requires_success_ack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/postmeasurement"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
            .mount(&server)
            .await;
        
        let f = fixture(&server, CredentialManager::anonymous());
        assert!(matches!(f.client.upload_results(&[]).await, Err(CheckinError::UploadRejected)));
    }
    
    #[tokio::test]
    async fn test_upload_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/postmeasurement"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;
        
        let f = fixture(&server, CredentialManager::anonymous());
        f.client.upload_results(&[]).await.unwrap();
    }
    
    #[test]
    fn test_retry_delays_double_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::from_secs(20));
        assert_eq!(policy.delay_after(1), Duration::from_secs(40));
        assert_eq!(policy.delay_after(2), Duration::from_secs(60));
        assert_eq!(policy.delay_after(40), Duration::from_secs(60));
    }
    
    #[test]
    fn test_retry_state_gives_up_after_max_count() {
        let mut state = RetryState::new(RetryPolicy::default());
        let hour = Duration::from_secs(3600);
        
        let delays: Vec<_> = std::iter::from_fn(|| state.on_failure(hour)).take(10).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(20),
                Duration::from_secs(40),
                Duration::from_secs(60),
                Duration::from_secs(60),
            ]
        );
        // Gave up and reset
        assert_eq!(state.count(), 0);
        assert_eq!(state.on_failure(hour), Some(Duration::from_secs(20)));
    }
    
    #[test]
    fn test_retry_not_scheduled_past_checkin_interval() {
        let mut state = RetryState::new(RetryPolicy::default());
        assert_eq!(state.on_failure(Duration::from_secs(20)), None);
    }
}
