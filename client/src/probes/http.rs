//! HTTP fetch

use super::{ProbeControl, ProbeSettings};
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes of body read before giving up on the rest
pub const MAX_HTTP_RESPONSE_SIZE: u64 = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpProbe {
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<String>,
    control: ProbeControl,
}

impl HttpProbe {
    pub fn new(descriptor: &MeasurementDescriptor, _settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let url = descriptor.require_param("url")?.to_string();
        reqwest::Url::parse(&url).map_err(|e| MeasurementError::invalid("url", e.to_string()))?;
        
        // Unknown methods fall back to GET
        let method = match descriptor.param("method").map(str::to_ascii_uppercase).as_deref() {
            Some("HEAD") => Method::HEAD,
            Some("POST") => Method::POST,
            _ => Method::GET,
        };
        
        let headers = match descriptor.param("headers") {
            Some(raw) => parse_headers(raw)?,
            None => HeaderMap::new(),
        };
        
        Ok(Self {
            url,
            method,
            headers,
            body: descriptor.param("body").map(str::to_string),
            control: ProbeControl::new(),
        })
    }
}

/// `Name: value` lines separated by CRLF
fn parse_headers(raw: &str) -> Result<HeaderMap, MeasurementError> {
    let mut headers = HeaderMap::new();
    for line in raw.split("\r\n").filter(|l| !l.trim().is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MeasurementError::invalid("headers", format!("Incorrect header line: {}", line)))?;
        let name = HeaderName::from_str(name.trim())
            .map_err(|e| MeasurementError::invalid("headers", e.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| MeasurementError::invalid("headers", e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl Probe for HttpProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        self.control.check()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeasurementError::failed(e.to_string()))?;
        
        let mut request = client.request(self.method.clone(), &self.url).headers(self.headers.clone());
        if self.method == Method::POST {
            let body = self.body.clone().unwrap_or_default();
            self.control.add_bytes(body.len() as u64);
            request = request.body(body);
        }
        
        let started = Instant::now();
        let mut response = self
            .control
            .guard(request.send())
            .await?
            .map_err(|e| MeasurementError::failed(format!("HTTP request to {} failed: {}", self.url, e)))?;
        
        let status = response.status();
        let headers_len: u64 = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().len() + 2 + v.as_bytes().len()) as u64)
            .sum();
        self.control.add_bytes(headers_len);
        
        let mut body_len = 0u64;
        while body_len <= MAX_HTTP_RESPONSE_SIZE {
            let chunk = self
                .control
                .guard(response.chunk())
                .await?
                .map_err(|e| MeasurementError::failed(format!("Error reading body: {}", e)))?;
            let Some(chunk) = chunk else {
                break;
            };
            body_len += chunk.len() as u64;
            self.control.add_bytes(chunk.len() as u64);
        }
        let elapsed = started.elapsed();
        debug!("HTTP {} -> {} ({} body bytes)", self.url, status, body_len);
        
        if status != reqwest::StatusCode::OK {
            return Err(MeasurementError::failed(format!("HTTP status {}", status.as_u16())));
        }
        
        let mut values = ProbeValues::new();
        values.insert("code".into(), status.as_u16().to_string());
        values.insert("time_ms".into(), elapsed.as_millis().to_string());
        values.insert("headers_len".into(), headers_len.to_string());
        values.insert("body_len".into(), body_len.to_string());
        Ok(values)
    }
    
    fn stop(&self) {
        self.control.stop();
    }
    
    fn data_consumed(&self) -> u64 {
        self.control.bytes()
    }
}
