//! JSON shapes exchanged with the checkin service
//!
//! Field names are snake_case on the wire. Timestamps inside schedules use
//! `yyyy-MM-ddTHH:mm:ss.SSSZ` (UTC); result timestamps are microseconds
//! since the epoch.

use crate::error::ProtocolError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Output format for schedule timestamps
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format(WIRE_TIME_FORMAT).to_string()
}

/// Parse a schedule timestamp. Accepts the canonical wire form, any RFC 3339
/// string, and `yyyy-MM-dd HH:mm:ss` (interpreted as UTC).
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, ProtocolError> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(t.and_utc());
        }
    }
    Err(ProtocolError::InvalidTimestamp(s.to_string()))
}

/// serde adapter for optional schedule timestamps
pub mod opt_time {
    use super::*;
    use serde::Serializer;
    
    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_some(&format_time(t)),
            None => serializer.serialize_none(),
        }
    }
    
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) if !s.trim().is_empty() => parse_time(&s).map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Accept numbers and booleans as parameter values; the agent treats every
/// parameter as a string.
fn string_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error> {
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut map = BTreeMap::new();
    for (k, v) in raw {
        let value = match v {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            other => other.to_string(),
        };
        map.insert(k, value);
    }
    Ok(Some(map))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub longitude: f64,
    pub latitude: f64,
}

/// Snapshot of device state attached to checkins and results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperty {
    pub device_id: String,
    pub app_version: String,
    /// Microseconds since the epoch
    pub timestamp: i64,
    pub os_version: String,
    #[serde(default)]
    pub ip_connectivity: String,
    #[serde(default)]
    pub dn_resolvability: String,
    #[serde(default)]
    pub location: GeoLocation,
    #[serde(default)]
    pub location_type: String,
    pub network_type: String,
    #[serde(default)]
    pub carrier: String,
    pub battery_level: u8,
    pub is_battery_charging: bool,
    #[serde(default)]
    pub cell_info: String,
    #[serde(default)]
    pub rssi: i32,
}

/// Static identity of the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub manufacturer: String,
    pub model: String,
    pub os: String,
}

/// Body of `POST /checkin`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRequest {
    pub id: String,
    pub manufacturer: String,
    pub model: String,
    pub os: String,
    pub properties: DeviceProperty,
}

impl CheckinRequest {
    pub fn new(info: &DeviceInfo, properties: DeviceProperty) -> Self {
        Self {
            id: info.device_id.clone(),
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            os: info.os.clone(),
            properties,
        }
    }
}

/// One schedule entry as sent by the server
///
/// Everything except `type` is optional; defaults are applied by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireTaskDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, with = "opt_time", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "opt_time", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "string_map")]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Parse a checkin response. The outer array must be well formed; each
/// entry is decoded on its own so one bad entry does not hide the rest.
pub fn parse_schedule(body: &str) -> Result<Vec<Result<WireTaskDescriptor, String>>, ProtocolError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(body)?;
    Ok(entries
        .into_iter()
        .map(|entry| serde_json::from_value::<WireTaskDescriptor>(entry).map_err(|e| e.to_string()))
        .collect())
}

/// One entry of the `POST /postmeasurement` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResult {
    pub device_id: String,
    pub properties: DeviceProperty,
    /// Microseconds since the epoch
    pub timestamp: i64,
    pub success: bool,
    #[serde(default)]
    pub task_key: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating descriptor with its parameter map stripped
    #[serde(rename = "parameters")]
    pub descriptor: WireTaskDescriptor,
    pub values: BTreeMap<String, String>,
}

/// Acknowledgement returned by upload endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    
    #[test]
    fn test_time_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_time(&t), "2024-03-01T12:30:05.000Z");
        assert_eq!(parse_time("2024-03-01T12:30:05.000Z").unwrap(), t);
        assert_eq!(parse_time("2024-03-01 12:30:05").unwrap(), t);
        assert_eq!(parse_time("2024-03-01T13:30:05+01:00").unwrap(), t);
        assert!(parse_time("yesterday").is_err());
    }
    
    #[test]
    fn test_parse_schedule_skips_bad_entries() {
        let body = r#"[
            {"type": "ping", "key": "p1", "interval_sec": 600, "priority": 100,
             "parameters": {"target": "example.com", "packet_size_byte": 56}},
            {"key": "no-type"},
            {"type": "dns_lookup", "start_time": "not a time"},
            {"type": "http", "start_time": "2024-03-01T12:30:05.000Z", "parameters": {"url": "http://x"}}
        ]"#;
        let entries = parse_schedule(body).unwrap();
        assert_eq!(entries.len(), 4);
        
        let ping = entries[0].as_ref().unwrap();
        assert_eq!(ping.kind, "ping");
        assert_eq!(ping.interval_sec, Some(600.0));
        let params = ping.parameters.as_ref().unwrap();
        assert_eq!(params.get("packet_size_byte").map(String::as_str), Some("56"));
        
        assert!(entries[1].is_err());
        assert!(entries[2].is_err());
        assert!(entries[3].as_ref().unwrap().start_time.is_some());
    }
    
    #[test]
    fn test_parse_schedule_rejects_non_array() {
        assert!(parse_schedule(r#"{"type": "ping"}"#).is_err());
        assert!(parse_schedule("[]").unwrap().is_empty());
    }
    
    #[test]
    fn test_upload_ack() {
        let ack: UploadAck = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!ack.success);
    }
}
