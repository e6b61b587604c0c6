//! Output and display management
//!
//! Start/end/status notifications go out on a broadcast channel; the
//! console printer and the in-memory result feeds are consumers of it.

use crate::measurement::MeasurementKind;
use anyhow::Result;
use protocol::wire::WireResult;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Entries kept per result feed
pub const MAX_LIST_ITEMS: usize = 128;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Transient status text ("checking in...", "skipping checkin - ...")
    Status(String),
    MeasurementStarted {
        key: Option<String>,
        kind: MeasurementKind,
        priority: i64,
    },
    /// Never sent for skipped measurements
    MeasurementEnded {
        key: Option<String>,
        kind: MeasurementKind,
        priority: i64,
        user: bool,
        /// Rendered result, or error text
        outcome: Result<String, String>,
    },
}

pub type EventSink = broadcast::Sender<AgentEvent>;

pub fn event_channel() -> EventSink {
    let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
    tx
}

/// Send without caring whether anyone listens
pub fn emit(sink: &EventSink, event: AgentEvent) {
    if sink.send(event).is_err() {
        debug!("No event subscribers");
    }
}

pub fn status(sink: &EventSink, msg: impl Into<String>) {
    emit(sink, AgentEvent::Status(msg.into()));
}

/// Bounded feed of rendered results, newest first
#[derive(Debug, Default)]
pub struct ResultConsole {
    entries: Mutex<VecDeque<String>>,
}

impl ResultConsole {
    pub fn new() -> Self {
        Self::default()
    }
    
    pub fn push(&self, entry: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_front(entry);
        entries.truncate(MAX_LIST_ITEMS);
    }
    
    pub fn entries(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }
}

/// Print events to stdout until the channel closes
pub async fn run_console_printer(mut rx: broadcast::Receiver<AgentEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Console printer lagged {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let ts = chrono::Local::now().format("%H:%M:%S");
        match event {
            AgentEvent::Status(msg) => println!("[{}] {}", ts, msg),
            AgentEvent::MeasurementStarted { key, kind, .. } => {
                println!("[{}] {} started ({})", ts, kind.display_name(), key.unwrap_or_default());
            }
            AgentEvent::MeasurementEnded { outcome: Ok(text), .. } => {
                println!("[{}] {}", ts, text.trim_end());
            }
            AgentEvent::MeasurementEnded { outcome: Err(e), kind, .. } => {
                println!("[{}] {} -> ERROR: {}", ts, kind.display_name(), e);
            }
        }
    }
}

/// Export results as CSV
pub fn export_csv(results: &[WireResult], output_path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_path)?;
    
    // Write header
    writer.write_record([
        "timestamp",
        "type",
        "task_key",
        "success",
        "network_type",
        "battery_level",
        "values",
    ])?;
    
    // Write results
    for r in results {
        let timestamp = chrono::DateTime::from_timestamp_micros(r.timestamp)
            .map(|t| protocol::wire::format_time(&t))
            .unwrap_or_default();
        writer.write_record([
            timestamp,
            r.kind.clone(),
            r.task_key.clone().unwrap_or_default(),
            r.success.to_string(),
            r.properties.network_type.clone(),
            r.properties.battery_level.to_string(),
            serde_json::to_string(&r.values)?,
        ])?;
    }
    
    writer.flush()?;
    
    Ok(())
}
