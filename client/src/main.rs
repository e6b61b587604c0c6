//! mobimeter - network measurement agent
//!
//! Checks in with a measurement server, runs the scheduled probes under
//! battery and data-usage caps, and uploads the results.

mod analysis;
mod checkin;
mod clock;
mod config;
mod device;
mod measurement;
mod output;
mod probes;
mod queue;
mod resource;
mod runner;
mod scheduler;
mod storage;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use checkin::{AuthCookie, CheckinClient, CredentialManager, DevLoginProvider, StaticCredentialProvider};
use clap::Parser;
use clock::{Clock, SharedClock, SystemClock};
use device::{DeviceInfoProvider, SystemDeviceInfo};
use measurement::descriptor::{DEFAULT_USER_INTERVAL_SEC, USER_PRIORITY};
use measurement::{MeasurementDescriptor, MeasurementKind, ProbeRegistry, TaskContext};
use output::{AgentEvent, ResultConsole};
use resource::ResourceCapManager;
use scheduler::{Preferences, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{Database, DATABASE_FILE_NAME};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Key given to measurements started from the command line
const CLI_TASK_KEY: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "mobimeter")]
#[command(version)]
#[command(about = "Scheduled network measurements under battery and data caps", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "client.conf")]
    config: PathBuf,
    
    /// Export results that have not been uploaded yet
    #[arg(long)]
    export: bool,
    
    /// Output file for export
    #[arg(short, long)]
    output: Option<PathBuf>,
    
    /// Run one measurement now: ping, traceroute, dns_lookup, http,
    /// udp_burst, tcpthroughput or rrc
    #[arg(long, value_name = "TYPE")]
    measure: Option<String>,
    
    /// Measurement parameter as key=value; repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", requires = "measure")]
    params: Vec<String>,
    
    /// Number of runs, spaced a few seconds apart
    #[arg(long, default_value_t = 1, requires = "measure", value_parser = clap::value_parser!(u32).range(1..))]
    count: u32,
}

/// Shared pieces every mode builds from the configuration
struct Agent {
    config: config::Config,
    clock: SharedClock,
    device: Arc<dyn DeviceInfoProvider>,
    resources: Arc<ResourceCapManager>,
    db: Database,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();
    
    let args = Args::parse();
    
    info!("mobimeter v{}", env!("CARGO_PKG_VERSION"));
    
    // Load configuration
    let config = config::Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);
    
    let agent = Agent::open(config)?;
    
    if args.export {
        info!("Export mode");
        run_export(agent, &args)
    } else if let Some(kind) = &args.measure {
        info!("Single measurement mode");
        run_measure(agent, kind, &args.params, args.count).await
    } else {
        info!("Starting agent");
        run_agent(agent, &args.config).await
    }
}

impl Agent {
    fn open(mut config: config::Config) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        config.resolve_device_id()?;
        info!("Device id: {}", config.general.device_id);
        
        let clock: SharedClock = Arc::new(SystemClock);
        let device: Arc<dyn DeviceInfoProvider> = Arc::new(SystemDeviceInfo::new(
            config.general.device_id.clone(),
            config.device.clone(),
        ));
        let resources = Arc::new(
            ResourceCapManager::new(
                &data_dir,
                config.resources.battery_threshold_pct,
                config.resources.profile()?,
                config.resources.period_days,
                device.clone(),
                clock.clone(),
            )
            .context("Failed to set up resource caps")?,
        );
        
        let db_path = data_dir.join(DATABASE_FILE_NAME);
        let db = Database::new(&db_path)?;
        db.initialize()?;
        info!("Database: {:?}", db_path);
        
        Ok(Self {
            config,
            clock,
            device,
            resources,
            db,
        })
    }
    
    fn credentials(&self) -> Result<CredentialManager> {
        let checkin = &self.config.checkin;
        if let Some(raw) = &checkin.auth_cookie {
            let cookie = AuthCookie::parse(raw)
                .with_context(|| format!("auth_cookie must look like name=value, got {:?}", raw))?;
            return Ok(CredentialManager::new(Arc::new(StaticCredentialProvider::new(cookie))));
        }
        if let Some(email) = &checkin.dev_login {
            return Ok(CredentialManager::new(Arc::new(DevLoginProvider::new(email.clone()))));
        }
        Ok(CredentialManager::anonymous())
    }
    
    fn into_scheduler(self, events: output::EventSink, start_paused: bool) -> Result<Scheduler> {
        let checkin = CheckinClient::new(
            &self.config.checkin.server_url,
            Duration::from_secs(self.config.checkin.timeout_sec),
            self.credentials()?,
            self.device.clone(),
            self.resources.clone(),
            events.clone(),
            self.clock.clone(),
        )
        .context("Failed to create checkin client")?;
        
        let registry = ProbeRegistry::with_builtin_probes(self.config.probes.settings());
        let mut scheduler_config = SchedulerConfig::from_config(&self.config);
        scheduler_config.start_paused |= start_paused;
        
        Ok(Scheduler::new(
            scheduler_config,
            registry,
            checkin,
            self.db,
            self.resources,
            TaskContext {
                device: self.device,
                clock: self.clock,
            },
            events,
        ))
    }
}

async fn run_agent(agent: Agent, config_path: &Path) -> Result<()> {
    info!("Checkin server: {}", agent.config.checkin.server_url);
    info!("Checkin interval: {}s", agent.config.checkin.interval_sec);
    
    let events = output::event_channel();
    let printer = tokio::spawn(output::run_console_printer(events.subscribe()));
    
    let mut scheduler = agent.into_scheduler(events, false)?;
    scheduler.restore();
    let recent = [scheduler.user_results(), scheduler.system_results()];
    let (handle, join) = scheduler.spawn();
    
    info!("Agent running (Ctrl+C stops, SIGHUP reloads preferences and checks in, SIGUSR1 pauses/resumes)");
    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    let mut user1 = signal(SignalKind::user_defined1()).context("Failed to listen for SIGUSR1")?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl+C")?;
                break;
            }
            _ = hangup.recv() => reload_preferences(&handle, config_path).await,
            _ = user1.recv() => {
                if let Err(e) = toggle_pause(&handle, &recent).await {
                    warn!("Could not toggle pause: {}", e);
                }
            }
        }
    }
    
    info!("Shutting down");
    if let Err(e) = handle.request_stop().await {
        warn!("Scheduler already stopped: {}", e);
    }
    drop(handle);
    if let Err(e) = join.await {
        error!("Scheduler task ended abnormally: {}", e);
    }
    printer.abort();
    
    Ok(())
}

fn preferences(config: &config::Config) -> Result<Preferences> {
    Ok(Preferences {
        battery_threshold: Some(config.resources.battery_threshold_pct as i64),
        checkin_interval_sec: Some(config.checkin.interval_sec),
        data_limit: Some(config.resources.profile()?),
    })
}

/// Re-read the preference settings and check in with them
async fn reload_preferences(handle: &SchedulerHandle, config_path: &Path) {
    info!("Reloading preferences from {:?}", config_path);
    match config::Config::load(config_path).and_then(|c| preferences(&c)) {
        Ok(prefs) => {
            if let Err(e) = handle.update_preferences(prefs).await {
                warn!("Preferences not applied: {}", e);
            }
        }
        Err(e) => warn!("Keeping current preferences: {:#}", e),
    }
    if let Err(e) = handle.checkin_now().await {
        warn!("Forced checkin not possible: {}", e);
    }
}

async fn toggle_pause(handle: &SchedulerHandle, recent: &[Arc<ResultConsole>]) -> Result<(), SchedulerError> {
    let before = handle.snapshot().await?;
    if before.paused {
        handle.resume().await?;
    } else {
        handle.pause().await?;
    }
    
    let s = handle.snapshot().await?;
    info!(
        "{} - queued {}, pending {}, completed {}, failed {}, awaiting upload {}",
        if s.paused { "Paused" } else { "Running" },
        s.queued.len(),
        s.pending,
        s.completed,
        s.failed,
        s.awaiting_upload
    );
    info!(
        "Battery threshold {}%, data used this period {} bytes, last checkin {}",
        s.battery_threshold,
        s.data_used_bytes.unwrap_or(0),
        s.last_checkin
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(current) = &s.current {
        info!("Running {} ({:?})", current.kind, current.key);
    }
    for entry in recent.iter().filter_map(|console| console.entries().into_iter().next()) {
        info!("Latest: {}", entry.lines().next().unwrap_or_default());
    }
    Ok(())
}

async fn run_measure(agent: Agent, kind: &str, params: &[String], count: u32) -> Result<()> {
    let kind = MeasurementKind::from_tag(kind)?;
    let now = agent.clock.now();
    let mut builder = MeasurementDescriptor::builder(kind)
        .key(CLI_TASK_KEY)
        .priority(USER_PRIORITY)
        .interval_sec(DEFAULT_USER_INTERVAL_SEC)
        .count(count as i64)
        .start_time(now);
    for param in params {
        let (name, value) = param
            .split_once('=')
            .with_context(|| format!("Parameter must be key=value, got {:?}", param))?;
        builder = builder.param(name.trim(), value.trim());
    }
    let descriptor = builder.build(now);
    
    let events = output::event_channel();
    let mut rx = events.subscribe();
    // Paused so no checkin or server task runs alongside
    let scheduler = agent.into_scheduler(events, true)?;
    let (handle, join) = scheduler.spawn();
    
    handle.submit_task(descriptor).await?;
    
    let mut done = 0;
    let mut failed = 0;
    while done < count {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(AgentEvent::MeasurementEnded { key, outcome, .. }) if key.as_deref() == Some(CLI_TASK_KEY) => {
                    done += 1;
                    match outcome {
                        Ok(text) => println!("{}", text.trim_end()),
                        Err(e) => {
                            error!("{} failed: {}", kind.display_name(), e);
                            failed += 1;
                        }
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    anyhow::bail!("Scheduler stopped before the measurement finished");
                }
            },
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl+C")?;
                if handle.remove_task_by_key(CLI_TASK_KEY).await? {
                    info!("Dropped the remaining runs");
                }
                break;
            }
        }
    }
    
    handle.request_stop().await?;
    drop(handle);
    if let Err(e) = join.await {
        error!("Scheduler task ended abnormally: {}", e);
    }
    
    if failed > 0 {
        anyhow::bail!("{} of {} {} runs failed", failed, done, kind.display_name());
    }
    Ok(())
}

fn run_export(agent: Agent, args: &Args) -> Result<()> {
    info!("Running export...");
    
    let stored = agent.db.pending_results()?;
    info!("Found {} results awaiting upload", stored.len());
    
    // Determine output file
    let output_path = args.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!("mobimeter_export_{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S")))
    });
    
    let results: Vec<_> = stored.into_iter().map(|s| s.result).collect();
    output::export_csv(&results, &output_path)?;
    
    info!("Exported to {:?}", output_path);
    
    Ok(())
}
