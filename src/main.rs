use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use log::{error, info, warn};
use multihal::config::ProxyConfig;
use multihal::core::{HalProxy, ProxyChannels};
use multihal::loader;
use multihal_core::{global_registry, SensorHandle, SensorInfo, SensorsCallback};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// multihal - One sensor HAL in front of many sub-HALs
#[derive(Parser, Debug)]
#[command(name = "multihal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file to load instead of the default one
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug verbosity level (0=quiet, 1=info, 2=debug, 3=trace)
    #[arg(short = 'd', long = "debug", value_name = "LEVEL", default_value = "0")]
    debug: u8,

    /// Sub-HAL list file (overrides the configured one)
    #[arg(long = "subhals", value_name = "FILE")]
    subhals: Option<PathBuf>,

    /// Load every built-in sub-HAL instead of reading a list file
    #[arg(long = "builtin")]
    builtin: bool,

    /// List available sub-HALs and exit
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Seconds to run before dumping state and exiting
    #[arg(long = "duration", value_name = "SECONDS", default_value = "5")]
    duration: u64,

    /// Activate every sensor at startup
    #[arg(long = "activate-all")]
    activate_all: bool,

    /// Capacity of the client event channel
    #[arg(long = "queue-capacity", value_name = "EVENTS", default_value = "128")]
    queue_capacity: usize,
}

/// Logs dynamic sensor changes
struct LoggingCallback;

impl SensorsCallback for LoggingCallback {
    fn on_dynamic_sensors_connected(&self, sensors: &[SensorInfo]) {
        for sensor in sensors {
            info!("Dynamic sensor connected: {:#x} {}", sensor.sensor_handle, sensor.name);
        }
    }

    fn on_dynamic_sensors_disconnected(&self, sensor_handles: &[SensorHandle]) {
        for sensor_handle in sensor_handles {
            info!("Dynamic sensor disconnected: {:#x}", sensor_handle);
        }
    }
}

fn main() {
    // Parse command line arguments
    let cli = Cli::parse();

    // Level 0 (default): warn only
    // Level 1: info
    // Level 2: debug
    // Level 3+: trace
    let log_level = match cli.debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Allow RUST_LOG to override CLI setting
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    warn!("Starting multihal v{}", env!("CARGO_PKG_VERSION"));

    // Register all built-in sub-HALs
    multihal_subhals::register_all();

    if cli.list {
        list_available_subhals();
        return;
    }

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// List registered sub-HALs to stdout
fn list_available_subhals() {
    let registry = global_registry().read().unwrap_or_else(|e| e.into_inner());
    let infos = registry.list_subhal_infos();
    println!("Available sub-HALs ({}):", infos.len());
    for info in infos {
        println!("  {:<12} {}", info.id, info.description);
    }
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => ProxyConfig::load().unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            ProxyConfig::default()
        }),
    };
    if let Some(path) = &cli.subhals {
        config.subhal_list_path = path.clone();
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    let subhals = {
        let registry = global_registry().read().unwrap_or_else(|e| e.into_inner());
        if cli.builtin {
            loader::create_subhals(&registry.list_subhals(), &registry)
        } else {
            loader::load_subhal_list(&config.subhal_list_path, &registry)
        }
    };
    if subhals.is_empty() {
        warn!("No sub-HALs loaded, the proxy will expose no sensors");
    }

    let proxy = HalProxy::new(subhals, &config);
    let (channels, client) = ProxyChannels::new(cli.queue_capacity.max(1), Arc::new(LoggingCallback));
    if let Err(e) = proxy.initialize(channels) {
        warn!("Proxy initialized with errors: {}", e);
    }

    let sensors = proxy.sensors_list();
    println!("Sensors ({}):", sensors.len());
    for sensor in &sensors {
        println!(
            "  {:#010x}  {:<32} {:?}{}",
            sensor.sensor_handle,
            sensor.name,
            sensor.sensor_type,
            if sensor.is_wake_up() { " (wake-up)" } else { "" }
        );
    }

    if cli.activate_all {
        for sensor in &sensors {
            let period_ns = i64::from(sensor.min_delay_us.max(20_000)) * 1_000;
            if let Err(e) = proxy.batch(sensor.sensor_handle, period_ns, 0) {
                warn!("batch({:#x}) failed: {}", sensor.sensor_handle, e);
            }
            if let Err(e) = proxy.activate(sensor.sensor_handle, true) {
                warn!("activate({:#x}) failed: {}", sensor.sensor_handle, e);
            }
        }
    }

    // Consume events like a client would, acknowledging wake-up events
    let wake_up: HashSet<SensorHandle> = sensors
        .iter()
        .filter(|s| s.is_wake_up())
        .map(|s| s.sensor_handle)
        .collect();
    let mut counts: BTreeMap<SensorHandle, u64> = BTreeMap::new();
    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    while Instant::now() < deadline {
        match client.events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                *counts.entry(event.sensor_handle).or_default() += 1;
                if wake_up.contains(&event.sensor_handle) {
                    let _ = client.wake_lock_acks.send(1);
                }
            }
            Err(RecvTimeoutError::Timeout) => thread::yield_now(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!();
    println!("Events received:");
    for (sensor_handle, count) in &counts {
        println!("  {:#010x}  {}", sensor_handle, count);
    }
    println!();
    print!("{}", proxy.debug_dump());

    proxy.shutdown();
    Ok(())
}
