//! Simulated motion sensors
//!
//! Provides an accelerometer, a gyroscope and a wake-up significant motion
//! sensor. Readings are a resting device plus random noise, produced by a
//! worker thread at each active sensor's sampling period.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use multihal_core::{HalProxyCallback, SubHal};
use multihal_types::handle::ALL_SENSORS_HANDLE;
use multihal_types::{
    Event, EventPayload, OperationMode, RateLevel, Result, SensorError, SensorFlags, SensorHandle,
    SensorInfo, SensorType, SharedMemInfo,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::timestamp_ns;

pub const ACCELEROMETER_HANDLE: SensorHandle = 1;
pub const GYROSCOPE_HANDLE: SensorHandle = 2;
pub const SIGNIFICANT_MOTION_HANDLE: SensorHandle = 3;

const STANDARD_GRAVITY: f32 = 9.80665;
const WORKER_TICK: Duration = Duration::from_millis(5);
const MIN_DELAY_US: i32 = 5_000;
const MAX_DELAY_US: i32 = 1_000_000;

/// Settings of the simulated motion sub-HAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Sampling period used until the client batches a sensor
    pub default_period_ms: u64,
    /// Standard deviation style amplitude of the noise added to readings
    pub noise: f32,
    /// Chance per tick that significant motion triggers
    pub significant_motion_chance: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_period_ms: 200,
            noise: 0.05,
            significant_motion_chance: 0.002,
        }
    }
}

struct Schedule {
    period: Duration,
    last_emit: Option<Instant>,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: Sender<()>,
}

#[derive(Default)]
struct MotionState {
    callback: Option<Arc<dyn HalProxyCallback>>,
    mode: OperationMode,
    periods: BTreeMap<SensorHandle, Duration>,
    active: BTreeMap<SensorHandle, Schedule>,
    channels: BTreeMap<i32, SharedMemInfo>,
    next_channel: i32,
    direct_rates: BTreeMap<(i32, SensorHandle), RateLevel>,
    events_posted: u64,
}

/// Sub-HAL serving simulated motion sensors
pub struct MotionSubHal {
    config: MotionConfig,
    sensors: Vec<SensorInfo>,
    state: Arc<Mutex<MotionState>>,
    worker: Mutex<Option<Worker>>,
}

impl Default for MotionSubHal {
    fn default() -> Self {
        Self::new(MotionConfig::default())
    }
}

impl MotionSubHal {
    pub fn new(config: MotionConfig) -> Self {
        let direct = SensorFlags::MASK_DIRECT_REPORT | SensorFlags::MASK_DIRECT_CHANNEL;
        let mut accelerometer = SensorInfo::new(ACCELEROMETER_HANDLE, "Simulated Accelerometer", SensorType::Accelerometer)
            .with_vendor("multihal")
            .with_flags(direct);
        accelerometer.max_range = 4.0 * STANDARD_GRAVITY;
        accelerometer.resolution = 0.001;
        accelerometer.power = 0.2;
        accelerometer.min_delay_us = MIN_DELAY_US;
        accelerometer.max_delay_us = MAX_DELAY_US;

        let mut gyroscope = SensorInfo::new(GYROSCOPE_HANDLE, "Simulated Gyroscope", SensorType::Gyroscope)
            .with_vendor("multihal");
        gyroscope.max_range = 34.9;
        gyroscope.resolution = 0.001;
        gyroscope.power = 0.5;
        gyroscope.min_delay_us = MIN_DELAY_US;
        gyroscope.max_delay_us = MAX_DELAY_US;

        // One-shot reporting mode
        let mut significant_motion = SensorInfo::new(
            SIGNIFICANT_MOTION_HANDLE,
            "Simulated Significant Motion",
            SensorType::SignificantMotion,
        )
        .with_vendor("multihal")
        .with_flags(SensorFlags::WAKE_UP | SensorFlags(0x4));
        significant_motion.max_range = 1.0;
        significant_motion.resolution = 1.0;
        significant_motion.power = 0.1;
        significant_motion.min_delay_us = -1;

        Self {
            config,
            sensors: vec![accelerometer, gyroscope, significant_motion],
            state: Arc::new(Mutex::new(MotionState::default())),
            worker: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MotionState> {
        lock_state(&self.state)
    }

    fn sensor(&self, sensor_handle: SensorHandle) -> Result<&SensorInfo> {
        self.sensors
            .iter()
            .find(|s| s.sensor_handle == sensor_handle)
            .ok_or_else(|| SensorError::BadArgument(format!("unknown sensor {}", sensor_handle)))
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            drop(worker.shutdown);
            // Dropped from the worker itself; it exits on its own
            if worker.handle.thread().id() == thread::current().id() {
                return;
            }
            if worker.handle.join().is_err() {
                warn!("Motion worker panicked");
            }
        }
    }

    fn start_worker(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("motion-subhal".into())
            .spawn(move || run_worker(state, config, shutdown_rx))
            .map_err(|e| SensorError::backend("motion", format!("failed to start worker: {}", e)))?;
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(Worker {
            handle,
            shutdown: shutdown_tx,
        });
        Ok(())
    }
}

impl Drop for MotionSubHal {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn lock_state(state: &Mutex<MotionState>) -> MutexGuard<'_, MotionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn noisy(rng: &mut impl Rng, base: f32, noise: f32) -> f32 {
    base + rng.gen_range(-noise..=noise)
}

fn run_worker(state: Arc<Mutex<MotionState>>, config: MotionConfig, shutdown: Receiver<()>) {
    let mut rng = rand::thread_rng();
    loop {
        match shutdown.recv_timeout(WORKER_TICK) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        let now = Instant::now();
        let timestamp = timestamp_ns();
        let mut events = Vec::new();
        let mut wake_events = Vec::new();
        let callback = {
            let mut state = lock_state(&state);
            if state.mode == OperationMode::DataInjection {
                continue;
            }
            let Some(callback) = state.callback.clone() else {
                continue;
            };

            let mut triggered = false;
            for (&sensor_handle, schedule) in state.active.iter_mut() {
                if sensor_handle == SIGNIFICANT_MOTION_HANDLE {
                    if rng.gen_bool(config.significant_motion_chance.clamp(0.0, 1.0)) {
                        wake_events.push(Event::new(
                            sensor_handle,
                            SensorType::SignificantMotion,
                            timestamp,
                            EventPayload::Scalar(1.0),
                        ));
                        triggered = true;
                    }
                    continue;
                }
                let due = schedule
                    .last_emit
                    .map_or(true, |last| now.duration_since(last) >= schedule.period);
                if !due {
                    continue;
                }
                schedule.last_emit = Some(now);
                let (sensor_type, base_z) = if sensor_handle == ACCELEROMETER_HANDLE {
                    (SensorType::Accelerometer, STANDARD_GRAVITY)
                } else {
                    (SensorType::Gyroscope, 0.0)
                };
                events.push(Event::new(
                    sensor_handle,
                    sensor_type,
                    timestamp,
                    EventPayload::Vec3 {
                        x: noisy(&mut rng, 0.0, config.noise),
                        y: noisy(&mut rng, 0.0, config.noise),
                        z: noisy(&mut rng, base_z, config.noise),
                        status: 3,
                    },
                ));
            }
            // Significant motion disables itself once it fires
            if triggered {
                state.active.remove(&SIGNIFICANT_MOTION_HANDLE);
            }
            state.events_posted += (events.len() + wake_events.len()) as u64;
            callback
        };

        if !events.is_empty() {
            let wakelock = callback.create_scoped_wakelock(false);
            callback.post_events(events, wakelock);
        }
        if !wake_events.is_empty() {
            let wakelock = callback.create_scoped_wakelock(true);
            callback.post_events(wake_events, wakelock);
        }
    }
    debug!("Motion worker stopped");
}

impl SubHal for MotionSubHal {
    fn name(&self) -> &str {
        "motion"
    }

    fn sensors_list(&self) -> Result<Vec<SensorInfo>> {
        Ok(self.sensors.clone())
    }

    fn initialize(&self, callback: Arc<dyn HalProxyCallback>) -> Result<()> {
        self.stop_worker();
        {
            let mut state = self.lock();
            *state = MotionState {
                callback: Some(callback),
                ..MotionState::default()
            };
        }
        self.start_worker()?;
        info!("Motion sub-HAL initialized");
        Ok(())
    }

    fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.lock().mode = mode;
        Ok(())
    }

    fn activate(&self, sensor_handle: SensorHandle, enabled: bool) -> Result<()> {
        self.sensor(sensor_handle)?;
        let mut state = self.lock();
        if enabled {
            let period = state
                .periods
                .get(&sensor_handle)
                .copied()
                .unwrap_or(Duration::from_millis(self.config.default_period_ms));
            state.active.insert(
                sensor_handle,
                Schedule {
                    period,
                    last_emit: None,
                },
            );
        } else {
            state.active.remove(&sensor_handle);
        }
        debug!("Motion sensor {} {}", sensor_handle, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn batch(&self, sensor_handle: SensorHandle, sampling_period_ns: i64, _max_report_latency_ns: i64) -> Result<()> {
        let sensor = self.sensor(sensor_handle)?;
        if sampling_period_ns < 0 {
            return Err(SensorError::BadArgument("negative sampling period".into()));
        }
        let min = i64::from(sensor.min_delay_us.max(0)) * 1_000;
        let max = i64::from(MAX_DELAY_US) * 1_000;
        let period = Duration::from_nanos(sampling_period_ns.clamp(min, max) as u64);

        let mut state = self.lock();
        state.periods.insert(sensor_handle, period);
        if let Some(schedule) = state.active.get_mut(&sensor_handle) {
            schedule.period = period;
        }
        Ok(())
    }

    fn flush(&self, sensor_handle: SensorHandle) -> Result<()> {
        self.sensor(sensor_handle)?;
        if sensor_handle == SIGNIFICANT_MOTION_HANDLE {
            return Err(SensorError::BadArgument("one-shot sensors cannot be flushed".into()));
        }
        let callback = {
            let state = self.lock();
            if !state.active.contains_key(&sensor_handle) {
                return Err(SensorError::BadArgument(format!("sensor {} is not active", sensor_handle)));
            }
            state.callback.clone()
        };
        if let Some(callback) = callback {
            let wakelock = callback.create_scoped_wakelock(false);
            callback.post_events(vec![Event::flush_complete(sensor_handle, timestamp_ns())], wakelock);
        }
        Ok(())
    }

    fn inject_sensor_data(&self, event: &Event) -> Result<()> {
        let callback = {
            let state = self.lock();
            if state.mode != OperationMode::DataInjection {
                debug!("Motion sub-HAL ignoring {:?} injected in normal mode", event.sensor_type);
                return Ok(());
            }
            state.callback.clone()
        };
        let sensor = self.sensor(event.sensor_handle)?;
        if let Some(callback) = callback {
            let wakelock = callback.create_scoped_wakelock(sensor.is_wake_up());
            callback.post_events(vec![event.clone()], wakelock);
        }
        Ok(())
    }

    fn register_direct_channel(&self, mem: &SharedMemInfo) -> Result<i32> {
        if mem.size == 0 {
            return Err(SensorError::BadArgument("empty shared memory".into()));
        }
        let mut state = self.lock();
        state.next_channel += 1;
        let channel = state.next_channel;
        state.channels.insert(channel, mem.clone());
        Ok(channel)
    }

    fn unregister_direct_channel(&self, channel_handle: i32) -> Result<()> {
        let mut state = self.lock();
        if state.channels.remove(&channel_handle).is_none() {
            return Err(SensorError::BadArgument(format!("unknown channel {}", channel_handle)));
        }
        state.direct_rates.retain(|(channel, _), _| *channel != channel_handle);
        Ok(())
    }

    fn config_direct_report(&self, sensor_handle: SensorHandle, channel_handle: i32, rate: RateLevel) -> Result<i32> {
        let mut state = self.lock();
        if !state.channels.contains_key(&channel_handle) {
            return Err(SensorError::BadArgument(format!("unknown channel {}", channel_handle)));
        }
        if sensor_handle == ALL_SENSORS_HANDLE {
            if rate != RateLevel::Stop {
                return Err(SensorError::BadArgument("all sensors can only be stopped".into()));
            }
            state.direct_rates.retain(|(channel, _), _| *channel != channel_handle);
            return Ok(0);
        }
        if sensor_handle != ACCELEROMETER_HANDLE {
            return Err(SensorError::BadArgument(format!(
                "sensor {} has no direct report support",
                sensor_handle
            )));
        }
        if rate == RateLevel::Stop {
            state.direct_rates.remove(&(channel_handle, sensor_handle));
            return Ok(0);
        }
        state.direct_rates.insert((channel_handle, sensor_handle), rate);
        Ok(sensor_handle)
    }

    fn debug_dump(&self) -> String {
        let state = self.lock();
        let active: Vec<String> = state
            .active
            .iter()
            .map(|(h, s)| format!("{}@{}ms", h, s.period.as_millis()))
            .collect();
        format!(
            "mode: {:?}\nactive: [{}]\nevents posted: {}\ndirect channels: {}\n",
            state.mode,
            active.join(", "),
            state.events_posted,
            state.channels.len()
        )
    }
}
