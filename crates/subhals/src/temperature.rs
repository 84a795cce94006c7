//! Temperature sensor backed by the host's hardware monitors
//!
//! Reports the hottest sysinfo component as an on-change ambient
//! temperature sensor.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use multihal_core::{HalProxyCallback, SubHal};
use multihal_types::{
    Event, EventPayload, OperationMode, Result, SensorError, SensorFlags, SensorHandle, SensorInfo,
    SensorType,
};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sysinfo::Components;

use crate::timestamp_ns;

pub const TEMPERATURE_HANDLE: SensorHandle = 1;

/// Minimum interval between component refreshes (250ms)
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(250);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Smallest change worth reporting, in degrees Celsius
const CHANGE_THRESHOLD: f32 = 0.1;

struct SharedComponents {
    components: Components,
    last_refresh: Instant,
}

impl SharedComponents {
    fn refresh_if_needed(&mut self) {
        if self.last_refresh.elapsed() >= MIN_REFRESH_INTERVAL {
            self.components.refresh();
            self.last_refresh = Instant::now();
        }
    }
}

static SHARED_COMPONENTS: Lazy<Mutex<SharedComponents>> = Lazy::new(|| {
    let components = Components::new_with_refreshed_list();
    log::info!("Temperature components discovered: {}", components.len());
    Mutex::new(SharedComponents {
        components,
        last_refresh: Instant::now(),
    })
});

/// Hottest component temperature, if the host exposes any
fn hottest_temperature() -> Option<f32> {
    // Use unwrap_or_else to recover from poisoned mutex - data may still be valid
    let mut shared = SHARED_COMPONENTS.lock().unwrap_or_else(|poisoned| {
        warn!("Shared components mutex was poisoned, recovering");
        poisoned.into_inner()
    });
    shared.refresh_if_needed();
    shared
        .components
        .iter()
        .map(|c| c.temperature())
        .filter(|t| t.is_finite())
        .fold(None, |hottest: Option<f32>, t| Some(hottest.map_or(t, |h| h.max(t))))
}

#[derive(Default)]
struct TemperatureState {
    callback: Option<Arc<dyn HalProxyCallback>>,
    mode: OperationMode,
    active: bool,
    last_reported: Option<f32>,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: Sender<()>,
}

/// Sub-HAL exposing the host temperature
pub struct TemperatureSubHal {
    sensor: SensorInfo,
    state: Arc<Mutex<TemperatureState>>,
    worker: Mutex<Option<Worker>>,
}

impl Default for TemperatureSubHal {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureSubHal {
    pub fn new() -> Self {
        // On-change reporting mode
        let mut sensor = SensorInfo::new(TEMPERATURE_HANDLE, "Host Temperature", SensorType::AmbientTemperature)
            .with_vendor("multihal")
            .with_flags(SensorFlags(0x2));
        sensor.max_range = 150.0;
        sensor.resolution = CHANGE_THRESHOLD;
        sensor.power = 0.01;
        sensor.max_delay_us = POLL_INTERVAL.as_micros() as i32;

        Self {
            sensor,
            state: Arc::new(Mutex::new(TemperatureState::default())),
            worker: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TemperatureState> {
        lock_state(&self.state)
    }

    fn check_handle(&self, sensor_handle: SensorHandle) -> Result<()> {
        if sensor_handle == TEMPERATURE_HANDLE {
            Ok(())
        } else {
            Err(SensorError::BadArgument(format!("unknown sensor {}", sensor_handle)))
        }
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
                warn!("Temperature worker panicked");
            }
        }
    }
}

impl Drop for TemperatureSubHal {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn lock_state(state: &Mutex<TemperatureState>) -> MutexGuard<'_, TemperatureState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn temperature_event(celsius: f32) -> Event {
    Event::new(
        TEMPERATURE_HANDLE,
        SensorType::AmbientTemperature,
        timestamp_ns(),
        EventPayload::Scalar(celsius),
    )
}

fn run_worker(state: Arc<Mutex<TemperatureState>>, shutdown: Receiver<()>) {
    loop {
        match shutdown.recv_timeout(POLL_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        {
            let state = lock_state(&state);
            if !state.active || state.mode == OperationMode::DataInjection || state.callback.is_none() {
                continue;
            }
        }
        let Some(celsius) = hottest_temperature() else {
            continue;
        };

        let callback = {
            let mut state = lock_state(&state);
            let changed = state
                .last_reported
                .map_or(true, |last| (last - celsius).abs() >= CHANGE_THRESHOLD);
            if !state.active || !changed {
                continue;
            }
            state.last_reported = Some(celsius);
            state.callback.clone()
        };
        if let Some(callback) = callback {
            let wakelock = callback.create_scoped_wakelock(false);
            callback.post_events(vec![temperature_event(celsius)], wakelock);
        }
    }
    debug!("Temperature worker stopped");
}

impl SubHal for TemperatureSubHal {
    fn name(&self) -> &str {
        "temperature"
    }

    fn sensors_list(&self) -> Result<Vec<SensorInfo>> {
        Ok(vec![self.sensor.clone()])
    }

    fn initialize(&self, callback: Arc<dyn HalProxyCallback>) -> Result<()> {
        self.stop_worker();
        *self.lock() = TemperatureState {
            callback: Some(callback),
            ..TemperatureState::default()
        };

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name("temperature-subhal".into())
            .spawn(move || run_worker(state, shutdown_rx))
            .map_err(|e| SensorError::backend("temperature", format!("failed to start worker: {}", e)))?;
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(Worker {
            handle,
            shutdown: shutdown_tx,
        });
        Ok(())
    }

    fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.lock().mode = mode;
        Ok(())
    }

    fn activate(&self, sensor_handle: SensorHandle, enabled: bool) -> Result<()> {
        self.check_handle(sensor_handle)?;
        let mut state = self.lock();
        state.active = enabled;
        // On-change sensors report their current value on activation
        state.last_reported = None;
        Ok(())
    }

    fn batch(&self, sensor_handle: SensorHandle, _sampling_period_ns: i64, _max_report_latency_ns: i64) -> Result<()> {
        self.check_handle(sensor_handle)
    }

    fn flush(&self, sensor_handle: SensorHandle) -> Result<()> {
        self.check_handle(sensor_handle)?;
        let callback = {
            let state = self.lock();
            if !state.active {
                return Err(SensorError::BadArgument("temperature sensor is not active".into()));
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
                return Ok(());
            }
            state.callback.clone()
        };
        self.check_handle(event.sensor_handle)?;
        if let Some(callback) = callback {
            let wakelock = callback.create_scoped_wakelock(false);
            callback.post_events(vec![event.clone()], wakelock);
        }
        Ok(())
    }

    fn debug_dump(&self) -> String {
        let state = self.lock();
        format!(
            "mode: {:?}\nactive: {}\nlast reported: {:?}\n",
            state.mode, state.active, state.last_reported
        )
    }
}
