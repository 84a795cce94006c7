//! Scriptable sub-HAL for tests and demonstrations
//!
//! Records every call the proxy makes and lets the caller push events and
//! dynamic sensor changes through the callback it was initialized with.

use crossbeam::channel::Receiver;
use log::debug;
use multihal_core::{HalProxyCallback, SubHal};
use multihal_types::{
    Event, OperationMode, RateLevel, Result, SensorError, SensorFlags, SensorHandle, SensorInfo,
    SensorType, SharedMemInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Builder for the sensors a [`FakeSubHal`] reports
#[derive(Debug, Clone)]
pub struct FakeSensor {
    info: SensorInfo,
}

impl FakeSensor {
    /// Continuous, non wake-up accelerometer
    pub fn plain(sensor_handle: SensorHandle) -> Self {
        Self {
            info: SensorInfo::new(sensor_handle, "Fake Accelerometer", SensorType::Accelerometer)
                .with_vendor("multihal"),
        }
    }

    /// Wake-up significant motion sensor
    pub fn wake_up(sensor_handle: SensorHandle) -> Self {
        Self {
            info: SensorInfo::new(sensor_handle, "Fake Significant Motion", SensorType::SignificantMotion)
                .with_vendor("multihal")
                .with_flags(SensorFlags::WAKE_UP),
        }
    }

    /// Accelerometer that supports direct channels
    pub fn direct(sensor_handle: SensorHandle) -> Self {
        Self::plain(sensor_handle).with_flags(SensorFlags::MASK_DIRECT_REPORT | SensorFlags::MASK_DIRECT_CHANNEL)
    }

    pub fn with_flags(mut self, flags: SensorFlags) -> Self {
        self.info.flags.insert(flags);
        self
    }

    pub fn info(&self) -> SensorInfo {
        self.info.clone()
    }
}

#[derive(Default)]
struct FakeState {
    callback: Option<Arc<dyn HalProxyCallback>>,
    initialize_count: usize,
    fail_initialize: bool,
    fail_sensors_list: bool,
    mode: OperationMode,
    rejected_mode: Option<OperationMode>,
    mode_gate: Option<Receiver<()>>,
    holding_mode_change: bool,
    mode_changes: Vec<OperationMode>,
    dynamic: BTreeMap<SensorHandle, SensorInfo>,
    active: BTreeSet<SensorHandle>,
    activations: Vec<(SensorHandle, bool)>,
    batches: Vec<(SensorHandle, i64, i64)>,
    flushes: Vec<SensorHandle>,
    injected: Vec<Event>,
    channels: BTreeSet<i32>,
    next_channel: i32,
    next_report_token: i32,
    direct_reports: Vec<(SensorHandle, i32, RateLevel)>,
}

/// Sub-HAL whose behavior is driven entirely by its caller
pub struct FakeSubHal {
    name: String,
    sensors: Vec<SensorInfo>,
    state: Mutex<FakeState>,
}

impl FakeSubHal {
    pub fn new(name: &str, sensors: Vec<FakeSensor>) -> Self {
        Self {
            name: name.to_string(),
            sensors: sensors.into_iter().map(|s| s.info).collect(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callback(&self) -> Option<Arc<dyn HalProxyCallback>> {
        self.lock().callback.clone()
    }

    fn knows(&self, state: &FakeState, sensor_handle: SensorHandle) -> bool {
        self.sensors.iter().any(|s| s.sensor_handle == sensor_handle)
            || state.dynamic.contains_key(&sensor_handle)
    }

    fn is_wake_up(&self, sensor_handle: SensorHandle) -> bool {
        let state = self.lock();
        self.sensors
            .iter()
            .chain(state.dynamic.values())
            .find(|s| s.sensor_handle == sensor_handle)
            .map(SensorInfo::is_wake_up)
            .unwrap_or(false)
    }

    /// Make `sensors_list` fail
    pub fn fail_sensors_list(&self, fail: bool) {
        self.lock().fail_sensors_list = fail;
    }

    /// Make `initialize` fail
    pub fn fail_initialize(&self, fail: bool) {
        self.lock().fail_initialize = fail;
    }

    /// Reject switches to `mode`
    pub fn reject_operation_mode(&self, mode: Option<OperationMode>) {
        self.lock().rejected_mode = mode;
    }

    /// Make `set_operation_mode` wait for a message on `gate` before applying
    pub fn hold_operation_mode(&self, gate: Option<Receiver<()>>) {
        self.lock().mode_gate = gate;
    }

    /// Whether a mode change is waiting on the gate
    pub fn is_holding_mode_change(&self) -> bool {
        self.lock().holding_mode_change
    }

    /// Post events through the current callback
    ///
    /// Takes the wake lock when any event belongs to a wake-up sensor.
    /// Returns false when the sub-HAL has not been initialized.
    pub fn post(&self, events: Vec<Event>) -> bool {
        let lock = events.iter().any(|e| self.is_wake_up(e.sensor_handle));
        self.post_with_lock(events, lock)
    }

    /// Post events holding the wake lock or not, regardless of their sensors
    pub fn post_with_lock(&self, events: Vec<Event>, lock: bool) -> bool {
        match self.callback() {
            Some(callback) => {
                let wakelock = callback.create_scoped_wakelock(lock);
                callback.post_events(events, wakelock);
                true
            }
            None => false,
        }
    }

    pub fn connect_dynamic(&self, sensors: Vec<SensorInfo>) -> bool {
        let callback = {
            let mut state = self.lock();
            for sensor in &sensors {
                state.dynamic.insert(sensor.sensor_handle, sensor.clone());
            }
            state.callback.clone()
        };
        match callback {
            Some(callback) => {
                callback.on_dynamic_sensors_connected(sensors);
                true
            }
            None => false,
        }
    }

    pub fn disconnect_dynamic(&self, sensor_handles: Vec<SensorHandle>) -> bool {
        let callback = {
            let mut state = self.lock();
            for sensor_handle in &sensor_handles {
                state.dynamic.remove(sensor_handle);
                state.active.remove(sensor_handle);
            }
            state.callback.clone()
        };
        match callback {
            Some(callback) => {
                callback.on_dynamic_sensors_disconnected(sensor_handles);
                true
            }
            None => false,
        }
    }

    pub fn initialize_count(&self) -> usize {
        self.lock().initialize_count
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.lock().mode
    }

    pub fn mode_changes(&self) -> Vec<OperationMode> {
        self.lock().mode_changes.clone()
    }

    pub fn active_sensors(&self) -> Vec<SensorHandle> {
        self.lock().active.iter().copied().collect()
    }

    pub fn activations(&self) -> Vec<(SensorHandle, bool)> {
        self.lock().activations.clone()
    }

    pub fn batches(&self) -> Vec<(SensorHandle, i64, i64)> {
        self.lock().batches.clone()
    }

    pub fn flushes(&self) -> Vec<SensorHandle> {
        self.lock().flushes.clone()
    }

    pub fn injected(&self) -> Vec<Event> {
        self.lock().injected.clone()
    }

    pub fn direct_reports(&self) -> Vec<(SensorHandle, i32, RateLevel)> {
        self.lock().direct_reports.clone()
    }
}

impl SubHal for FakeSubHal {
    fn name(&self) -> &str {
        &self.name
    }

    fn sensors_list(&self) -> Result<Vec<SensorInfo>> {
        if self.lock().fail_sensors_list {
            return Err(SensorError::backend(&self.name, "sensor list unavailable"));
        }
        Ok(self.sensors.clone())
    }

    fn initialize(&self, callback: Arc<dyn HalProxyCallback>) -> Result<()> {
        let mut state = self.lock();
        state.initialize_count += 1;
        if state.fail_initialize {
            return Err(SensorError::backend(&self.name, "initialize failed"));
        }
        state.callback = Some(callback);
        state.mode = OperationMode::Normal;
        state.dynamic.clear();
        state.channels.clear();
        debug!("{} initialized ({} times)", self.name, state.initialize_count);
        Ok(())
    }

    fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        let gate = {
            let mut state = self.lock();
            state.holding_mode_change = state.mode_gate.is_some();
            state.mode_gate.clone()
        };
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        let mut state = self.lock();
        state.holding_mode_change = false;
        if state.rejected_mode == Some(mode) {
            return Err(SensorError::Unsupported(format!("{} rejects {:?}", self.name, mode)));
        }
        state.mode = mode;
        state.mode_changes.push(mode);
        Ok(())
    }

    fn activate(&self, sensor_handle: SensorHandle, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        if !self.knows(&state, sensor_handle) {
            return Err(SensorError::BadArgument(format!("unknown sensor {}", sensor_handle)));
        }
        state.activations.push((sensor_handle, enabled));
        if enabled {
            state.active.insert(sensor_handle);
        } else {
            state.active.remove(&sensor_handle);
        }
        Ok(())
    }

    fn batch(&self, sensor_handle: SensorHandle, sampling_period_ns: i64, max_report_latency_ns: i64) -> Result<()> {
        let mut state = self.lock();
        if !self.knows(&state, sensor_handle) {
            return Err(SensorError::BadArgument(format!("unknown sensor {}", sensor_handle)));
        }
        state.batches.push((sensor_handle, sampling_period_ns, max_report_latency_ns));
        Ok(())
    }

    fn flush(&self, sensor_handle: SensorHandle) -> Result<()> {
        let callback = {
            let mut state = self.lock();
            if !self.knows(&state, sensor_handle) {
                return Err(SensorError::BadArgument(format!("unknown sensor {}", sensor_handle)));
            }
            state.flushes.push(sensor_handle);
            state.callback.clone()
        };
        if let Some(callback) = callback {
            let wakelock = callback.create_scoped_wakelock(false);
            callback.post_events(vec![Event::flush_complete(sensor_handle, 0)], wakelock);
        }
        Ok(())
    }

    fn inject_sensor_data(&self, event: &Event) -> Result<()> {
        self.lock().injected.push(event.clone());
        Ok(())
    }

    fn register_direct_channel(&self, _mem: &SharedMemInfo) -> Result<i32> {
        if !self.sensors.iter().any(|s| s.flags.supports_direct_channel()) {
            return Err(SensorError::Unsupported(format!("{} has no direct channel support", self.name)));
        }
        let mut state = self.lock();
        state.next_channel += 1;
        let channel = state.next_channel;
        state.channels.insert(channel);
        Ok(channel)
    }

    fn unregister_direct_channel(&self, channel_handle: i32) -> Result<()> {
        if self.lock().channels.remove(&channel_handle) {
            Ok(())
        } else {
            Err(SensorError::BadArgument(format!("unknown channel {}", channel_handle)))
        }
    }

    fn config_direct_report(&self, sensor_handle: SensorHandle, channel_handle: i32, rate: RateLevel) -> Result<i32> {
        let mut state = self.lock();
        if !state.channels.contains(&channel_handle) {
            return Err(SensorError::BadArgument(format!("unknown channel {}", channel_handle)));
        }
        state.direct_reports.push((sensor_handle, channel_handle, rate));
        if rate == RateLevel::Stop {
            return Ok(0);
        }
        state.next_report_token += 1;
        Ok(state.next_report_token)
    }

    fn debug_dump(&self) -> String {
        let state = self.lock();
        format!(
            "mode: {:?}\nsensors: {} static, {} dynamic\nactive: {:?}\n",
            state.mode,
            self.sensors.len(),
            state.dynamic.len(),
            state.active
        )
    }
}
