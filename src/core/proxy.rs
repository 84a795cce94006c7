//! Proxy orchestrator
//!
//! Presents the sub-HALs as one sensor HAL: routes client calls by the
//! namespace bits of the sensor handle, funnels every sub-HAL's events into
//! the dispatch queue and runs the dispatch and wake lock tasks.

use arc_swap::ArcSwapOption;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use multihal_core::{
    Event, EventSink, OperationMode, PowerLock, RateLevel, Result, ScopedWakelock, SensorError,
    SensorHandle, SensorInfo, SensorsCallback, SharedMemInfo, SharedSubHal, WakelockRefCounter,
};
use multihal_types::{handle, SensorType};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use super::callback::SubHalCallback;
use super::direct_channel::DirectChannelRouter;
use super::dispatch::{EventDispatchQueue, QueueStats};
use super::registry::BackendRegistry;
use super::wakelock::{WakelockCoordinator, WakelockStats};
use crate::config::ProxyConfig;

/// Lifecycle of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Uninitialized,
    Initializing,
    Ready,
    Reinitializing,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Uninitialized => "uninitialized",
            ProxyState::Initializing => "initializing",
            ProxyState::Ready => "ready",
            ProxyState::Reinitializing => "reinitializing",
            ProxyState::ShuttingDown => "shutting down",
            ProxyState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Proxy side of the client channels, passed to [`HalProxy::initialize`]
pub struct ProxyChannels {
    /// Bounded event channel towards the client
    pub events: Arc<dyn EventSink>,
    /// Counts of wake-up events the client has processed
    pub wake_lock_acks: Receiver<u32>,
    /// Dynamic sensor notifications
    pub callback: Arc<dyn SensorsCallback>,
}

/// Client side of the channels created by [`ProxyChannels::new`]
pub struct ClientChannels {
    pub events: Receiver<Event>,
    pub wake_lock_acks: Sender<u32>,
}

impl ProxyChannels {
    /// Create an event channel holding `capacity` events and an ack channel
    pub fn new(capacity: usize, callback: Arc<dyn SensorsCallback>) -> (ProxyChannels, ClientChannels) {
        let (event_tx, event_rx) = bounded::<Event>(capacity);
        let (ack_tx, ack_rx) = unbounded::<u32>();
        (
            ProxyChannels {
                events: Arc::new(event_tx),
                wake_lock_acks: ack_rx,
                callback,
            },
            ClientChannels {
                events: event_rx,
                wake_lock_acks: ack_tx,
            },
        )
    }
}

/// Upstream state of one initialization generation
struct Session {
    callback: Arc<dyn SensorsCallback>,
}

struct Workers {
    dispatch: JoinHandle<()>,
    wakelock: JoinHandle<()>,
    /// Dropped to wake the wake lock task
    shutdown: Sender<()>,
}

struct Lifecycle {
    workers: Option<Workers>,
}

/// State shared between the proxy handle and the sub-HAL callbacks
pub(crate) struct ProxyShared {
    registry: BackendRegistry,
    direct_channel: DirectChannelRouter,
    wakelock: Arc<WakelockCoordinator>,
    dispatch: Arc<EventDispatchQueue>,
    session: ArcSwapOption<Session>,
    threads_running: AtomicBool,
    state: RwLock<ProxyState>,
    /// Serializes initialize and shutdown
    lifecycle: Mutex<Lifecycle>,
    /// Serializes mode changes; held across the sub-HAL calls
    mode_change: Mutex<()>,
    /// Committed mode, only locked to read or store it
    operation_mode: Mutex<OperationMode>,
}

/// The multiplexing sensor HAL
pub struct HalProxy {
    shared: Arc<ProxyShared>,
}

impl HalProxy {
    /// Build a proxy over `subhals`, using the power lock named in `config`
    pub fn new(subhals: Vec<SharedSubHal>, config: &ProxyConfig) -> Self {
        Self::with_power_lock(subhals, config, config.power_lock.build())
    }

    /// Build a proxy over `subhals` with an explicit power lock
    pub fn with_power_lock(
        subhals: Vec<SharedSubHal>,
        config: &ProxyConfig,
        power: Arc<dyn PowerLock>,
    ) -> Self {
        let wakelock = Arc::new(WakelockCoordinator::new(
            power,
            config.wakelock_name.clone(),
            config.wakelock_timeout(),
        ));
        let dispatch = Arc::new(EventDispatchQueue::new(
            Arc::clone(&wakelock),
            config.max_pending_events,
            config.pending_write_timeout(),
        ));

        let shared = Arc::new_cyclic(|weak| {
            let registry = BackendRegistry::new(subhals, &config.direct_channel_policy, |index| {
                Arc::new(SubHalCallback::new(index, weak.clone())) as Arc<dyn multihal_core::HalProxyCallback>
            });
            let direct_channel = DirectChannelRouter::new(registry.direct_channel_backend());
            ProxyShared {
                registry,
                direct_channel,
                wakelock,
                dispatch,
                session: ArcSwapOption::empty(),
                threads_running: AtomicBool::new(false),
                state: RwLock::new(ProxyState::Uninitialized),
                lifecycle: Mutex::new(Lifecycle { workers: None }),
                mode_change: Mutex::new(()),
                operation_mode: Mutex::new(OperationMode::Normal),
            }
        });

        info!(
            "Proxy created with {} sub-HALs and {} sensors",
            shared.registry.len(),
            shared.registry.static_sensor_count()
        );
        Self { shared }
    }

    pub fn state(&self) -> ProxyState {
        self.shared.state()
    }

    /// Static sensors of every sub-HAL, with namespaced handles
    pub fn sensors_list(&self) -> Vec<SensorInfo> {
        self.shared.registry.sensors_list()
    }

    /// Currently connected dynamic sensors
    pub fn dynamic_sensors(&self) -> Vec<SensorInfo> {
        self.shared.registry.dynamic_sensors()
    }

    pub fn subhal_names(&self) -> Vec<String> {
        self.shared.registry.backends().iter().map(|b| b.name.clone()).collect()
    }

    /// Start a new session on fresh client channels
    ///
    /// Stops the background tasks and disables every sensor of the previous
    /// session before anything of the new one starts, so no event crosses
    /// sessions. Returns the first sub-HAL initialization error, if any.
    pub fn initialize(&self, channels: ProxyChannels) -> Result<()> {
        let shared = &self.shared;
        let mut lifecycle = shared.lock_lifecycle();

        match shared.state() {
            ProxyState::ShuttingDown | ProxyState::Stopped => {
                return Err(SensorError::InvalidState("proxy has been shut down".into()));
            }
            ProxyState::Uninitialized => shared.set_state(ProxyState::Initializing),
            _ => shared.set_state(ProxyState::Reinitializing),
        }

        shared.stop_workers(&mut lifecycle);
        shared.wakelock.reset();
        shared.disable_all_sensors();
        let dropped = shared.dispatch.clear();
        if dropped > 0 {
            debug!("Discarded {} events pending from the previous session", dropped);
        }
        shared.registry.clear_dynamic_sensors();

        shared.session.store(Some(Arc::new(Session {
            callback: channels.callback,
        })));
        shared.dispatch.start(channels.events);
        shared.wakelock.start();
        shared.threads_running.store(true, Ordering::SeqCst);

        match shared.spawn_workers(channels.wake_lock_acks) {
            Ok(workers) => lifecycle.workers = Some(workers),
            Err(e) => {
                error!("Failed to start proxy tasks: {}", e);
                shared.stop_workers(&mut lifecycle);
                shared.set_state(ProxyState::Uninitialized);
                return Err(SensorError::ResourceExhausted(format!(
                    "failed to start proxy tasks: {}",
                    e
                )));
            }
        }

        let mut result = Ok(());
        for backend in shared.registry.backends() {
            if let Err(e) = backend.subhal.initialize(Arc::clone(&backend.callback)) {
                error!("Sub-HAL '{}' failed to initialize: {}", backend.name, e);
                result = Err(e);
                break;
            }
        }

        {
            let _serial = shared.mode_change.lock().unwrap_or_else(|e| e.into_inner());
            *shared.lock_mode() = OperationMode::Normal;
        }
        shared.set_state(ProxyState::Ready);
        info!("Proxy session started ({} sub-HALs)", shared.registry.len());
        result
    }

    /// Switch every sub-HAL to `mode`, or none of them
    ///
    /// If a sub-HAL rejects the mode, the ones that already switched are put
    /// back to the previous mode and the rejection is returned.
    pub fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.shared.ensure_ready()?;
        let _serial = self.shared.mode_change.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.operation_mode();
        let backends = self.shared.registry.backends();

        for (index, backend) in backends.iter().enumerate() {
            if let Err(e) = backend.subhal.set_operation_mode(mode) {
                error!("set_operation_mode({:?}) failed for sub-HAL '{}': {}", mode, backend.name, e);
                for flipped in &backends[..index] {
                    if let Err(e) = flipped.subhal.set_operation_mode(previous) {
                        error!(
                            "Failed to restore {:?} on sub-HAL '{}': {}",
                            previous, flipped.name, e
                        );
                    }
                }
                return Err(e);
            }
        }

        *self.shared.lock_mode() = mode;
        Ok(())
    }

    pub fn operation_mode(&self) -> OperationMode {
        *self.shared.lock_mode()
    }

    pub fn activate(&self, sensor_handle: SensorHandle, enabled: bool) -> Result<()> {
        self.shared.ensure_ready()?;
        let backend = self.shared.registry.resolve(sensor_handle)?;
        backend.subhal.activate(handle::unstamp(sensor_handle), enabled)
    }

    pub fn batch(
        &self,
        sensor_handle: SensorHandle,
        sampling_period_ns: i64,
        max_report_latency_ns: i64,
    ) -> Result<()> {
        self.shared.ensure_ready()?;
        let backend = self.shared.registry.resolve(sensor_handle)?;
        backend.subhal.batch(
            handle::unstamp(sensor_handle),
            sampling_period_ns,
            max_report_latency_ns,
        )
    }

    pub fn flush(&self, sensor_handle: SensorHandle) -> Result<()> {
        self.shared.ensure_ready()?;
        let backend = self.shared.registry.resolve(sensor_handle)?;
        backend.subhal.flush(handle::unstamp(sensor_handle))
    }

    /// Inject an event into the sub-HAL owning its sensor
    ///
    /// In normal mode only additional info events may be injected.
    pub fn inject_sensor_data(&self, event: &Event) -> Result<()> {
        self.shared.ensure_ready()?;
        if self.operation_mode() == OperationMode::Normal
            && event.sensor_type != SensorType::AdditionalInfo
        {
            return Err(SensorError::BadArgument(format!(
                "cannot inject {:?} events in normal mode",
                event.sensor_type
            )));
        }
        let backend = self.shared.registry.resolve(event.sensor_handle)?;
        let mut local = event.clone();
        local.sensor_handle = handle::unstamp(event.sensor_handle);
        backend.subhal.inject_sensor_data(&local)
    }

    pub fn register_direct_channel(&self, mem: &SharedMemInfo) -> Result<i32> {
        self.shared.ensure_ready()?;
        self.shared.direct_channel.register_direct_channel(mem)
    }

    pub fn unregister_direct_channel(&self, channel_handle: i32) -> Result<()> {
        self.shared.ensure_ready()?;
        self.shared.direct_channel.unregister_direct_channel(channel_handle)
    }

    pub fn config_direct_report(
        &self,
        sensor_handle: SensorHandle,
        channel_handle: i32,
        rate: RateLevel,
    ) -> Result<i32> {
        self.shared.ensure_ready()?;
        self.shared
            .direct_channel
            .config_direct_report(sensor_handle, channel_handle, rate)
    }

    /// Whether the dispatch and wake lock tasks are running
    pub fn threads_running(&self) -> bool {
        self.shared.threads_running()
    }

    pub fn wakelock_stats(&self) -> WakelockStats {
        self.shared.wakelock.stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.dispatch.stats()
    }

    /// Human readable state of the proxy and every sub-HAL
    pub fn debug_dump(&self) -> String {
        let shared = &self.shared;
        let wakelock = shared.wakelock.stats();
        let queue = shared.dispatch.stats();
        let mut out = String::new();

        let _ = writeln!(out, "===HalProxy===");
        let _ = writeln!(out, "Internal values:");
        let _ = writeln!(out, "  State: {}", shared.state());
        let _ = writeln!(out, "  Operation mode: {:?}", self.operation_mode());
        let _ = writeln!(out, "  Threads are running: {}", shared.threads_running());
        let _ = writeln!(
            out,
            "  Wakelock timeout start time: {} ms ago",
            wakelock.since_timeout_start.as_millis()
        );
        let _ = writeln!(
            out,
            "  Wakelock timeout reset time: {} ms ago",
            wakelock.since_last_reset.as_millis()
        );
        let _ = writeln!(out, "  Wakelock ref count: {}", wakelock.ref_count);
        let _ = writeln!(out, "  Wakelock held: {}", wakelock.acquired);
        let _ = writeln!(out, "  # of events on pending write events queue: {}", queue.pending_events);
        let _ = writeln!(out, "  Most events seen on pending write events queue: {}", queue.high_water_mark);
        if let Some(front) = queue.front_batch_len {
            let _ = writeln!(out, "  Size of events list on front of pending writes queue: {}", front);
        }
        let _ = writeln!(out, "  # of events dropped on full queue: {}", queue.dropped_overflow);
        let _ = writeln!(out, "  # of events dropped on write timeout: {}", queue.dropped_timeout);
        let _ = writeln!(
            out,
            "  # of events dropped on closed client channel: {}",
            queue.dropped_disconnected
        );
        let _ = writeln!(
            out,
            "  # of non-dynamic sensors across all subhals: {}",
            shared.registry.static_sensor_count()
        );
        let _ = writeln!(
            out,
            "  # of dynamic sensors across all subhals: {}",
            shared.registry.dynamic_sensor_count()
        );
        let _ = writeln!(out, "SubHals ({}):", shared.registry.len());
        for backend in shared.registry.backends() {
            let _ = writeln!(out, "  Name: {}", backend.name);
            let _ = writeln!(out, "  Debug dump:");
            for line in backend.subhal.debug_dump().lines() {
                let _ = writeln!(out, "    {}", line);
            }
            let _ = writeln!(out);
        }
        out
    }

    /// Stop the background tasks and disable every sensor
    ///
    /// The proxy cannot be initialized again afterwards.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let mut lifecycle = shared.lock_lifecycle();
        if shared.state() == ProxyState::Stopped {
            return;
        }
        let was_initialized = shared.state() != ProxyState::Uninitialized;
        shared.set_state(ProxyState::ShuttingDown);

        shared.stop_workers(&mut lifecycle);
        if was_initialized {
            shared.disable_all_sensors();
        }
        shared.dispatch.clear();
        shared.wakelock.reset();
        shared.session.store(None);
        shared.set_state(ProxyState::Stopped);
        info!("Proxy stopped");
    }
}

impl Drop for HalProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ProxyShared {
    fn state(&self) -> ProxyState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ProxyState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        debug!("Proxy state -> {}", state);
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_mode(&self) -> MutexGuard<'_, OperationMode> {
        self.operation_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn threads_running(&self) -> bool {
        self.threads_running.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ProxyState::Ready => Ok(()),
            state => Err(SensorError::InvalidState(format!("proxy is {}", state))),
        }
    }

    fn spawn_workers(&self, acks: Receiver<u32>) -> std::io::Result<Workers> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let dispatch = Arc::clone(&self.dispatch);
        let dispatch = thread::Builder::new()
            .name("multihal-dispatch".into())
            .spawn(move || dispatch.run())?;

        let wakelock = Arc::clone(&self.wakelock);
        let wakelock = thread::Builder::new()
            .name("multihal-wakelock".into())
            .spawn(move || wakelock.run_monitor(acks, shutdown_rx))?;

        Ok(Workers {
            dispatch,
            wakelock,
            shutdown: shutdown_tx,
        })
    }

    fn stop_workers(&self, lifecycle: &mut Lifecycle) {
        self.threads_running.store(false, Ordering::SeqCst);
        self.dispatch.stop();
        self.wakelock.stop();
        if let Some(workers) = lifecycle.workers.take() {
            drop(workers.shutdown);
            if workers.dispatch.join().is_err() {
                error!("Dispatch task panicked");
            }
            if workers.wakelock.join().is_err() {
                error!("Wake lock task panicked");
            }
            debug!("Proxy tasks stopped");
        }
    }

    fn disable_all_sensors(&self) {
        for sensor_handle in self.registry.all_handles() {
            let result = self
                .registry
                .resolve(sensor_handle)
                .and_then(|backend| backend.subhal.activate(handle::unstamp(sensor_handle), false));
            if let Err(e) = result {
                warn!("Failed to disable sensor {:#x}: {}", sensor_handle, e);
            }
        }
    }

    pub(crate) fn create_scoped_wakelock(&self, lock: bool) -> ScopedWakelock {
        let counter: Arc<dyn WakelockRefCounter> = self.wakelock.clone();
        ScopedWakelock::new(counter, lock)
    }

    /// Namespace a sub-HAL's events and hand them to the dispatch queue
    pub(crate) fn post_events(&self, index: usize, events: Vec<Event>, wakelock: ScopedWakelock) {
        if events.is_empty() || !self.threads_running() {
            return;
        }

        let mut processed = Vec::with_capacity(events.len());
        let mut wake_up = Vec::with_capacity(events.len());
        for mut event in events {
            if handle::is_namespaced(event.sensor_handle) {
                error!(
                    "Sub-HAL {} posted an event for handle {:#x} whose top byte is not 0",
                    index, event.sensor_handle
                );
                continue;
            }
            event.sensor_handle = handle::stamp(event.sensor_handle, index);
            wake_up.push(self.registry.is_wake_up(event.sensor_handle));
            processed.push(event);
        }

        let wakeups = wake_up.iter().filter(|w| **w).count();
        if wakeups > 0 && !wakelock.is_locked() {
            error!("Wake-up events posted while wake lock unlocked for sub-HAL {}", index);
        } else if wakeups == 0 && wakelock.is_locked() {
            error!("No wake-up events posted but wake lock locked for sub-HAL {}", index);
        }

        let acquired_at = if wakeups > 0 {
            match self.wakelock.acquire_or_extend(wakeups) {
                Some(at) => Some(at),
                None => return,
            }
        } else {
            None
        };
        self.dispatch.post(processed, wake_up, acquired_at);
    }

    pub(crate) fn on_dynamic_sensors_connected(&self, index: usize, sensors: Vec<SensorInfo>) {
        let accepted = self.registry.on_dynamic_sensors_connected(index, sensors);
        if accepted.is_empty() {
            return;
        }
        match self.session.load_full() {
            Some(session) => session.callback.on_dynamic_sensors_connected(&accepted),
            None => warn!("Dynamic sensors connected with no client session"),
        }
    }

    pub(crate) fn on_dynamic_sensors_disconnected(&self, index: usize, sensor_handles: Vec<SensorHandle>) {
        let removed = self.registry.on_dynamic_sensors_disconnected(index, sensor_handles);
        if removed.is_empty() {
            return;
        }
        match self.session.load_full() {
            Some(session) => session.callback.on_dynamic_sensors_disconnected(&removed),
            None => warn!("Dynamic sensors disconnected with no client session"),
        }
    }
}
