//! End-to-end tests of the proxy over scripted sub-HALs

use crossbeam::channel::{bounded, unbounded, Receiver};
use multihal::config::ProxyConfig;
use multihal::core::{DirectChannelPolicy, HalProxy, ProxyChannels, ProxyState};
use multihal::power::NoopPowerLock;
use multihal_core::{
    Event, EventPayload, OperationMode, PowerLock, RateLevel, SensorError, SensorHandle,
    SensorInfo, SensorType, SensorsCallback, SharedMemInfo, SharedSubHal,
};
use multihal_subhals::{FakeSensor, FakeSubHal};
use multihal_types::handle::{self, ALL_SENSORS_HANDLE};
use multihal_types::{SharedMemFormat, SharedMemType};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingCallback {
    connected: Mutex<Vec<SensorInfo>>,
    disconnected: Mutex<Vec<SensorHandle>>,
}

impl SensorsCallback for RecordingCallback {
    fn on_dynamic_sensors_connected(&self, sensors: &[SensorInfo]) {
        self.connected.lock().unwrap().extend_from_slice(sensors);
    }

    fn on_dynamic_sensors_disconnected(&self, sensor_handles: &[SensorHandle]) {
        self.disconnected.lock().unwrap().extend_from_slice(sensor_handles);
    }
}

/// Records how many events sat in the client channel at each acquire
#[derive(Default)]
struct ChannelSamplingLock {
    events: Mutex<Option<Receiver<Event>>>,
    samples: Mutex<Vec<usize>>,
}

impl PowerLock for ChannelSamplingLock {
    fn acquire(&self, _name: &str) -> bool {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            self.samples.lock().unwrap().push(events.len());
        }
        true
    }

    fn release(&self, _name: &str) -> bool {
        true
    }
}

fn config() -> ProxyConfig {
    ProxyConfig {
        pending_write_timeout_ms: 500,
        ..ProxyConfig::default()
    }
}

fn proxy(subhals: Vec<SharedSubHal>) -> HalProxy {
    HalProxy::with_power_lock(subhals, &config(), Arc::new(NoopPowerLock::new()))
}

fn accel(local: SensorHandle, value: f32) -> Event {
    Event::new(local, SensorType::Accelerometer, 0, EventPayload::Scalar(value))
}

fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn recv_handles(rx: &Receiver<Event>, count: usize) -> Vec<SensorHandle> {
    (0..count)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().sensor_handle)
        .collect()
}

fn mem() -> SharedMemInfo {
    SharedMemInfo {
        mem_type: SharedMemType::Ashmem,
        format: SharedMemFormat::SensorsEvent,
        size: 4096,
        memory_handle: 11,
    }
}

#[test]
fn calls_before_initialize_are_invalid_state() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let proxy = proxy(vec![a.clone()]);

    assert_eq!(proxy.state(), ProxyState::Uninitialized);
    assert_eq!(proxy.sensors_list().len(), 1);
    assert!(matches!(
        proxy.activate(handle::stamp(1, 0), true),
        Err(SensorError::InvalidState(_))
    ));
    assert!(a.activations().is_empty());
}

#[test]
fn same_local_handle_routes_to_its_own_subhal() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::wake_up(1)]));
    let proxy = proxy(vec![a.clone(), b.clone()]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    let sensors = proxy.sensors_list();
    let handles: Vec<SensorHandle> = sensors.iter().map(|s| s.sensor_handle).collect();
    assert_eq!(handles, vec![handle::stamp(1, 0), handle::stamp(1, 1)]);
    assert!(!sensors[0].is_wake_up());
    assert!(sensors[1].is_wake_up());

    proxy.activate(handle::stamp(1, 1), true).unwrap();
    proxy.batch(handle::stamp(1, 0), 10_000_000, 0).unwrap();

    // Initialization disables every sensor first
    assert_eq!(b.activations(), vec![(1, false), (1, true)]);
    assert_eq!(a.batches(), vec![(1, 10_000_000, 0)]);
    assert!(a.active_sensors().is_empty());
}

#[test]
fn invalid_handle_touches_no_subhal() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let proxy = proxy(vec![a.clone()]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();
    let before = a.activations().len();

    assert!(matches!(
        proxy.activate(handle::stamp(1, 5), true),
        Err(SensorError::BadArgument(_))
    ));
    assert!(matches!(
        proxy.flush(handle::stamp(1, 200)),
        Err(SensorError::BadArgument(_))
    ));
    assert_eq!(a.activations().len(), before);
    assert!(a.flushes().is_empty());
}

#[test]
fn operation_mode_is_rolled_back_when_a_subhal_rejects() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::plain(1)]));
    b.reject_operation_mode(Some(OperationMode::DataInjection));
    let proxy = proxy(vec![a.clone(), b.clone()]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    assert!(proxy.set_operation_mode(OperationMode::DataInjection).is_err());
    assert_eq!(a.operation_mode(), OperationMode::Normal);
    assert_eq!(
        a.mode_changes(),
        vec![OperationMode::DataInjection, OperationMode::Normal]
    );
    assert_eq!(b.operation_mode(), OperationMode::Normal);
    assert_eq!(proxy.operation_mode(), OperationMode::Normal);

    b.reject_operation_mode(None);
    proxy.set_operation_mode(OperationMode::DataInjection).unwrap();
    assert_eq!(a.operation_mode(), OperationMode::DataInjection);
    assert_eq!(b.operation_mode(), OperationMode::DataInjection);
}

#[test]
fn events_reach_client_with_namespaced_handles() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::plain(1), FakeSensor::plain(2)]));
    let proxy = proxy(vec![a.clone(), b.clone()]);
    let (channels, client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    assert!(b.post(vec![accel(2, 1.0), accel(1, 2.0)]));
    assert!(a.post(vec![accel(1, 3.0)]));
    assert_eq!(
        recv_handles(&client.events, 3),
        vec![handle::stamp(2, 1), handle::stamp(1, 1), handle::stamp(1, 0)]
    );

    // An event whose handle already carries namespace bits is dropped
    assert!(a.post(vec![accel(handle::stamp(1, 3), 4.0), accel(1, 5.0)]));
    let event = client.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.payload, EventPayload::Scalar(5.0));
    assert!(client.events.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn flush_complete_is_namespaced() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::plain(4)]));
    let proxy = proxy(vec![a, b.clone()]);
    let (channels, client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    proxy.flush(handle::stamp(4, 1)).unwrap();
    assert_eq!(b.flushes(), vec![4]);
    let event = client.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.sensor_handle, handle::stamp(4, 1));
    assert_eq!(event.sensor_type, SensorType::MetaData);
}

#[test]
fn wake_up_burst_is_counted_before_any_write() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::wake_up(1)]));
    let power = Arc::new(ChannelSamplingLock::default());
    let proxy = HalProxy::with_power_lock(vec![a.clone()], &config(), power.clone());

    // Client channel of 10 with 6 already taken
    let (event_tx, event_rx) = bounded::<Event>(10);
    for i in 0..6 {
        event_tx.send(accel(0x7f, i as f32)).unwrap();
    }
    let (ack_tx, ack_rx) = unbounded::<u32>();
    proxy
        .initialize(ProxyChannels {
            events: Arc::new(event_tx),
            wake_lock_acks: ack_rx,
            callback: Arc::new(RecordingCallback::default()),
        })
        .unwrap();

    let burst: Vec<Event> = (0..15)
        .map(|i| Event::new(1, SensorType::SignificantMotion, i, EventPayload::Scalar(1.0)))
        .collect();
    *power.events.lock().unwrap() = Some(event_rx.clone());
    assert!(a.post(burst));

    // The lock was taken while the channel still held only the prefill
    assert_eq!(*power.samples.lock().unwrap(), vec![6]);
    assert_eq!(event_rx.len(), 10);
    let stats = proxy.queue_stats();
    assert_eq!(stats.pending_events, 11);
    assert_eq!(stats.high_water_mark, 11);
    assert_eq!(proxy.wakelock_stats().ref_count, 15);
    assert!(proxy.wakelock_stats().acquired);

    // Drain in order and acknowledge every wake-up event
    let mut timestamps = Vec::new();
    while timestamps.len() < 15 {
        let event = event_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        if event.sensor_handle == handle::stamp(1, 0) {
            timestamps.push(event.timestamp);
            ack_tx.send(1).unwrap();
        }
    }
    assert_eq!(timestamps, (0..15).collect::<Vec<i64>>());
    assert!(wait_until(|| proxy.wakelock_stats().ref_count == 0));
    assert!(!proxy.wakelock_stats().acquired);
    assert_eq!(proxy.queue_stats().pending_events, 0);
}

#[test]
fn concurrent_subhals_keep_their_own_event_order() {
    const PER_SUBHAL: i64 = 200;
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::wake_up(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::plain(1)]));
    let proxy = proxy(vec![a.clone(), b.clone()]);
    let (channels, client) = ProxyChannels::new(4, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    let posters: Vec<_> = [a.clone(), b.clone()]
        .into_iter()
        .map(|subhal| {
            thread::spawn(move || {
                for chunk in 0..PER_SUBHAL / 4 {
                    let events = (0..4)
                        .map(|i| Event::new(1, SensorType::Accelerometer, chunk * 4 + i, EventPayload::Scalar(0.0)))
                        .collect();
                    assert!(subhal.post(events));
                }
            })
        })
        .collect();

    let wake_up = handle::stamp(1, 0);
    let mut last: BTreeMap<SensorHandle, i64> = BTreeMap::new();
    for _ in 0..2 * PER_SUBHAL {
        let event = client.events.recv_timeout(Duration::from_secs(2)).unwrap();
        if let Some(previous) = last.insert(event.sensor_handle, event.timestamp) {
            assert!(
                event.timestamp > previous,
                "{:#x}: {} after {}",
                event.sensor_handle,
                event.timestamp,
                previous
            );
        }
        if event.sensor_handle == wake_up {
            client.wake_lock_acks.send(1).unwrap();
        }
    }
    for poster in posters {
        poster.join().unwrap();
    }

    assert_eq!(last.get(&wake_up), Some(&(PER_SUBHAL - 1)));
    assert_eq!(last.get(&handle::stamp(1, 1)), Some(&(PER_SUBHAL - 1)));
    assert!(wait_until(|| proxy.wakelock_stats().ref_count == 0));
    assert!(!proxy.wakelock_stats().acquired);
    let stats = proxy.queue_stats();
    assert_eq!(stats.dropped_overflow + stats.dropped_timeout, 0);
}

#[test]
fn injection_is_not_blocked_by_a_pending_mode_change() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let (gate_tx, gate_rx) = bounded::<()>(0);
    a.hold_operation_mode(Some(gate_rx));
    let proxy = Arc::new(proxy(vec![a.clone()]));
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    let changer = {
        let proxy = proxy.clone();
        thread::spawn(move || proxy.set_operation_mode(OperationMode::DataInjection))
    };
    assert!(wait_until(|| a.is_holding_mode_change()));

    let (done_tx, done_rx) = bounded(1);
    {
        let proxy = proxy.clone();
        thread::spawn(move || {
            let info = Event::new(
                handle::stamp(1, 0),
                SensorType::AdditionalInfo,
                0,
                EventPayload::AdditionalInfo { info_type: 0, serial: 1, values: vec![0.5] },
            );
            let _ = done_tx.send(proxy.inject_sensor_data(&info));
        });
    }
    let injected = done_rx.recv_timeout(Duration::from_secs(1));

    gate_tx.send(()).unwrap();
    changer.join().unwrap().unwrap();
    assert!(matches!(injected, Ok(Ok(()))));
    assert_eq!(a.injected().len(), 1);
    assert_eq!(proxy.operation_mode(), OperationMode::DataInjection);
}

#[test]
fn reinitialize_starts_a_clean_session() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1), FakeSensor::wake_up(2)]));
    let proxy = proxy(vec![a.clone()]);
    let (channels, first) = ProxyChannels::new(1, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();
    proxy.activate(handle::stamp(1, 0), true).unwrap();
    assert!(a.connect_dynamic(vec![FakeSensor::plain(0x40).info()]));
    assert_eq!(proxy.dynamic_sensors().len(), 1);

    // Fill the channel and leave a wake-up event buffered
    assert!(a.post(vec![accel(1, 0.0)]));
    assert!(a.post(vec![Event::new(2, SensorType::SignificantMotion, 0, EventPayload::Scalar(1.0))]));
    assert_eq!(proxy.wakelock_stats().ref_count, 1);

    let (channels, second) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    assert_eq!(proxy.state(), ProxyState::Ready);
    assert!(proxy.threads_running());
    assert_eq!(a.initialize_count(), 2);
    assert!(a.active_sensors().is_empty());
    assert!(proxy.dynamic_sensors().is_empty());
    assert_eq!(proxy.wakelock_stats().ref_count, 0);
    assert_eq!(proxy.queue_stats().pending_events, 0);

    assert!(a.post(vec![accel(1, 9.0)]));
    let event = second.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.payload, EventPayload::Scalar(9.0));
    // Only the event written before reinitialization reached the old channel
    assert_eq!(first.events.try_iter().count(), 1);
}

#[test]
fn dynamic_sensors_are_namespaced_for_the_client() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::plain(1)]));
    let callback = Arc::new(RecordingCallback::default());
    let proxy = proxy(vec![a, b.clone()]);
    let (channels, client) = ProxyChannels::new(16, callback.clone());
    proxy.initialize(channels).unwrap();

    assert!(b.connect_dynamic(vec![FakeSensor::wake_up(0x30).info()]));
    let connected = callback.connected.lock().unwrap().clone();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].sensor_handle, handle::stamp(0x30, 1));
    assert_eq!(proxy.dynamic_sensors(), connected);

    // Events of the dynamic sensor are wake-up events
    assert!(b.post(vec![Event::new(0x30, SensorType::SignificantMotion, 0, EventPayload::Scalar(1.0))]));
    let event = client.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.sensor_handle, handle::stamp(0x30, 1));
    assert_eq!(proxy.wakelock_stats().ref_count, 1);

    proxy.activate(handle::stamp(0x30, 1), true).unwrap();
    assert!(b.disconnect_dynamic(vec![0x30]));
    assert_eq!(*callback.disconnected.lock().unwrap(), vec![handle::stamp(0x30, 1)]);
    assert!(proxy.dynamic_sensors().is_empty());
}

#[test]
fn injection_follows_operation_mode() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::plain(3)]));
    let proxy = proxy(vec![a, b.clone()]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    let reading = accel(handle::stamp(3, 1), 1.5);
    assert!(matches!(
        proxy.inject_sensor_data(&reading),
        Err(SensorError::BadArgument(_))
    ));

    let info = Event::new(
        handle::stamp(3, 1),
        SensorType::AdditionalInfo,
        0,
        EventPayload::AdditionalInfo { info_type: 0, serial: 1, values: vec![0.5] },
    );
    proxy.inject_sensor_data(&info).unwrap();

    proxy.set_operation_mode(OperationMode::DataInjection).unwrap();
    proxy.inject_sensor_data(&reading).unwrap();

    let injected = b.injected();
    assert_eq!(injected.len(), 2);
    assert!(injected.iter().all(|e| e.sensor_handle == 3));
    assert_eq!(injected[1].payload, EventPayload::Scalar(1.5));
}

#[test]
fn direct_channel_without_capable_subhal_is_unsupported() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let proxy = proxy(vec![a]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    assert!(matches!(
        proxy.register_direct_channel(&mem()),
        Err(SensorError::Unsupported(_))
    ));
    assert!(matches!(
        proxy.config_direct_report(ALL_SENSORS_HANDLE, 1, RateLevel::Stop),
        Err(SensorError::Unsupported(_))
    ));
}

#[test]
fn direct_channel_goes_to_the_designated_subhal() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("b", vec![FakeSensor::direct(2)]));
    let c = Arc::new(FakeSubHal::new("c", vec![FakeSensor::direct(2)]));
    let proxy = HalProxy::with_power_lock(
        vec![a, b.clone(), c.clone()],
        &ProxyConfig {
            direct_channel_policy: DirectChannelPolicy::FirstRegistered,
            ..config()
        },
        Arc::new(NoopPowerLock::new()),
    );
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    let direct: Vec<SensorHandle> = proxy
        .sensors_list()
        .iter()
        .filter(|s| s.flags.supports_direct_channel())
        .map(|s| s.sensor_handle)
        .collect();
    assert_eq!(direct, vec![handle::stamp(2, 1)]);

    let channel = proxy.register_direct_channel(&mem()).unwrap();
    assert!(proxy.config_direct_report(handle::stamp(2, 1), channel, RateLevel::Normal).unwrap() > 0);
    assert!(matches!(
        proxy.config_direct_report(handle::stamp(2, 2), channel, RateLevel::Normal),
        Err(SensorError::BadArgument(_))
    ));
    assert_eq!(b.direct_reports(), vec![(2, channel, RateLevel::Normal)]);
    assert!(c.direct_reports().is_empty());
    proxy.unregister_direct_channel(channel).unwrap();
}

#[test]
fn debug_dump_reports_proxy_and_subhals() {
    let a = Arc::new(FakeSubHal::new("alpha", vec![FakeSensor::plain(1)]));
    let b = Arc::new(FakeSubHal::new("beta", vec![FakeSensor::wake_up(1)]));
    let proxy = proxy(vec![a, b]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();

    let dump = proxy.debug_dump();
    assert!(dump.starts_with("===HalProxy==="));
    assert!(dump.contains("Threads are running: true"));
    assert!(dump.contains("Wakelock ref count: 0"));
    assert!(dump.contains("# of non-dynamic sensors across all subhals: 2"));
    assert!(dump.contains("SubHals (2):"));
    assert!(dump.contains("Name: alpha"));
    assert!(dump.contains("Name: beta"));
}

#[test]
fn failing_subhal_initialize_is_reported() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    a.fail_initialize(true);
    let proxy = proxy(vec![a]);
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));

    assert!(matches!(
        proxy.initialize(channels),
        Err(SensorError::BackendFailure { .. })
    ));
    assert_eq!(proxy.state(), ProxyState::Ready);
}

#[test]
fn shutdown_is_final() {
    let a = Arc::new(FakeSubHal::new("a", vec![FakeSensor::plain(1)]));
    let proxy = proxy(vec![a.clone()]);
    let (channels, client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    proxy.initialize(channels).unwrap();
    proxy.activate(handle::stamp(1, 0), true).unwrap();

    proxy.shutdown();
    assert_eq!(proxy.state(), ProxyState::Stopped);
    assert!(!proxy.threads_running());
    assert!(a.active_sensors().is_empty());

    // Posts after shutdown go nowhere
    assert!(a.post(vec![accel(1, 0.0)]));
    assert!(client.events.try_recv().is_err());

    assert!(matches!(
        proxy.activate(handle::stamp(1, 0), true),
        Err(SensorError::InvalidState(_))
    ));
    let (channels, _client) = ProxyChannels::new(16, Arc::new(RecordingCallback::default()));
    assert!(matches!(
        proxy.initialize(channels),
        Err(SensorError::InvalidState(_))
    ));
    proxy.shutdown();
}
