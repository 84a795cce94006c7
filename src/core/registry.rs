//! Backend registry: sub-HAL ownership and the merged sensor catalog

use log::{debug, error, info, warn};
use multihal_core::{HalProxyCallback, Result, SensorError, SensorHandle, SensorInfo, SharedSubHal};
use multihal_types::handle;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::direct_channel::DirectChannelPolicy;

/// One registered sub-HAL
pub struct BackendEntry {
    pub subhal: SharedSubHal,
    pub name: String,
    /// Callback bound to this sub-HAL's index
    pub callback: Arc<dyn HalProxyCallback>,
}

/// Owns the sub-HALs and the namespaced view of their sensors
///
/// The backend list and the static catalog are fixed at construction.
/// Dynamic sensors live under their own lock, separate from event dispatch.
pub struct BackendRegistry {
    backends: Vec<BackendEntry>,
    sensors: BTreeMap<SensorHandle, SensorInfo>,
    dynamic_sensors: Mutex<BTreeMap<SensorHandle, SensorInfo>>,
    direct_channel_index: Option<usize>,
}

impl BackendRegistry {
    /// Register `subhals` in order and build the merged catalog
    ///
    /// `make_callback` creates the callback adapter for a sub-HAL index.
    /// Sub-HALs whose catalog cannot be enumerated, or that do not fit in
    /// the handle namespace, are logged and left out.
    pub fn new<F>(subhals: Vec<SharedSubHal>, policy: &DirectChannelPolicy, make_callback: F) -> Self
    where
        F: Fn(usize) -> Arc<dyn HalProxyCallback>,
    {
        let mut backends = Vec::with_capacity(subhals.len());
        let mut catalogs = Vec::with_capacity(subhals.len());

        for subhal in subhals {
            let name = subhal.name().to_string();
            let index = backends.len();
            if !handle::index_fits(index) {
                error!(
                    "Sub-HAL '{}' excluded: at most {} sub-HALs are supported",
                    name,
                    handle::MAX_SUBHALS
                );
                continue;
            }
            let list = match subhal.sensors_list() {
                Ok(list) => list,
                Err(e) => {
                    error!("Sub-HAL '{}' excluded: sensor list failed: {}", name, e);
                    continue;
                }
            };

            let mut accepted = Vec::with_capacity(list.len());
            for mut sensor in list {
                if handle::is_namespaced(sensor.sensor_handle) {
                    error!(
                        "Sub-HAL '{}' reported sensor '{}' with handle {:#x} whose top byte is not 0",
                        name, sensor.name, sensor.sensor_handle
                    );
                    continue;
                }
                sensor.sensor_handle = handle::stamp(sensor.sensor_handle, index);
                debug!("Loaded sensor: {} ({:#x})", sensor.name, sensor.sensor_handle);
                accepted.push(sensor);
            }

            info!("Registered sub-HAL '{}' at index {} with {} sensors", name, index, accepted.len());
            backends.push(BackendEntry {
                callback: make_callback(index),
                subhal,
                name,
            });
            catalogs.push(accepted);
        }

        let direct_channel_index = choose_direct_channel_backend(&backends, &catalogs, policy);

        let mut sensors = BTreeMap::new();
        for (index, catalog) in catalogs.into_iter().enumerate() {
            for mut sensor in catalog {
                if Some(index) != direct_channel_index && sensor.flags.supports_direct_channel() {
                    debug!(
                        "Clearing direct channel flags of '{}' on sub-HAL '{}'",
                        sensor.name, backends[index].name
                    );
                    sensor.flags.clear_direct_channel();
                }
                sensors.insert(sensor.sensor_handle, sensor);
            }
        }

        Self {
            backends,
            sensors,
            dynamic_sensors: Mutex::new(BTreeMap::new()),
            direct_channel_index,
        }
    }

    fn lock_dynamic(&self) -> MutexGuard<'_, BTreeMap<SensorHandle, SensorInfo>> {
        self.dynamic_sensors.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[BackendEntry] {
        &self.backends
    }

    /// The sub-HAL owning a namespaced handle
    pub fn resolve(&self, sensor_handle: SensorHandle) -> Result<&BackendEntry> {
        let index = handle::subhal_index_of(sensor_handle);
        self.backends.get(index).ok_or_else(|| {
            SensorError::BadArgument(format!(
                "sensor handle {:#x} names sub-HAL {} but only {} are registered",
                sensor_handle,
                index,
                self.backends.len()
            ))
        })
    }

    /// Index and sub-HAL chosen for direct channels
    pub fn direct_channel_backend(&self) -> Option<(usize, SharedSubHal)> {
        self.direct_channel_index
            .map(|index| (index, Arc::clone(&self.backends[index].subhal)))
    }

    /// Static sensors, ordered by namespaced handle
    pub fn sensors_list(&self) -> Vec<SensorInfo> {
        self.sensors.values().cloned().collect()
    }

    pub fn static_sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Connected dynamic sensors, ordered by namespaced handle
    pub fn dynamic_sensors(&self) -> Vec<SensorInfo> {
        self.lock_dynamic().values().cloned().collect()
    }

    pub fn dynamic_sensor_count(&self) -> usize {
        self.lock_dynamic().len()
    }

    /// Every known namespaced handle, static first
    pub fn all_handles(&self) -> Vec<SensorHandle> {
        let mut handles: Vec<SensorHandle> = self.sensors.keys().copied().collect();
        handles.extend(self.lock_dynamic().keys().copied());
        handles
    }

    pub fn sensor_info(&self, sensor_handle: SensorHandle) -> Option<SensorInfo> {
        self.sensors
            .get(&sensor_handle)
            .cloned()
            .or_else(|| self.lock_dynamic().get(&sensor_handle).cloned())
    }

    /// Whether events from `sensor_handle` are wake-up events
    ///
    /// Unknown handles count as non wake-up.
    pub fn is_wake_up(&self, sensor_handle: SensorHandle) -> bool {
        match self.sensors.get(&sensor_handle) {
            Some(sensor) => sensor.is_wake_up(),
            None => self
                .lock_dynamic()
                .get(&sensor_handle)
                .map_or(false, |s| s.is_wake_up()),
        }
    }

    /// Record dynamic sensors connected on sub-HAL `index`
    ///
    /// Returns the accepted sensors with namespaced handles.
    pub fn on_dynamic_sensors_connected(&self, index: usize, sensors: Vec<SensorInfo>) -> Vec<SensorInfo> {
        let mut accepted = Vec::with_capacity(sensors.len());
        let mut dynamic = self.lock_dynamic();
        for mut sensor in sensors {
            if handle::is_namespaced(sensor.sensor_handle) {
                error!(
                    "Dynamic sensor '{}' added with handle {:#x} whose top byte is not 0",
                    sensor.name, sensor.sensor_handle
                );
                continue;
            }
            sensor.sensor_handle = handle::stamp(sensor.sensor_handle, index);
            if Some(index) != self.direct_channel_index {
                sensor.flags.clear_direct_channel();
            }
            info!("Dynamic sensor connected: {} ({:#x})", sensor.name, sensor.sensor_handle);
            dynamic.insert(sensor.sensor_handle, sensor.clone());
            accepted.push(sensor);
        }
        accepted
    }

    /// Forget dynamic sensors disconnected on sub-HAL `index`
    ///
    /// Returns the namespaced handles that were actually connected.
    pub fn on_dynamic_sensors_disconnected(
        &self,
        index: usize,
        sensor_handles: Vec<SensorHandle>,
    ) -> Vec<SensorHandle> {
        let mut removed = Vec::with_capacity(sensor_handles.len());
        let mut dynamic = self.lock_dynamic();
        for local in sensor_handles {
            if handle::is_namespaced(local) {
                error!("Dynamic sensor removed with handle {:#x} whose top byte is not 0", local);
                continue;
            }
            let stamped = handle::stamp(local, index);
            if dynamic.remove(&stamped).is_some() {
                info!("Dynamic sensor disconnected: {:#x}", stamped);
                removed.push(stamped);
            } else {
                warn!("Disconnect for unknown dynamic sensor {:#x}", stamped);
            }
        }
        removed
    }

    /// Forget all dynamic sensors (start of a new session)
    pub fn clear_dynamic_sensors(&self) {
        self.lock_dynamic().clear();
    }
}

fn choose_direct_channel_backend(
    backends: &[BackendEntry],
    catalogs: &[Vec<SensorInfo>],
    policy: &DirectChannelPolicy,
) -> Option<usize> {
    let capable = |index: usize| catalogs[index].iter().any(|s| s.flags.supports_direct_channel());
    let first = (0..backends.len()).find(|&index| capable(index));

    match policy {
        DirectChannelPolicy::FirstRegistered => first,
        DirectChannelPolicy::Preferred(name) => {
            match backends.iter().position(|b| &b.name == name) {
                Some(index) if capable(index) => Some(index),
                Some(_) => {
                    warn!(
                        "Preferred direct channel sub-HAL '{}' has no direct channel sensors",
                        name
                    );
                    first
                }
                None => {
                    warn!("Preferred direct channel sub-HAL '{}' is not registered", name);
                    first
                }
            }
        }
    }
}
