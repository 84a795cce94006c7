//! Per sub-HAL callback adapter

use multihal_core::{Event, HalProxyCallback, ScopedWakelock, SensorHandle, SensorInfo};
use std::sync::Weak;

use super::proxy::ProxyShared;

/// Callback handed to one sub-HAL, bound to its index
///
/// Holds the proxy weakly so a sub-HAL keeping its callback alive does not
/// keep the proxy alive.
pub struct SubHalCallback {
    index: usize,
    proxy: Weak<ProxyShared>,
}

impl SubHalCallback {
    pub(crate) fn new(index: usize, proxy: Weak<ProxyShared>) -> Self {
        Self { index, proxy }
    }
}

impl HalProxyCallback for SubHalCallback {
    fn post_events(&self, events: Vec<Event>, wakelock: ScopedWakelock) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.post_events(self.index, events, wakelock);
        }
    }

    fn create_scoped_wakelock(&self, lock: bool) -> ScopedWakelock {
        match self.proxy.upgrade() {
            Some(proxy) => proxy.create_scoped_wakelock(lock),
            None => ScopedWakelock::unlocked(),
        }
    }

    fn on_dynamic_sensors_connected(&self, sensors: Vec<SensorInfo>) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_dynamic_sensors_connected(self.index, sensors);
        }
    }

    fn on_dynamic_sensors_disconnected(&self, sensor_handles: Vec<SensorHandle>) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_dynamic_sensors_disconnected(self.index, sensor_handles);
        }
    }
}
