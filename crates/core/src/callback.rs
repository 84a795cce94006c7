//! Callback interfaces between sub-HALs, the proxy and the client

use multihal_types::{Event, SensorHandle, SensorInfo};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Reference counter behind the shared wake lock
pub trait WakelockRefCounter: Send + Sync {
    /// Add `delta` references, acquiring the lock if none were held
    ///
    /// Returns the timeout start recorded for this acquisition, or `None`
    /// when the counter is shut down and nothing was taken.
    fn increment_ref_count(&self, delta: usize) -> Option<Instant>;

    /// Drop `delta` references taken at `since`
    ///
    /// Releases taken before the counter's last reset are ignored.
    /// `None` means the caller does not track when it acquired.
    fn decrement_ref_count(&self, delta: usize, since: Option<Instant>);
}

/// One reference on the shared wake lock, released on drop
///
/// Sub-HALs create these through [`HalProxyCallback::create_scoped_wakelock`]
/// and hand them back with [`HalProxyCallback::post_events`].
pub struct ScopedWakelock {
    counter: Option<Arc<dyn WakelockRefCounter>>,
    created_at: Option<Instant>,
}

impl ScopedWakelock {
    /// Create a guard, taking a reference when `lock` is true
    pub fn new(counter: Arc<dyn WakelockRefCounter>, lock: bool) -> Self {
        let created_at = if lock {
            counter.increment_ref_count(1)
        } else {
            None
        };
        Self {
            counter: Some(counter),
            created_at,
        }
    }

    /// Guard that holds nothing
    pub fn unlocked() -> Self {
        Self {
            counter: None,
            created_at: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.created_at.is_some()
    }
}

impl Drop for ScopedWakelock {
    fn drop(&mut self) {
        if let (Some(counter), Some(created_at)) = (self.counter.take(), self.created_at) {
            counter.decrement_ref_count(1, Some(created_at));
        }
    }
}

impl fmt::Debug for ScopedWakelock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedWakelock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Callback handed to each sub-HAL on initialization
///
/// Handles reported through it are in the sub-HAL's own address space.
pub trait HalProxyCallback: Send + Sync {
    /// Post a batch of events
    ///
    /// `wakelock` must be locked when the batch contains wake-up events and
    /// unlocked otherwise.
    fn post_events(&self, events: Vec<Event>, wakelock: ScopedWakelock);

    fn create_scoped_wakelock(&self, lock: bool) -> ScopedWakelock;

    fn on_dynamic_sensors_connected(&self, sensors: Vec<SensorInfo>);

    fn on_dynamic_sensors_disconnected(&self, sensor_handles: Vec<SensorHandle>);
}

/// Upstream client notifications (handles are namespaced)
pub trait SensorsCallback: Send + Sync {
    fn on_dynamic_sensors_connected(&self, sensors: &[SensorInfo]);

    fn on_dynamic_sensors_disconnected(&self, sensor_handles: &[SensorHandle]);
}
