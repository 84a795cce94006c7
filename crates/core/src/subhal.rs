//! Sub-HAL trait and related types

use multihal_types::{
    Event, OperationMode, RateLevel, Result, SensorError, SensorHandle, SensorInfo,
    SharedMemInfo,
};
use std::sync::Arc;

use crate::callback::HalProxyCallback;

/// Trait for all sub-HALs
///
/// A sub-HAL is an independently implemented sensor backend. It reports
/// handles in its own address space (top byte clear); the proxy namespaces
/// them before anything reaches the client.
///
/// Methods take `&self` because the proxy calls into a sub-HAL from the
/// client thread while the sub-HAL's own threads post events.
pub trait SubHal: Send + Sync {
    /// Human-readable name, used in logs and the diagnostic dump
    fn name(&self) -> &str;

    /// Enumerate the static sensors this sub-HAL provides
    fn sensors_list(&self) -> Result<Vec<SensorInfo>>;

    /// Start a new session, reporting through `callback`
    ///
    /// Called on every proxy (re)initialization. Sub-HALs should drop any
    /// state belonging to the previous session.
    fn initialize(&self, callback: Arc<dyn HalProxyCallback>) -> Result<()>;

    fn set_operation_mode(&self, mode: OperationMode) -> Result<()>;

    fn activate(&self, sensor_handle: SensorHandle, enabled: bool) -> Result<()>;

    fn batch(
        &self,
        sensor_handle: SensorHandle,
        sampling_period_ns: i64,
        max_report_latency_ns: i64,
    ) -> Result<()>;

    fn flush(&self, sensor_handle: SensorHandle) -> Result<()>;

    fn inject_sensor_data(&self, event: &Event) -> Result<()>;

    /// Register a direct channel, returning its channel handle
    fn register_direct_channel(&self, _mem: &SharedMemInfo) -> Result<i32> {
        Err(SensorError::Unsupported(format!(
            "{} has no direct channel support",
            self.name()
        )))
    }

    fn unregister_direct_channel(&self, _channel_handle: i32) -> Result<()> {
        Err(SensorError::Unsupported(format!(
            "{} has no direct channel support",
            self.name()
        )))
    }

    /// Configure direct reports of a sensor, returning the report token
    fn config_direct_report(
        &self,
        _sensor_handle: SensorHandle,
        _channel_handle: i32,
        _rate: RateLevel,
    ) -> Result<i32> {
        Err(SensorError::Unsupported(format!(
            "{} has no direct channel support",
            self.name()
        )))
    }

    /// Free-form diagnostic text for the proxy dump
    fn debug_dump(&self) -> String {
        String::new()
    }
}

/// Shared sub-HAL reference
pub type SharedSubHal = Arc<dyn SubHal>;
