//! multihal-subhals: Built-in sub-HAL implementations for the multihal proxy.

mod fake;
mod motion;
#[cfg(feature = "sysinfo")]
mod temperature;

pub use fake::{FakeSensor, FakeSubHal};
pub use motion::{
    MotionConfig, MotionSubHal, ACCELEROMETER_HANDLE, GYROSCOPE_HANDLE, SIGNIFICANT_MOTION_HANDLE,
};
#[cfg(feature = "sysinfo")]
pub use temperature::{TemperatureSubHal, TEMPERATURE_HANDLE};

use once_cell::sync::Lazy;
use std::time::Instant;

static BOOT: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds since the first event timestamp was taken
pub(crate) fn timestamp_ns() -> i64 {
    BOOT.elapsed().as_nanos() as i64
}

/// Register all built-in sub-HALs with the global registry
pub fn register_all() {
    use multihal_core::{global_registry, register_subhal};

    register_subhal!(
        "motion",
        "Simulated accelerometer, gyroscope and significant motion",
        MotionSubHal
    );

    #[cfg(feature = "sysinfo")]
    register_subhal!(
        "temperature",
        "Hottest host hardware monitor as an ambient temperature sensor",
        TemperatureSubHal
    );

    let registry = global_registry().read().unwrap_or_else(|e| e.into_inner());
    log::debug!("Registered {} built-in sub-HALs", registry.list_subhals().len());
}
