//! Shared constants for the proxy and sub-HALs

use std::time::Duration;

/// Interface version a sub-HAL must report to be loaded
pub const SUB_HAL_2_0_VERSION: u32 = 0x0002_0000;

/// Longest the shared wake lock may be held without the client
/// acknowledging wake-up events
pub const WAKELOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound on a single blocking write of buffered events
pub const PENDING_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of events buffered while the client channel is full
pub const MAX_PENDING_EVENTS: usize = 100_000;

/// Name of the shared wake lock
pub const WAKELOCK_NAME: &str = "SensorsHAL_WAKEUP";

/// Default location of the sub-HAL list
pub const DEFAULT_SUBHAL_LIST_PATH: &str = "/vendor/etc/sensors/hals.conf";
