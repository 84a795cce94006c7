//! multihal-core: Core traits and registry for the multihal sensor proxy.
//!
//! This crate contains the fundamental traits (SubHal, the callback
//! interfaces, EventSink, PowerLock), the global sub-HAL Registry, and
//! shared constants.

mod callback;
pub mod constants;
mod power;
mod registry;
mod sink;
mod subhal;

pub use callback::{HalProxyCallback, ScopedWakelock, SensorsCallback, WakelockRefCounter};
pub use constants::{
    DEFAULT_SUBHAL_LIST_PATH, MAX_PENDING_EVENTS, PENDING_WRITE_TIMEOUT, SUB_HAL_2_0_VERSION,
    WAKELOCK_NAME, WAKELOCK_TIMEOUT,
};
pub use power::PowerLock;
pub use registry::{global_registry, Registry, SubHalEntry, SubHalFactory, SubHalInfo};
pub use sink::{EventSink, WriteOutcome};
pub use subhal::{SharedSubHal, SubHal};

// Re-export types used in trait signatures for convenience
pub use multihal_types::{
    Event, EventPayload, OperationMode, RateLevel, Result, SensorError, SensorFlags,
    SensorHandle, SensorInfo, SensorType, SharedMemInfo,
};
