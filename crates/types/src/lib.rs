//! multihal-types: Shared data types for the multihal sensor proxy.
//!
//! This crate contains pure data types (sensor descriptors, events, modes,
//! handle namespacing and the error taxonomy) shared by all multihal crates.

pub mod error;
pub mod event;
pub mod handle;
pub mod mode;
pub mod sensor;

// Re-export commonly used types at the crate root for convenience
pub use error::{Result, SensorError};
pub use event::{Event, EventPayload, MetaDataEventType};
pub use handle::SensorHandle;
pub use mode::{OperationMode, RateLevel, SharedMemFormat, SharedMemInfo, SharedMemType};
pub use sensor::{SensorFlags, SensorInfo, SensorType};
