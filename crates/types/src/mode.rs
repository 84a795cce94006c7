//! Operation modes and direct channel types

use serde::{Deserialize, Serialize};

/// Proxy-wide operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Normal,
    DataInjection,
}

/// Direct report rate level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLevel {
    Stop,
    Normal,
    Fast,
    VeryFast,
}

/// Shared memory backing for a direct channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedMemType {
    Ashmem,
    Gralloc,
}

/// Layout of events written into direct channel memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedMemFormat {
    SensorsEvent,
}

/// Description of a direct channel memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemInfo {
    pub mem_type: SharedMemType,
    pub format: SharedMemFormat,
    /// Size in bytes
    pub size: u32,
    /// Platform handle of the memory region (file descriptor or buffer id)
    pub memory_handle: i64,
}
