//! Sensor descriptors and capability flags

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::handle::SensorHandle;

/// Capability and reporting flags of a sensor
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorFlags(pub u32);

impl SensorFlags {
    /// Events from this sensor wake the application processor
    pub const WAKE_UP: SensorFlags = SensorFlags(0x1);
    /// Reporting mode bits (continuous, on-change, one-shot, special)
    pub const MASK_REPORTING_MODE: SensorFlags = SensorFlags(0xE);
    /// Sensor accepts injected data
    pub const DATA_INJECTION: SensorFlags = SensorFlags(0x10);
    /// Sensor was connected at runtime
    pub const DYNAMIC_SENSOR: SensorFlags = SensorFlags(0x20);
    /// Sensor emits additional info frames
    pub const ADDITIONAL_INFO: SensorFlags = SensorFlags(0x40);
    /// Highest supported direct report rate level
    pub const MASK_DIRECT_REPORT: SensorFlags = SensorFlags(0x380);
    /// Supported direct channel memory types
    pub const MASK_DIRECT_CHANNEL: SensorFlags = SensorFlags(0xC00);

    pub const fn empty() -> Self {
        SensorFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if any bit of `other` is set in `self`
    pub const fn intersects(self, other: SensorFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: SensorFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SensorFlags) {
        self.0 &= !other.0;
    }

    pub fn is_wake_up(self) -> bool {
        self.intersects(Self::WAKE_UP)
    }

    /// Whether the sensor advertises any direct report or direct channel support
    pub fn supports_direct_channel(self) -> bool {
        self.intersects(SensorFlags(
            Self::MASK_DIRECT_REPORT.0 | Self::MASK_DIRECT_CHANNEL.0,
        ))
    }

    /// Strip every direct report and direct channel bit
    pub fn clear_direct_channel(&mut self) {
        self.remove(SensorFlags(
            Self::MASK_DIRECT_REPORT.0 | Self::MASK_DIRECT_CHANNEL.0,
        ));
    }
}

impl std::ops::BitOr for SensorFlags {
    type Output = SensorFlags;

    fn bitor(self, rhs: SensorFlags) -> SensorFlags {
        SensorFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for SensorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorFlags({:#x})", self.0)
    }
}

/// Sensor type, following the platform numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    MetaData,
    Accelerometer,
    MagneticField,
    Gyroscope,
    Light,
    Pressure,
    Proximity,
    AmbientTemperature,
    SignificantMotion,
    StepCounter,
    AdditionalInfo,
    /// Vendor or otherwise unlisted type id
    Other(i32),
}

impl SensorType {
    /// Numeric type id as used on the wire
    pub fn id(self) -> i32 {
        match self {
            SensorType::MetaData => 0,
            SensorType::Accelerometer => 1,
            SensorType::MagneticField => 2,
            SensorType::Gyroscope => 4,
            SensorType::Light => 5,
            SensorType::Pressure => 6,
            SensorType::Proximity => 8,
            SensorType::AmbientTemperature => 13,
            SensorType::SignificantMotion => 17,
            SensorType::StepCounter => 19,
            SensorType::AdditionalInfo => 33,
            SensorType::Other(id) => id,
        }
    }
}

/// Sensor metadata as reported by a sub-HAL and exposed by the proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Handle, namespaced once the proxy has stamped it
    pub sensor_handle: SensorHandle,
    pub name: String,
    pub vendor: String,
    pub version: i32,
    pub sensor_type: SensorType,
    /// Type string, e.g. "android.sensor.accelerometer"
    pub type_as_string: String,
    pub max_range: f32,
    pub resolution: f32,
    /// Power draw in mA
    pub power: f32,
    /// Minimum sampling period in microseconds
    pub min_delay_us: i32,
    pub fifo_reserved_event_count: u32,
    pub fifo_max_event_count: u32,
    pub required_permission: String,
    /// Maximum sampling period in microseconds
    pub max_delay_us: i32,
    pub flags: SensorFlags,
}

impl SensorInfo {
    /// Create a descriptor with the given identity and empty capabilities
    pub fn new(sensor_handle: SensorHandle, name: impl Into<String>, sensor_type: SensorType) -> Self {
        Self {
            sensor_handle,
            name: name.into(),
            vendor: String::new(),
            version: 1,
            sensor_type,
            type_as_string: String::new(),
            max_range: 0.0,
            resolution: 0.0,
            power: 0.0,
            min_delay_us: 0,
            fifo_reserved_event_count: 0,
            fifo_max_event_count: 0,
            required_permission: String::new(),
            max_delay_us: 0,
            flags: SensorFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: SensorFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn is_wake_up(&self) -> bool {
        self.flags.is_wake_up()
    }
}
