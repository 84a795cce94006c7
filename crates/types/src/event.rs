//! Sensor events

use serde::{Deserialize, Serialize};

use crate::handle::SensorHandle;
use crate::sensor::SensorType;

/// Meta data event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaDataEventType {
    FlushComplete,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    /// Three axis reading with accuracy status
    Vec3 { x: f32, y: f32, z: f32, status: i8 },
    /// Single value reading (temperature, light, ...)
    Scalar(f32),
    /// Counter reading (step counter)
    Counter(u64),
    Meta(MetaDataEventType),
    /// Additional info frame: info type, serial and payload values
    AdditionalInfo { info_type: i32, serial: i32, values: Vec<f32> },
    Raw(Vec<f32>),
}

/// A single sensor event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Timestamp in nanoseconds
    pub timestamp: i64,
    pub sensor_handle: SensorHandle,
    pub sensor_type: SensorType,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(sensor_handle: SensorHandle, sensor_type: SensorType, timestamp: i64, payload: EventPayload) -> Self {
        Self {
            timestamp,
            sensor_handle,
            sensor_type,
            payload,
        }
    }

    /// Flush complete marker for `sensor_handle`
    pub fn flush_complete(sensor_handle: SensorHandle, timestamp: i64) -> Self {
        Self::new(
            sensor_handle,
            SensorType::MetaData,
            timestamp,
            EventPayload::Meta(MetaDataEventType::FlushComplete),
        )
    }
}
