//! Direct channel routing
//!
//! Only one sub-HAL can serve direct channels; every direct channel call goes
//! to it, or fails as unsupported when there is none.

use log::debug;
use multihal_core::{RateLevel, Result, SensorError, SensorHandle, SharedMemInfo, SharedSubHal};
use multihal_types::handle::{self, ALL_SENSORS_HANDLE};
use serde::{Deserialize, Serialize};

/// How the direct channel sub-HAL is chosen among those that support it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectChannelPolicy {
    /// First sub-HAL, in load order, with a direct channel capable sensor
    #[default]
    FirstRegistered,
    /// The named sub-HAL if it is capable, otherwise first registered
    Preferred(String),
}

/// Routes direct channel operations to the designated sub-HAL
pub struct DirectChannelRouter {
    target: Option<(usize, SharedSubHal)>,
}

impl DirectChannelRouter {
    pub fn new(target: Option<(usize, SharedSubHal)>) -> Self {
        if let Some((index, subhal)) = &target {
            debug!("Direct channel routed to sub-HAL {} ({})", index, subhal.name());
        }
        Self { target }
    }

    fn target(&self) -> Result<&(usize, SharedSubHal)> {
        self.target
            .as_ref()
            .ok_or_else(|| SensorError::Unsupported("no sub-HAL supports direct channels".into()))
    }

    pub fn register_direct_channel(&self, mem: &SharedMemInfo) -> Result<i32> {
        let (_, subhal) = self.target()?;
        subhal.register_direct_channel(mem)
    }

    pub fn unregister_direct_channel(&self, channel_handle: i32) -> Result<()> {
        let (_, subhal) = self.target()?;
        subhal.unregister_direct_channel(channel_handle)
    }

    /// Configure direct reports; `sensor_handle` is namespaced or `-1` for all
    pub fn config_direct_report(
        &self,
        sensor_handle: SensorHandle,
        channel_handle: i32,
        rate: RateLevel,
    ) -> Result<i32> {
        let (index, subhal) = self.target()?;
        let local = if sensor_handle == ALL_SENSORS_HANDLE {
            sensor_handle
        } else if handle::subhal_index_of(sensor_handle) == *index {
            handle::unstamp(sensor_handle)
        } else {
            return Err(SensorError::BadArgument(format!(
                "sensor {:#x} does not belong to the direct channel sub-HAL",
                sensor_handle
            )));
        };
        subhal.config_direct_report(local, channel_handle, rate)
    }
}
