//! Registry of sub-HAL factories

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::subhal::SharedSubHal;

/// A freshly created sub-HAL together with the interface version it reports
pub struct SubHalEntry {
    pub subhal: SharedSubHal,
    pub version: u32,
}

/// Function that creates a sub-HAL
pub type SubHalFactory = fn() -> SubHalEntry;

/// Information about a registered sub-HAL
#[derive(Debug, Clone)]
pub struct SubHalInfo {
    /// Name used in the sub-HAL list file
    pub id: String,
    /// Short description
    pub description: String,
}

/// Registry for sub-HAL factories
///
/// Stands in for loading sub-HAL libraries: the sub-HAL list names entries
/// of this registry instead of shared objects.
pub struct Registry {
    subhals: BTreeMap<String, (SubHalInfo, SubHalFactory)>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            subhals: BTreeMap::new(),
        }
    }

    /// Register a sub-HAL factory
    pub fn register_subhal(&mut self, id: &str, factory: SubHalFactory) {
        self.register_subhal_with_info(id, "", factory);
    }

    /// Register a sub-HAL factory with a description
    pub fn register_subhal_with_info(&mut self, id: &str, description: &str, factory: SubHalFactory) {
        let info = SubHalInfo {
            id: id.to_string(),
            description: description.to_string(),
        };
        if self.subhals.insert(id.to_string(), (info, factory)).is_some() {
            log::debug!("Replaced sub-HAL factory '{}'", id);
        }
    }

    /// Create a sub-HAL by ID
    pub fn create_subhal(&self, id: &str) -> Result<SubHalEntry> {
        let (_, factory) = self
            .subhals
            .get(id)
            .ok_or_else(|| anyhow!("Unknown sub-HAL: {}", id))?;
        Ok(factory())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subhals.contains_key(id)
    }

    /// List all registered sub-HAL IDs, sorted
    pub fn list_subhals(&self) -> Vec<String> {
        self.subhals.keys().cloned().collect()
    }

    /// List info for all registered sub-HALs, sorted by ID
    pub fn list_subhal_infos(&self) -> Vec<SubHalInfo> {
        self.subhals.values().map(|(info, _)| info.clone()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global registry instance
static GLOBAL_REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::new()));

/// Get the global registry
pub fn global_registry() -> &'static RwLock<Registry> {
    &GLOBAL_REGISTRY
}

/// Macro to register a sub-HAL with the global registry
#[macro_export]
macro_rules! register_subhal {
    ($id:expr, $description:expr, $type:ty) => {
        $crate::global_registry()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register_subhal_with_info($id, $description, || $crate::SubHalEntry {
                subhal: ::std::sync::Arc::new(<$type>::default()),
                version: $crate::SUB_HAL_2_0_VERSION,
            });
    };
    ($id:expr, $type:ty) => {
        $crate::register_subhal!($id, "", $type)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::HalProxyCallback;
    use crate::subhal::SubHal;
    use multihal_types::{Event, OperationMode, SensorHandle, SensorInfo};
    use std::sync::Arc;

    #[derive(Default)]
    struct Empty;

    impl SubHal for Empty {
        fn name(&self) -> &str {
            "empty"
        }
        fn sensors_list(&self) -> multihal_types::Result<Vec<SensorInfo>> {
            Ok(Vec::new())
        }
        fn initialize(&self, _callback: Arc<dyn HalProxyCallback>) -> multihal_types::Result<()> {
            Ok(())
        }
        fn set_operation_mode(&self, _mode: OperationMode) -> multihal_types::Result<()> {
            Ok(())
        }
        fn activate(&self, _h: SensorHandle, _enabled: bool) -> multihal_types::Result<()> {
            Ok(())
        }
        fn batch(&self, _h: SensorHandle, _p: i64, _l: i64) -> multihal_types::Result<()> {
            Ok(())
        }
        fn flush(&self, _h: SensorHandle) -> multihal_types::Result<()> {
            Ok(())
        }
        fn inject_sensor_data(&self, _event: &Event) -> multihal_types::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_create_registered_subhal() {
        let mut registry = Registry::new();
        registry.register_subhal_with_info("empty", "Nothing at all", || SubHalEntry {
            subhal: Arc::new(Empty),
            version: crate::SUB_HAL_2_0_VERSION,
        });

        let entry = registry.create_subhal("empty").unwrap();
        assert_eq!(entry.subhal.name(), "empty");
        assert_eq!(registry.list_subhals(), vec!["empty".to_string()]);
        assert!(registry.create_subhal("missing").is_err());
    }

    #[test]
    fn test_register_macro_uses_global_registry() {
        register_subhal!("macro-empty", Empty);
        let registry = global_registry().read().unwrap();
        assert!(registry.contains("macro-empty"));
    }
}
