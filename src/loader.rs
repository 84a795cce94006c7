//! Sub-HAL list loading
//!
//! The list file holds whitespace separated sub-HAL names; `#` starts a
//! comment running to the end of the line. Names are looked up in the
//! sub-HAL registry.

use log::{error, info};
use multihal_core::{Registry, SharedSubHal, SUB_HAL_2_0_VERSION};
use std::path::Path;
use thiserror::Error;

/// Why a listed sub-HAL was not loaded
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown sub-HAL '{0}'")]
    Unknown(String),
    #[error("sub-HAL '{name}' reports version {version:#x}, expected {expected:#x}")]
    VersionMismatch { name: String, version: u32, expected: u32 },
}

/// Names listed in the sub-HAL list file contents
pub fn parse_subhal_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .map(str::to_string)
        .collect()
}

/// Create one named sub-HAL, checking its interface version
pub fn create_subhal(name: &str, registry: &Registry) -> Result<SharedSubHal, LoadError> {
    let entry = registry
        .create_subhal(name)
        .map_err(|_| LoadError::Unknown(name.to_string()))?;
    if entry.version != SUB_HAL_2_0_VERSION {
        return Err(LoadError::VersionMismatch {
            name: name.to_string(),
            version: entry.version,
            expected: SUB_HAL_2_0_VERSION,
        });
    }
    Ok(entry.subhal)
}

/// Create every sub-HAL in `names`, in order, skipping those that fail
pub fn create_subhals(names: &[String], registry: &Registry) -> Vec<SharedSubHal> {
    let mut subhals = Vec::with_capacity(names.len());
    for name in names {
        match create_subhal(name, registry) {
            Ok(subhal) => {
                info!("Loaded sub-HAL '{}'", name);
                subhals.push(subhal);
            }
            Err(e) => error!("Skipping sub-HAL: {}", e),
        }
    }
    subhals
}

/// Load the sub-HALs named in the list file at `path`
///
/// A missing or unreadable file yields no sub-HALs.
pub fn load_subhal_list(path: &Path, registry: &Registry) -> Vec<SharedSubHal> {
    match std::fs::read_to_string(path) {
        Ok(content) => create_subhals(&parse_subhal_list(&content), registry),
        Err(e) => {
            error!("Could not read sub-HAL list {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
