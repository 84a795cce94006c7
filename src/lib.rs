//! multihal: one sensor HAL in front of many sub-HALs
//!
//! This library provides:
//! - The proxy that namespaces sensor handles and routes calls to sub-HALs
//! - The event dispatch queue and wake lock bookkeeping behind it
//! - Configuration management and sub-HAL list loading
//! - Platform power lock implementations

pub mod config;
pub mod core;
pub mod loader;
pub mod power;

// Re-export commonly used types
pub use crate::config::ProxyConfig;
pub use crate::core::{ClientChannels, HalProxy, ProxyChannels, ProxyState};
pub use crate::loader::load_subhal_list;
