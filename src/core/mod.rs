//! The proxy and the machinery behind it

mod callback;
mod direct_channel;
mod dispatch;
mod proxy;
mod registry;
mod wakelock;

pub use callback::SubHalCallback;
pub use direct_channel::{DirectChannelPolicy, DirectChannelRouter};
pub use dispatch::{EventDispatchQueue, QueueStats};
pub use proxy::{ClientChannels, HalProxy, ProxyChannels, ProxyState};
pub use registry::{BackendEntry, BackendRegistry};
pub use wakelock::{WakelockCoordinator, WakelockStats};
