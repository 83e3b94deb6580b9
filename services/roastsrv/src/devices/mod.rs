//! Device channels and the registry that reads and writes them

pub mod channel;
pub mod registry;

pub use crate::error::RegistryError;
pub use channel::{ChannelAddress, DeviceChannel, TemperatureUnit};
pub use registry::{masked_value, DeviceRegistry, LinkOptions};
