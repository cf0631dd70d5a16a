pub mod client;
pub mod dispatch;
pub mod frames;
pub mod registry;

pub use client::ChannelClient;
pub use frames::Frame;
pub use registry::{ApiInstance, HttpRegistry, InstanceRegistry};
