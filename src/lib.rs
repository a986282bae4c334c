pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod node;
pub mod persistence;
pub mod platform;
pub mod privileged;
pub mod provisioner;
pub mod registry;
pub mod tray;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::BridgeError;
