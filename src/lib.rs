//! # Star Projector
//!
//! Bridges Tuya star projectors to smart-home style characteristics over the
//! Tuya local protocol (v3.3 and v3.4), without cloud dependencies.
//!
//! A [`registry::Registry`] turns the platform configuration into one
//! [`session::DeviceSession`] per projector, a projector controller that
//! mirrors power, rotation, colour light and laser state, and one momentary
//! switch per configured scene.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use star_projector::config::PlatformConfig;
//! use star_projector::registry::Registry;
//! use star_projector::transport::{LocalClient, Transport};
//! use std::sync::Arc;
//!
//! # async fn run() -> star_projector::Result<()> {
//! let config = PlatformConfig::load("config.json")?;
//! let registry = Registry::build(&config, |device| {
//!     let client = LocalClient::builder(&device.device_id, &device.local_key)
//!         .address(device.address.clone())
//!         .version(device.version)
//!         .build()?;
//!     Ok(Arc::new(client) as Arc<dyn Transport>)
//! });
//! registry.start();
//! # Ok(())
//! # }
//! ```

pub mod accessory;
pub mod characteristic;
pub mod codec;
pub mod config;
pub mod controller;
pub mod dp;
pub mod error;
pub mod registry;
pub mod session;
pub mod timer;
pub mod transport;

pub use codec::{ColorFormat, Hsb, NamedColor, SceneDescriptor, SceneShape};
pub use error::{ProjectorError, Result};
pub use registry::{Accessory, Registry};
pub use session::{DeviceSession, EventKinds, LinkState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
