//! Per-accessory controllers. Each runs as one task that owns its timers
//! and write bookkeeping and talks to the device only through a
//! [`crate::session::DeviceSession`].

pub mod lane;
pub mod projector;
pub mod rotation;
pub mod scene;

pub use projector::{ProjectorController, ProjectorHandle, ProjectorSetup};
pub use scene::{SceneController, SceneHandle, SceneSetup};
