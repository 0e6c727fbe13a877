//! The device transport seam.
//!
//! The core only talks to a projector through [`Transport`]: resolve it,
//! connect, query, write DPs, and listen to a broadcast of [`DeviceEvent`]s.
//! [`LocalClient`] implements it over the Tuya LAN protocol.

pub mod crypto;
pub mod discovery;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;

use crate::dp::{DpIndex, DpSnapshot, SetRequest};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use local::{LocalClient, LocalClientBuilder};
pub use protocol::Version;

/// Events a transport reports about its device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Partial update pushed by the device (or echoed after a `set`).
    Data(DpSnapshot),
    /// Full state, answering a query.
    DpRefresh(DpSnapshot),
    Connected,
    Disconnected,
    /// Non-fatal transport error; logged and otherwise ignored.
    Error(String),
}

/// State queries a transport can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every DP the device exposes.
    Schema,
    /// Ask the device to re-report the listed DPs.
    Refresh(Vec<DpIndex>),
}

/// A client for one physical device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves the device's network location.
    async fn find(&self) -> Result<()>;

    /// Opens the session. Emits [`DeviceEvent::Connected`] on success.
    async fn connect(&self) -> Result<()>;

    /// Sends a state query; the answer arrives as an event.
    async fn get(&self, query: Query) -> Result<()>;

    /// Writes one or more DPs in a single device message.
    async fn set(&self, request: SetRequest) -> Result<()>;

    /// Closes the session without emitting further events.
    async fn disconnect(&self);

    /// A fresh receiver for the device's event stream.
    fn events(&self) -> broadcast::Receiver<DeviceEvent>;
}
