//! Momentary scene switch.
//!
//! Turning the switch on sends one encoded scene to the sibling projector
//! and flips the switch back off 500 ms later, whatever the outcome.

use crate::accessory::SceneServices;
use crate::characteristic::Characteristic;
use crate::codec::{self, SceneDescriptor};
use crate::controller::projector::MODE_SCENE;
use crate::dp::{DpMap, DpRole, SetRequest};
use crate::error::Result;
use crate::session::DeviceSession;
use crate::timer::sleep_until_deadline;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const AUTO_RESET: Duration = Duration::from_millis(500);

pub struct SceneSetup {
    pub name: String,
    /// Name of the projector this scene drives.
    pub linked_to: String,
    pub scene: SceneDescriptor,
    pub dps: DpMap,
    pub services: SceneServices,
    /// Power characteristic of the linked projector.
    pub sibling_power: Characteristic<bool>,
}

#[derive(Clone)]
pub struct SceneHandle {
    name: Arc<str>,
    linked_to: Arc<str>,
    tx: mpsc::UnboundedSender<bool>,
    services: SceneServices,
}

impl SceneHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn linked_to(&self) -> &str {
        &self.linked_to
    }

    pub fn services(&self) -> &SceneServices {
        &self.services
    }

    /// Host write to the switch. Only `true` does anything.
    pub fn activate(&self, on: bool) {
        if self.tx.send(on).is_err() {
            warn!("Scene {} is shut down", self.name);
        }
    }
}

pub struct SceneController {
    name: Arc<str>,
    linked_to: Arc<str>,
    encoded: String,
    dps: DpMap,
    switch: Characteristic<bool>,
    sibling_power: Characteristic<bool>,
    session: DeviceSession,
    reset_at: Option<Instant>,
    writes: JoinSet<Result<()>>,
}

impl SceneController {
    pub fn spawn(
        setup: SceneSetup,
        session: DeviceSession,
        cancel: CancellationToken,
    ) -> SceneHandle {
        let name: Arc<str> = setup.name.into();
        let linked_to: Arc<str> = setup.linked_to.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            name: name.clone(),
            linked_to: linked_to.clone(),
            encoded: codec::scene_to_device(&setup.scene),
            dps: setup.dps,
            switch: setup.services.switch.clone(),
            sibling_power: setup.sibling_power,
            session,
            reset_at: None,
            writes: JoinSet::new(),
        };
        tokio::spawn(controller.run(rx, cancel));
        SceneHandle {
            name,
            linked_to,
            tx,
            services: setup.services,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<bool>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(on) => self.on_activate(on),
                    None => break,
                },
                Some(res) = self.writes.join_next() => match res {
                    Ok(Ok(())) => info!("Scene {} sent to {}", self.name, self.linked_to),
                    Ok(Err(e)) => warn!("Failed to send scene {} to {}: {}", self.name, self.linked_to, e),
                    Err(e) => error!("Scene task for {} failed: {}", self.name, e),
                },
                _ = sleep_until_deadline(self.reset_at) => {
                    self.reset_at = None;
                    self.switch.update(false);
                }
            }
        }
        self.writes.abort_all();
    }

    fn on_activate(&mut self, on: bool) {
        if !on {
            debug!("Ignoring off write to scene {}", self.name);
            return;
        }
        self.switch.update(true);
        self.reset_at = Some(Instant::now() + AUTO_RESET);

        if !self.sibling_power.is_reachable() {
            info!(
                "{} is unreachable; scene {} not sent",
                self.linked_to, self.name
            );
            return;
        }

        let request = self.request();
        let session = self.session.clone();
        self.writes.spawn(async move { session.set(request?).await });
    }

    fn request(&self) -> Result<SetRequest> {
        Ok(SetRequest::multiple([
            (self.dps.require(DpRole::Mode)?, Value::from(MODE_SCENE)),
            (self.dps.require(DpRole::Scene)?, Value::from(self.encoded.clone())),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{NamedColor, SceneShape};
    use crate::transport::mock::MockTransport;
    use serde_json::json;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn rig(power: Characteristic<bool>) -> (MockTransport, SceneHandle) {
        let mock = MockTransport::new();
        let session = DeviceSession::new("Galaxy", Arc::new(mock.clone()));
        session.start();
        settle().await;
        let handle = SceneController::spawn(
            SceneSetup {
                name: "Party".into(),
                linked_to: "Galaxy".into(),
                scene: SceneDescriptor {
                    shape: SceneShape::Flash,
                    rotation_speed: 40,
                    colors: vec![NamedColor::Red, NamedColor::Blue],
                },
                dps: DpMap::from_pairs([(DpRole::Mode, 21), (DpRole::Scene, 25)]).unwrap(),
                services: SceneServices::new(),
                sibling_power: power,
            },
            session,
            CancellationToken::new(),
        );
        (mock, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_sends_scene_and_resets() {
        let (mock, handle) = rig(Characteristic::new("On", true)).await;
        let switch = handle.services().switch.clone();

        handle.activate(true);
        settle().await;
        assert!(switch.value());
        let sets = mock.sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].value_of(21), Some(&json!("scene")));
        let encoded = sets[0].value_of(25).and_then(Value::as_str).unwrap();
        assert_eq!(encoded.len(), codec::SCENE_LEN);
        assert!(encoded.starts_with("022802"));

        tokio::time::sleep(AUTO_RESET).await;
        assert!(!switch.value());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resets_after_failed_send() {
        let (mock, handle) = rig(Characteristic::new("On", true)).await;
        mock.fail_sets(true);
        handle.activate(true);
        settle().await;
        assert!(handle.services().switch.value());
        assert_eq!(mock.sets().len(), 1);

        tokio::time::sleep(AUTO_RESET).await;
        assert!(!handle.services().switch.value());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_sibling_skips_send() {
        let power = Characteristic::new("On", false);
        power.mark_unreachable();
        let (mock, handle) = rig(power).await;

        handle.activate(true);
        settle().await;
        assert!(handle.services().switch.value());
        assert!(mock.sets().is_empty());
        tokio::time::sleep(AUTO_RESET).await;
        assert!(!handle.services().switch.value());

        handle.activate(false);
        settle().await;
        assert!(!handle.services().switch.value());
        assert!(mock.sets().is_empty());
    }
}
