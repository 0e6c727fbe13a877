//! Builds sessions and controllers from configuration and keeps track of
//! the accessories handed to the host.

use crate::accessory::{ProjectorServices, SceneServices};
use crate::config::{DeviceDescriptor, PlatformConfig, SceneAccessoryDescriptor};
use crate::controller::{
    ProjectorController, ProjectorHandle, ProjectorSetup, SceneController, SceneHandle, SceneSetup,
};
use crate::error::Result;
use crate::session::DeviceSession;
use crate::transport::Transport;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// An accessory exposed to the host.
#[derive(Clone)]
pub enum Accessory {
    Projector(ProjectorHandle),
    Scene(SceneHandle),
}

impl Accessory {
    pub fn name(&self) -> &str {
        match self {
            Accessory::Projector(p) => p.name(),
            Accessory::Scene(s) => s.name(),
        }
    }
}

/// Outcome of matching configured accessories against the host's cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Configured but not cached: the host must register these.
    pub register: Vec<String>,
    /// Cached but no longer configured: the host must drop these.
    pub remove: Vec<String>,
}

pub struct Registry {
    sessions: Vec<DeviceSession>,
    accessories: Vec<Accessory>,
    cancel: CancellationToken,
}

impl Registry {
    /// Validates the configuration and wires up every projector and scene.
    /// Invalid or duplicate entries are skipped with a warning. `transport`
    /// creates the device client for a validated projector.
    pub fn build<F>(config: &PlatformConfig, transport: F) -> Self
    where
        F: Fn(&DeviceDescriptor) -> Result<Arc<dyn Transport>>,
    {
        let cancel = CancellationToken::new();
        let mut names = HashSet::new();
        let mut sessions = Vec::new();
        let mut accessories = Vec::new();

        for entry in &config.projectors {
            let (projector, device) = match entry.get().and_then(|p| Ok((p, p.validate()?))) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping projector: {}", e);
                    continue;
                }
            };
            if names.contains(&device.name) {
                warn!(
                    "Multiple accessories are named {}; skipping the duplicate projector",
                    device.name
                );
                continue;
            }
            let client = match transport(&device) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Skipping projector {}: {}", device.name, e);
                    continue;
                }
            };
            names.insert(device.name.clone());

            let mut scenes = Vec::new();
            for scene in &projector.scenes {
                let scene = match scene.get() {
                    Ok(scene) => scene,
                    Err(e) => {
                        warn!("Skipping scene of {}: {}", device.name, e);
                        continue;
                    }
                };
                if !scene.active {
                    info!(
                        "Scene {} of {} is not active; skipping",
                        scene.name.as_deref().unwrap_or("<unnamed>"),
                        device.name
                    );
                    continue;
                }
                match scene.validate(&device) {
                    Ok(scene) if names.contains(&scene.name) => warn!(
                        "Multiple accessories are named {}; skipping the duplicate scene",
                        scene.name
                    ),
                    Ok(scene) => {
                        names.insert(scene.name.clone());
                        scenes.push(scene);
                    }
                    Err(e) => warn!("Skipping scene of {}: {}", device.name, e),
                }
            }

            let session = DeviceSession::new(device.name.clone(), client);
            accessories.extend(Self::wire(device, scenes, &session, &cancel));
            sessions.push(session);
        }

        info!(
            "Registry ready: {} projector session(s), {} accessorie(s)",
            sessions.len(),
            accessories.len()
        );
        Self {
            sessions,
            accessories,
            cancel,
        }
    }

    /// Scene switches first, then the projector (holding the switches), then
    /// the scene controllers (holding the projector's power).
    fn wire(
        device: DeviceDescriptor,
        scenes: Vec<SceneAccessoryDescriptor>,
        session: &DeviceSession,
        cancel: &CancellationToken,
    ) -> Vec<Accessory> {
        let scene_services: Vec<SceneServices> = scenes.iter().map(|_| SceneServices::new()).collect();
        let services = ProjectorServices::for_capabilities(device.capabilities);
        let power = services.power.clone();

        let projector = ProjectorController::spawn(
            ProjectorSetup {
                name: device.name,
                dps: device.dps,
                services,
                info: device.info,
                scene_switches: scene_services.iter().map(|s| s.switch.clone()).collect(),
                color_format: device.color_format,
            },
            session.clone(),
            cancel.child_token(),
        );

        let mut out = vec![Accessory::Projector(projector)];
        for (scene, services) in scenes.into_iter().zip(scene_services) {
            out.push(Accessory::Scene(SceneController::spawn(
                SceneSetup {
                    name: scene.name,
                    linked_to: scene.linked_to,
                    scene: scene.scene,
                    dps: scene.dps,
                    services,
                    sibling_power: power.clone(),
                },
                session.clone(),
                cancel.child_token(),
            )));
        }
        out
    }

    /// Starts every device session.
    pub fn start(&self) {
        for session in &self.sessions {
            session.start();
        }
    }

    pub fn accessories(&self) -> &[Accessory] {
        &self.accessories
    }

    pub fn sessions(&self) -> &[DeviceSession] {
        &self.sessions
    }

    pub fn session(&self, name: &str) -> Option<&DeviceSession> {
        self.sessions.iter().find(|s| s.name() == name)
    }

    pub fn projector(&self, name: &str) -> Option<&ProjectorHandle> {
        self.accessories.iter().find_map(|a| match a {
            Accessory::Projector(p) if p.name() == name => Some(p),
            _ => None,
        })
    }

    pub fn scene(&self, name: &str) -> Option<&SceneHandle> {
        self.accessories.iter().find_map(|a| match a {
            Accessory::Scene(s) if s.name() == name => Some(s),
            _ => None,
        })
    }

    /// Compares configured accessories with the names the host restored
    /// from its cache.
    pub fn reconcile<S: AsRef<str>>(&self, cached: &[S]) -> Reconciliation {
        let cached: HashSet<&str> = cached.iter().map(|name| name.as_ref()).collect();
        let configured: HashSet<&str> = self.accessories.iter().map(Accessory::name).collect();

        let register = self
            .accessories
            .iter()
            .map(Accessory::name)
            .filter(|n| !cached.contains(n))
            .map(str::to_string)
            .collect();
        let mut remove: Vec<String> = cached
            .iter()
            .filter(|n| !configured.contains(*n))
            .map(|n| n.to_string())
            .collect();
        remove.sort();

        for name in &remove {
            info!("Removing accessory {}", name);
        }
        Reconciliation { register, remove }
    }

    /// Stops every controller and session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for session in &self.sessions {
            session.shutdown().await;
        }
    }
}
