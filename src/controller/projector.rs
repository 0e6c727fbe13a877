//! Device state controller for one projector accessory.
//!
//! The controller task owns every piece of mutable state: the rotation gate,
//! the per-dimension write lanes and the small device cache (last power,
//! mode, colour format). Host writes arrive through [`ProjectorHandle`],
//! device truth through the session subscription, and `set` calls run in a
//! [`JoinSet`] so events keep flowing while a write is outstanding.

use crate::accessory::{AccessoryInfo, ProjectorServices};
use crate::characteristic::Characteristic;
use crate::codec::{self, BRIGHTNESS_MAX, ColorFormat, Hsb};
use crate::controller::lane::WriteLane;
use crate::controller::rotation::{self, RotationGate, RotationWrite, ToggleOutcome};
use crate::dp::{DpMap, DpRole, DpSnapshot, SetRequest};
use crate::error::Result;
use crate::session::{DeviceSession, EventKinds, SessionEvents};
use crate::timer::sleep_until_deadline;
use crate::transport::DeviceEvent;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const MODE_COLOUR: &str = "colour";
pub const MODE_SCENE: &str = "scene";

/// Laser brightness on the device is 0–1000.
const LASER_SCALE: u32 = 10;

/// Everything a projector controller is built from.
pub struct ProjectorSetup {
    pub name: String,
    pub dps: DpMap,
    pub services: ProjectorServices,
    pub info: AccessoryInfo,
    /// Switches of the scene accessories driving this projector.
    pub scene_switches: Vec<Characteristic<bool>>,
    pub color_format: Option<ColorFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Power(bool),
    RotationActive(u8),
    RotationSpeed(u8),
    ColorOn(bool),
    Hue(u16),
    Saturation(u8),
    ColorBrightness(u8),
    LaserOn(bool),
    LaserBrightness(u8),
    Identify,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Write {
    Power(bool),
    ColorState(bool),
    Color(Hsb),
    LaserState(bool),
    LaserBrightness(u8),
    Rotation(RotationWrite),
}

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Write::Power(on) => write!(f, "power to {}", on),
            Write::ColorState(on) => write!(f, "colour light to {}", on),
            Write::Color(hsb) => write!(f, "colour to {}", hsb),
            Write::LaserState(on) => write!(f, "laser to {}", on),
            Write::LaserBrightness(b) => write!(f, "laser brightness to {}", b),
            Write::Rotation(w) => write!(f, "rotation speed to {}", w.speed),
        }
    }
}

/// Host-side handle. Every setter enqueues and returns; the outcome shows
/// up on the characteristics.
#[derive(Clone)]
pub struct ProjectorHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
    services: ProjectorServices,
    info: AccessoryInfo,
}

impl ProjectorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &ProjectorServices {
        &self.services
    }

    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("{} is shut down; dropping {:?}", self.name, command);
        }
    }

    pub fn set_power(&self, on: bool) {
        self.send(Command::Power(on));
    }

    /// 0 or 1.
    pub fn set_rotation_active(&self, active: u8) {
        self.send(Command::RotationActive(active));
    }

    /// 1–100.
    pub fn set_rotation_speed(&self, speed: u8) {
        self.send(Command::RotationSpeed(speed));
    }

    pub fn set_color_on(&self, on: bool) {
        self.send(Command::ColorOn(on));
    }

    pub fn set_hue(&self, hue: u16) {
        self.send(Command::Hue(hue));
    }

    pub fn set_saturation(&self, saturation: u8) {
        self.send(Command::Saturation(saturation));
    }

    pub fn set_color_brightness(&self, brightness: u8) {
        self.send(Command::ColorBrightness(brightness));
    }

    pub fn set_laser_on(&self, on: bool) {
        self.send(Command::LaserOn(on));
    }

    pub fn set_laser_brightness(&self, brightness: u8) {
        self.send(Command::LaserBrightness(brightness));
    }

    pub fn identify(&self) {
        self.send(Command::Identify);
    }
}

pub struct ProjectorController {
    name: Arc<str>,
    dps: DpMap,
    services: ProjectorServices,
    scene_switches: Vec<Characteristic<bool>>,
    session: DeviceSession,
    preferred_format: Option<ColorFormat>,
    seen_format: Option<ColorFormat>,
    mode: Option<String>,
    rotation: RotationGate,
    power_lane: WriteLane<bool>,
    color_state_lane: WriteLane<bool>,
    color_lane: WriteLane<Hsb>,
    laser_state_lane: WriteLane<bool>,
    laser_brightness_lane: WriteLane<u8>,
    writes: JoinSet<(Write, Result<()>)>,
}

impl ProjectorController {
    /// Subscribes to the session and spawns the controller task.
    pub fn spawn(
        setup: ProjectorSetup,
        session: DeviceSession,
        cancel: CancellationToken,
    ) -> ProjectorHandle {
        let name: Arc<str> = setup.name.into();
        let events = session.subscribe(EventKinds::STATE | EventKinds::LINK);
        let (tx, rx) = mpsc::unbounded_channel();

        let controller = Self {
            name: name.clone(),
            dps: setup.dps,
            services: setup.services.clone(),
            scene_switches: setup.scene_switches,
            session,
            preferred_format: setup.color_format,
            seen_format: None,
            mode: None,
            rotation: RotationGate::default(),
            power_lane: WriteLane::new(),
            color_state_lane: WriteLane::new(),
            color_lane: WriteLane::new(),
            laser_state_lane: WriteLane::new(),
            laser_brightness_lane: WriteLane::new(),
            writes: JoinSet::new(),
        };
        tokio::spawn(controller.run(rx, events, cancel));

        ProjectorHandle {
            name,
            tx,
            services: setup.services,
            info: setup.info,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: SessionEvents,
        cancel: CancellationToken,
    ) {
        debug!("Controller for {} started", self.name);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command),
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                Some(res) = self.writes.join_next() => match res {
                    Ok((write, result)) => self.on_write_done(write, result),
                    Err(e) => error!("Write task for {} failed: {}", self.name, e),
                },
                _ = sleep_until_deadline(self.rotation.deadline()) => {
                    if let Some(write) = self.rotation.on_deadline(Instant::now()) {
                        self.start_write(Write::Rotation(write));
                    }
                }
            }
        }
        self.writes.abort_all();
        debug!("Controller for {} stopped", self.name);
    }

    fn encode_format(&self) -> ColorFormat {
        self.seen_format
            .or(self.preferred_format)
            .unwrap_or_default()
    }

    fn request_for(&self, write: Write) -> Result<SetRequest> {
        Ok(match write {
            Write::Power(on) => SetRequest::single(self.dps.require(DpRole::PowerState)?, on),
            Write::ColorState(on) => SetRequest::single(self.dps.require(DpRole::ColorState)?, on),
            Write::Color(hsb) => SetRequest::multiple([
                (self.dps.require(DpRole::Mode)?, Value::from(MODE_COLOUR)),
                (
                    self.dps.require(DpRole::Color)?,
                    Value::from(codec::hsb_to_device(hsb, self.encode_format())),
                ),
            ]),
            Write::LaserState(on) => SetRequest::single(self.dps.require(DpRole::LaserState)?, on),
            Write::LaserBrightness(b) => SetRequest::single(
                self.dps.require(DpRole::LaserBrightness)?,
                b as u32 * LASER_SCALE,
            ),
            Write::Rotation(w) => {
                SetRequest::single(self.dps.require(DpRole::Rotation)?, w.device_value())
            }
        })
    }

    fn start_write(&mut self, write: Write) {
        debug!("Setting {} on {}", write, self.name);
        let request = self.request_for(write);
        let session = self.session.clone();
        self.writes.spawn(async move {
            let result = match request {
                Ok(request) => session.set(request).await,
                Err(e) => Err(e),
            };
            (write, result)
        });
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Power(on) => {
                if let Some(on) = self.power_lane.submit(on) {
                    self.start_write(Write::Power(on));
                }
            }
            Command::RotationActive(active) => {
                let Some(rotation) = &self.services.rotation else {
                    warn!("{} has no star rotation", self.name);
                    return;
                };
                let current = rotation.active.value() > 0;
                let outcome = self
                    .rotation
                    .request_toggle(active > 0, current, Instant::now());
                match outcome {
                    ToggleOutcome::Suppressed => {
                        debug!("Ignoring rotation toggle on {} while a write settles", self.name)
                    }
                    outcome => debug!("Rotation toggle on {}: {:?}", self.name, outcome),
                }
            }
            Command::RotationSpeed(speed) => {
                if self.services.rotation.is_none() {
                    warn!("{} has no star rotation", self.name);
                    return;
                }
                if let Some(write) = self.rotation.request_speed(speed) {
                    self.start_write(Write::Rotation(write));
                }
            }
            Command::ColorOn(on) => {
                if self.services.color.is_none() {
                    warn!("{} has no colour light", self.name);
                    return;
                }
                if let Some(on) = self.color_state_lane.submit(on) {
                    self.start_write(Write::ColorState(on));
                }
            }
            Command::Hue(_) | Command::Saturation(_) | Command::ColorBrightness(_) => {
                let Some(color) = &self.services.color else {
                    warn!("{} has no colour light", self.name);
                    return;
                };
                let mut target = self.color_lane.latest().copied().unwrap_or_else(|| {
                    Hsb::new(
                        color.hue.value(),
                        color.saturation.value(),
                        color.brightness.value(),
                    )
                });
                match command {
                    Command::Hue(h) => target.hue = h,
                    Command::Saturation(s) => target.saturation = s,
                    Command::ColorBrightness(b) => target.brightness = b,
                    _ => {}
                }
                if let Some(target) = self.color_lane.submit(target.clamped()) {
                    self.start_write(Write::Color(target));
                }
            }
            Command::LaserOn(on) => {
                if self.services.laser.is_none() {
                    warn!("{} has no laser", self.name);
                    return;
                }
                if let Some(on) = self.laser_state_lane.submit(on) {
                    self.start_write(Write::LaserState(on));
                }
            }
            Command::LaserBrightness(brightness) => {
                if self.services.laser.is_none() {
                    warn!("{} has no laser", self.name);
                    return;
                }
                if let Some(b) = self
                    .laser_brightness_lane
                    .submit(brightness.min(BRIGHTNESS_MAX))
                {
                    self.start_write(Write::LaserBrightness(b));
                }
            }
            Command::Identify => info!("Identify requested for {}", self.name),
        }
    }

    fn on_write_done(&mut self, write: Write, result: Result<()>) {
        match &result {
            Ok(()) => {
                debug!("Set {} on {}", write, self.name);
                self.commit(write);
            }
            Err(e) => warn!("Failed to set {} on {}: {}", write, self.name, e),
        }

        let next = match write {
            Write::Power(_) => self.power_lane.complete().map(Write::Power),
            Write::ColorState(_) => self.color_state_lane.complete().map(Write::ColorState),
            Write::Color(_) => self.color_lane.complete().map(Write::Color),
            Write::LaserState(_) => self.laser_state_lane.complete().map(Write::LaserState),
            Write::LaserBrightness(_) => self
                .laser_brightness_lane
                .complete()
                .map(Write::LaserBrightness),
            Write::Rotation(_) => self
                .rotation
                .on_write_complete(Instant::now())
                .map(Write::Rotation),
        };
        if let Some(next) = next {
            self.start_write(next);
        }
    }

    /// Mirrors a confirmed write into the characteristics.
    fn commit(&mut self, write: Write) {
        match write {
            Write::Power(on) => self.apply_power(on),
            Write::ColorState(on) => {
                if let Some(color) = &self.services.color {
                    color.on.update(on);
                }
            }
            Write::Color(hsb) => {
                if let Some(color) = &self.services.color {
                    color.hue.update(hsb.hue);
                    color.saturation.update(hsb.saturation);
                    color.brightness.update(hsb.brightness);
                }
                self.mode = Some(MODE_COLOUR.to_string());
            }
            Write::LaserState(on) => {
                if let Some(laser) = &self.services.laser {
                    laser.on.update(on);
                }
            }
            Write::LaserBrightness(b) => {
                if let Some(laser) = &self.services.laser {
                    laser.brightness.update(b);
                }
            }
            Write::Rotation(w) => {
                if let Some(rotation) = &self.services.rotation {
                    rotation.speed.update(w.speed);
                    rotation.active.update((w.speed > 1) as u8);
                }
            }
        }
    }

    fn apply_power(&self, on: bool) {
        self.services.power.update(on);
        if let Some(rotation) = &self.services.rotation {
            rotation.active.update(on as u8);
        }
    }

    fn reset_scene_switches(&self) {
        for switch in &self.scene_switches {
            switch.update(false);
        }
    }

    fn on_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected => {
                info!("{} is reachable", self.name);
                self.services.power.mark_reachable();
                self.reset_scene_switches();
            }
            DeviceEvent::Disconnected => {
                warn!("{} is unreachable", self.name);
                self.services.power.mark_unreachable();
                self.reset_scene_switches();
            }
            DeviceEvent::Data(snapshot) | DeviceEvent::DpRefresh(snapshot) => {
                self.apply_snapshot(&snapshot)
            }
            DeviceEvent::Error(_) => {}
        }
    }

    fn dp_value<'a>(&self, snapshot: &'a DpSnapshot, role: DpRole) -> Option<&'a Value> {
        self.dps.get(role).and_then(|dp| snapshot.get(dp))
    }

    /// Mirrors device state into the characteristics without touching the
    /// write path.
    fn apply_snapshot(&mut self, snapshot: &DpSnapshot) {
        debug!("DP update from {}: {:?}", self.name, snapshot);

        if let Some(on) = self.dp_value(snapshot, DpRole::PowerState).and_then(Value::as_bool) {
            self.apply_power(on);
        }

        if let Some(mode) = self.dp_value(snapshot, DpRole::Mode).and_then(Value::as_str)
            && self.mode.as_deref() != Some(mode)
        {
            info!("{} switched to {} mode", self.name, mode);
            self.mode = Some(mode.to_string());
        }

        if let Some(rotation) = &self.services.rotation
            && let Some(raw) = self.dp_value(snapshot, DpRole::Rotation).and_then(as_number)
        {
            let (speed, active) = rotation::from_device(raw);
            rotation.speed.update(speed);
            rotation.active.update(active as u8);
        }

        if let Some(color) = &self.services.color {
            if let Some(on) = self.dp_value(snapshot, DpRole::ColorState).and_then(Value::as_bool) {
                color.on.update(on);
            }
            if let Some(raw) = self.dp_value(snapshot, DpRole::Color).and_then(Value::as_str) {
                match codec::detect_format(raw).and_then(|f| codec::device_to_hsb(raw).map(|hsb| (f, hsb))) {
                    Ok((format, hsb)) => {
                        self.seen_format = Some(format);
                        color.hue.update(hsb.hue);
                        color.saturation.update(hsb.saturation);
                        color.brightness.update(hsb.brightness);
                    }
                    Err(e) => warn!("Dropping colour update from {}: {}", self.name, e),
                }
            }
        }

        if let Some(laser) = &self.services.laser {
            if let Some(on) = self.dp_value(snapshot, DpRole::LaserState).and_then(Value::as_bool) {
                laser.on.update(on);
            }
            if let Some(raw) = self
                .dp_value(snapshot, DpRole::LaserBrightness)
                .and_then(as_number)
            {
                let pct = (raw / LASER_SCALE as u64).min(BRIGHTNESS_MAX as u64);
                laser.brightness.update(pct as u8);
            }
        }

        if let Some(scene) = self.dp_value(snapshot, DpRole::Scene).and_then(Value::as_str) {
            match codec::device_to_scene(scene) {
                Ok(scene) => debug!("{} reports scene {:?}", self.name, scene),
                Err(e) => debug!("{} reports an unrecognised scene: {}", self.name, e),
            }
        }
    }
}

/// Numeric DP value; some firmwares send numbers as strings.
fn as_number(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
