//! Platform configuration.
//!
//! The JSON file is parsed leniently with serde; every projector and scene
//! is then validated on its own into a descriptor, so one bad entry never
//! takes the rest down.

use crate::accessory::AccessoryInfo;
use crate::codec::{ColorFormat, NamedColor, SCENE_SLOTS, SceneDescriptor, SceneShape};
use crate::dp::{Capabilities, DpIndex, DpMap, DpRole};
use crate::error::{ProjectorError, Result};
use crate::transport::Version;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Rotation used when a scene's configured speed is out of range.
pub const DEFAULT_SCENE_ROTATION: u8 = 50;

/// One element of a config list. An element that does not fit its type is
/// kept with the parse error, so only that element gets skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<T> {
    Parsed(T),
    Malformed { raw: Value, error: String },
}

impl<T> Entry<T> {
    pub fn get(&self) -> Result<&T> {
        match self {
            Entry::Parsed(value) => Ok(value),
            Entry::Malformed { raw, error } => Err(ProjectorError::Configuration(format!(
                "entry {} is malformed: {}",
                raw.get("name").and_then(Value::as_str).unwrap_or("<unnamed>"),
                error
            ))),
        }
    }
}

impl<T> From<T> for Entry<T> {
    fn from(value: T) -> Self {
        Entry::Parsed(value)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Entry<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let parsed = T::deserialize(&raw);
        Ok(match parsed {
            Ok(value) => Entry::Parsed(value),
            Err(e) => Entry::Malformed {
                error: e.to_string(),
                raw,
            },
        })
    }
}

impl<T: Serialize> Serialize for Entry<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Entry::Parsed(value) => value.serialize(serializer),
            Entry::Malformed { raw, .. } => raw.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    pub debug: bool,
    pub projectors: Vec<Entry<ProjectorConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectorConfig {
    pub name: Option<String>,
    pub tuya_id: Option<String>,
    pub tuya_key: Option<String>,
    /// Fixed IP; discovered when absent.
    pub address: Option<String>,
    /// "3.3", "3.4" or "auto".
    pub version: Option<String>,
    pub color: bool,
    pub laser: bool,
    pub star_rotation: bool,
    /// "legacy" or "extended".
    pub color_format: Option<String>,
    /// Role name to DP index, e.g. `{"powerState": 20}`.
    pub dps: BTreeMap<String, DpIndex>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub scenes: Vec<Entry<SceneConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneConfig {
    pub name: Option<String>,
    pub active: bool,
    pub mode: Option<String>,
    pub rotation: Option<i64>,
    pub colors: Vec<String>,
}

/// A validated projector.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub device_id: String,
    pub local_key: String,
    pub address: Option<String>,
    pub version: Version,
    pub dps: DpMap,
    pub capabilities: Capabilities,
    pub color_format: Option<ColorFormat>,
    pub info: AccessoryInfo,
}

/// A validated scene bound to its projector.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneAccessoryDescriptor {
    pub name: String,
    pub linked_to: String,
    pub scene: SceneDescriptor,
    pub dps: DpMap,
}

impl PlatformConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProjectorError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ProjectorError::Configuration(format!("invalid config: {}", e)))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ProjectorConfig {
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        caps.set(Capabilities::ROTATION, self.star_rotation);
        caps.set(Capabilities::COLOR, self.color);
        caps.set(Capabilities::LASER, self.laser);
        caps
    }

    pub fn validate(&self) -> Result<DeviceDescriptor> {
        let name = non_empty(&self.name)
            .ok_or_else(|| ProjectorError::Configuration("projector has no name".into()))?;
        let device_id = non_empty(&self.tuya_id).ok_or_else(|| {
            ProjectorError::Configuration(format!("{} has no Tuya ID", name))
        })?;
        let local_key = non_empty(&self.tuya_key).ok_or_else(|| {
            ProjectorError::Configuration(format!("{} has no Tuya key", name))
        })?;

        let version = match non_empty(&self.version) {
            Some(v) => v.parse()?,
            None => Version::Auto,
        };
        let color_format = non_empty(&self.color_format)
            .map(str::parse::<ColorFormat>)
            .transpose()?;

        let capabilities = self.capabilities();
        let dps = DpMap::from_named(&self.dps, capabilities, false)
            .map_err(|e| ProjectorError::Configuration(format!("{}: {}", name, e)))?;

        Ok(DeviceDescriptor {
            name: name.to_string(),
            device_id: device_id.to_string(),
            local_key: local_key.to_string(),
            address: non_empty(&self.address).map(str::to_string),
            version,
            dps,
            capabilities,
            color_format,
            info: AccessoryInfo::new(
                self.manufacturer.as_deref(),
                self.model.as_deref(),
                self.serial_number.as_deref(),
            ),
        })
    }
}

impl SceneConfig {
    /// Validates an active scene against its parent projector.
    pub fn validate(&self, parent: &DeviceDescriptor) -> Result<SceneAccessoryDescriptor> {
        let name = non_empty(&self.name)
            .ok_or_else(|| ProjectorError::Configuration("scene has no name".into()))?;
        if self.colors.is_empty() {
            return Err(ProjectorError::Configuration(format!(
                "scene {} has no colours",
                name
            )));
        }
        let mut colors = self
            .colors
            .iter()
            .map(|c| c.parse::<NamedColor>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| ProjectorError::Configuration(format!("scene {}: {}", name, e)))?;
        if colors.len() > SCENE_SLOTS {
            warn!(
                "Scene {} lists {} colours; only the first {} are used",
                name,
                colors.len(),
                SCENE_SLOTS
            );
            colors.truncate(SCENE_SLOTS);
        }

        for role in [DpRole::Mode, DpRole::Scene] {
            parent.dps.require(role).map_err(|_| {
                ProjectorError::Configuration(format!(
                    "scene {} needs a '{}' DP on {}",
                    name, role, parent.name
                ))
            })?;
        }

        let rotation_speed = match self.rotation {
            Some(r @ 1..=100) => r as u8,
            _ => DEFAULT_SCENE_ROTATION,
        };

        Ok(SceneAccessoryDescriptor {
            name: name.to_string(),
            linked_to: parent.name.clone(),
            scene: SceneDescriptor {
                shape: SceneShape::from_mode(self.mode.as_deref()),
                rotation_speed,
                colors,
            },
            dps: parent.dps.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "debug": true,
        "projectors": [{
            "name": "Galaxy", "tuyaId": "bf0123", "tuyaKey": "0123456789abcdef",
            "address": "192.168.1.40", "version": "3.4",
            "color": true, "starRotation": true, "colorFormat": "legacy",
            "dps": {"powerState": 20, "mode": 21, "colorState": 102, "color": 24,
                    "rotation": 101, "scene": 25},
            "manufacturer": "Acme",
            "scenes": [
                {"name": "Party", "active": true, "mode": "FLASH", "rotation": 40,
                 "colors": ["RED", "BLUE"]},
                {"name": "Calm", "active": true, "mode": "SPIN", "rotation": 0,
                 "colors": ["RED", "GREEN", "BLUE", "ORANGE", "YELLOW", "PURPLE", "CYAN", "RED"]}
            ]
        }]
    }"#;

    #[test]
    fn test_parse_and_validate() {
        let config = PlatformConfig::from_json(SAMPLE).unwrap();
        assert!(config.debug);
        let projector = config.projectors[0].get().unwrap();
        let device = projector.validate().unwrap();
        assert_eq!(device.name, "Galaxy");
        assert_eq!(device.version, Version::V3_4);
        assert_eq!(device.color_format, Some(ColorFormat::Legacy));
        assert_eq!(
            device.capabilities,
            Capabilities::COLOR | Capabilities::ROTATION
        );
        assert_eq!(device.dps.get(DpRole::Rotation), Some(101));
        assert_eq!(device.info.manufacturer, "Acme");
        assert_eq!(device.info.model, "Smart Projector");
    }

    #[test]
    fn test_scene_normalisation() {
        let config = PlatformConfig::from_json(SAMPLE).unwrap();
        let projector = config.projectors[0].get().unwrap();
        let device = projector.validate().unwrap();

        let party = projector.scenes[0].get().unwrap().validate(&device).unwrap();
        assert_eq!(party.linked_to, "Galaxy");
        assert_eq!(party.scene.shape, SceneShape::Flash);
        assert_eq!(party.scene.rotation_speed, 40);

        let calm = projector.scenes[1].get().unwrap().validate(&device).unwrap();
        assert_eq!(calm.scene.shape, SceneShape::Static);
        assert_eq!(calm.scene.rotation_speed, DEFAULT_SCENE_ROTATION);
        assert_eq!(calm.scene.colors.len(), SCENE_SLOTS);
    }

    #[test]
    fn test_mistyped_entry_only_fails_itself() {
        let config = PlatformConfig::from_json(
            r#"{"projectors": [
                {"name": "Galaxy", "tuyaId": "bf01", "tuyaKey": "0123456789abcdef",
                 "dps": {"powerState": 20},
                 "scenes": [{"name": "Party", "active": "yes"}, {"name": "Calm"}]},
                {"name": "Nebula", "tuyaId": "bf02", "tuyaKey": "0123456789abcdef",
                 "dps": {"powerState": "20"}},
                {"name": "Aurora", "tuyaId": 7, "tuyaKey": "0123456789abcdef"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(config.projectors.len(), 3);

        let galaxy = config.projectors[0].get().unwrap();
        assert!(galaxy.validate().is_ok());
        let err = galaxy.scenes[0].get().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Party"));
        assert!(galaxy.scenes[1].get().is_ok());

        let err = config.projectors[1].get().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Nebula"));
        assert!(config.projectors[2].get().is_err());

        // Malformed entries are written back untouched.
        let text = serde_json::to_string(&config).unwrap();
        let again = PlatformConfig::from_json(&text).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_invalid_entries_are_configuration_errors() {
        let missing_key = ProjectorConfig {
            name: Some("Galaxy".into()),
            tuya_id: Some("bf0123".into()),
            ..Default::default()
        };
        assert!(missing_key.validate().unwrap_err().is_configuration());

        let missing_dp = ProjectorConfig {
            name: Some("Galaxy".into()),
            tuya_id: Some("bf0123".into()),
            tuya_key: Some("0123456789abcdef".into()),
            laser: true,
            dps: [("powerState".to_string(), 20)].into_iter().collect(),
            ..Default::default()
        };
        let err = missing_dp.validate().unwrap_err();
        assert!(err.to_string().contains("laserState"));

        let bad_version = ProjectorConfig {
            version: Some("3.1".into()),
            ..missing_dp.clone()
        };
        assert!(bad_version.validate().is_err());
    }

    #[test]
    fn test_scene_rejections() {
        let device = ProjectorConfig {
            name: Some("Galaxy".into()),
            tuya_id: Some("bf0123".into()),
            tuya_key: Some("0123456789abcdef".into()),
            dps: [("powerState".to_string(), 20)].into_iter().collect(),
            ..Default::default()
        }
        .validate()
        .unwrap();

        let no_scene_dp = SceneConfig {
            name: Some("Party".into()),
            active: true,
            colors: vec!["RED".into()],
            ..Default::default()
        };
        assert!(no_scene_dp.validate(&device).unwrap_err().is_configuration());

        let bad_colour = SceneConfig {
            colors: vec!["RED".into(), "MAGENTA".into()],
            ..no_scene_dp.clone()
        };
        assert!(bad_colour.validate(&device).unwrap_err().to_string().contains("MAGENTA"));

        let no_colours = SceneConfig {
            colors: vec![],
            ..no_scene_dp
        };
        assert!(no_colours.validate(&device).is_err());
    }
}
