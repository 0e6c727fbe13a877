//! Capability records handed to the host. Each optional service is either
//! present and wired to its controller, or absent for the life of the
//! accessory.

use crate::characteristic::Characteristic;
use crate::codec::{BRIGHTNESS_MAX, HUE_MAX, SATURATION_MAX};
use crate::dp::Capabilities;

pub const ROTATION_ACTIVE: u8 = 1;
pub const ROTATION_INACTIVE: u8 = 0;
pub const ROTATION_SPEED_MIN: u8 = 1;
pub const ROTATION_SPEED_MAX: u8 = 100;

const DEFAULT_MANUFACTURER: &str = "Homebridge";
const DEFAULT_MODEL: &str = "Smart Projector";
const DEFAULT_SERIAL: &str = "SerialNumber";

/// Accessory information service contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_revision: String,
}

impl AccessoryInfo {
    /// Fills blanks with the defaults shown for unconfigured devices.
    pub fn new(
        manufacturer: Option<&str>,
        model: Option<&str>,
        serial_number: Option<&str>,
    ) -> Self {
        fn or_default(value: Option<&str>, default: &str) -> String {
            value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default)
                .to_string()
        }
        Self {
            manufacturer: or_default(manufacturer, DEFAULT_MANUFACTURER),
            model: or_default(model, DEFAULT_MODEL),
            serial_number: or_default(serial_number, DEFAULT_SERIAL),
            firmware_revision: crate::VERSION.to_string(),
        }
    }
}

impl Default for AccessoryInfo {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

/// Star rotation exposed as a fan.
#[derive(Debug, Clone)]
pub struct RotationService {
    /// 0 or 1
    pub active: Characteristic<u8>,
    /// 1–100
    pub speed: Characteristic<u8>,
}

#[derive(Debug, Clone)]
pub struct ColorService {
    pub on: Characteristic<bool>,
    pub hue: Characteristic<u16>,
    pub saturation: Characteristic<u8>,
    pub brightness: Characteristic<u8>,
}

#[derive(Debug, Clone)]
pub struct LaserService {
    pub on: Characteristic<bool>,
    pub brightness: Characteristic<u8>,
}

/// Every characteristic a projector accessory can expose.
#[derive(Debug, Clone)]
pub struct ProjectorServices {
    pub power: Characteristic<bool>,
    pub rotation: Option<RotationService>,
    pub color: Option<ColorService>,
    pub laser: Option<LaserService>,
}

impl ProjectorServices {
    /// Resolves the service set once from the capability flags.
    pub fn for_capabilities(capabilities: Capabilities) -> Self {
        let rotation = capabilities
            .contains(Capabilities::ROTATION)
            .then(|| RotationService {
                active: Characteristic::ranged(
                    "Active",
                    ROTATION_INACTIVE,
                    ROTATION_INACTIVE,
                    ROTATION_ACTIVE,
                ),
                speed: Characteristic::ranged(
                    "RotationSpeed",
                    ROTATION_SPEED_MIN,
                    ROTATION_SPEED_MIN,
                    ROTATION_SPEED_MAX,
                ),
            });
        let color = capabilities
            .contains(Capabilities::COLOR)
            .then(|| ColorService {
                on: Characteristic::new("On", false),
                hue: Characteristic::ranged("Hue", 0, 0, HUE_MAX),
                saturation: Characteristic::ranged("Saturation", 0, 0, SATURATION_MAX),
                brightness: Characteristic::ranged("Brightness", BRIGHTNESS_MAX, 0, BRIGHTNESS_MAX),
            });
        let laser = capabilities
            .contains(Capabilities::LASER)
            .then(|| LaserService {
                on: Characteristic::new("On", false),
                brightness: Characteristic::ranged("Brightness", BRIGHTNESS_MAX, 0, BRIGHTNESS_MAX),
            });

        let power = Characteristic::new("On", false);
        // Nothing is known about the device until the session connects.
        power.mark_unreachable();

        Self {
            power,
            rotation,
            color,
            laser,
        }
    }
}

/// A scene accessory has a single momentary switch.
#[derive(Debug, Clone)]
pub struct SceneServices {
    pub switch: Characteristic<bool>,
}

impl SceneServices {
    pub fn new() -> Self {
        Self {
            switch: Characteristic::new("On", false),
        }
    }
}

impl Default for SceneServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::Reading;

    #[test]
    fn test_services_follow_capabilities() {
        let services = ProjectorServices::for_capabilities(Capabilities::ROTATION);
        assert!(services.rotation.is_some());
        assert!(services.color.is_none());
        assert!(services.laser.is_none());
        assert_eq!(services.power.reading(), Reading::Unreachable);

        let all = ProjectorServices::for_capabilities(Capabilities::all());
        assert!(all.rotation.is_some() && all.color.is_some() && all.laser.is_some());
    }

    #[test]
    fn test_accessory_info_defaults() {
        let info = AccessoryInfo::new(Some("Acme"), Some(""), None);
        assert_eq!(info.manufacturer, "Acme");
        assert_eq!(info.model, "Smart Projector");
        assert_eq!(info.serial_number, "SerialNumber");
        assert_eq!(info.firmware_revision, crate::VERSION);
    }
}
