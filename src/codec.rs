//! Conversions between host colour/scene values and the projector's packed
//! hex encodings. Everything here is pure and allocation-light.

use crate::error::{ProjectorError, Result};
use std::fmt;
use std::str::FromStr;

pub const HUE_MAX: u16 = 360;
pub const SATURATION_MAX: u8 = 100;
pub const BRIGHTNESS_MAX: u8 = 100;

/// Number of colour slots in the scene layout.
pub const SCENE_SLOTS: usize = 7;

const LEGACY_LEN: usize = 14;
const EXTENDED_LEN: usize = 12;
const SCENE_HEADER_LEN: usize = 6;
/// Total length of an encoded scene, independent of how many colours it uses.
pub const SCENE_LEN: usize = SCENE_HEADER_LEN + SCENE_SLOTS * EXTENDED_LEN;

const LEGACY_CHANNEL_MAX: u32 = 255;
const EXTENDED_CHANNEL_MAX: u32 = 1000;

/// Host-side colour triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hsb {
    /// 0–360
    pub hue: u16,
    /// 0–100
    pub saturation: u8,
    /// 0–100
    pub brightness: u8,
}

impl Hsb {
    /// Builds a triple, clamping each channel into its host range.
    pub fn new(hue: u16, saturation: u8, brightness: u8) -> Self {
        Self {
            hue,
            saturation,
            brightness,
        }
        .clamped()
    }

    pub fn clamped(self) -> Self {
        Self {
            hue: self.hue.min(HUE_MAX),
            saturation: self.saturation.min(SATURATION_MAX),
            brightness: self.brightness.min(BRIGHTNESS_MAX),
        }
    }
}

impl fmt::Display for Hsb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hue={} saturation={} brightness={}",
            self.hue, self.saturation, self.brightness
        )
    }
}

/// Packed colour layouts used by different firmware generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    /// `RRGGBB` + hue(4) + saturation(2, 0–255) + value(2, 0–255)
    Legacy,
    /// hue(4) + saturation(4, 0–1000) + value(4, 0–1000)
    #[default]
    Extended,
}

impl ColorFormat {
    pub fn encoded_len(&self) -> usize {
        match self {
            ColorFormat::Legacy => LEGACY_LEN,
            ColorFormat::Extended => EXTENDED_LEN,
        }
    }
}

impl FromStr for ColorFormat {
    type Err = ProjectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "v1" => Ok(ColorFormat::Legacy),
            "extended" | "v2" => Ok(ColorFormat::Extended),
            other => Err(ProjectorError::Configuration(format!(
                "unknown colour format '{}'",
                other
            ))),
        }
    }
}

/// Detects the packed layout of a device colour string by its length.
pub fn detect_format(raw: &str) -> Result<ColorFormat> {
    match raw.len() {
        LEGACY_LEN => Ok(ColorFormat::Legacy),
        EXTENDED_LEN => Ok(ColorFormat::Extended),
        n => Err(ProjectorError::Decode(format!(
            "colour payload '{}' has unsupported length {}",
            raw, n
        ))),
    }
}

/// Encodes a host colour into the device's packed hex string.
pub fn hsb_to_device(color: Hsb, format: ColorFormat) -> String {
    let color = color.clamped();
    match format {
        ColorFormat::Legacy => {
            let [r, g, b] = hsb_to_rgb(color);
            format!(
                "{:02x}{:02x}{:02x}{:04x}{:02x}{:02x}",
                r,
                g,
                b,
                color.hue,
                scale_up(color.saturation, LEGACY_CHANNEL_MAX),
                scale_up(color.brightness, LEGACY_CHANNEL_MAX),
            )
        }
        ColorFormat::Extended => format!(
            "{:04x}{:04x}{:04x}",
            color.hue,
            scale_up(color.saturation, EXTENDED_CHANNEL_MAX),
            scale_up(color.brightness, EXTENDED_CHANNEL_MAX),
        ),
    }
}

/// Decodes a device colour string of either layout into a host triple.
pub fn device_to_hsb(raw: &str) -> Result<Hsb> {
    let format = detect_format(raw)?;
    if !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProjectorError::Decode(format!(
            "colour payload '{}' is not hex",
            raw
        )));
    }

    let (hue, saturation, value, channel_max) = match format {
        ColorFormat::Legacy => (
            hex_field(raw, 6, 10)?,
            hex_field(raw, 10, 12)?,
            hex_field(raw, 12, 14)?,
            LEGACY_CHANNEL_MAX,
        ),
        ColorFormat::Extended => (
            hex_field(raw, 0, 4)?,
            hex_field(raw, 4, 8)?,
            hex_field(raw, 8, 12)?,
            EXTENDED_CHANNEL_MAX,
        ),
    };

    if hue > HUE_MAX as u32 || saturation > channel_max || value > channel_max {
        return Err(ProjectorError::Decode(format!(
            "colour payload '{}' is out of range",
            raw
        )));
    }

    Ok(Hsb {
        hue: hue as u16,
        saturation: scale_down(saturation, channel_max),
        brightness: scale_down(value, channel_max),
    })
}

fn hex_field(raw: &str, start: usize, end: usize) -> Result<u32> {
    u32::from_str_radix(&raw[start..end], 16)
        .map_err(|e| ProjectorError::Decode(format!("bad hex field in '{}': {}", raw, e)))
}

/// Host percentage (0–100) to a device channel (0–`max`), rounded.
fn scale_up(percent: u8, max: u32) -> u32 {
    (percent as u32 * max + 50) / 100
}

/// Device channel (0–`max`) to a host percentage (0–100), rounded.
fn scale_down(value: u32, max: u32) -> u8 {
    ((value * 100 + max / 2) / max).min(100) as u8
}

fn hsb_to_rgb(color: Hsb) -> [u8; 3] {
    let h = (color.hue % 360) as f64 / 60.0;
    let s = color.saturation as f64 / 100.0;
    let v = color.brightness as f64 / 100.0;

    let c = v * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    [r, g, b].map(|ch| ((ch + m) * 255.0).round().clamp(0.0, 255.0) as u8)
}

// -------------------------------------------------------------------------
// Scenes
// -------------------------------------------------------------------------

/// Animation shape of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneShape {
    #[default]
    Static,
    Flash,
    Breath,
}

impl SceneShape {
    /// Maps a configured mode name onto a shape. Anything that is not
    /// FLASH or BREATH is static.
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode.map(|m| m.to_ascii_uppercase()).as_deref() {
            Some("FLASH") => SceneShape::Flash,
            Some("BREATH") => SceneShape::Breath,
            _ => SceneShape::Static,
        }
    }

    fn flag(&self) -> u8 {
        match self {
            SceneShape::Static => 0x01,
            SceneShape::Flash => 0x02,
            SceneShape::Breath => 0x04,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0x01 => Some(SceneShape::Static),
            0x02 => Some(SceneShape::Flash),
            0x04 => Some(SceneShape::Breath),
            _ => None,
        }
    }
}

/// Colours a scene may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedColor {
    Red,
    Green,
    Blue,
    Orange,
    Yellow,
    Purple,
    Cyan,
}

impl NamedColor {
    pub const ALL: [NamedColor; 7] = [
        NamedColor::Red,
        NamedColor::Green,
        NamedColor::Blue,
        NamedColor::Orange,
        NamedColor::Yellow,
        NamedColor::Purple,
        NamedColor::Cyan,
    ];

    /// Canonical palette entry.
    pub fn hsb(&self) -> Hsb {
        let hue = match self {
            NamedColor::Red => 0,
            NamedColor::Orange => 30,
            NamedColor::Yellow => 60,
            NamedColor::Green => 120,
            NamedColor::Cyan => 180,
            NamedColor::Blue => 240,
            NamedColor::Purple => 280,
        };
        Hsb::new(hue, SATURATION_MAX, BRIGHTNESS_MAX)
    }

    pub fn name(&self) -> &'static str {
        match self {
            NamedColor::Red => "RED",
            NamedColor::Green => "GREEN",
            NamedColor::Blue => "BLUE",
            NamedColor::Orange => "ORANGE",
            NamedColor::Yellow => "YELLOW",
            NamedColor::Purple => "PURPLE",
            NamedColor::Cyan => "CYAN",
        }
    }

    fn from_hsb(color: Hsb) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.hsb() == color)
    }
}

impl FromStr for NamedColor {
    type Err = ProjectorError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == upper)
            .ok_or_else(|| ProjectorError::Configuration(format!("unsupported colour '{}'", s)))
    }
}

impl fmt::Display for NamedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declarative scene: shape, rotation speed and an ordered colour list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneDescriptor {
    pub shape: SceneShape,
    /// 1–100
    pub rotation_speed: u8,
    /// At most [`SCENE_SLOTS`] are encoded; extras are dropped.
    pub colors: Vec<NamedColor>,
}

/// Encodes a scene into the fixed-length scene DP string.
pub fn scene_to_device(scene: &SceneDescriptor) -> String {
    let used = scene.colors.len().min(SCENE_SLOTS);
    let mut out = String::with_capacity(SCENE_LEN);
    out.push_str(&format!(
        "{:02x}{:02x}{:02x}",
        scene.shape.flag(),
        scene.rotation_speed.clamp(1, 100),
        used
    ));

    for slot in 0..SCENE_SLOTS {
        match scene.colors.get(slot).filter(|_| slot < used) {
            Some(color) => out.push_str(&hsb_to_device(color.hsb(), ColorFormat::Extended)),
            None => out.push_str(&"0".repeat(EXTENDED_LEN)),
        }
    }
    out
}

/// Decodes a scene DP string produced by [`scene_to_device`].
pub fn device_to_scene(raw: &str) -> Result<SceneDescriptor> {
    if raw.len() != SCENE_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProjectorError::Decode(format!(
            "scene payload of length {} is malformed",
            raw.len()
        )));
    }

    let flag = hex_field(raw, 0, 2)? as u8;
    let shape = SceneShape::from_flag(flag)
        .ok_or_else(|| ProjectorError::Decode(format!("unknown scene shape flag {:#04x}", flag)))?;
    let rotation_speed = hex_field(raw, 2, 4)? as u8;
    let count = hex_field(raw, 4, 6)? as usize;
    if count > SCENE_SLOTS {
        return Err(ProjectorError::Decode(format!(
            "scene declares {} colours, at most {} fit",
            count, SCENE_SLOTS
        )));
    }

    let mut colors = Vec::with_capacity(count);
    for slot in 0..count {
        let start = SCENE_HEADER_LEN + slot * EXTENDED_LEN;
        let hsb = device_to_hsb(&raw[start..start + EXTENDED_LEN])?;
        let color = NamedColor::from_hsb(hsb).ok_or_else(|| {
            ProjectorError::Decode(format!("scene slot {} holds an unnamed colour ({})", slot, hsb))
        })?;
        colors.push(color);
    }

    Ok(SceneDescriptor {
        shape,
        rotation_speed,
        colors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Hsb, b: Hsb) {
        assert!(a.hue.abs_diff(b.hue) <= 1, "{} vs {}", a, b);
        assert!(a.saturation.abs_diff(b.saturation) <= 1, "{} vs {}", a, b);
        assert!(a.brightness.abs_diff(b.brightness) <= 1, "{} vs {}", a, b);
    }

    #[test]
    fn test_extended_encoding() {
        assert_eq!(
            hsb_to_device(Hsb::new(120, 50, 100), ColorFormat::Extended),
            "007801f403e8"
        );
        assert_eq!(
            device_to_hsb("007801f403e8").unwrap(),
            Hsb::new(120, 50, 100)
        );
    }

    #[test]
    fn test_legacy_encoding() {
        // Pure red: rgb ff0000, hue 0, saturation/value 255.
        assert_eq!(
            hsb_to_device(Hsb::new(0, 100, 100), ColorFormat::Legacy),
            "ff00000000ffff"
        );
        assert_eq!(
            device_to_hsb("ff00000000ffff").unwrap(),
            Hsb::new(0, 100, 100)
        );
        // Upper-case payloads from older firmware are accepted too.
        assert_eq!(
            device_to_hsb("00FF000078FFFF").unwrap(),
            Hsb::new(120, 100, 100)
        );
    }

    #[test]
    fn test_round_trip_within_one_unit() {
        for format in [ColorFormat::Legacy, ColorFormat::Extended] {
            for hue in (0..=HUE_MAX).step_by(7) {
                for saturation in 0..=SATURATION_MAX {
                    for brightness in (0..=BRIGHTNESS_MAX).step_by(3) {
                        let input = Hsb::new(hue, saturation, brightness);
                        let encoded = hsb_to_device(input, format);
                        assert_eq!(encoded.len(), format.encoded_len());
                        let decoded = device_to_hsb(&encoded).unwrap();
                        assert_close(input, decoded);
                    }
                }
            }
        }
    }

    #[test]
    fn test_encode_clamps_out_of_range_input() {
        let wild = Hsb {
            hue: 999,
            saturation: 250,
            brightness: 101,
        };
        assert_eq!(
            device_to_hsb(&hsb_to_device(wild, ColorFormat::Extended)).unwrap(),
            Hsb::new(360, 100, 100)
        );
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(
            device_to_hsb("0078"),
            Err(ProjectorError::Decode(_))
        ));
        assert!(matches!(
            device_to_hsb("zz7801f403e8"),
            Err(ProjectorError::Decode(_))
        ));
        // Saturation 0x07d0 = 2000 exceeds the extended range.
        assert!(matches!(
            device_to_hsb("007807d003e8"),
            Err(ProjectorError::Decode(_))
        ));
        // Hue 0x0200 = 512 exceeds 360.
        assert!(matches!(
            device_to_hsb("020003e803e8"),
            Err(ProjectorError::Decode(_))
        ));
    }

    #[test]
    fn test_detect_format_by_length() {
        assert_eq!(detect_format("ff00000000ffff").unwrap(), ColorFormat::Legacy);
        assert_eq!(detect_format("000003e803e8").unwrap(), ColorFormat::Extended);
        assert!(detect_format("").is_err());
    }

    #[test]
    fn test_scene_has_fixed_length_and_round_trips() {
        for count in 1..=SCENE_SLOTS {
            let scene = SceneDescriptor {
                shape: SceneShape::Flash,
                rotation_speed: 40,
                colors: NamedColor::ALL[..count].to_vec(),
            };
            let encoded = scene_to_device(&scene);
            assert_eq!(encoded.len(), SCENE_LEN);
            assert_eq!(device_to_scene(&encoded).unwrap(), scene);
        }
    }

    #[test]
    fn test_scene_layout() {
        let scene = SceneDescriptor {
            shape: SceneShape::Breath,
            rotation_speed: 100,
            colors: vec![NamedColor::Blue],
        };
        let encoded = scene_to_device(&scene);
        assert_eq!(&encoded[..6], "046401");
        assert_eq!(&encoded[6..18], "00f003e803e8");
        assert!(encoded[18..].bytes().all(|b| b == b'0'));
    }

    #[test]
    fn test_scene_truncates_extra_colours() {
        let mut colors = NamedColor::ALL.to_vec();
        colors.push(NamedColor::Red);
        let scene = SceneDescriptor {
            shape: SceneShape::Static,
            rotation_speed: 50,
            colors,
        };
        let decoded = device_to_scene(&scene_to_device(&scene)).unwrap();
        assert_eq!(decoded.colors, NamedColor::ALL.to_vec());
    }

    #[test]
    fn test_named_colour_parsing() {
        assert_eq!("red".parse::<NamedColor>().unwrap(), NamedColor::Red);
        assert_eq!("CYAN".parse::<NamedColor>().unwrap(), NamedColor::Cyan);
        assert!("MAGENTA".parse::<NamedColor>().unwrap_err().is_configuration());
    }

    #[test]
    fn test_scene_shape_from_mode() {
        assert_eq!(SceneShape::from_mode(Some("FLASH")), SceneShape::Flash);
        assert_eq!(SceneShape::from_mode(Some("breath")), SceneShape::Breath);
        assert_eq!(SceneShape::from_mode(Some("DISCO")), SceneShape::Static);
        assert_eq!(SceneShape::from_mode(None), SceneShape::Static);
    }
}
