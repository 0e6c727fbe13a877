//! Data-point (DP) vocabulary: the roles a projector exposes, the validated
//! index map binding roles to DP numbers, snapshots received from the device
//! and the set requests sent to it.

use crate::error::{ProjectorError, Result};
use bitflags::bitflags;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub type DpIndex = u32;

const KEY_DPS: &str = "dps";
const KEY_DATA: &str = "data";

/// Named roles a DP index can play on a projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DpRole {
    PowerState,
    Mode,
    Rotation,
    ColorState,
    Color,
    LaserState,
    LaserBrightness,
    Scene,
}

impl DpRole {
    pub const ALL: [DpRole; 8] = [
        DpRole::PowerState,
        DpRole::Mode,
        DpRole::Rotation,
        DpRole::ColorState,
        DpRole::Color,
        DpRole::LaserState,
        DpRole::LaserBrightness,
        DpRole::Scene,
    ];

    /// Configuration key of the role.
    pub fn key(&self) -> &'static str {
        match self {
            DpRole::PowerState => "powerState",
            DpRole::Mode => "mode",
            DpRole::Rotation => "rotation",
            DpRole::ColorState => "colorState",
            DpRole::Color => "color",
            DpRole::LaserState => "laserState",
            DpRole::LaserBrightness => "laserBrightness",
            DpRole::Scene => "scene",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.key() == key)
    }
}

impl fmt::Display for DpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

bitflags! {
    /// Optional hardware features of a projector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        const ROTATION = 0b001;
        const COLOR = 0b010;
        const LASER = 0b100;
    }
}

impl Capabilities {
    /// DP roles that must be mapped for these capabilities. Power is always
    /// required; scenes additionally need `mode` and `scene`.
    pub fn required_roles(&self, with_scenes: bool) -> Vec<DpRole> {
        let mut roles = vec![DpRole::PowerState];
        if self.contains(Capabilities::ROTATION) {
            roles.push(DpRole::Rotation);
        }
        if self.contains(Capabilities::COLOR) {
            roles.extend([DpRole::Mode, DpRole::ColorState, DpRole::Color]);
        }
        if self.contains(Capabilities::LASER) {
            roles.extend([DpRole::LaserState, DpRole::LaserBrightness]);
        }
        if with_scenes {
            roles.extend([DpRole::Mode, DpRole::Scene]);
        }
        roles.sort();
        roles.dedup();
        roles
    }
}

/// Validated mapping from roles to DP indices. No two roles share an index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DpMap {
    indices: BTreeMap<DpRole, DpIndex>,
}

impl DpMap {
    /// Builds a map from role/index pairs, rejecting an index claimed twice.
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (DpRole, DpIndex)>,
    {
        let mut indices = BTreeMap::new();
        for (role, index) in pairs {
            if let Some((other, _)) = indices.iter().find(|(r, i)| **i == index && **r != role) {
                return Err(ProjectorError::Configuration(format!(
                    "DP {} is assigned to both '{}' and '{}'",
                    index, other, role
                )));
            }
            indices.insert(role, index);
        }
        Ok(Self { indices })
    }

    /// Builds a map from configuration keys (`powerState`, `rotation`, ...)
    /// and checks that every role required by `capabilities` is present.
    pub fn from_named(
        named: &BTreeMap<String, DpIndex>,
        capabilities: Capabilities,
        with_scenes: bool,
    ) -> Result<Self> {
        let mut pairs = Vec::with_capacity(named.len());
        for (key, index) in named {
            let role = DpRole::from_key(key).ok_or_else(|| {
                ProjectorError::Configuration(format!("unknown DP role '{}'", key))
            })?;
            pairs.push((role, *index));
        }
        let map = Self::from_pairs(pairs)?;

        let missing: Vec<&str> = capabilities
            .required_roles(with_scenes)
            .into_iter()
            .filter(|role| !map.indices.contains_key(role))
            .map(|role| role.key())
            .collect();
        if !missing.is_empty() {
            return Err(ProjectorError::Configuration(format!(
                "missing DP index for {}",
                missing.join(", ")
            )));
        }
        Ok(map)
    }

    pub fn get(&self, role: DpRole) -> Option<DpIndex> {
        self.indices.get(&role).copied()
    }

    /// Looks up a role that validation guaranteed to be present.
    pub fn require(&self, role: DpRole) -> Result<DpIndex> {
        self.get(role).ok_or_else(|| {
            ProjectorError::Configuration(format!("no DP index configured for '{}'", role))
        })
    }
}

/// The DP values carried by one device report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DpSnapshot {
    values: BTreeMap<DpIndex, Value>,
}

impl DpSnapshot {
    pub fn from_pairs<I, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (DpIndex, V)>,
        V: Into<Value>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    /// Extracts the `dps` object from a device payload. Both the flat
    /// (`{"dps": {...}}`) and the nested v3.4 (`{"data": {"dps": {...}}}`)
    /// shapes are accepted. Non-numeric keys are skipped.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let dps = payload
            .get(KEY_DPS)
            .or_else(|| payload.get(KEY_DATA).and_then(|d| d.get(KEY_DPS)))?
            .as_object()?;

        let values = dps
            .iter()
            .filter_map(|(k, v)| k.parse::<DpIndex>().ok().map(|i| (i, v.clone())))
            .collect();
        Some(Self { values })
    }

    pub fn get(&self, index: DpIndex) -> Option<&Value> {
        self.values.get(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DpIndex, &Value)> {
        self.values.iter()
    }
}

/// A write to the device: one DP, or several DPs applied as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum SetRequest {
    Single { dp: DpIndex, value: Value },
    Multiple { data: BTreeMap<DpIndex, Value> },
}

impl SetRequest {
    pub fn single(dp: DpIndex, value: impl Into<Value>) -> Self {
        SetRequest::Single {
            dp,
            value: value.into(),
        }
    }

    pub fn multiple<I, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (DpIndex, V)>,
        V: Into<Value>,
    {
        SetRequest::Multiple {
            data: pairs.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    /// The `dps` JSON object sent on the wire (DP numbers as string keys).
    pub fn to_dps(&self) -> Value {
        let mut obj = Map::new();
        match self {
            SetRequest::Single { dp, value } => {
                obj.insert(dp.to_string(), value.clone());
            }
            SetRequest::Multiple { data } => {
                for (dp, value) in data {
                    obj.insert(dp.to_string(), value.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Value this request writes to `dp`, if any.
    pub fn value_of(&self, dp: DpIndex) -> Option<&Value> {
        match self {
            SetRequest::Single { dp: d, value } if *d == dp => Some(value),
            SetRequest::Single { .. } => None,
            SetRequest::Multiple { data } => data.get(&dp),
        }
    }
}
