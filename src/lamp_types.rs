//! Lamp and Show Types
//!
//! This module defines the declarative data model of a show:
//!
//! ## Lamps
//! - [`Lamp`] - One addressable pixel/fixture with R, G, B and W channels
//! - [`ChannelMapping`] - How a lamp's channels are laid out on the wire
//! - [`LampLayout`] - Mapping plus channel count for one chain/output pairing
//!
//! ## Chains
//! - [`ChainSpec`] - One independently scheduled fixture group
//! - [`EffectSpec`] - One effect entry within a chain
//! - [`OutputSpec`] / [`SinkSpec`] - Where a chain's frames go
//!
//! ## Live control
//! - [`GlobalsSpec`] - Persisted tempo, palette and intensity
//! - [`ActionSpec`] - One declarative mutation
//! - [`EventTable`] - Event name to ordered action list

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Named effect parameters as they appear in the show file.
pub type EffectArgs = BTreeMap<String, Value>;

/// Event name to the ordered list of actions it runs.
pub type EventTable = BTreeMap<String, Vec<ActionSpec>>;

/// A single addressable lamp.
/// Each field holds an 8-bit channel value (0-255).
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Lamp {
    /// Red channel value (0-255)
    pub r: u8,
    /// Green channel value (0-255)
    pub g: u8,
    /// Blue channel value (0-255)
    pub b: u8,
    /// White channel value (0-255) - only meaningful on RGBW layouts
    pub w: u8,
}

impl Lamp {
    pub const BLACK: Lamp = Lamp::rgbw(0, 0, 0, 0);
    pub const WHITE: Lamp = Lamp::rgbw(255, 255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, w: 0 }
    }

    pub const fn rgbw(r: u8, g: u8, b: u8, w: u8) -> Self {
        Self { r, g, b, w }
    }

    /// Parses `RRGGBB` or `#RRGGBB`. The white channel is always 0.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self::rgb(r, g, b))
    }

    pub fn to_hex(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    /// Multiplies every channel by `factor`, saturating at 0 and 255.
    pub fn scaled(self, factor: f64) -> Self {
        let scale = |v: u8| (v as f64 * factor).clamp(0.0, 255.0) as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
            w: scale(self.w),
        }
    }
}

/// Channel layout of a lamp on the wire.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Debug,
    strum::Display,
    strum::EnumString,
)]
pub enum ChannelMapping {
    #[serde(rename = "RGB")]
    #[strum(serialize = "RGB")]
    Rgb,
    #[default]
    #[serde(rename = "RGBW")]
    #[strum(serialize = "RGBW")]
    Rgbw,
}

impl ChannelMapping {
    pub fn default_channels(&self) -> u8 {
        match self {
            ChannelMapping::Rgb => 3,
            ChannelMapping::Rgbw => 4,
        }
    }
}

/// Channel mapping and channel count for one chain/output pairing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LampLayout {
    pub mapping: ChannelMapping,
    pub channels_per_lamp: u8,
}

impl LampLayout {
    pub fn new(mapping: ChannelMapping, channels_per_lamp: u8) -> Self {
        Self {
            mapping,
            channels_per_lamp,
        }
    }

    /// Whether the W channel reaches the hardware for this layout.
    pub fn has_white(&self) -> bool {
        self.channels_per_lamp == 4 && self.mapping == ChannelMapping::Rgbw
    }

    /// Applies the white rule: W is kept only on a 4-channel RGBW layout.
    pub fn fit(&self, lamp: Lamp) -> Lamp {
        if self.has_white() {
            lamp
        } else {
            Lamp { w: 0, ..lamp }
        }
    }
}

impl Default for LampLayout {
    fn default() -> Self {
        Self::new(ChannelMapping::Rgbw, 4)
    }
}

fn default_true() -> bool {
    true
}

/// One effect entry within a chain.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct EffectSpec {
    /// Identifier, unique within its chain
    pub id: String,
    /// Registry key of the effect type (e.g. "solid_color")
    #[serde(rename = "type")]
    pub kind: String,
    /// Named parameters passed to the constructor
    #[serde(default)]
    pub args: EffectArgs,
    /// Disabled effects stay in the list but are not constructed
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Exclusivity group. At most one enabled member per group per chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl EffectSpec {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            args: EffectArgs::new(),
            enabled: true,
            group: None,
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The exclusivity group, with an empty string treated as no group.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref().filter(|g| !g.is_empty())
    }
}

/// Where a chain sends its frames.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    /// Frames are computed and discarded
    Null,
    /// USB DMX interface on a serial port
    DmxSerial {
        port: String,
        /// First DMX channel (1-based) of lamp 0
        #[serde(default = "default_start_channel")]
        start_channel: usize,
    },
}

fn default_start_channel() -> usize {
    1
}

/// Output binding of a chain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct OutputSpec {
    #[serde(flatten)]
    pub sink: SinkSpec,
    #[serde(default)]
    pub channel_mapping: ChannelMapping,
    /// Defaults to 3 for RGB and 4 for RGBW
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels_per_lamp: Option<u8>,
    /// Upper bound for one send; no bound when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_timeout_ms: Option<u64>,
}

impl OutputSpec {
    pub fn null(channel_mapping: ChannelMapping) -> Self {
        Self {
            sink: SinkSpec::Null,
            channel_mapping,
            channels_per_lamp: None,
            send_timeout_ms: None,
        }
    }

    pub fn layout(&self) -> LampLayout {
        LampLayout::new(
            self.channel_mapping,
            self.channels_per_lamp
                .unwrap_or_else(|| self.channel_mapping.default_channels()),
        )
    }
}

/// One independently scheduled fixture group.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ChainSpec {
    /// Unique chain identifier
    pub id: String,
    /// Reserved, never used for scheduling
    #[serde(default)]
    pub priority: i32,
    /// Frames per second
    pub tick_rate: u32,
    /// Number of lamps, fixed for the chain's lifetime
    pub lamp_count: usize,
    #[serde(default)]
    pub effects: Vec<EffectSpec>,
    pub output: OutputSpec,
}

/// Persisted global parameters.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct GlobalsSpec {
    pub bpm: f64,
    /// Hex color, `RRGGBB`
    pub color1: String,
    /// Hex color, `RRGGBB`
    pub color2: String,
    pub intensity: u8,
}

impl Default for GlobalsSpec {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            color1: String::from("FF0000"),
            color2: String::from("0000FF"),
            intensity: 255,
        }
    }
}

/// Keys accepted by [`ActionSpec::SetGlobal`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum GlobalKey {
    Bpm,
    Color1,
    Color2,
    Intensity,
}

/// One declarative mutation run by an event.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    #[strum(serialize = "add_effect {chain_id}")]
    AddEffect { chain_id: String, effect: EffectSpec },
    #[strum(serialize = "remove_effect {chain_id}/{effect_id}")]
    RemoveEffect { chain_id: String, effect_id: String },
    #[strum(serialize = "toggle_effect {chain_id}/{effect_id} -> {enabled}")]
    ToggleEffect {
        chain_id: String,
        effect_id: String,
        enabled: bool,
    },
    #[strum(serialize = "set_global {key} = {value}")]
    SetGlobal { key: String, value: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hex_colors_parse_with_or_without_hash() {
        assert_eq!(Lamp::from_hex("#FF8000"), Some(Lamp::rgb(255, 128, 0)));
        assert_eq!(Lamp::from_hex("00ff00"), Some(Lamp::rgb(0, 255, 0)));
        assert_eq!(Lamp::from_hex("FF80"), None);
        assert_eq!(Lamp::from_hex("GG0000"), None);
        assert_eq!(Lamp::rgb(1, 2, 255).to_hex(), "0102FF");
    }

    #[test]
    fn white_survives_only_on_four_channel_rgbw() {
        let lamp = Lamp::rgbw(1, 2, 3, 4);
        assert_eq!(LampLayout::new(ChannelMapping::Rgbw, 4).fit(lamp).w, 4);
        assert_eq!(LampLayout::new(ChannelMapping::Rgbw, 3).fit(lamp).w, 0);
        assert_eq!(LampLayout::new(ChannelMapping::Rgb, 4).fit(lamp).w, 0);
    }

    #[test]
    fn effect_spec_defaults_to_enabled() {
        let spec: EffectSpec =
            serde_json::from_value(json!({"id": "a", "type": "dim", "group": ""})).unwrap();
        assert!(spec.enabled);
        assert!(spec.args.is_empty());
        assert_eq!(spec.group(), None);
    }

    #[test]
    fn output_spec_reads_flattened_sink() {
        let spec: OutputSpec = serde_json::from_value(json!({
            "type": "dmx_serial",
            "port": "/dev/ttyUSB0",
            "channel_mapping": "RGB"
        }))
        .unwrap();
        assert_eq!(
            spec.sink,
            SinkSpec::DmxSerial {
                port: "/dev/ttyUSB0".into(),
                start_channel: 1
            }
        );
        assert_eq!(spec.layout(), LampLayout::new(ChannelMapping::Rgb, 3));
    }

    #[test]
    fn actions_are_tagged_by_type() {
        let action: ActionSpec = serde_json::from_value(json!({
            "type": "toggle_effect",
            "chain_id": "strip",
            "effect_id": "blink",
            "enabled": false
        }))
        .unwrap();
        assert_eq!(
            action,
            ActionSpec::ToggleEffect {
                chain_id: "strip".into(),
                effect_id: "blink".into(),
                enabled: false
            }
        );
        assert_eq!("color2".parse::<GlobalKey>().unwrap(), GlobalKey::Color2);
        assert!("tempo".parse::<GlobalKey>().is_err());
    }
}
