//! Show file loading and saving.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::lamp_types::{
    ActionSpec, ChainSpec, ChannelMapping, EffectSpec, EventTable, GlobalsSpec, Lamp, OutputSpec,
};
use crate::midi::MidiConfig;
use crate::osc::OscConfig;
use crate::registry::EffectRegistry;

#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize show: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Duplicate chain id: {0}")]
    DuplicateChain(String),
    #[error("Chain {0}: tick_rate must be greater than 0")]
    ZeroTickRate(String),
    #[error("Chain {chain}: duplicate effect id {effect}")]
    DuplicateEffect { chain: String, effect: String },
    #[error("Invalid global {key}: {reason}")]
    InvalidGlobal { key: &'static str, reason: String },
}

/// Everything stored in a show file.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct ShowConfig {
    pub globals: GlobalsSpec,
    pub chains: Vec<ChainSpec>,
    pub events: EventTable,
    pub midi: MidiConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osc: Option<OscConfig>,
}

/// Show written when no file exists yet: one demo strip on a null output.
pub fn default_show() -> ShowConfig {
    let strip = ChainSpec {
        id: "strip".into(),
        priority: 0,
        tick_rate: 40,
        lamp_count: 30,
        effects: vec![
            EffectSpec::new("base", "rainbow").with_group("basic_color"),
            EffectSpec::new("solid", "solid_color")
                .with_group("basic_color")
                .disabled(),
            EffectSpec::new("pulse", "blink").disabled(),
            EffectSpec::new("master", "intensity"),
        ],
        output: OutputSpec::null(ChannelMapping::Rgbw),
    };
    let toggle = |effect_id: &str, enabled| ActionSpec::ToggleEffect {
        chain_id: "strip".into(),
        effect_id: effect_id.into(),
        enabled,
    };
    let events = EventTable::from([
        ("rainbow".to_string(), vec![toggle("base", true)]),
        ("solid".to_string(), vec![toggle("solid", true)]),
        ("pulse_on".to_string(), vec![toggle("pulse", true)]),
        ("pulse_off".to_string(), vec![toggle("pulse", false)]),
    ]);
    ShowConfig {
        chains: vec![strip],
        events,
        ..ShowConfig::default()
    }
}

/// Loads the show at `path`, writing [`default_show`] there first when the
/// file does not exist. Effect arguments missing from the file are filled
/// from the registry and the file is rewritten if anything was added.
pub fn load_or_create(path: &Path, registry: &EffectRegistry) -> Result<ShowConfig, ConfigFileError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(source) => {
            return Err(ConfigFileError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let Some(text) = text else {
        info!(path = %path.display(), "show file not found, writing default show");
        let mut config = default_show();
        fill_effect_defaults(&mut config, registry);
        save(&config, path)?;
        return Ok(config);
    };

    let mut config: ShowConfig =
        serde_json::from_str(&text).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    validate(&config)?;

    if fill_effect_defaults(&mut config, registry) {
        info!(path = %path.display(), "adding default effect arguments to show file");
        if let Err(e) = save(&config, path) {
            warn!("could not update show file: {e}");
        }
    }
    Ok(config)
}

/// Adds declared defaults for every effect argument the show leaves out.
/// Returns whether anything was added.
pub fn fill_effect_defaults(config: &mut ShowConfig, registry: &EffectRegistry) -> bool {
    let mut changed = false;
    let chain_effects = config.chains.iter_mut().flat_map(|c| c.effects.iter_mut());
    let event_effects = config.events.values_mut().flatten().filter_map(|a| match a {
        ActionSpec::AddEffect { effect, .. } => Some(effect),
        _ => None,
    });
    for effect in chain_effects.chain(event_effects) {
        if !registry.contains(&effect.kind) {
            warn!(effect = %effect.id, kind = %effect.kind, "unknown effect type, arguments left as-is");
            continue;
        }
        changed |= registry.fill_defaults(&effect.kind, &mut effect.args);
    }
    changed
}

pub fn validate(config: &ShowConfig) -> Result<(), ConfigFileError> {
    if !(config.globals.bpm.is_finite() && config.globals.bpm > 0.0) {
        return Err(ConfigFileError::InvalidGlobal {
            key: "bpm",
            reason: format!("{} is not greater than 0", config.globals.bpm),
        });
    }
    for (key, color) in [("color1", &config.globals.color1), ("color2", &config.globals.color2)] {
        if Lamp::from_hex(color).is_none() {
            return Err(ConfigFileError::InvalidGlobal {
                key,
                reason: format!("'{color}' is not a 6-digit hex color"),
            });
        }
    }

    let mut chain_ids = BTreeSet::new();
    for chain in &config.chains {
        if !chain_ids.insert(chain.id.as_str()) {
            return Err(ConfigFileError::DuplicateChain(chain.id.clone()));
        }
        if chain.tick_rate == 0 {
            return Err(ConfigFileError::ZeroTickRate(chain.id.clone()));
        }
        let mut effect_ids = BTreeSet::new();
        for effect in &chain.effects {
            if !effect_ids.insert(effect.id.as_str()) {
                return Err(ConfigFileError::DuplicateEffect {
                    chain: chain.id.clone(),
                    effect: effect.id.clone(),
                });
            }
        }
    }
    Ok(())
}

pub fn save(config: &ShowConfig, path: &Path) -> Result<(), ConfigFileError> {
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json).map_err(|source| ConfigFileError::Write {
        path: path.to_path_buf(),
        source,
    })
}
