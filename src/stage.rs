//! Live show state and the event/action executor.
//!
//! A [`Stage`] owns the beat clock, the shared half of every chain and the
//! event table. Operator surfaces (MIDI, OSC, the command line) only call
//! [`Stage::trigger_event`]; each action runs in order, a failing action is
//! logged and skipped, and nothing is rolled back.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::chain::{ChainHandle, ChainRunner, enable_exclusively};
use crate::clock::{BeatClock, GlobalState};
use crate::config::ShowConfig;
use crate::lamp_types::{ActionSpec, ChainSpec, EffectSpec, EventTable, GlobalKey, GlobalsSpec, Lamp};
use crate::midi::MidiConfig;
use crate::osc::OscConfig;
use crate::output::{Output, OutputError};
use crate::registry::EffectRegistry;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Chain not found: {0}")]
    ChainNotFound(String),
    #[error("Effect {effect_id} not found in chain {chain_id}")]
    EffectNotFound { chain_id: String, effect_id: String },
    #[error("Event not found: {0}")]
    EventNotFound(String),
    #[error("Effect {effect_id} already exists in chain {chain_id}")]
    DuplicateEffect { chain_id: String, effect_id: String },
    #[error("Unknown global parameter: {0}")]
    UnknownGlobal(String),
    #[error("Invalid value for {key}: {reason}")]
    InvalidGlobal { key: GlobalKey, reason: String },
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Duplicate chain id: {0}")]
    DuplicateChain(String),
    #[error("Chain {0}: tick_rate must be greater than 0")]
    ZeroTickRate(String),
    #[error("Invalid globals: {0}")]
    Globals(#[from] ActionError),
    #[error("Chain {chain}: failed to open output: {source}")]
    Output { chain: String, source: OutputError },
}

/// Outcome of one [`Stage::trigger_event`] call.
#[derive(Debug, Default, PartialEq)]
pub struct EventReport {
    pub applied: usize,
    /// Failed actions with their description, in run order
    pub failures: Vec<(String, ActionError)>,
}

pub struct Stage {
    clock: Arc<BeatClock>,
    registry: Arc<EffectRegistry>,
    chains: Vec<Arc<ChainHandle>>,
    events: EventTable,
    /// Persisted view of the clock's settable fields
    globals: Mutex<GlobalsSpec>,
    midi: MidiConfig,
    osc: Option<OscConfig>,
}

impl Stage {
    /// Builds the stage and one runner per chain, opening each chain's
    /// output through `open_output`.
    pub fn assemble(
        config: &ShowConfig,
        registry: Arc<EffectRegistry>,
        mut open_output: impl FnMut(&ChainSpec) -> Result<Box<dyn Output>, OutputError>,
    ) -> Result<(Arc<Stage>, Vec<ChainRunner>), StageError> {
        let mut ids = BTreeSet::new();
        for chain in &config.chains {
            if !ids.insert(chain.id.as_str()) {
                return Err(StageError::DuplicateChain(chain.id.clone()));
            }
            if chain.tick_rate == 0 {
                return Err(StageError::ZeroTickRate(chain.id.clone()));
            }
        }

        let clock = Arc::new(BeatClock::new(initial_globals(&config.globals)?));
        let mut handles = Vec::with_capacity(config.chains.len());
        let mut runners = Vec::with_capacity(config.chains.len());
        for chain in &config.chains {
            let output = open_output(chain).map_err(|source| StageError::Output {
                chain: chain.id.clone(),
                source,
            })?;
            let handle = Arc::new(ChainHandle::new(chain.clone()));
            runners.push(ChainRunner::new(
                handle.clone(),
                clock.clone(),
                registry.clone(),
                output,
            ));
            handles.push(handle);
        }

        let stage = Arc::new(Stage {
            clock,
            registry,
            chains: handles,
            events: config.events.clone(),
            globals: Mutex::new(config.globals.clone()),
            midi: config.midi.clone(),
            osc: config.osc.clone(),
        });
        Ok((stage, runners))
    }

    pub fn clock(&self) -> &Arc<BeatClock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<EffectRegistry> {
        &self.registry
    }

    pub fn chain(&self, id: &str) -> Option<&Arc<ChainHandle>> {
        self.chains.iter().find(|c| c.id() == id)
    }

    pub fn chains(&self) -> &[Arc<ChainHandle>] {
        &self.chains
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn globals(&self) -> GlobalsSpec {
        self.globals.lock().clone()
    }

    /// Snapshot of the live show in its file form.
    pub fn to_config(&self) -> ShowConfig {
        ShowConfig {
            globals: self.globals(),
            chains: self.chains.iter().map(|c| c.to_spec()).collect(),
            events: self.events.clone(),
            midi: self.midi.clone(),
            osc: self.osc.clone(),
        }
    }

    /// Runs every action of `name` in order.
    ///
    /// Unknown events change nothing. Failing actions are logged and
    /// reported; the remaining actions still run.
    pub fn trigger_event(&self, name: &str) -> Result<EventReport, ActionError> {
        let Some(actions) = self.events.get(name) else {
            warn!(event = %name, "unknown event");
            return Err(ActionError::EventNotFound(name.to_string()));
        };
        info!(event = %name, actions = actions.len(), "triggering event");

        let mut report = EventReport::default();
        for action in actions {
            match self.apply(action) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(event = %name, %action, "action failed: {e}");
                    report.failures.push((action.to_string(), e));
                }
            }
        }
        Ok(report)
    }

    pub fn apply(&self, action: &ActionSpec) -> Result<(), ActionError> {
        match action {
            ActionSpec::AddEffect { chain_id, effect } => self.add_effect(chain_id, effect.clone()),
            ActionSpec::RemoveEffect {
                chain_id,
                effect_id,
            } => self.remove_effect(chain_id, effect_id),
            ActionSpec::ToggleEffect {
                chain_id,
                effect_id,
                enabled,
            } => self.toggle_effect(chain_id, effect_id, *enabled),
            ActionSpec::SetGlobal { key, value } => self.set_global(key, value),
        }
    }

    fn find_chain(&self, chain_id: &str) -> Result<&Arc<ChainHandle>, ActionError> {
        self.chain(chain_id)
            .ok_or_else(|| ActionError::ChainNotFound(chain_id.to_string()))
    }

    /// Appends `effect` to the chain. Effect ids stay unique per chain.
    pub fn add_effect(&self, chain_id: &str, effect: EffectSpec) -> Result<(), ActionError> {
        self.find_chain(chain_id)?.edit(|effects| {
            if effects.iter().any(|e| e.id == effect.id) {
                return Err(ActionError::DuplicateEffect {
                    chain_id: chain_id.to_string(),
                    effect_id: effect.id.clone(),
                });
            }
            effects.push(effect);
            Ok(())
        })
    }

    pub fn remove_effect(&self, chain_id: &str, effect_id: &str) -> Result<(), ActionError> {
        self.find_chain(chain_id)?.edit(|effects| {
            let index = position(effects, chain_id, effect_id)?;
            effects.remove(index);
            Ok(())
        })
    }

    /// Enabling a grouped effect disables the other enabled members of its
    /// group in the same edit.
    pub fn toggle_effect(&self, chain_id: &str, effect_id: &str, enabled: bool) -> Result<(), ActionError> {
        self.find_chain(chain_id)?.edit(|effects| {
            if enabled {
                if !enable_exclusively(effects, effect_id) {
                    return Err(ActionError::EffectNotFound {
                        chain_id: chain_id.to_string(),
                        effect_id: effect_id.to_string(),
                    });
                }
            } else {
                let index = position(effects, chain_id, effect_id)?;
                effects[index].enabled = false;
            }
            Ok(())
        })
    }

    /// Validates and applies one global parameter. Both the persisted globals
    /// and the live clock change, or neither does.
    pub fn set_global(&self, key: &str, value: &Value) -> Result<(), ActionError> {
        let key: GlobalKey = key
            .parse()
            .map_err(|_| ActionError::UnknownGlobal(key.to_string()))?;
        let mut globals = self.globals.lock();
        match key {
            GlobalKey::Bpm => {
                let bpm = parse_bpm(value)?;
                globals.bpm = bpm;
                self.clock.set_bpm(bpm);
            }
            GlobalKey::Color1 => {
                let color = parse_color(key, value)?;
                globals.color1 = color.to_hex();
                self.clock.set_color1(color);
            }
            GlobalKey::Color2 => {
                let color = parse_color(key, value)?;
                globals.color2 = color.to_hex();
                self.clock.set_color2(color);
            }
            GlobalKey::Intensity => {
                let intensity = value
                    .as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| invalid(key, format!("expected an integer from 0 to 255, got {value}")))?;
                globals.intensity = intensity;
                self.clock.set_intensity(intensity);
            }
        }
        info!(%key, %value, "global updated");
        Ok(())
    }
}

fn position(effects: &[EffectSpec], chain_id: &str, effect_id: &str) -> Result<usize, ActionError> {
    effects
        .iter()
        .position(|e| e.id == effect_id)
        .ok_or_else(|| ActionError::EffectNotFound {
            chain_id: chain_id.to_string(),
            effect_id: effect_id.to_string(),
        })
}

fn invalid(key: GlobalKey, reason: impl Into<String>) -> ActionError {
    ActionError::InvalidGlobal {
        key,
        reason: reason.into(),
    }
}

fn parse_bpm(value: &Value) -> Result<f64, ActionError> {
    value
        .as_f64()
        .filter(|bpm| bpm.is_finite() && *bpm > 0.0)
        .ok_or_else(|| invalid(GlobalKey::Bpm, format!("expected a number greater than 0, got {value}")))
}

fn parse_color(key: GlobalKey, value: &Value) -> Result<Lamp, ActionError> {
    value
        .as_str()
        .and_then(Lamp::from_hex)
        .ok_or_else(|| invalid(key, format!("expected a 6-digit hex color, got {value}")))
}

fn initial_globals(spec: &GlobalsSpec) -> Result<GlobalState, ActionError> {
    Ok(GlobalState {
        bpm: parse_bpm(&Value::from(spec.bpm))?,
        color1: parse_color(GlobalKey::Color1, &Value::from(spec.color1.as_str()))?,
        color2: parse_color(GlobalKey::Color2, &Value::from(spec.color2.as_str()))?,
        intensity: spec.intensity,
        beat_progress: 0.0,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lamp_types::ChannelMapping;
    use crate::lamp_types::OutputSpec;
    use crate::output::NullOutput;
    use crate::output::tests::RecordingOutput;
    use serde_json::json;
    use std::time::Instant;

    pub(crate) fn show() -> ShowConfig {
        let strip = ChainSpec {
            id: "strip".into(),
            priority: 0,
            tick_rate: 40,
            lamp_count: 8,
            effects: vec![
                EffectSpec::new("red", "solid_color").with_group("basic_color"),
                EffectSpec::new("white", "whiteout").with_group("basic_color").disabled(),
                EffectSpec::new("half", "dim"),
            ],
            output: OutputSpec::null(ChannelMapping::Rgbw),
        };
        let events = EventTable::from([
            (
                "strobe".to_string(),
                vec![ActionSpec::ToggleEffect {
                    chain_id: "strip".into(),
                    effect_id: "white".into(),
                    enabled: true,
                }],
            ),
            (
                "mixed".to_string(),
                vec![
                    ActionSpec::RemoveEffect {
                        chain_id: "strip".into(),
                        effect_id: "missing".into(),
                    },
                    ActionSpec::SetGlobal {
                        key: "bpm".into(),
                        value: json!(90),
                    },
                ],
            ),
        ]);
        ShowConfig {
            chains: vec![strip],
            events,
            ..ShowConfig::default()
        }
    }

    pub(crate) fn stage_for(config: &ShowConfig) -> (Arc<Stage>, Vec<ChainRunner>) {
        let registry = Arc::new(EffectRegistry::with_builtins().unwrap());
        Stage::assemble(config, registry, |_| Ok(Box::new(NullOutput))).unwrap()
    }

    fn ids(stage: &Stage) -> Vec<String> {
        stage
            .chain("strip")
            .unwrap()
            .effects()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    fn enabled(stage: &Stage) -> Vec<bool> {
        stage
            .chain("strip")
            .unwrap()
            .effects()
            .iter()
            .map(|e| e.enabled)
            .collect()
    }

    #[test]
    fn bpm_accepts_positive_numbers_only() {
        let (stage, _) = stage_for(&show());
        stage.set_global("bpm", &json!(60)).unwrap();
        assert_eq!(stage.clock().snapshot().bpm, 60.0);

        let err = stage.set_global("bpm", &json!(-5)).unwrap_err();
        assert!(matches!(err, ActionError::InvalidGlobal { key: GlobalKey::Bpm, .. }));
        assert_eq!(stage.clock().snapshot().bpm, 60.0);
        assert_eq!(stage.globals().bpm, 60.0);

        assert!(stage.set_global("bpm", &json!("fast")).is_err());
        assert!(stage.set_global("bpm", &json!(0)).is_err());
    }

    #[test]
    fn colors_and_intensity_are_validated() {
        let (stage, _) = stage_for(&show());
        stage.set_global("color1", &json!("#00ff80")).unwrap();
        assert_eq!(stage.globals().color1, "00FF80");
        assert_eq!(stage.clock().snapshot().color1, Lamp::rgb(0, 255, 128));

        assert!(stage.set_global("color2", &json!("blue")).is_err());
        assert_eq!(stage.globals().color2, GlobalsSpec::default().color2);

        stage.set_global("intensity", &json!(128)).unwrap();
        assert_eq!(stage.clock().snapshot().intensity, 128);
        assert!(stage.set_global("intensity", &json!(300)).is_err());
        assert!(stage.set_global("intensity", &json!(12.5)).is_err());
        assert!(stage.set_global("intensity", &json!(-1)).is_err());
        assert_eq!(stage.globals().intensity, 128);

        assert_eq!(
            stage.set_global("tempo", &json!(1)),
            Err(ActionError::UnknownGlobal("tempo".into()))
        );
    }

    #[test]
    fn unknown_event_changes_nothing() {
        let (stage, _) = stage_for(&show());
        let before = stage.to_config();
        assert_eq!(
            stage.trigger_event("nonexistent"),
            Err(ActionError::EventNotFound("nonexistent".into()))
        );
        assert_eq!(stage.to_config(), before);
    }

    #[test]
    fn failing_actions_do_not_stop_the_event() {
        let (stage, _) = stage_for(&show());
        let report = stage.trigger_event("mixed").unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].1, ActionError::EffectNotFound { .. }));
        assert_eq!(stage.globals().bpm, 90.0);
    }

    #[test]
    fn add_then_remove_restores_the_list() {
        let (stage, _) = stage_for(&show());
        let before = stage.chain("strip").unwrap().effects();
        stage
            .add_effect("strip", EffectSpec::new("sparkle", "twinkle"))
            .unwrap();
        assert_eq!(ids(&stage), vec!["red", "white", "half", "sparkle"]);
        stage.remove_effect("strip", "sparkle").unwrap();
        assert_eq!(stage.chain("strip").unwrap().effects(), before);
    }

    #[test]
    fn edits_reject_unknown_targets_and_duplicates() {
        let (stage, _) = stage_for(&show());
        assert_eq!(
            stage.add_effect("nope", EffectSpec::new("x", "dim")),
            Err(ActionError::ChainNotFound("nope".into()))
        );
        assert!(matches!(
            stage.add_effect("strip", EffectSpec::new("red", "dim")),
            Err(ActionError::DuplicateEffect { .. })
        ));
        assert!(matches!(
            stage.remove_effect("strip", "ghost"),
            Err(ActionError::EffectNotFound { .. })
        ));
        assert!(matches!(
            stage.toggle_effect("strip", "ghost", true),
            Err(ActionError::EffectNotFound { .. })
        ));
        assert_eq!(ids(&stage), vec!["red", "white", "half"]);
    }

    #[test]
    fn toggling_on_disables_group_peers_and_is_idempotent() {
        let (stage, mut runners) = stage_for(&show());
        let runner = &mut runners[0];
        runner.rebuild().unwrap();

        stage.toggle_effect("strip", "white", true).unwrap();
        assert_eq!(enabled(&stage), vec![false, true, true]);
        assert!(stage.chain("strip").unwrap().is_dirty());

        runner.rebuild().unwrap();
        stage.toggle_effect("strip", "white", true).unwrap();
        assert_eq!(enabled(&stage), vec![false, true, true]);
        assert!(stage.chain("strip").unwrap().is_dirty());

        stage.toggle_effect("strip", "white", false).unwrap();
        assert_eq!(enabled(&stage), vec![false, false, true]);
    }

    #[test]
    fn events_reach_the_running_chain_on_its_next_tick() {
        let (stage, mut runners) = stage_for(&show());
        let runner = &mut runners[0];
        runner.tick(Instant::now());
        assert_eq!(runner.live_effect_ids(), vec!["red", "half"]);

        stage.trigger_event("strobe").unwrap();
        runner.tick(Instant::now());
        assert_eq!(runner.live_effect_ids(), vec!["white", "half"]);
        assert_eq!(runner.lamps()[0], Lamp::rgbw(128, 128, 128, 128));
    }

    #[test]
    fn assemble_rejects_bad_chains_and_globals() {
        let registry = Arc::new(EffectRegistry::with_builtins().unwrap());
        let open = |_: &ChainSpec| -> Result<Box<dyn Output>, OutputError> { Ok(Box::new(NullOutput)) };

        let mut config = show();
        config.chains.push(config.chains[0].clone());
        assert!(matches!(
            Stage::assemble(&config, registry.clone(), open),
            Err(StageError::DuplicateChain(_))
        ));

        let mut config = show();
        config.chains[0].tick_rate = 0;
        assert!(matches!(
            Stage::assemble(&config, registry.clone(), open),
            Err(StageError::ZeroTickRate(_))
        ));

        let mut config = show();
        config.globals.color1 = "nope".into();
        assert!(matches!(
            Stage::assemble(&config, registry.clone(), open),
            Err(StageError::Globals(_))
        ));

        let config = show();
        let failing = |_: &ChainSpec| -> Result<Box<dyn Output>, OutputError> { Err(OutputError::Closed) };
        assert!(matches!(
            Stage::assemble(&config, registry, failing),
            Err(StageError::Output { .. })
        ));
    }

    #[test]
    fn partial_assembly_closes_the_outputs_it_opened() {
        let registry = Arc::new(EffectRegistry::with_builtins().unwrap());
        let mut config = show();
        let mut second = config.chains[0].clone();
        second.id = "wash".into();
        config.chains.push(second);

        let mut opened = Vec::new();
        let result = Stage::assemble(&config, registry, |chain| {
            if chain.id == "wash" {
                return Err(OutputError::Closed);
            }
            let (output, recording) = RecordingOutput::new();
            opened.push(recording);
            Ok(Box::new(output) as Box<dyn Output>)
        });
        assert!(matches!(result, Err(StageError::Output { ref chain, .. }) if chain == "wash"));
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].close_count(), 1);
    }

    #[test]
    fn event_names_follow_the_table() {
        let (stage, _) = stage_for(&show());
        assert_eq!(stage.event_names().collect::<Vec<_>>(), vec!["mixed", "strobe"]);
    }

    #[test]
    fn to_config_captures_live_edits() {
        let (stage, _) = stage_for(&show());
        stage.set_global("color2", &json!("123456")).unwrap();
        stage.remove_effect("strip", "half").unwrap();
        let config = stage.to_config();
        assert_eq!(config.globals.color2, "123456");
        assert_eq!(config.chains[0].effects.len(), 2);
        assert_eq!(config.events.len(), 2);
    }
}
