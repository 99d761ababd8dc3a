//! MIDI input that fires show events.

use midir::{Ignore, MidiInput, MidiInputConnection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::stage::Stage;

#[derive(Error, Debug)]
pub enum MidiError {
    #[error("MIDI init failed: {0}")]
    Init(String),
    #[error("No MIDI input port matching '{0}'")]
    PortNotFound(String),
    #[error("MIDI connect failed: {0}")]
    Connect(String),
}

#[derive(
    Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MidiMessageKind {
    NoteOn,
    NoteOff,
    Cc,
}

/// Maps one MIDI message to an event name.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct MidiTrigger {
    pub message: MidiMessageKind,
    /// Note or controller number
    pub number: u8,
    /// Velocity or controller value; any value matches when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
    pub event: String,
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize, Debug)]
pub struct MidiConfig {
    /// Substring of the input port name; MIDI stays off when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub triggers: Vec<MidiTrigger>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MidiMessage {
    pub kind: MidiMessageKind,
    pub number: u8,
    pub value: u8,
}

impl MidiMessage {
    /// Parses note-on, note-off and control-change messages on any channel.
    /// A note-on with velocity 0 counts as note-off.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let &[status, number, value, ..] = bytes else {
            return None;
        };
        let kind = match status & 0xF0 {
            0x90 if value > 0 => MidiMessageKind::NoteOn,
            0x90 | 0x80 => MidiMessageKind::NoteOff,
            0xB0 => MidiMessageKind::Cc,
            _ => return None,
        };
        let value = match kind {
            MidiMessageKind::NoteOff => 0,
            _ => value,
        };
        Some(Self {
            kind,
            number,
            value,
        })
    }
}

impl MidiTrigger {
    pub fn matches(&self, message: &MidiMessage) -> bool {
        self.message == message.kind
            && self.number == message.number
            && self.value.is_none_or(|v| v == message.value)
    }
}

/// First trigger matching `message`.
pub fn find_trigger<'a>(triggers: &'a [MidiTrigger], message: &MidiMessage) -> Option<&'a MidiTrigger> {
    triggers.iter().find(|t| t.matches(message))
}

/// Names of every MIDI input port currently visible.
pub fn list_ports() -> Result<Vec<String>, MidiError> {
    let midi_in = MidiInput::new("beatlight scanner").map_err(|e| MidiError::Init(e.to_string()))?;
    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|p| midi_in.port_name(p).ok())
        .collect())
}

/// Open MIDI connection. Dropping it disconnects.
pub struct MidiListener {
    _connection: MidiInputConnection<()>,
}

impl MidiListener {
    /// Connects to the first input port whose name contains `config.port`.
    /// Returns `Ok(None)` when no port is configured.
    pub fn connect(config: &MidiConfig, stage: Arc<Stage>) -> Result<Option<Self>, MidiError> {
        let Some(wanted) = &config.port else {
            return Ok(None);
        };
        let mut midi_in = MidiInput::new("beatlight").map_err(|e| MidiError::Init(e.to_string()))?;
        midi_in.ignore(Ignore::All);

        let (port, port_name) = midi_in
            .ports()
            .into_iter()
            .find_map(|p| {
                let name = midi_in.port_name(&p).ok()?;
                name.contains(wanted.as_str()).then_some((p, name))
            })
            .ok_or_else(|| MidiError::PortNotFound(wanted.clone()))?;

        let triggers = config.triggers.clone();
        let connection = midi_in
            .connect(
                &port,
                "beatlight-input",
                move |_timestamp, bytes, _| {
                    let Some(message) = MidiMessage::from_bytes(bytes) else {
                        return;
                    };
                    match find_trigger(&triggers, &message) {
                        Some(trigger) => {
                            debug!(?message, event = %trigger.event, "MIDI trigger matched");
                            let _ = stage.trigger_event(&trigger.event);
                        }
                        None => debug!(?message, "unmapped MIDI message"),
                    }
                },
                (),
            )
            .map_err(|e| MidiError::Connect(e.to_string()))?;

        info!(port = %port_name, triggers = config.triggers.len(), "listening for MIDI");
        Ok(Some(Self {
            _connection: connection,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(message: MidiMessageKind, number: u8, value: Option<u8>, event: &str) -> MidiTrigger {
        MidiTrigger {
            message,
            number,
            value,
            event: event.into(),
        }
    }

    #[test]
    fn parses_note_and_cc_messages_on_any_channel() {
        assert_eq!(
            MidiMessage::from_bytes(&[0x93, 60, 100]),
            Some(MidiMessage {
                kind: MidiMessageKind::NoteOn,
                number: 60,
                value: 100
            })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0x90, 60, 0]).map(|m| m.kind),
            Some(MidiMessageKind::NoteOff)
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0x80, 60, 64]).map(|m| (m.kind, m.value)),
            Some((MidiMessageKind::NoteOff, 0))
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0xB1, 7, 127]).map(|m| m.kind),
            Some(MidiMessageKind::Cc)
        );
        assert_eq!(MidiMessage::from_bytes(&[0xC0, 5]), None);
        assert_eq!(MidiMessage::from_bytes(&[0xE0, 0, 64]), None);
    }

    #[test]
    fn first_matching_trigger_wins() {
        let triggers = vec![
            trigger(MidiMessageKind::Cc, 1, Some(127), "full"),
            trigger(MidiMessageKind::Cc, 1, None, "any"),
            trigger(MidiMessageKind::Cc, 1, Some(0), "never"),
        ];
        let full = MidiMessage::from_bytes(&[0xB0, 1, 127]).unwrap();
        let zero = MidiMessage::from_bytes(&[0xB0, 1, 0]).unwrap();
        let other = MidiMessage::from_bytes(&[0xB0, 2, 0]).unwrap();
        assert_eq!(find_trigger(&triggers, &full).unwrap().event, "full");
        assert_eq!(find_trigger(&triggers, &zero).unwrap().event, "any");
        assert!(find_trigger(&triggers, &other).is_none());
    }

    #[test]
    fn trigger_config_reads_from_json() {
        let parsed: MidiTrigger = serde_json::from_str(
            r#"{"message": "note_on", "number": 36, "event": "drop"}"#,
        )
        .unwrap();
        assert_eq!(parsed, trigger(MidiMessageKind::NoteOn, 36, None, "drop"));
        assert_eq!(MidiMessageKind::Cc.to_string(), "cc");
    }
}
