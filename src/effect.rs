use thiserror::Error;

use crate::clock::GlobalState;
use crate::lamp_types::{Lamp, LampLayout};

/// Everything an effect may read while rendering one frame.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    /// Copy of the shared state taken at the start of the tick
    pub globals: GlobalState,
    /// Frames per second of the chain being rendered
    pub tick_rate: u32,
    pub layout: LampLayout,
}

impl Frame {
    pub fn new(globals: GlobalState, tick_rate: u32, layout: LampLayout) -> Self {
        Self {
            globals,
            tick_rate,
            layout,
        }
    }

    /// Seconds covered by one frame.
    pub fn frame_seconds(&self) -> f64 {
        1.0 / self.tick_rate.max(1) as f64
    }
}

/// A transform applied in place to a chain's lamp buffer once per frame.
///
/// Effects run in chain order and see the output of the effects before
/// them. Buffers may be empty. Any state an effect keeps lives in the
/// instance and is dropped when the chain rebuilds its effect list.
pub trait Effect: Send {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame);
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown effect type: {0}")]
    UnknownEffect(String),
    #[error("Effect {effect}: missing argument '{param}'")]
    MissingArgument { effect: String, param: String },
    #[error("Effect {effect}: invalid argument '{param}': {reason}")]
    InvalidArgument {
        effect: String,
        param: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(effect: &str, param: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidArgument {
            effect: effect.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}
