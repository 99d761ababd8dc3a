//! Real-time lighting effects engine.
//!
//! Chains of effects render lamp buffers at their own frame rate, driven by
//! a shared beat clock, and push them to hardware outputs. Named events
//! edit the running chains and the global tempo and palette.

pub mod builtin_effects;
pub mod chain;
pub mod clock;
pub mod color;
pub mod config;
pub mod effect;
pub mod lamp_types;
pub mod logging;
pub mod midi;
pub mod osc;
pub mod output;
pub mod registry;
pub mod show;
pub mod stage;
