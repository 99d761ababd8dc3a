//! Built-in effects and their registry metadata.
//!
//! Color sources (`solid_color`, `gradient`, `rainbow`, `blink`, `whiteout`)
//! overwrite the buffer from the global palette. Transforms (`hueshift`,
//! `shift`, `dim`, `darkwave`, `twinkle`, `cyberfall`, `intensity`) rework
//! whatever the earlier effects in the chain produced.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;

use crate::color::{hsv_to_rgb, rgb_to_hsv};
use crate::effect::{ConfigError, Effect, Frame};
use crate::lamp_types::Lamp;
use crate::registry::{EffectMetadata, EffectParams, EffectRegistry, ParamSpec, RegistryError};

pub fn register_builtins(registry: &mut EffectRegistry) -> Result<(), RegistryError> {
    registry.register(
        "solid_color",
        EffectMetadata::new("Solid Color", "Sets every lamp to global Color 1.")
            .tags(&["color_source"]),
        SolidColor::build,
    )?;
    registry.register(
        "gradient",
        EffectMetadata::new(
            "Gradient",
            "Blends global Color 1 into Color 2 along the strip through HSV space.",
        )
        .tags(&["color_source", "pattern"]),
        Gradient::build,
    )?;
    registry.register(
        "rainbow",
        EffectMetadata::new(
            "Rainbow",
            "Spreads the hue wheel over the strip and scrolls it one strip length per beat.",
        )
        .tags(&["color_source", "bpm_sensitive", "pattern"]),
        Rainbow::build,
    )?;
    registry.register(
        "hueshift",
        EffectMetadata::new(
            "Hue Shift",
            "Rotates the hue of the incoming colors, synchronized with the beat.",
        )
        .tags(&["bpm_sensitive", "transparent", "color", "pattern"])
        .param(direction_param())
        .param(
            ParamSpec::float("beatspan", "Beat Span", "Number of beats for one full hue range.")
                .default(1.0)
                .min(0.0),
        )
        .param(
            ParamSpec::float("huerange", "Hue Range", "Hue shift in degrees covered per beat span.")
                .default(360.0)
                .min(0.0)
                .max(360.0),
        ),
        HueShift::build,
    )?;
    registry.register(
        "shift",
        EffectMetadata::new("Shift", "Rotates the strip contents one strip length per beat.")
            .tags(&["bpm_sensitive", "transparent", "movement"])
            .param(direction_param()),
        Shift::build,
    )?;
    registry.register(
        "blink",
        EffectMetadata::new("Blink", "Alternates the whole strip between Color 1 and Color 2 on the beat.")
            .tags(&["bpm_sensitive", "color_source", "pattern"])
            .param(
                ParamSpec::int("divider", "Divider", "Splits each beat into faster blinks.")
                    .default(1)
                    .min(1.0)
                    .max(64.0),
            )
            .param(
                ParamSpec::float("duty_cycle", "Duty Cycle", "Share of each segment showing Color 1.")
                    .default(0.5)
                    .min(0.0)
                    .max(1.0),
            ),
        Blink::build,
    )?;
    registry.register(
        "dim",
        EffectMetadata::new("Dim", "Scales every channel by a fixed percentage.")
            .tags(&["transparent", "brightness_mask"])
            .param(percentage_param(0.5, "Output level relative to the input.")),
        Dim::build,
    )?;
    registry.register(
        "darkwave",
        EffectMetadata::new("Dark Wave", "Runs a sine-shaped band of darkness along the strip.")
            .tags(&["transparent", "brightness_mask", "movement"])
            .param(percentage_param(0.5, "Depth of the darkest part of the wave."))
            .param(
                ParamSpec::float("speed", "Speed", "Wave cycles per second.")
                    .default(1.0),
            ),
        DarkWave::build,
    )?;
    registry.register(
        "twinkle",
        EffectMetadata::new("Twinkle", "Flashes a random selection of lamps white on every frame.")
            .tags(&["random", "sparkle"])
            .param(percentage_param(0.1, "Share of lamps lit per frame.")),
        Twinkle::build,
    )?;
    registry.register(
        "whiteout",
        EffectMetadata::new("Whiteout", "Sets every lamp to full white.").tags(&["color_source"]),
        Whiteout::build,
    )?;
    registry.register(
        "cyberfall",
        EffectMetadata::new(
            "Cyberfall",
            "Digital rain acting as a brightness mask over the existing colors.",
        )
        .tags(&["transparent", "brightness_mask", "random"])
        .param(ParamSpec::float("speed", "Speed", "How fast the rain falls.").default(1.0).min(0.0))
        .param(
            ParamSpec::float("density", "Density", "How often new drops start (0-1).")
                .default(0.5)
                .min(0.0)
                .max(1.0),
        )
        .param(
            ParamSpec::int("trail_length", "Trail Length", "Length of a drop's tail in lamps.")
                .default(10)
                .min(0.0),
        )
        .param(
            ParamSpec::int("min_brightness", "Min Brightness", "Brightness of unlit lamps (0-255).")
                .default(0)
                .min(0.0)
                .max(255.0),
        )
        .param(
            ParamSpec::int("max_brightness", "Max Brightness", "Brightness of a drop's head (0-255).")
                .default(255)
                .min(0.0)
                .max(255.0),
        )
        .param(
            ParamSpec::float("flicker_intensity", "Flicker Intensity", "Random brightness jitter (0-1).")
                .default(0.1)
                .min(0.0)
                .max(1.0),
        ),
        Cyberfall::build,
    )?;
    registry.register(
        "intensity",
        EffectMetadata::new("Intensity", "Scales the strip by the global intensity.")
            .tags(&["transparent", "brightness_mask"]),
        Intensity::build,
    )?;
    Ok(())
}

fn direction_param() -> ParamSpec {
    ParamSpec::text("direction", "Direction", "Direction of travel.")
        .default("left")
        .options(&["left", "right"])
}

fn percentage_param(default: f64, description: &str) -> ParamSpec {
    ParamSpec::float("percentage", "Percentage", description)
        .default(default)
        .min(0.0)
        .max(1.0)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
enum Direction {
    Left,
    Right,
}

impl Direction {
    fn read(params: &EffectParams) -> Result<Self, ConfigError> {
        let text = params.text("direction")?;
        text.parse()
            .map_err(|_| ConfigError::invalid(params.effect(), "direction", format!("unknown direction '{text}'")))
    }
}

/// Lamps the strip scrolls by per frame to cover its full length once per beat.
fn lamps_per_frame(lamp_count: usize, frame: &Frame) -> f64 {
    lamp_count as f64 * frame.globals.bpm / (60.0 * frame.tick_rate.max(1) as f64)
}

struct SolidColor;

impl SolidColor {
    fn build(_: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(SolidColor))
    }
}

impl Effect for SolidColor {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        lamps.fill(frame.layout.fit(frame.globals.color1));
    }
}

struct Gradient;

impl Gradient {
    fn build(_: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Gradient))
    }
}

impl Effect for Gradient {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        let (c1, c2) = (frame.globals.color1, frame.globals.color2);
        let (mut h1, s1, v1) = rgb_to_hsv(c1.r, c1.g, c1.b);
        let (mut h2, s2, v2) = rgb_to_hsv(c2.r, c2.g, c2.b);

        // Travel the short way around the hue wheel.
        if (h1 - h2).abs() > 0.5 {
            if h1 > h2 {
                h2 += 1.0;
            } else {
                h1 += 1.0;
            }
        }

        let span = lamps.len().saturating_sub(1).max(1) as f64;
        for (i, lamp) in lamps.iter_mut().enumerate() {
            let t = i as f64 / span;
            let mix = |a: f64, b: f64| a * (1.0 - t) + b * t;
            let (r, g, b) = hsv_to_rgb(mix(h1, h2), mix(s1, s2), mix(v1, v2));
            *lamp = Lamp::rgb(r, g, b);
        }
    }
}

struct Rainbow {
    offset: f64,
}

impl Rainbow {
    fn build(_: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Rainbow { offset: 0.0 }))
    }
}

impl Effect for Rainbow {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        if lamps.is_empty() {
            return;
        }
        let count = lamps.len() as f64;
        self.offset = (self.offset + lamps_per_frame(lamps.len(), frame)).rem_euclid(count);

        for (i, lamp) in lamps.iter_mut().enumerate() {
            let hue = ((self.offset + i as f64) / count).rem_euclid(1.0);
            let (r, g, b) = hsv_to_rgb(hue, 1.0, 1.0);
            *lamp = Lamp::rgb(r, g, b);
        }
    }
}

struct HueShift {
    direction: Direction,
    beat_span: f64,
    hue_range: f64,
    /// Beats accumulated within the current span
    accumulated: f64,
    last_progress: f64,
}

impl HueShift {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        let beat_span = params.float("beatspan")?;
        if beat_span <= 0.0 {
            return Err(ConfigError::invalid(params.effect(), "beatspan", "must be greater than 0"));
        }
        Ok(Box::new(HueShift {
            direction: Direction::read(params)?,
            beat_span,
            hue_range: params.float("huerange")?,
            accumulated: 0.0,
            last_progress: 0.0,
        }))
    }

    fn advance(&mut self, progress: f64) {
        let delta = if progress < self.last_progress {
            // The beat rolled over since the previous frame.
            (1.0 - self.last_progress) + progress
        } else {
            progress - self.last_progress
        };
        self.accumulated = (self.accumulated + delta).rem_euclid(self.beat_span);
        self.last_progress = progress;
    }
}

impl Effect for HueShift {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        self.advance(frame.globals.beat_progress);
        let amount = self.accumulated / self.beat_span * (self.hue_range / 360.0);
        let amount = match self.direction {
            Direction::Left => amount,
            Direction::Right => -amount,
        };

        for lamp in lamps.iter_mut() {
            let (h, s, v) = rgb_to_hsv(lamp.r, lamp.g, lamp.b);
            let (r, g, b) = hsv_to_rgb((h + amount).rem_euclid(1.0), s, v);
            *lamp = Lamp { r, g, b, w: lamp.w };
        }
    }
}

struct Shift {
    direction: Direction,
    step: f64,
    scratch: Vec<Lamp>,
}

impl Shift {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Shift {
            direction: Direction::read(params)?,
            step: 0.0,
            scratch: Vec::new(),
        }))
    }
}

impl Effect for Shift {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        let count = lamps.len();
        if count == 0 {
            return;
        }
        self.step = (self.step + lamps_per_frame(count, frame)).rem_euclid(count as f64);
        let offset = self.step.round() as usize % count;

        self.scratch.clear();
        self.scratch.extend_from_slice(lamps);
        for (i, lamp) in lamps.iter_mut().enumerate() {
            let source = match self.direction {
                Direction::Left => (i + offset) % count,
                Direction::Right => (i + count - offset) % count,
            };
            *lamp = self.scratch[source];
        }
    }
}

struct Blink {
    divider: u32,
    duty_cycle: f64,
}

impl Blink {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Blink {
            divider: params.int("divider")?.clamp(1, 64) as u32,
            duty_cycle: params.float("duty_cycle")?,
        }))
    }
}

impl Effect for Blink {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        let position = frame.globals.beat_progress * f64::from(self.divider) * 2.0;
        let within = position - position.floor();
        let color = if within < self.duty_cycle {
            frame.globals.color1
        } else {
            frame.globals.color2
        };
        lamps.fill(frame.layout.fit(color));
    }
}

struct Dim {
    percentage: f64,
}

impl Dim {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Dim {
            percentage: params.float("percentage")?,
        }))
    }
}

impl Effect for Dim {
    fn process(&mut self, lamps: &mut [Lamp], _frame: &Frame) {
        let scale = |v: u8| (v as f64 * self.percentage).round() as u8;
        for lamp in lamps.iter_mut() {
            *lamp = Lamp::rgbw(scale(lamp.r), scale(lamp.g), scale(lamp.b), scale(lamp.w));
        }
    }
}

struct DarkWave {
    percentage: f64,
    speed: f64,
    phase: f64,
}

impl DarkWave {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(DarkWave {
            percentage: params.float("percentage")?,
            speed: params.float("speed")?,
            phase: 0.0,
        }))
    }
}

impl Effect for DarkWave {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        self.phase = (self.phase + self.speed * TAU * frame.frame_seconds()).rem_euclid(TAU);
        let count = lamps.len() as f64;
        for (i, lamp) in lamps.iter_mut().enumerate() {
            let wave = ((i as f64 / count * TAU + self.phase).sin() + 1.0) / 2.0;
            *lamp = lamp.scaled(1.0 - wave * self.percentage);
        }
    }
}

struct Twinkle {
    percentage: f64,
    rng: StdRng,
}

impl Twinkle {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Twinkle {
            percentage: params.float("percentage")?,
            rng: StdRng::from_os_rng(),
        }))
    }
}

impl Effect for Twinkle {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        let count = ((lamps.len() as f64 * self.percentage) as usize).min(lamps.len());
        let white = frame.layout.fit(Lamp::WHITE);
        for index in rand::seq::index::sample(&mut self.rng, lamps.len(), count) {
            lamps[index] = white;
        }
    }
}

struct Whiteout;

impl Whiteout {
    fn build(_: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Whiteout))
    }
}

impl Effect for Whiteout {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        lamps.fill(frame.layout.fit(Lamp::WHITE));
    }
}

struct Cyberfall {
    speed: f64,
    density: f64,
    trail_length: f64,
    min_brightness: f64,
    max_brightness: f64,
    flicker_intensity: f64,
    /// Head position of the drop owned by each lamp, `None` when idle
    drops: Vec<Option<f64>>,
    rng: StdRng,
}

impl Cyberfall {
    fn build(params: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        let min_brightness = params.int("min_brightness")? as f64;
        let max_brightness = params.int("max_brightness")? as f64;
        if min_brightness > max_brightness {
            return Err(ConfigError::invalid(
                params.effect(),
                "min_brightness",
                "must not exceed max_brightness",
            ));
        }
        Ok(Box::new(Cyberfall {
            speed: params.float("speed")?,
            density: params.float("density")?,
            trail_length: params.int("trail_length")?.max(1) as f64,
            min_brightness,
            max_brightness,
            flicker_intensity: params.float("flicker_intensity")?,
            drops: Vec::new(),
            rng: StdRng::from_os_rng(),
        }))
    }

    fn step(&mut self, count: usize, dt: f64) {
        if self.drops.len() != count {
            self.drops = vec![None; count];
        }
        let fall = self.speed * dt * count as f64 / 5.0;
        let floor = count as f64 + self.trail_length;
        for drop in self.drops.iter_mut() {
            if let Some(head) = drop {
                *head += fall;
                if *head >= floor {
                    *drop = None;
                }
            }
            if drop.is_none() && self.rng.random::<f64>() < self.density * dt * 2.0 {
                *drop = Some(0.0);
            }
        }
    }
}

impl Effect for Cyberfall {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        if lamps.is_empty() {
            return;
        }
        self.step(lamps.len(), frame.frame_seconds());

        for (i, lamp) in lamps.iter_mut().enumerate() {
            let mut brightness = self.min_brightness;
            if let Some(head) = self.drops[i] {
                let trail = (head - i as f64) / self.trail_length;
                if (0.0..=1.0).contains(&trail) {
                    let mut factor = 1.0 - trail;
                    if self.flicker_intensity > 0.0 {
                        let jitter = self.rng.random::<f64>() * 2.0 - 1.0;
                        factor = (factor + jitter * self.flicker_intensity).clamp(0.0, 1.0);
                    }
                    brightness = self.min_brightness + factor * (self.max_brightness - self.min_brightness);
                }
            }
            *lamp = lamp.scaled(brightness / 255.0);
        }
    }
}

struct Intensity;

impl Intensity {
    fn build(_: &EffectParams) -> Result<Box<dyn Effect>, ConfigError> {
        Ok(Box::new(Intensity))
    }
}

impl Effect for Intensity {
    fn process(&mut self, lamps: &mut [Lamp], frame: &Frame) {
        let factor = frame.globals.intensity as f64 / 255.0;
        for lamp in lamps.iter_mut() {
            *lamp = lamp.scaled(factor);
        }
    }
}
