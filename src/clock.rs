//! Shared tempo clock.
//!
//! [`BeatClock`] owns the show-wide [`GlobalState`] (tempo, palette,
//! intensity) and derives the beat phase from wall-clock time. Every chain
//! advances it once per tick and receives a copy of the state; operators
//! mutate it through the setters. All access goes through one lock, so
//! concurrent chains and the action executor never observe a torn state.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::lamp_types::Lamp;

/// Show-wide values read by every effect on every frame.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct GlobalState {
    /// Beats per minute, > 0
    pub bpm: f64,
    pub color1: Lamp,
    pub color2: Lamp,
    /// Master intensity (0-255)
    pub intensity: u8,
    /// Position within the current beat, in `[0, 1)`
    pub beat_progress: f64,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            color1: Lamp::rgb(255, 0, 0),
            color2: Lamp::rgb(0, 0, 255),
            intensity: 255,
            beat_progress: 0.0,
        }
    }
}

impl GlobalState {
    /// Length of one beat at the current tempo.
    pub fn beat_duration(&self) -> Option<Duration> {
        if self.bpm.is_finite() && self.bpm > 0.0 {
            Some(Duration::from_secs_f64(60.0 / self.bpm))
        } else {
            None
        }
    }
}

struct ClockState {
    globals: GlobalState,
    last_beat_start: Instant,
}

pub struct BeatClock {
    state: Mutex<ClockState>,
}

impl BeatClock {
    pub fn new(globals: GlobalState) -> Self {
        Self::starting_at(globals, Instant::now())
    }

    /// Creates a clock whose first beat starts at `start`.
    pub fn starting_at(globals: GlobalState, start: Instant) -> Self {
        Self {
            state: Mutex::new(ClockState {
                globals: GlobalState {
                    beat_progress: 0.0,
                    ..globals
                },
                last_beat_start: start,
            }),
        }
    }

    /// Recomputes the beat phase for `now` and returns a copy of the state.
    ///
    /// The phase resets to exactly 0 (and the beat restarts at `now`) once
    /// a full beat period has elapsed. Instants earlier than the current
    /// beat start count as no elapsed time.
    pub fn advance(&self, now: Instant) -> GlobalState {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_beat_start);
        let progress = match state.globals.beat_duration() {
            Some(beat) => elapsed.as_secs_f64() / beat.as_secs_f64(),
            None => 0.0,
        };

        if progress >= 1.0 {
            trace!(bpm = state.globals.bpm, "beat");
            state.last_beat_start = now;
            state.globals.beat_progress = 0.0;
        } else {
            state.globals.beat_progress = progress;
        }
        state.globals
    }

    pub fn snapshot(&self) -> GlobalState {
        self.state.lock().globals
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.state.lock().globals.bpm = bpm;
    }

    pub fn set_color1(&self, color: Lamp) {
        self.state.lock().globals.color1 = color;
    }

    pub fn set_color2(&self, color: Lamp) {
        self.state.lock().globals.color2 = color;
    }

    pub fn set_intensity(&self, intensity: u8) {
        self.state.lock().globals.intensity = intensity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn clock_at(bpm: f64) -> (BeatClock, Instant) {
        let start = Instant::now();
        let globals = GlobalState {
            bpm,
            ..GlobalState::default()
        };
        (BeatClock::starting_at(globals, start), start)
    }

    #[test]
    fn progress_is_the_fraction_of_the_beat_elapsed() {
        let (clock, start) = clock_at(60.0);
        let state = clock.advance(start + Duration::from_millis(500));
        assert!((state.beat_progress - 0.5).abs() < 1e-9);
        let state = clock.advance(start + Duration::from_millis(750));
        assert!((state.beat_progress - 0.75).abs() < 1e-9);
    }

    #[test]
    fn progress_resets_to_zero_at_one_full_beat() {
        let (clock, start) = clock_at(60.0);
        let state = clock.advance(start + Duration::from_secs(1));
        assert_eq!(state.beat_progress, 0.0);

        // The next beat is measured from the reset instant.
        let state = clock.advance(start + Duration::from_millis(1250));
        assert!((state.beat_progress - 0.25).abs() < 1e-9);
    }

    #[test]
    fn progress_stays_in_range_and_rises_between_resets() {
        for bpm in [1.0, 60.0, 128.0, 174.0, 999.0] {
            let (clock, start) = clock_at(bpm);
            let mut last = 0.0;
            for step in 1..2_000u64 {
                let state = clock.advance(start + Duration::from_millis(step * 7));
                assert!((0.0..1.0).contains(&state.beat_progress), "bpm {bpm}");
                if state.beat_progress != 0.0 {
                    assert!(state.beat_progress >= last, "bpm {bpm} went backwards");
                }
                last = state.beat_progress;
            }
        }
    }

    #[test]
    fn earlier_instants_do_not_move_the_phase_backwards() {
        let (clock, start) = clock_at(60.0);
        clock.advance(start + Duration::from_secs(1));
        let state = clock.advance(start + Duration::from_millis(10));
        assert_eq!(state.beat_progress, 0.0);
    }

    #[test]
    fn setters_are_visible_in_the_next_advance() {
        let (clock, start) = clock_at(120.0);
        clock.set_bpm(90.0);
        clock.set_color1(Lamp::rgb(1, 2, 3));
        clock.set_color2(Lamp::rgb(4, 5, 6));
        clock.set_intensity(7);
        let state = clock.advance(start);
        assert_eq!(state.bpm, 90.0);
        assert_eq!(state.color1, Lamp::rgb(1, 2, 3));
        assert_eq!(state.color2, Lamp::rgb(4, 5, 6));
        assert_eq!(state.intensity, 7);
    }

    #[test]
    fn concurrent_advances_keep_the_invariant() {
        let clock = Arc::new(BeatClock::new(GlobalState {
            bpm: 600.0,
            ..GlobalState::default()
        }));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let state = clock.advance(Instant::now());
                        assert!((0.0..1.0).contains(&state.beat_progress));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
