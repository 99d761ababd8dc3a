//! Per-chain scheduling.
//!
//! A chain is split in two halves:
//! - [`ChainHandle`] is shared (`Arc`) between the action executor and the
//!   chain's own thread. It holds the declarative effect list behind a
//!   short-lived lock together with a revision counter. Every edit bumps the
//!   revision, and the chain is dirty until a rebuild catches up with it.
//! - [`ChainRunner`] is owned by the chain's thread. It holds the lamp
//!   buffer, the live effect instances and the output, so running effects
//!   never happens under a lock.

use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::BeatClock;
use crate::effect::{ConfigError, Effect, Frame};
use crate::lamp_types::{ChainSpec, EffectSpec, Lamp, LampLayout, OutputSpec};
use crate::output::Output;
use crate::registry::EffectRegistry;

struct SpecState {
    effects: Vec<EffectSpec>,
    revision: u64,
    /// Revision the live effect list was last built from
    built: Option<u64>,
}

pub struct ChainHandle {
    id: String,
    priority: i32,
    tick_rate: u32,
    lamp_count: usize,
    output: OutputSpec,
    specs: Mutex<SpecState>,
}

impl ChainHandle {
    pub fn new(spec: ChainSpec) -> Self {
        Self {
            id: spec.id,
            priority: spec.priority,
            tick_rate: spec.tick_rate,
            lamp_count: spec.lamp_count,
            output: spec.output,
            specs: Mutex::new(SpecState {
                effects: spec.effects,
                revision: 0,
                built: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn lamp_count(&self) -> usize {
        self.lamp_count
    }

    pub fn layout(&self) -> LampLayout {
        self.output.layout()
    }

    /// Copy of the current effect list.
    pub fn effects(&self) -> Vec<EffectSpec> {
        self.specs.lock().effects.clone()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.specs.lock();
        state.built != Some(state.revision)
    }

    pub fn revision(&self) -> u64 {
        self.specs.lock().revision
    }

    /// Runs `f` on the effect list under the chain lock. A successful edit
    /// marks the chain dirty; a failed one leaves it untouched.
    pub fn edit<T, E>(&self, f: impl FnOnce(&mut Vec<EffectSpec>) -> Result<T, E>) -> Result<T, E> {
        let mut state = self.specs.lock();
        let out = f(&mut state.effects)?;
        state.revision += 1;
        Ok(out)
    }

    pub fn to_spec(&self) -> ChainSpec {
        ChainSpec {
            id: self.id.clone(),
            priority: self.priority,
            tick_rate: self.tick_rate,
            lamp_count: self.lamp_count,
            effects: self.effects(),
            output: self.output.clone(),
        }
    }

    /// Normalizes groups and returns the revision being built together with
    /// the enabled specs, or `None` when the live list is current.
    fn plan_rebuild(&self) -> Option<(u64, Vec<EffectSpec>)> {
        let mut state = self.specs.lock();
        if state.built == Some(state.revision) {
            return None;
        }
        for id in normalize_groups(&mut state.effects) {
            warn!(chain = %self.id, effect = %id, "disabled, its group already has an enabled effect");
        }
        let enabled = state.effects.iter().filter(|e| e.enabled).cloned().collect();
        Some((state.revision, enabled))
    }

    fn mark_built(&self, revision: u64) {
        self.specs.lock().built = Some(revision);
    }
}

/// Keeps the first enabled effect of every group and disables the later
/// ones. Returns the ids that were disabled.
pub fn normalize_groups(effects: &mut [EffectSpec]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut disabled = Vec::new();
    for spec in effects.iter_mut().filter(|s| s.enabled) {
        let Some(group) = spec.group().map(str::to_owned) else {
            continue;
        };
        if !seen.insert(group) {
            spec.enabled = false;
            disabled.push(spec.id.clone());
        }
    }
    disabled
}

/// Enables the effect `id` and disables every other enabled member of its
/// group. Returns `false` when no effect has that id.
pub fn enable_exclusively(effects: &mut [EffectSpec], id: &str) -> bool {
    let Some(index) = effects.iter().position(|e| e.id == id) else {
        return false;
    };
    let group = effects[index].group().map(str::to_owned);
    if let Some(group) = group {
        for (i, other) in effects.iter_mut().enumerate() {
            if i != index && other.enabled && other.group() == Some(group.as_str()) {
                other.enabled = false;
            }
        }
    }
    effects[index].enabled = true;
    true
}

struct LiveEffect {
    id: String,
    effect: Box<dyn Effect>,
}

pub struct ChainRunner {
    handle: Arc<ChainHandle>,
    clock: Arc<BeatClock>,
    registry: Arc<EffectRegistry>,
    output: Box<dyn Output>,
    lamps: Vec<Lamp>,
    live: Vec<LiveEffect>,
    failed_revision: Option<u64>,
    send_failing: bool,
    closed: bool,
}

impl ChainRunner {
    pub fn new(
        handle: Arc<ChainHandle>,
        clock: Arc<BeatClock>,
        registry: Arc<EffectRegistry>,
        output: Box<dyn Output>,
    ) -> Self {
        let lamps = vec![Lamp::BLACK; handle.lamp_count()];
        Self {
            handle,
            clock,
            registry,
            output,
            lamps,
            live: Vec::new(),
            failed_revision: None,
            send_failing: false,
            closed: false,
        }
    }

    pub fn handle(&self) -> &Arc<ChainHandle> {
        &self.handle
    }

    pub fn lamps(&self) -> &[Lamp] {
        &self.lamps
    }

    pub fn live_effect_ids(&self) -> Vec<&str> {
        self.live.iter().map(|l| l.id.as_str()).collect()
    }

    /// Rebuilds the live effect list if the chain is dirty.
    ///
    /// Returns `Ok(true)` when a new list was adopted. On error the previous
    /// list stays live and the chain stays dirty.
    pub fn rebuild(&mut self) -> Result<bool, ConfigError> {
        let Some((revision, specs)) = self.handle.plan_rebuild() else {
            return Ok(false);
        };
        let mut live = Vec::with_capacity(specs.len());
        for spec in specs {
            let effect = self.registry.construct(&spec.kind, &spec.args)?;
            live.push(LiveEffect {
                id: spec.id,
                effect,
            });
        }
        self.live = live;
        self.handle.mark_built(revision);
        self.failed_revision = None;
        debug!(chain = %self.handle.id(), revision, effects = self.live.len(), "effects rebuilt");
        Ok(true)
    }

    /// Renders one frame for `now` and hands it to the output.
    pub fn tick(&mut self, now: Instant) {
        if let Err(e) = self.rebuild() {
            let revision = self.handle.revision();
            if self.failed_revision != Some(revision) {
                error!(chain = %self.handle.id(), "rebuild failed, keeping previous effects: {e}");
                self.failed_revision = Some(revision);
            }
        }

        let globals = self.clock.advance(now);
        let frame = Frame::new(globals, self.handle.tick_rate(), self.handle.layout());
        for live in self.live.iter_mut() {
            live.effect.process(&mut self.lamps, &frame);
        }

        match self.output.send(&self.lamps) {
            Ok(()) => {
                if self.send_failing {
                    info!(chain = %self.handle.id(), "output recovered");
                    self.send_failing = false;
                }
            }
            Err(e) if !self.send_failing => {
                warn!(chain = %self.handle.id(), "output send failed: {e}");
                self.send_failing = true;
            }
            Err(e) => debug!(chain = %self.handle.id(), "output send failed: {e}"),
        }
    }

    /// Closes the output. Later calls do nothing; dropping the runner
    /// closes it too.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.output.close();
        }
    }

    /// Moves the runner onto its own thread, ticking at the chain's rate
    /// until the returned worker is stopped.
    pub fn spawn(mut self) -> std::io::Result<ChainWorker> {
        let id = self.handle.id().to_string();
        let period = tick_period(self.handle.tick_rate());
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name(format!("chain-{id}"))
            .spawn(move || {
                let ticker = tick(period);
                info!(chain = %self.handle.id(), ?period, "chain started");
                'chain: loop {
                    select! {
                        recv(stop_rx) -> _ => break 'chain,
                        recv(ticker) -> now => match now {
                            Ok(now) => self.tick(now),
                            Err(_) => break 'chain,
                        },
                    }
                }
                self.close();
                info!(chain = %self.handle.id(), "chain stopped");
            })?;
        Ok(ChainWorker {
            id,
            stop: stop_tx,
            thread: Some(thread),
        })
    }
}

impl Drop for ChainRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Timer period for a chain: `1000 / tick_rate` milliseconds, at least 1 ms.
pub fn tick_period(tick_rate: u32) -> Duration {
    Duration::from_millis((1000 / tick_rate.max(1) as u64).max(1))
}

/// Running chain thread. Dropping it stops and joins the thread.
pub struct ChainWorker {
    id: String,
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ChainWorker {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(chain = %self.id, "chain thread panicked");
            }
        }
    }
}

impl Drop for ChainWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::GlobalState;
    use crate::lamp_types::ChannelMapping;
    use crate::output::tests::{Recording, RecordingOutput};

    fn chain(lamp_count: usize, mapping: ChannelMapping, effects: Vec<EffectSpec>) -> ChainSpec {
        ChainSpec {
            id: "strip".into(),
            priority: 0,
            tick_rate: 100,
            lamp_count,
            effects,
            output: OutputSpec::null(mapping),
        }
    }

    fn runner_with(spec: ChainSpec, output: RecordingOutput) -> ChainRunner {
        let globals = GlobalState {
            color1: Lamp::rgbw(255, 0, 0, 0),
            ..GlobalState::default()
        };
        ChainRunner::new(
            Arc::new(ChainHandle::new(spec)),
            Arc::new(BeatClock::new(globals)),
            Arc::new(EffectRegistry::with_builtins().unwrap()),
            Box::new(output),
        )
    }

    fn runner(spec: ChainSpec) -> (ChainRunner, Recording) {
        let (output, recording) = RecordingOutput::new();
        (runner_with(spec, output), recording)
    }

    #[test]
    fn solid_color_frame_reaches_the_output() {
        let spec = chain(10, ChannelMapping::Rgb, vec![EffectSpec::new("base", "solid_color")]);
        let (mut runner, recording) = runner(spec);
        runner.tick(Instant::now());

        let frame = recording.last_frame().unwrap();
        assert_eq!(frame.len(), 10);
        assert!(frame.iter().all(|l| *l == Lamp::rgbw(255, 0, 0, 0)));
        assert!(!runner.handle().is_dirty());
    }

    #[test]
    fn rebuild_disables_later_group_members_durably() {
        let spec = chain(
            4,
            ChannelMapping::Rgbw,
            vec![
                EffectSpec::new("red", "solid_color").with_group("basic_color"),
                EffectSpec::new("white", "whiteout").with_group("basic_color"),
                EffectSpec::new("dim", "dim"),
            ],
        );
        let (mut runner, _recording) = runner(spec);
        assert!(runner.rebuild().unwrap());

        assert_eq!(runner.live_effect_ids(), vec!["red", "dim"]);
        let enabled: Vec<bool> = runner.handle().effects().iter().map(|e| e.enabled).collect();
        assert_eq!(enabled, vec![true, false, true]);
        assert!(!runner.rebuild().unwrap());
    }

    #[test]
    fn failed_rebuild_keeps_previous_effects_and_stays_dirty() {
        let spec = chain(3, ChannelMapping::Rgb, vec![EffectSpec::new("base", "solid_color")]);
        let (mut runner, recording) = runner(spec);
        runner.tick(Instant::now());

        runner
            .handle()
            .edit(|effects| {
                effects.push(EffectSpec::new("bogus", "no_such_effect"));
                Ok::<_, ()>(())
            })
            .unwrap();
        runner.tick(Instant::now());

        assert!(runner.handle().is_dirty());
        assert_eq!(runner.live_effect_ids(), vec!["base"]);
        assert_eq!(recording.frame_count(), 2);
        assert_eq!(recording.last_frame().unwrap()[0], Lamp::rgb(255, 0, 0));

        // Fixing the list lets the next tick catch up.
        runner
            .handle()
            .edit(|effects| {
                effects.retain(|e| e.id != "bogus");
                Ok::<_, ()>(())
            })
            .unwrap();
        runner.tick(Instant::now());
        assert!(!runner.handle().is_dirty());
    }

    #[test]
    fn invalid_arguments_fail_the_whole_rebuild() {
        let spec = chain(
            3,
            ChannelMapping::Rgb,
            vec![
                EffectSpec::new("base", "solid_color"),
                EffectSpec::new("half", "dim").with_arg("percentage", 7.0),
            ],
        );
        let (mut runner, _recording) = runner(spec);
        assert!(runner.rebuild().is_err());
        assert!(runner.live_effect_ids().is_empty());
        assert!(runner.handle().is_dirty());
    }

    #[test]
    fn failed_edits_do_not_mark_dirty() {
        let (mut runner, _recording) = runner(chain(1, ChannelMapping::Rgb, vec![]));
        runner.rebuild().unwrap();
        let result = runner.handle().edit(|_| Err::<(), _>("nope"));
        assert_eq!(result, Err("nope"));
        assert!(!runner.handle().is_dirty());
    }

    #[test]
    fn send_errors_do_not_stop_ticking() {
        let (mut output, recording) = RecordingOutput::new();
        output.fail_sends = true;
        let mut runner = runner_with(chain(2, ChannelMapping::Rgb, vec![]), output);
        for _ in 0..3 {
            runner.tick(Instant::now());
        }
        assert_eq!(recording.frame_count(), 3);
    }

    #[test]
    fn empty_chain_sends_empty_frames() {
        let spec = chain(0, ChannelMapping::Rgbw, vec![EffectSpec::new("rain", "rainbow")]);
        let (mut runner, recording) = runner(spec);
        runner.tick(Instant::now());
        assert_eq!(recording.last_frame(), Some(vec![]));
    }

    #[test]
    fn enabling_a_grouped_effect_disables_its_peers() {
        let mut effects = vec![
            EffectSpec::new("a", "solid_color").with_group("g"),
            EffectSpec::new("b", "gradient").with_group("g").disabled(),
            EffectSpec::new("c", "dim"),
        ];
        assert!(enable_exclusively(&mut effects, "b"));
        let enabled: Vec<bool> = effects.iter().map(|e| e.enabled).collect();
        assert_eq!(enabled, vec![false, true, true]);

        assert!(!enable_exclusively(&mut effects, "missing"));
        let unchanged: Vec<bool> = effects.iter().map(|e| e.enabled).collect();
        assert_eq!(unchanged, enabled);
    }

    #[test]
    fn worker_ticks_until_stopped_and_closes_once() {
        let spec = chain(5, ChannelMapping::Rgb, vec![EffectSpec::new("base", "solid_color")]);
        let (runner, recording) = runner(spec);
        let mut worker = runner.spawn().unwrap();
        thread::sleep(Duration::from_millis(100));
        worker.stop();
        drop(worker);

        let frames = recording.frame_count();
        assert!(frames > 0);
        assert_eq!(recording.close_count(), 1);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(recording.frame_count(), frames);
    }

    #[test]
    fn unspawned_runner_closes_its_output_once() {
        let (mut closed, recording) = runner(chain(2, ChannelMapping::Rgb, vec![]));
        closed.tick(Instant::now());
        closed.close();
        closed.close();
        drop(closed);
        assert_eq!(recording.close_count(), 1);

        let (dropped, recording) = runner(chain(2, ChannelMapping::Rgb, vec![]));
        drop(dropped);
        assert_eq!(recording.close_count(), 1);
    }

    #[test]
    fn tick_period_follows_rate() {
        assert_eq!(tick_period(40), Duration::from_millis(25));
        assert_eq!(tick_period(5000), Duration::from_millis(1));
        assert_eq!(tick_period(0), Duration::from_millis(1000));
    }
}
