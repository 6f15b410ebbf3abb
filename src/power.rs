/// Intermittent power source
///
/// Models an energy harvester (RF or solar) feeding a battery-free device.
/// Power alternates between an "on" interval and an "off" interval whose
/// durations come from two independent samplers. The device is powered at
/// the instant the source is created.
///
/// The transition sequence is lazy and restartable: `timeline()` always
/// replays the same schedule from the start because samplers are cloned from
/// their pristine, seeded state. `is_on` materializes the schedule only as
/// far as it needs to answer a query, and forgets transitions that are no
/// longer in effect at the latest query time.

use std::collections::VecDeque;
use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::sim::{SimContext, SimTime};

/// Source of interval durations
///
/// Implementations must return a strictly positive, finite duration; any
/// other value stops the power model with `PowerModelExhausted`.
pub trait DurationSampler: fmt::Debug {
    fn sample(&mut self) -> f64;

    /// Copy of the sampler in its current state
    fn boxed_clone(&self) -> Box<dyn DurationSampler>;
}

/// Exponentially distributed durations with the given mean
#[derive(Clone, Debug)]
pub struct Exponential {
    mean: f64,
    distribution: Exp<f64>,
    rng: ChaCha8Rng,
}

impl Exponential {
    pub fn new(mean: f64, seed: u64) -> Result<Self> {
        Self::with_rng(mean, ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn with_rng(mean: f64, rng: ChaCha8Rng) -> Result<Self> {
        if !(mean.is_finite() && mean > 0.0) {
            return Err(TesseraError::InvalidParameters(format!(
                "Exponential mean must be positive and finite, got {}",
                mean
            )));
        }
        let distribution = Exp::new(1.0 / mean).map_err(|e| {
            TesseraError::InvalidParameters(format!("Exponential rate for mean {}: {:?}", mean, e))
        })?;
        Ok(Self {
            mean,
            distribution,
            rng,
        })
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
}

impl DurationSampler for Exponential {
    fn sample(&mut self) -> f64 {
        self.distribution.sample(&mut self.rng)
    }

    fn boxed_clone(&self) -> Box<dyn DurationSampler> {
        Box::new(self.clone())
    }
}

/// The same duration every time
#[derive(Clone, Debug)]
pub struct Fixed {
    duration: f64,
}

impl Fixed {
    pub fn new(duration: f64) -> Self {
        Self { duration }
    }
}

impl DurationSampler for Fixed {
    fn sample(&mut self) -> f64 {
        self.duration
    }

    fn boxed_clone(&self) -> Box<dyn DurationSampler> {
        Box::new(self.clone())
    }
}

/// A scripted sequence of durations, repeated cyclically
///
/// Used to force interruptions at exact instants. An empty script yields 0,
/// which the power source rejects.
#[derive(Clone, Debug)]
pub struct Deterministic {
    durations: Vec<f64>,
    cursor: usize,
}

impl Deterministic {
    pub fn new(durations: Vec<f64>) -> Self {
        Self {
            durations,
            cursor: 0,
        }
    }
}

impl DurationSampler for Deterministic {
    fn sample(&mut self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        let duration = self.durations[self.cursor % self.durations.len()];
        self.cursor += 1;
        duration
    }

    fn boxed_clone(&self) -> Box<dyn DurationSampler> {
        Box::new(self.clone())
    }
}

/// Whether the device currently has power
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn toggled(self) -> Self {
        match self {
            PowerState::On => PowerState::Off,
            PowerState::Off => PowerState::On,
        }
    }

    fn phase(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.phase())
    }
}

/// The power switches to `state` at time `at` and stays there until the
/// next transition
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerTransition {
    pub at: SimTime,
    pub state: PowerState,
}

/// Power state at an instant plus the time of the next change
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PowerStatus {
    pub state: PowerState,
    pub next_transition: SimTime,
}

/// Lazy, infinite sequence of power transitions
///
/// Yields `Err(PowerModelExhausted)` once if a sampler misbehaves and ends
/// after that.
#[derive(Debug)]
pub struct PowerTimeline {
    on: Box<dyn DurationSampler>,
    off: Box<dyn DurationSampler>,
    now: SimTime,
    state: PowerState,
    exhausted: bool,
}

impl Iterator for PowerTimeline {
    type Item = Result<PowerTransition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let duration = match self.state {
            PowerState::On => self.on.sample(),
            PowerState::Off => self.off.sample(),
        };

        if !(duration.is_finite() && duration > 0.0) {
            self.exhausted = true;
            return Some(Err(TesseraError::PowerModelExhausted {
                phase: self.state.phase(),
                duration,
            }));
        }

        self.now += duration;
        self.state = self.state.toggled();
        Some(Ok(PowerTransition {
            at: self.now,
            state: self.state,
        }))
    }
}

/// Intermittent power supply driven by two duration samplers
#[derive(Debug)]
pub struct PowerSource {
    start: SimTime,
    on_sampler: Box<dyn DurationSampler>,
    off_sampler: Box<dyn DurationSampler>,
    cursor: PowerTimeline,
    /// Transitions from the one in effect at the latest query onward
    window: VecDeque<PowerTransition>,
    /// Transitions dropped from the front of `window`
    forgotten: u64,
    failure: Option<(&'static str, f64)>,
}

impl PowerSource {
    /// Creates a source that is powered from the context's current time
    pub fn new<On, Off>(ctx: &SimContext, on: On, off: Off) -> Self
    where
        On: DurationSampler + 'static,
        Off: DurationSampler + 'static,
    {
        Self::from_boxed(ctx, Box::new(on), Box::new(off))
    }

    pub fn from_boxed(
        ctx: &SimContext,
        on_sampler: Box<dyn DurationSampler>,
        off_sampler: Box<dyn DurationSampler>,
    ) -> Self {
        let start = ctx.now();
        let cursor = PowerTimeline {
            on: on_sampler.boxed_clone(),
            off: off_sampler.boxed_clone(),
            now: start,
            state: PowerState::On,
            exhausted: false,
        };

        Self {
            start,
            on_sampler,
            off_sampler,
            cursor,
            window: VecDeque::new(),
            forgotten: 0,
            failure: None,
        }
    }

    /// Restartable transition sequence from the source's start time
    pub fn timeline(&self) -> PowerTimeline {
        PowerTimeline {
            on: self.on_sampler.boxed_clone(),
            off: self.off_sampler.boxed_clone(),
            now: self.start,
            state: PowerState::On,
            exhausted: false,
        }
    }

    /// Materialized transitions still held in memory, in time order
    pub fn retained(&self) -> impl Iterator<Item = &PowerTransition> + '_ {
        self.window.iter()
    }

    /// Number of transitions materialized and then dropped
    pub fn forgotten(&self) -> u64 {
        self.forgotten
    }

    /// Whether `at` falls before the retained window
    fn is_forgotten(&self, at: SimTime) -> bool {
        self.forgotten > 0 && self.window.front().map_or(false, |t| at < t.at)
    }

    /// Drops every transition superseded by the one in effect at `at`
    fn forget_before(&mut self, at: SimTime) {
        let in_effect = self.window.partition_point(|t| t.at <= at);
        if in_effect > 1 {
            self.window.drain(..in_effect - 1);
            self.forgotten += (in_effect - 1) as u64;
        }
    }

    /// Extends the window until it holds a transition strictly after `at`
    fn materialize_past(&mut self, at: SimTime) -> Result<()> {
        while self.window.back().map_or(true, |t| t.at <= at) {
            if let Some((phase, duration)) = self.failure {
                return Err(TesseraError::PowerModelExhausted { phase, duration });
            }

            match self.cursor.next() {
                Some(Ok(transition)) => {
                    debug!(at = transition.at, state = %transition.state, "power transition");
                    self.window.push_back(transition);
                }
                Some(Err(err)) => {
                    if let TesseraError::PowerModelExhausted { phase, duration } = err {
                        self.failure = Some((phase, duration));
                    }
                    return Err(err);
                }
                None => {
                    let (phase, duration) = self.failure.unwrap_or(("timeline", f64::NAN));
                    return Err(TesseraError::PowerModelExhausted { phase, duration });
                }
            }
        }
        Ok(())
    }

    /// Power state at `at`; a transition at exactly `at` is already in effect
    pub fn state_at(&mut self, at: SimTime) -> Result<PowerState> {
        if at < self.start {
            return Ok(PowerState::On);
        }
        if self.is_forgotten(at) {
            return self.replay_state_at(at);
        }
        self.materialize_past(at)?;
        self.forget_before(at);

        let in_effect = self.window.partition_point(|t| t.at <= at);
        Ok(match in_effect {
            0 => PowerState::On,
            n => self.window[n - 1].state,
        })
    }

    pub fn is_on(&mut self, at: SimTime) -> Result<bool> {
        Ok(self.state_at(at)? == PowerState::On)
    }

    /// First transition strictly after `at`
    pub fn next_transition_after(&mut self, at: SimTime) -> Result<PowerTransition> {
        if self.is_forgotten(at) {
            return self.replay_after(at);
        }
        self.materialize_past(at)?;
        self.forget_before(at);

        let index = self.window.partition_point(|t| t.at <= at);
        Ok(self.window[index])
    }

    fn replay_state_at(&self, at: SimTime) -> Result<PowerState> {
        let mut state = PowerState::On;
        for transition in self.timeline() {
            let transition = transition?;
            if transition.at > at {
                break;
            }
            state = transition.state;
        }
        Ok(state)
    }

    fn replay_after(&self, at: SimTime) -> Result<PowerTransition> {
        for transition in self.timeline() {
            let transition = transition?;
            if transition.at > at {
                return Ok(transition);
            }
        }
        Err(TesseraError::PowerModelExhausted {
            phase: "timeline",
            duration: f64::NAN,
        })
    }

    pub fn status(&mut self, at: SimTime) -> Result<PowerStatus> {
        let state = self.state_at(at)?;
        let next = self.next_transition_after(at)?;
        Ok(PowerStatus {
            state,
            next_transition: next.at,
        })
    }
}
