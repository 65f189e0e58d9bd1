//! The real-time generation loop.
//!
//! A [`PerformanceRnn`] samples a few events per call and hands them to a
//! [`PlaybackSink`]. The driver calls
//! [`generate_step`](PerformanceRnn::generate_step), waits
//! [`schedule_delay`](PerformanceRnn::schedule_delay), and repeats.
//!
//! Work is tied to a [`GenerationToken`]. Resetting the performance (or
//! cancelling through a [`Canceller`]) issues a new token; a step started
//! with an older one finishes as [`StepOutcome::Cancelled`] without
//! touching the sink or the model state.

use super::chords::ChordProgression;
use super::checkpoint::{RnnWeights, VariableMap};
use super::conditioning::{ConditioningEncoder, advance_step};
use super::config::GenerationConfig;
use super::events::{Event, MAX_SHIFT_INDEX};
use super::sink::{PlaybackSink, Performer};
use crate::error::{Error, Result};
use crate::math::{LstmState, Math};
use crate::ndarray::NDArray;
use core::cell::Cell;
use core::time::Duration;
use std::rc::Rc;

/// Identifies one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationToken(u64);

/// Invalidates outstanding tokens from outside the generator, e.g. while a
/// step is waiting on a device read.
#[derive(Debug, Clone)]
pub struct Canceller {
    latest: Rc<Cell<u64>>,
}

impl Canceller {
    /// Makes every token issued so far stale. The generator keeps its state;
    /// call [`PerformanceRnn::reset`] to continue.
    pub fn cancel(&self) {
        self.latest.set(self.latest.get() + 1);
    }
}

/// Result of one [`generate_step`](PerformanceRnn::generate_step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Events were sampled and played.
    Generated {
        /// Decoded events, in order. Undecodable samples are left out.
        events: Vec<Event>,
        /// Every sampled index, in order.
        samples: Vec<usize>,
    },
    /// The token was stale; nothing was played and no state changed.
    Cancelled,
}

/// Everything that changes while generating.
///
/// The recurrent state, the last sample and the step counter are arrays
/// owned here, outside any scope, and replaced after every step.
#[derive(Debug)]
pub struct GenerationContext {
    latest: Rc<Cell<u64>>,
    state: LstmState,
    last_sample: NDArray,
    step: NDArray,
    performer: Performer,
}

impl GenerationContext {
    /// A fresh context for layers of the given widths, with the clock at
    /// `now` seconds.
    #[must_use]
    pub fn new(math: &Math, units: &[usize], now: f64, max_note_duration: f64) -> Self {
        Self {
            latest: Rc::new(Cell::new(0)),
            state: LstmState::zeros(math, units),
            last_sample: math.scalar(MAX_SHIFT_INDEX as f32),
            step: math.scalar(0.0),
            performer: Performer::new(now, max_note_duration),
        }
    }

    /// The token of the current run.
    #[must_use]
    pub fn token(&self) -> GenerationToken {
        GenerationToken(self.latest.get())
    }

    /// Whether `token` belongs to the current run.
    #[must_use]
    pub fn is_current(&self, token: GenerationToken) -> bool {
        token.0 == self.latest.get()
    }

    /// A handle that can cancel the current run.
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        Canceller {
            latest: Rc::clone(&self.latest),
        }
    }

    /// Zeroes the recurrent state, rewinds the step counter, moves the
    /// clock to `now` and issues a new token.
    ///
    /// # Errors
    ///
    /// [`Error::UseAfterDispose`] if the previous state was released
    /// elsewhere.
    pub fn reset(&mut self, math: &Math, units: &[usize], now: f64) -> Result<GenerationToken> {
        self.latest.set(self.latest.get() + 1);
        let fresh = LstmState::zeros(math, units);
        let old = core::mem::replace(&mut self.state, fresh);
        let old_sample = core::mem::replace(&mut self.last_sample, math.scalar(MAX_SHIFT_INDEX as f32));
        let old_step = core::mem::replace(&mut self.step, math.scalar(0.0));
        self.performer.set_time(now);
        for x in old.arrays().chain([&old_sample, &old_step]) {
            math.dispose(x)?;
        }
        log::debug!("generation reset, token {}", self.latest.get());
        Ok(self.token())
    }

    /// The recurrent state.
    #[must_use]
    pub const fn state(&self) -> &LstmState {
        &self.state
    }

    /// Scalar index of the last sampled event.
    #[must_use]
    pub const fn last_sample(&self) -> &NDArray {
        &self.last_sample
    }

    /// Scalar count of elapsed steps.
    #[must_use]
    pub const fn step(&self) -> &NDArray {
        &self.step
    }

    /// The event player.
    #[must_use]
    pub const fn performer(&self) -> &Performer {
        &self.performer
    }
}

/// A Performance-RNN model ready to generate.
#[derive(Debug)]
pub struct PerformanceRnn {
    math: Math,
    weights: RnnWeights,
    progression: ChordProgression,
    encoder: ConditioningEncoder,
    context: GenerationContext,
    config: GenerationConfig,
}

impl PerformanceRnn {
    /// Opens a model on the backend named in `config`.
    ///
    /// Everything that can fail is checked here, before any generation:
    /// the settings, the backend, and every checkpoint variable.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`], [`Error::DeviceUnavailable`],
    /// [`Error::MissingVariable`] or [`Error::ShapeMismatch`]. See
    /// [`status_message`] for a user-facing rendering.
    pub fn open(vars: &VariableMap, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        let math = Math::try_with_kind(config.backend)?;
        Self::new(math, vars, config)
    }

    /// Builds a model on an existing context. The clock starts at zero.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), except for the backend check.
    pub fn new(math: Math, vars: &VariableMap, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        let math = match config.seed {
            Some(seed) => math.seeded(seed),
            None => math,
        };
        let weights = RnnWeights::from_checkpoint(&math, vars, config.lstm_layers, config.forget_bias)?;
        let progression = ChordProgression::default();
        let encoder = ConditioningEncoder::new(&progression)?;
        let context = GenerationContext::new(&math, &weights.units(), 0.0, config.max_note_duration_seconds);
        log::debug!(
            "performance rnn ready: {} layers on {:?}",
            weights.cells.len(),
            math.backend().kind()
        );
        Ok(Self {
            math,
            weights,
            progression,
            encoder,
            context,
            config,
        })
    }

    /// The math context the model runs on.
    #[must_use]
    pub const fn math(&self) -> &Math {
        &self.math
    }

    /// The settings.
    #[must_use]
    pub const fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// The progression conditioning the model.
    #[must_use]
    pub const fn progression(&self) -> &ChordProgression {
        &self.progression
    }

    /// The mutable generation state.
    #[must_use]
    pub const fn context(&self) -> &GenerationContext {
        &self.context
    }

    /// The token of the current run.
    #[must_use]
    pub fn current_token(&self) -> GenerationToken {
        self.context.token()
    }

    /// A handle that can cancel the current run.
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        self.context.canceller()
    }

    /// Starts a new performance at `now` seconds.
    ///
    /// # Errors
    ///
    /// See [`GenerationContext::reset`].
    pub fn reset(&mut self, now: f64) -> Result<GenerationToken> {
        self.context.reset(&self.math, &self.weights.units(), now)
    }

    /// Switches chords and starts a new performance at `now` seconds.
    ///
    /// # Errors
    ///
    /// See [`GenerationContext::reset`].
    pub fn set_chord_progression(&mut self, progression: ChordProgression, now: f64) -> Result<GenerationToken> {
        self.encoder = ConditioningEncoder::new(&progression)?;
        self.progression = progression;
        self.reset(now)
    }

    /// Samples `steps_per_generate_call` events and plays them on `sink`.
    ///
    /// All intermediates live in one scope. The token is checked before
    /// any work and again after the samples are read back; if it went
    /// stale, everything produced is released and the previous state stays.
    ///
    /// # Errors
    ///
    /// Any op or transfer error; the previous state stays in that case
    /// too. Undecodable samples are logged and skipped, not returned.
    pub async fn generate_step(&mut self, token: GenerationToken, sink: &mut dyn PlaybackSink) -> Result<StepOutcome> {
        if !self.context.is_current(token) {
            log::trace!("dropping step of stale token {}", token.0);
            return Ok(StepOutcome::Cancelled);
        }
        let Self {
            math,
            weights,
            encoder,
            context,
            config,
            ..
        } = self;

        let scope = math.begin_scope();
        let mut state = context.state.clone();
        let mut last = context.last_sample.clone();
        let mut step = context.step.clone();
        let mut samples = Vec::with_capacity(config.steps_per_generate_call);
        for _ in 0..config.steps_per_generate_call {
            let input = encoder.encode(math, &step, &last)?;
            state = math.multi_rnn_cell(&weights.cells, &input, &state)?;
            let top = state
                .h
                .last()
                .ok_or_else(|| Error::InvalidConfig("at least one LSTM layer is required".into()))?;
            let logits = math.add(&math.matmul(top, &weights.fc_weights)?, &weights.fc_biases)?;
            let probs = math.softmax(&logits)?;
            let sample = math.multinomial(&probs, 1)?.as_scalar()?;
            step = advance_step(math, &step, &sample)?;
            last = sample.clone();
            samples.push(sample);
        }

        let mut indices = Vec::with_capacity(samples.len());
        for sample in &samples {
            let value = sample.data().await?;
            indices.push(value.first().map_or(usize::MAX, |&v| v as usize));
        }

        if !context.is_current(token) {
            log::trace!("token {} went stale during read back", token.0);
            drop(scope);
            return Ok(StepOutcome::Cancelled);
        }

        for x in state.arrays().chain([&last, &step]) {
            scope.keep(x)?;
        }
        for x in context.state.arrays().chain([&context.last_sample, &context.step]) {
            scope.track(x)?;
        }
        scope.end()?;
        context.state = state;
        context.last_sample = last;
        context.step = step;

        let mut events = Vec::with_capacity(indices.len());
        for &index in &indices {
            match context.performer.play(index, sink) {
                Ok(event) => events.push(event),
                Err(e) => log::warn!("skipping sample: {e}"),
            }
        }
        Ok(StepOutcome::Generated {
            events,
            samples: indices,
        })
    }

    /// How long to wait before the next step when the clock reads `now`.
    ///
    /// If generation lags more than the allowed maximum, the performance
    /// clock jumps forward to `now` first.
    pub fn schedule_delay(&mut self, now: f64) -> Duration {
        let performer = &mut self.context.performer;
        let lag = now - performer.time();
        if lag > self.config.max_generation_lag_seconds {
            log::warn!(
                "generation is {lag:.2}s behind, over {}s; resetting time",
                self.config.max_generation_lag_seconds
            );
            performer.set_time(now);
        }
        let ahead = performer.time() - now - self.config.generation_buffer_seconds;
        Duration::from_secs_f64(ahead.max(0.0))
    }
}

/// A user-facing message for an error raised while opening a model.
#[must_use]
pub fn status_message(error: &Error) -> String {
    match error {
        Error::DeviceUnavailable(reason) => {
            format!("This device is not supported ({reason}). Try the CPU backend.")
        }
        Error::MissingVariable(name) => {
            format!("The checkpoint is incomplete: variable `{name}` is missing.")
        }
        Error::ShapeMismatch { lhs, rhs, .. } => {
            format!("The checkpoint does not fit this model: expected shape {lhs:?}, found {rhs:?}.")
        }
        Error::InvalidConfig(reason) => format!("Invalid settings: {reason}."),
        other => format!("Could not start generation: {other}."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::checkpoint::random_checkpoint;
    use crate::performance::sink::RecordingSink;

    fn model(steps: usize) -> PerformanceRnn {
        let vars = random_checkpoint(&[8], 0.2, 3).unwrap();
        let config = GenerationConfig {
            steps_per_generate_call: steps,
            seed: Some(11),
            ..Default::default()
        };
        PerformanceRnn::open(&vars, config).unwrap()
    }

    #[test]
    fn step_produces_the_configured_number_of_samples() {
        let mut rnn = model(5);
        let mut sink = RecordingSink::default();
        let token = rnn.current_token();
        let outcome = pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap();
        let StepOutcome::Generated { samples, events } = outcome else {
            panic!("step was cancelled");
        };
        assert_eq!(samples.len(), 5);
        assert!(events.len() <= 5);
        assert_eq!(
            rnn.context().last_sample().get_scalar().unwrap() as usize,
            samples[4]
        );
    }

    #[test]
    fn stale_token_touches_nothing() {
        let mut rnn = model(3);
        let stale = rnn.current_token();
        rnn.reset(0.0).unwrap();
        let before = rnn.math().live_arrays();
        let mut sink = RecordingSink::default();
        let outcome = pollster::block_on(rnn.generate_step(stale, &mut sink)).unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
        assert!(sink.calls.is_empty());
        assert_eq!(rnn.math().live_arrays(), before);
    }

    #[test]
    fn live_arrays_stay_flat_across_steps() {
        let mut rnn = model(4);
        let mut sink = RecordingSink::default();
        let token = rnn.current_token();
        pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap();
        let after_one = rnn.math().live_arrays();
        pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap();
        assert_eq!(rnn.math().live_arrays(), after_one);
    }

    #[test]
    fn lagging_clock_jumps_forward() {
        let mut rnn = model(1);
        assert_eq!(rnn.schedule_delay(5.0), Duration::ZERO);
        assert!((rnn.context().performer().time() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn status_messages_name_the_problem() {
        let msg = status_message(&Error::MissingVariable("fully_connected/weights".into()));
        assert!(msg.contains("fully_connected/weights"));
    }
}
