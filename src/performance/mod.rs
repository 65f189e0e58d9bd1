//! Performance-RNN: real-time generation of piano performances.
//!
//! A stacked LSTM reads, each step, the previous event together with the
//! current chord and metrical position, and samples the next event from a
//! softmax over the 364-entry event table. Events are decoded and played on
//! a [`PlaybackSink`].
//!
//! # Example
//!
//! ```rust
//! use ndtape::performance::{
//!     GenerationConfig, PerformanceRnn, RecordingSink, StepOutcome, random_checkpoint,
//! };
//!
//! let vars = random_checkpoint(&[16], 0.1, 42).unwrap();
//! let config = GenerationConfig { seed: Some(7), ..Default::default() };
//! let mut rnn = PerformanceRnn::open(&vars, config).unwrap();
//!
//! let mut sink = RecordingSink::default();
//! let token = rnn.current_token();
//! let outcome = pollster::block_on(rnn.generate_step(token, &mut sink)).unwrap();
//! assert!(matches!(outcome, StepOutcome::Generated { .. }));
//! ```

mod checkpoint;
mod chords;
mod conditioning;
mod config;
mod events;
mod generator;
mod sink;

pub use checkpoint::{
    FC_BIASES, FC_WEIGHTS, RnnWeights, VariableMap, lstm_bias_name, lstm_kernel_name, random_checkpoint,
};
pub use chords::{
    CHORD_ENCODING_SIZE, CHORD_PROGRESSION_SIZE, CHORDS_PER_BAR, Chord, ChordProgression, Quality, chord_index,
};
pub use conditioning::{ConditioningEncoder, DIVISIONS_PER_QUARTER, INPUT_SIZE, QPM, QUARTERS_PER_BAR, advance_step};
pub use config::GenerationConfig;
pub use events::{
    EVENT_RANGES, EVENT_SIZE, Event, EventKind, MAX_MIDI_PITCH, MAX_SHIFT_INDEX, MAX_SHIFT_STEPS, MIN_MIDI_PITCH,
    SHIFT_OFFSET, STEPS_PER_SECOND, VELOCITY_BINS, shift_seconds, velocity_fraction,
};
pub use generator::{Canceller, GenerationContext, GenerationToken, PerformanceRnn, StepOutcome, status_message};
pub use sink::{DEFAULT_VELOCITY, Performer, PlaybackSink, RecordingSink, SinkCall};
