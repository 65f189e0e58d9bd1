//! The Performance-RNN event vocabulary.
//!
//! The model emits one index per step. Indices are laid out as consecutive
//! ranges, one per event kind:
//!
//! | kind              | values  | offset |
//! |-------------------|---------|--------|
//! | `note_on`         | 0..=127 | 0      |
//! | `note_off`        | 0..=127 | 128    |
//! | `time_shift`      | 1..=100 | 256    |
//! | `velocity_change` | 1..=8   | 356    |

use crate::error::{Error, Result};

/// Lowest MIDI pitch the model plays.
pub const MIN_MIDI_PITCH: u32 = 0;
/// Highest MIDI pitch the model plays.
pub const MAX_MIDI_PITCH: u32 = 127;
/// Number of quantised velocity levels.
pub const VELOCITY_BINS: u32 = 8;
/// Longest single time shift, in steps.
pub const MAX_SHIFT_STEPS: u32 = 100;
/// Time resolution of the event stream.
pub const STEPS_PER_SECOND: u32 = 100;

/// The kinds of event, in index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum EventKind {
    /// Start a note.
    NoteOn = 0,
    /// Release a note.
    NoteOff,
    /// Advance time.
    TimeShift,
    /// Change the velocity of following notes.
    VelocityChange,
}

/// `(kind, min value, max value)` of each index range, in order.
pub const EVENT_RANGES: [(EventKind, u32, u32); 4] = [
    (EventKind::NoteOn, MIN_MIDI_PITCH, MAX_MIDI_PITCH),
    (EventKind::NoteOff, MIN_MIDI_PITCH, MAX_MIDI_PITCH),
    (EventKind::TimeShift, 1, MAX_SHIFT_STEPS),
    (EventKind::VelocityChange, 1, VELOCITY_BINS),
];

const fn range_len(range: (EventKind, u32, u32)) -> usize {
    (range.2 - range.1 + 1) as usize
}

const fn event_size() -> usize {
    let mut total = 0;
    let mut k = 0;
    while k < EVENT_RANGES.len() {
        total += range_len(EVENT_RANGES[k]);
        k += 1;
    }
    total
}

/// Number of distinct event indices.
pub const EVENT_SIZE: usize = event_size();

/// Index of the first time shift.
pub const SHIFT_OFFSET: usize = 256;

/// Index of a one second time shift; the first input of a fresh performance.
pub const MAX_SHIFT_INDEX: usize = SHIFT_OFFSET + MAX_SHIFT_STEPS as usize - 1;

/// One decoded model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Start `pitch`.
    NoteOn {
        /// MIDI pitch.
        pitch: u8,
    },
    /// Release `pitch`.
    NoteOff {
        /// MIDI pitch.
        pitch: u8,
    },
    /// Advance time by `steps` hundredths of a second.
    TimeShift {
        /// Number of steps, `1..=100`.
        steps: u32,
    },
    /// Switch to velocity level `bin`.
    VelocityChange {
        /// Level, `1..=8`.
        bin: u32,
    },
}

impl Event {
    /// Decodes a sampled index with a linear scan over [`EVENT_RANGES`].
    ///
    /// # Errors
    ///
    /// [`Error::UndecodableIndex`] for `index >= EVENT_SIZE`.
    pub fn decode(index: usize) -> Result<Self> {
        let mut offset = 0;
        for range @ (kind, min, _) in EVENT_RANGES {
            let len = range_len(range);
            if index < offset + len {
                let value = min + u32::try_from(index - offset).map_err(|_| Error::UndecodableIndex(index))?;
                return Ok(match kind {
                    EventKind::NoteOn => Self::NoteOn { pitch: pitch(value) },
                    EventKind::NoteOff => Self::NoteOff { pitch: pitch(value) },
                    EventKind::TimeShift => Self::TimeShift { steps: value },
                    EventKind::VelocityChange => Self::VelocityChange { bin: value },
                });
            }
            offset += len;
        }
        Err(Error::UndecodableIndex(index))
    }

    /// The index this event decodes from.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] if the payload lies outside its range.
    pub fn index(self) -> Result<usize> {
        let (kind, value) = match self {
            Self::NoteOn { pitch } => (EventKind::NoteOn, u32::from(pitch)),
            Self::NoteOff { pitch } => (EventKind::NoteOff, u32::from(pitch)),
            Self::TimeShift { steps } => (EventKind::TimeShift, steps),
            Self::VelocityChange { bin } => (EventKind::VelocityChange, bin),
        };
        let (_, min, max) = EVENT_RANGES[kind as usize];
        if value < min || value > max {
            return Err(Error::IndexOutOfRange {
                index: i64::from(value),
                bound: max as usize + 1,
            });
        }
        let offset: usize = EVENT_RANGES[..kind as usize].iter().map(|&r| range_len(r)).sum();
        Ok(offset + (value - min) as usize)
    }

    /// The kind of this event.
    #[must_use]
    pub const fn kind(self) -> EventKind {
        match self {
            Self::NoteOn { .. } => EventKind::NoteOn,
            Self::NoteOff { .. } => EventKind::NoteOff,
            Self::TimeShift { .. } => EventKind::TimeShift,
            Self::VelocityChange { .. } => EventKind::VelocityChange,
        }
    }
}

// pitches are range-checked by EVENT_RANGES
fn pitch(value: u32) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

/// Duration of a time shift of `steps`.
#[must_use]
pub fn shift_seconds(steps: u32) -> f64 {
    f64::from(steps) / f64::from(STEPS_PER_SECOND)
}

/// Velocity of level `bin` as a fraction of full MIDI velocity.
#[must_use]
pub fn velocity_fraction(bin: u32) -> f32 {
    let width = 127_u32.div_ceil(VELOCITY_BINS);
    (bin * width) as f32 / 127.0
}
