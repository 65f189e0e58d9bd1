//! Builds the model input for one step from array ops.
//!
//! The input row is the concatenation of
//!
//! ```text
//! chord one-hot (49) | quarter one-hot (4) | division one-hot (24) | event one-hot (364)
//! ```
//!
//! The metrical position is derived from the step counter, so the whole
//! encoding stays on the backend. The performance is played at a fixed
//! 120 QPM in 4/4.

use super::chords::{CHORD_ENCODING_SIZE, CHORD_PROGRESSION_SIZE, CHORDS_PER_BAR, ChordProgression};
use super::events::{EVENT_SIZE, MAX_SHIFT_STEPS, SHIFT_OFFSET, STEPS_PER_SECOND};
use crate::error::Result;
use crate::math::Math;
use crate::ndarray::NDArray;

/// Tempo in quarter notes per minute.
pub const QPM: f32 = 120.0;
/// Quarters in a bar.
pub const QUARTERS_PER_BAR: usize = 4;
/// Metrical subdivisions of a quarter.
pub const DIVISIONS_PER_QUARTER: usize = 24;
/// Width of one input row.
pub const INPUT_SIZE: usize = CHORD_ENCODING_SIZE + QUARTERS_PER_BAR + DIVISIONS_PER_QUARTER + EVENT_SIZE;

const PROGRESSION_BARS: usize = CHORD_PROGRESSION_SIZE / CHORDS_PER_BAR;

/// Encodes steps against a chord progression.
#[derive(Debug, Clone)]
pub struct ConditioningEncoder {
    // chord class per progression slot, `[8]`
    progression: NDArray,
}

impl ConditioningEncoder {
    /// An encoder for `progression`. The class table is a caller-owned
    /// array, not tracked by any scope.
    ///
    /// # Errors
    ///
    /// Never in practice; the table always has eight entries.
    pub fn new(progression: &ChordProgression) -> Result<Self> {
        Ok(Self {
            progression: NDArray::new(vec![CHORD_PROGRESSION_SIZE], progression.indices())?,
        })
    }

    /// The chord classes, `[8]`.
    #[must_use]
    pub const fn progression(&self) -> &NDArray {
        &self.progression
    }

    /// The `[1, INPUT_SIZE]` input for the step numbered `step` (a scalar)
    /// after the event `last_sample` (a scalar index).
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`](crate::error::Error::IndexOutOfRange) if
    /// `last_sample` is not an event index.
    pub fn encode(&self, math: &Math, step: &NDArray, last_sample: &NDArray) -> Result<NDArray> {
        let constant = |v: f32| math.scalar(v);
        let minute = math.divide(step, &constant(60.0 * STEPS_PER_SECOND as f32))?;
        let bar = math.multiply(&minute, &constant(QPM / QUARTERS_PER_BAR as f32))?;

        // position in the progression
        let bars = constant(PROGRESSION_BARS as f32);
        let loop_start = math.multiply(&math.floor(&math.divide(&bar, &bars)?)?, &bars)?;
        let chord_bar = math.subtract(&bar, &loop_start)?;
        let chord_pos = math.floor(&math.multiply(&chord_bar, &constant(CHORDS_PER_BAR as f32))?)?;
        let slot = math.one_hot(&chord_pos, CHORD_PROGRESSION_SIZE)?;
        let chord = math.sum(&math.multiply(&slot, &self.progression)?, None)?;

        // position in the bar
        let bar_offset = math.subtract(&bar, &math.floor(&bar)?)?;
        let quarter_float = math.multiply(&bar_offset, &constant(QUARTERS_PER_BAR as f32))?;
        let quarter = math.floor(&quarter_float)?;
        let division = math.floor(&math.multiply(
            &math.subtract(&quarter_float, &quarter)?,
            &constant(DIVISIONS_PER_QUARTER as f32),
        )?)?;

        let chord = math.one_hot(&chord, CHORD_ENCODING_SIZE)?;
        let quarter = math.one_hot(&quarter, QUARTERS_PER_BAR)?;
        let division = math.one_hot(&division, DIVISIONS_PER_QUARTER)?;
        let event = math.one_hot(last_sample, EVENT_SIZE)?;

        let meter = math.concat(&quarter, &division, 1)?;
        let conditioning = math.concat(&chord, &meter, 1)?;
        math.concat(&conditioning, &event, 1)
    }
}

/// The step counter after `sample`: advanced by the shift length for a
/// time shift, unchanged for any other event.
///
/// ```text
/// is_shift = clip(sample - 255, 0, 1) · clip(356 - sample, 0, 1)
/// next     = step + is_shift · (sample - 255)
/// ```
///
/// # Errors
///
/// Propagates op errors.
pub fn advance_step(math: &Math, step: &NDArray, sample: &NDArray) -> Result<NDArray> {
    let lo = math.scalar(SHIFT_OFFSET as f32 - 1.0);
    let hi = math.scalar((SHIFT_OFFSET as u32 + MAX_SHIFT_STEPS) as f32);
    let num_steps = math.subtract(sample, &lo)?;
    let above = math.clip(&num_steps, 0.0, 1.0)?;
    let below = math.clip(&math.subtract(&hi, sample)?, 0.0, 1.0)?;
    let is_shift = math.multiply(&above, &below)?;
    math.add(step, &math.multiply(&is_shift, &num_steps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::chords::Chord;

    fn hot(row: &[f32], from: usize, len: usize) -> usize {
        row[from..from + len].iter().position(|&v| v == 1.0).unwrap()
    }

    #[test]
    fn input_layout() {
        assert_eq!(INPUT_SIZE, 441);
        let math = Math::cpu();
        let progression = ChordProgression::parse(&["C", "C", "Am", "Am", "Dm", "Dm", "G", "G"]).unwrap();
        let encoder = ConditioningEncoder::new(&progression).unwrap();

        // 2.65 bars in: sixth chord slot, third quarter, division 14
        let step = NDArray::scalar(530.0);
        let row = encoder
            .encode(&math, &step, &NDArray::scalar(355.0))
            .unwrap();
        assert_eq!(row.shape(), &[1, INPUT_SIZE]);
        let row = row.data_sync().unwrap();
        assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 4);
        assert_eq!(hot(&row, 0, 49), "Dm".parse::<Chord>().unwrap().index());
        assert_eq!(hot(&row, 49, 4), 2);
        assert_eq!(hot(&row, 53, 24), 14);
        assert_eq!(hot(&row, 77, 364), 355);
    }

    #[test]
    fn progression_loops_after_four_bars() {
        let math = Math::cpu();
        let encoder = ConditioningEncoder::new(&ChordProgression::default()).unwrap();
        // four bars at 120 QPM last eight seconds
        let row = encoder
            .encode(&math, &NDArray::scalar(830.0), &NDArray::scalar(0.0))
            .unwrap()
            .data_sync()
            .unwrap();
        assert_eq!(hot(&row, 0, 49), 1);
        assert_eq!(hot(&row, 49, 4), 0);
    }

    #[test]
    fn only_time_shifts_advance_the_step() {
        let math = Math::cpu();
        let step = NDArray::scalar(10.0);
        for (sample, expected) in [(60.0, 10.0), (255.0, 10.0), (256.0, 11.0), (355.0, 110.0), (356.0, 10.0)] {
            let next = advance_step(&math, &step, &NDArray::scalar(sample)).unwrap();
            assert_eq!(next.get_scalar().unwrap(), expected, "sample {sample}");
        }
    }
}
