//! Playback of decoded events.
//!
//! A [`Performer`] turns sampled indices into calls on a [`PlaybackSink`],
//! keeping track of the performance clock, the current velocity and the
//! notes that are sounding.

use super::events::{Event, shift_seconds, velocity_fraction};
use crate::error::Result;
use std::collections::BTreeMap;

/// Velocity used until the model emits its first velocity change.
pub const DEFAULT_VELOCITY: f32 = 100.0 / 127.0;

/// Receiver of a decoded performance, e.g. a synthesizer or a MIDI port.
///
/// Calls arrive in performance order; time only moves on
/// [`time_shift`](Self::time_shift).
///
/// A `note_off` may follow its `note_on` with no time in between. Output
/// devices that need a minimum hold (around half a second for most MIDI
/// synths) must delay the release themselves, and chord bass notes are
/// not sent here.
pub trait PlaybackSink {
    /// Starts `pitch` at `velocity` (a fraction of full MIDI velocity).
    fn note_on(&mut self, pitch: u8, velocity: f32);
    /// Releases `pitch`.
    fn note_off(&mut self, pitch: u8);
    /// Advances the clock.
    fn time_shift(&mut self, seconds: f64);
    /// The velocity of following notes changed.
    fn velocity_change(&mut self, velocity: f32);
}

/// One call received by a [`RecordingSink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkCall {
    /// [`PlaybackSink::note_on`]
    NoteOn(u8, f32),
    /// [`PlaybackSink::note_off`]
    NoteOff(u8),
    /// [`PlaybackSink::time_shift`]
    TimeShift(f64),
    /// [`PlaybackSink::velocity_change`]
    VelocityChange(f32),
}

/// A sink that remembers every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    /// Calls in arrival order.
    pub calls: Vec<SinkCall>,
}

impl PlaybackSink for RecordingSink {
    fn note_on(&mut self, pitch: u8, velocity: f32) {
        self.calls.push(SinkCall::NoteOn(pitch, velocity));
    }

    fn note_off(&mut self, pitch: u8) {
        self.calls.push(SinkCall::NoteOff(pitch));
    }

    fn time_shift(&mut self, seconds: f64) {
        self.calls.push(SinkCall::TimeShift(seconds));
    }

    fn velocity_change(&mut self, velocity: f32) {
        self.calls.push(SinkCall::VelocityChange(velocity));
    }
}

/// Decodes indices and drives a sink.
#[derive(Debug, Clone)]
pub struct Performer {
    time: f64,
    velocity: f32,
    // pitch -> start time
    active: BTreeMap<u8, f64>,
    max_note_duration: f64,
}

impl Performer {
    /// A performer whose clock starts at `time` seconds.
    #[must_use]
    pub const fn new(time: f64, max_note_duration: f64) -> Self {
        Self {
            time,
            velocity: DEFAULT_VELOCITY,
            active: BTreeMap::new(),
            max_note_duration,
        }
    }

    /// Current position of the performance clock, in seconds.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    /// Moves the clock without emitting anything.
    pub const fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Velocity of the next note.
    #[must_use]
    pub const fn velocity(&self) -> f32 {
        self.velocity
    }

    /// Pitches currently sounding, lowest first.
    pub fn active_notes(&self) -> impl Iterator<Item = u8> + '_ {
        self.active.keys().copied()
    }

    /// Decodes `index` and plays it.
    ///
    /// A note-off for a pitch that is not sounding is dropped. After a time
    /// shift, notes held longer than the maximum duration are released.
    ///
    /// # Errors
    ///
    /// [`Error::UndecodableIndex`](crate::error::Error::UndecodableIndex);
    /// nothing is played in that case.
    pub fn play(&mut self, index: usize, sink: &mut dyn PlaybackSink) -> Result<Event> {
        let event = Event::decode(index)?;
        match event {
            Event::NoteOn { pitch } => {
                self.active.insert(pitch, self.time);
                sink.note_on(pitch, self.velocity);
            }
            Event::NoteOff { pitch } => {
                if self.active.remove(&pitch).is_some() {
                    sink.note_off(pitch);
                }
            }
            Event::TimeShift { steps } => {
                let seconds = shift_seconds(steps);
                self.time += seconds;
                sink.time_shift(seconds);
                self.release_expired(sink);
            }
            Event::VelocityChange { bin } => {
                self.velocity = velocity_fraction(bin);
                sink.velocity_change(self.velocity);
            }
        }
        Ok(event)
    }

    fn release_expired(&mut self, sink: &mut dyn PlaybackSink) {
        let now = self.time;
        let limit = self.max_note_duration;
        self.active.retain(|&pitch, &mut start| {
            let held = now - start;
            if held > limit {
                log::debug!("note {pitch} held for {held:.2}s, over {limit}s; releasing");
                sink.note_off(pitch);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn note_off_without_note_on_is_dropped() {
        let mut performer = Performer::new(0.0, 3.0);
        let mut sink = RecordingSink::default();
        performer.play(128 + 60, &mut sink).unwrap();
        assert!(sink.calls.is_empty());
        performer.play(60, &mut sink).unwrap();
        performer.play(128 + 60, &mut sink).unwrap();
        assert_eq!(sink.calls, vec![SinkCall::NoteOn(60, DEFAULT_VELOCITY), SinkCall::NoteOff(60)]);
    }

    #[test]
    fn long_notes_are_released() {
        let mut performer = Performer::new(0.0, 1.5);
        let mut sink = RecordingSink::default();
        performer.play(64, &mut sink).unwrap();
        performer.play(355, &mut sink).unwrap();
        assert_eq!(performer.active_notes().collect::<Vec<_>>(), vec![64]);
        performer.play(355, &mut sink).unwrap();
        assert_eq!(sink.calls.last(), Some(&SinkCall::NoteOff(64)));
        assert!((performer.time() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn velocity_applies_to_following_notes() {
        let mut performer = Performer::new(0.0, 3.0);
        let mut sink = RecordingSink::default();
        performer.play(363, &mut sink).unwrap();
        performer.play(10, &mut sink).unwrap();
        assert_eq!(sink.calls[1], SinkCall::NoteOn(10, velocity_fraction(8)));
    }

    #[test]
    fn undecodable_index_plays_nothing() {
        let mut performer = Performer::new(0.0, 3.0);
        let mut sink = RecordingSink::default();
        assert_eq!(performer.play(400, &mut sink), Err(Error::UndecodableIndex(400)));
        assert!(sink.calls.is_empty());
    }
}
