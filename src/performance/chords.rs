//! Chord names and the looping chord progression that conditions the model.
//!
//! Chords are encoded as one of 49 classes: "no chord" (`N.C.`) and twelve
//! roots for each of the major, minor (`m`), augmented (`+`) and diminished
//! (`o`) triads.

use crate::error::{Error, Result};
use core::fmt;
use core::str::FromStr;

/// Number of chord classes.
pub const CHORD_ENCODING_SIZE: usize = 49;
/// Chords in one loop of the progression.
pub const CHORD_PROGRESSION_SIZE: usize = 8;
/// Chord changes per bar.
pub const CHORDS_PER_BAR: usize = 2;

const NO_CHORD: &str = "N.C.";

/// Triad qualities, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Major triad.
    Major,
    /// Minor triad.
    Minor,
    /// Augmented triad.
    Augmented,
    /// Diminished triad.
    Diminished,
}

impl Quality {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Major => "",
            Self::Minor => "m",
            Self::Augmented => "+",
            Self::Diminished => "o",
        }
    }
}

/// A chord symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Chord {
    /// No chord.
    #[default]
    NoChord,
    /// A triad on a root pitch class (`0` is C).
    Triad {
        /// Pitch class of the root, `0..12`.
        root: u8,
        /// Triad quality.
        quality: Quality,
    },
}

impl Chord {
    /// Class index in `0..CHORD_ENCODING_SIZE`.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::NoChord => 0,
            Self::Triad { root, quality } => 1 + quality as usize * 12 + usize::from(root),
        }
    }

    /// MIDI pitch of the root in the bass register, if there is a root.
    #[must_use]
    pub const fn bass_pitch(self) -> Option<u8> {
        match self {
            Self::NoChord => None,
            Self::Triad { root, .. } => Some(36 + root),
        }
    }
}

const SPELLINGS: [&str; 12] = ["C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B"];

fn parse_root(name: &str) -> Option<(u8, &str)> {
    let mut chars = name.chars();
    let letter = chars.next()?;
    let natural: u8 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    // only the spellings on black keys are accepted; no E#, Fb, B# or Cb
    if let Some(rest) = rest.strip_prefix('#') {
        matches!(letter, 'C' | 'D' | 'F' | 'G' | 'A').then_some(((natural + 1) % 12, rest))
    } else if let Some(rest) = rest.strip_prefix('b') {
        matches!(letter, 'D' | 'E' | 'G' | 'A' | 'B').then_some(((natural + 11) % 12, rest))
    } else {
        Some((natural, rest))
    }
}

impl FromStr for Chord {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        if name == NO_CHORD {
            return Ok(Self::NoChord);
        }
        let unknown = || Error::UnknownChord(name.to_string());
        let (root, suffix) = parse_root(name).ok_or_else(unknown)?;
        let quality = match suffix {
            "" => Quality::Major,
            "m" => Quality::Minor,
            "+" => Quality::Augmented,
            "o" => Quality::Diminished,
            _ => return Err(unknown()),
        };
        Ok(Self::Triad { root, quality })
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChord => f.write_str(NO_CHORD),
            Self::Triad { root, quality } => {
                write!(f, "{}{}", SPELLINGS[usize::from(*root) % 12], quality.suffix())
            }
        }
    }
}

/// Class index of a chord name.
///
/// # Errors
///
/// [`Error::UnknownChord`] if the name is not in the chord table.
pub fn chord_index(name: &str) -> Result<usize> {
    name.parse::<Chord>().map(Chord::index)
}

/// Eight chords played in a loop, two per bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChordProgression {
    chords: [Chord; CHORD_PROGRESSION_SIZE],
}

impl ChordProgression {
    /// A progression of the given chords.
    #[must_use]
    pub const fn new(chords: [Chord; CHORD_PROGRESSION_SIZE]) -> Self {
        Self { chords }
    }

    /// Parses one chord name per slot.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownChord`] for an unknown name, [`Error::InvalidConfig`]
    /// unless exactly eight names are given.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.len() != CHORD_PROGRESSION_SIZE {
            return Err(Error::InvalidConfig(format!(
                "a chord progression has {CHORD_PROGRESSION_SIZE} chords, got {}",
                names.len()
            )));
        }
        let mut chords = [Chord::NoChord; CHORD_PROGRESSION_SIZE];
        for (slot, name) in chords.iter_mut().zip(names) {
            *slot = name.as_ref().parse()?;
        }
        Ok(Self { chords })
    }

    /// The chords, in order.
    #[must_use]
    pub const fn chords(&self) -> &[Chord; CHORD_PROGRESSION_SIZE] {
        &self.chords
    }

    /// Chord at absolute position `pos`, wrapping around the loop.
    #[must_use]
    pub const fn at(&self, pos: usize) -> Chord {
        self.chords[pos % CHORD_PROGRESSION_SIZE]
    }

    /// Class index of every slot, as floats for the conditioning encoder.
    #[must_use]
    pub fn indices(&self) -> Vec<f32> {
        self.chords.iter().map(|c| c.index() as f32).collect()
    }
}

impl Default for ChordProgression {
    /// `C C C C F F G G`
    fn default() -> Self {
        let major = |root| Chord::Triad {
            root,
            quality: Quality::Major,
        };
        Self::new([major(0), major(0), major(0), major(0), major(5), major(5), major(7), major(7)])
    }
}

impl fmt::Display for ChordProgression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chord) in self.chords.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{chord}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_positions() {
        assert_eq!(chord_index("N.C.").unwrap(), 0);
        assert_eq!(chord_index("C").unwrap(), 1);
        assert_eq!(chord_index("B").unwrap(), 12);
        assert_eq!(chord_index("Cm").unwrap(), 13);
        assert_eq!(chord_index("Bbm").unwrap(), 23);
        assert_eq!(chord_index("C+").unwrap(), 25);
        assert_eq!(chord_index("Co").unwrap(), 37);
        assert_eq!(chord_index("Bo").unwrap(), 48);
    }

    #[test]
    fn enharmonic_spellings_agree() {
        for (sharp, flat) in [("C#", "Db"), ("D#m", "Ebm"), ("F#+", "Gb+"), ("G#o", "Abo"), ("A#", "Bb")] {
            assert_eq!(chord_index(sharp).unwrap(), chord_index(flat).unwrap());
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        for name in ["", "H", "Cmaj7", "E#", "Cb", "c", "Dsus"] {
            assert!(matches!(chord_index(name), Err(Error::UnknownChord(_))), "{name}");
        }
    }

    #[test]
    fn progression_round_trips_through_display() {
        let p = ChordProgression::parse(&["Am", "Am", "G", "G", "F", "F", "E", "E"]).unwrap();
        assert_eq!(p.to_string(), "Am,Am,G,G,F,F,E,E");
        assert_eq!(p.at(9), p.at(1));
        assert_eq!(p.at(6).bass_pitch(), Some(41));
        assert!(ChordProgression::parse(&["C"]).is_err());
    }
}
