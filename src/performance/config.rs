//! Generation settings.

use crate::backend::BackendKind;
use crate::error::{Error, Result};

/// Settings of a [`PerformanceRnn`](super::PerformanceRnn).
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Number of stacked LSTM layers in the checkpoint.
    pub lstm_layers: usize,
    /// Events sampled per [`generate_step`](super::PerformanceRnn::generate_step).
    /// More steps lag less, fewer steps keep the caller responsive.
    pub steps_per_generate_call: usize,
    /// How far ahead of the clock to generate, in seconds.
    pub generation_buffer_seconds: f64,
    /// When generation falls this far behind the clock, the performance
    /// clock jumps to the present.
    pub max_generation_lag_seconds: f64,
    /// Notes held longer than this are released.
    pub max_note_duration_seconds: f64,
    /// Added to the forget gate of every LSTM layer.
    pub forget_bias: f32,
    /// Seed of the sampler; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Backend to run on. Opening fails if it is unavailable.
    pub backend: BackendKind,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            lstm_layers: 1,
            steps_per_generate_call: 10,
            generation_buffer_seconds: 0.5,
            max_generation_lag_seconds: 1.0,
            max_note_duration_seconds: 3.0,
            forget_bias: 1.0,
            seed: None,
            backend: BackendKind::Cpu,
        }
    }
}

impl GenerationConfig {
    /// Checks every field.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.lstm_layers == 0 {
            return invalid("lstm_layers must be at least 1");
        }
        if self.steps_per_generate_call == 0 {
            return invalid("steps_per_generate_call must be at least 1");
        }
        if !self.generation_buffer_seconds.is_finite() || self.generation_buffer_seconds < 0.0 {
            return invalid("generation_buffer_seconds must be finite and non-negative");
        }
        if !self.max_generation_lag_seconds.is_finite() || self.max_generation_lag_seconds <= 0.0 {
            return invalid("max_generation_lag_seconds must be finite and positive");
        }
        if self.max_note_duration_seconds.is_nan() || self.max_note_duration_seconds <= 0.0 {
            return invalid("max_note_duration_seconds must be positive");
        }
        if !self.forget_bias.is_finite() {
            return invalid("forget_bias must be finite");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(GenerationConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_fields() {
        let bad = [
            GenerationConfig {
                lstm_layers: 0,
                ..Default::default()
            },
            GenerationConfig {
                steps_per_generate_call: 0,
                ..Default::default()
            },
            GenerationConfig {
                generation_buffer_seconds: -1.0,
                ..Default::default()
            },
            GenerationConfig {
                max_generation_lag_seconds: f64::NAN,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))), "{config:?}");
        }
    }
}
