//! Checkpoint variables of the Performance-RNN model.
//!
//! A checkpoint is handed over as an in-memory map from variable name to
//! array; reading it from disk is up to the caller. Every lookup states the
//! shape it expects so a mismatched checkpoint is rejected before any
//! generation starts.

use super::conditioning::INPUT_SIZE;
use super::events::EVENT_SIZE;
use crate::error::{Error, Result};
use crate::math::{LstmCell, Math};
use crate::ndarray::NDArray;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Name of the kernel of LSTM layer `k`.
#[must_use]
pub fn lstm_kernel_name(k: usize) -> String {
    format!("rnn/multi_rnn_cell/cell_{k}/basic_lstm_cell/kernel")
}

/// Name of the bias of LSTM layer `k`.
#[must_use]
pub fn lstm_bias_name(k: usize) -> String {
    format!("rnn/multi_rnn_cell/cell_{k}/basic_lstm_cell/bias")
}

/// Name of the output projection weights.
pub const FC_WEIGHTS: &str = "fully_connected/weights";
/// Name of the output projection biases.
pub const FC_BIASES: &str = "fully_connected/biases";

/// Checkpoint variables by name.
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    vars: HashMap<String, NDArray>,
}

impl VariableMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: NDArray) -> Option<NDArray> {
        self.vars.insert(name.into(), value)
    }

    /// Removes a variable.
    pub fn remove(&mut self, name: &str) -> Option<NDArray> {
        self.vars.remove(name)
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variable names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// The variable `name`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingVariable`] if it is absent.
    pub fn get(&self, name: &str) -> Result<&NDArray> {
        self.vars
            .get(name)
            .ok_or_else(|| Error::MissingVariable(name.to_string()))
    }

    /// The variable `name`, which must have exactly `shape`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingVariable`] if it is absent, [`Error::ShapeMismatch`]
    /// if its shape differs.
    pub fn get_shaped(&self, name: &str, shape: &[usize]) -> Result<&NDArray> {
        let value = self.get(name)?;
        if value.shape() != shape {
            return Err(Error::shape("checkpoint variable", shape, value.shape()));
        }
        Ok(value)
    }
}

impl FromIterator<(String, NDArray)> for VariableMap {
    fn from_iter<I: IntoIterator<Item = (String, NDArray)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Model weights resolved from a checkpoint.
#[derive(Debug, Clone)]
pub struct RnnWeights {
    /// LSTM layers, input side first.
    pub cells: Vec<LstmCell>,
    /// `[units, EVENT_SIZE]`
    pub fc_weights: NDArray,
    /// `[EVENT_SIZE]`
    pub fc_biases: NDArray,
}

impl RnnWeights {
    /// Looks up `layers` LSTM layers and the output projection.
    ///
    /// Layer widths are read from the biases (`4 · units` each); the first
    /// layer reads the conditioned input and layer `k` reads layer `k - 1`.
    /// `forget_bias` becomes a caller-owned scalar allocated through `math`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingVariable`] or [`Error::ShapeMismatch`] for the first
    /// variable that is absent or mis-shaped.
    pub fn from_checkpoint(math: &Math, vars: &VariableMap, layers: usize, forget_bias: f32) -> Result<Self> {
        if layers == 0 {
            return Err(Error::InvalidConfig("at least one LSTM layer is required".into()));
        }
        let forget_bias = math.scalar(forget_bias);
        let mut cells = Vec::with_capacity(layers);
        let mut input = INPUT_SIZE;
        for k in 0..layers {
            let bias = vars.get(&lstm_bias_name(k))?;
            let units = match bias.shape() {
                [n] if *n > 0 && n % 4 == 0 => n / 4,
                other => return Err(Error::shape("checkpoint variable", &[4], other)),
            };
            let kernel = vars.get_shaped(&lstm_kernel_name(k), &[input + units, 4 * units])?;
            cells.push(LstmCell {
                kernel: kernel.clone(),
                bias: bias.clone(),
                forget_bias: forget_bias.clone(),
            });
            input = units;
        }
        let fc_weights = vars.get_shaped(FC_WEIGHTS, &[input, EVENT_SIZE])?.clone();
        let fc_biases = vars.get_shaped(FC_BIASES, &[EVENT_SIZE])?.clone();
        log::debug!("loaded {layers} LSTM layers, {input} units at the output");
        Ok(Self {
            cells,
            fc_weights,
            fc_biases,
        })
    }

    /// Width of each layer.
    #[must_use]
    pub fn units(&self) -> Vec<usize> {
        self.cells.iter().map(LstmCell::units).collect()
    }
}

/// A checkpoint with the right names and shapes and uniform random values
/// in `[-scale, scale]`. Useful for demos and tests without a trained model.
///
/// # Errors
///
/// [`Error::InvalidConfig`] unless `scale` is finite and not negative.
pub fn random_checkpoint(layers: &[usize], scale: f32, seed: u64) -> Result<VariableMap> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(Error::InvalidConfig(format!("weight scale must be finite and >= 0, got {scale}")));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.random_range(-scale..=scale)).collect() };
    let mut vars = VariableMap::new();
    let mut input = INPUT_SIZE;
    for (k, &units) in layers.iter().enumerate() {
        let rows = input + units;
        vars.insert(lstm_kernel_name(k), NDArray::new(vec![rows, 4 * units], values(rows * 4 * units))?);
        vars.insert(lstm_bias_name(k), NDArray::new(vec![4 * units], values(4 * units))?);
        input = units;
    }
    vars.insert(FC_WEIGHTS, NDArray::new(vec![input, EVENT_SIZE], values(input * EVENT_SIZE))?);
    vars.insert(FC_BIASES, NDArray::new(vec![EVENT_SIZE], values(EVENT_SIZE))?);
    Ok(vars)
}
