//! Composite ops built from the primitives: softmax, one-hot encoding,
//! multinomial sampling and LSTM cells.

use super::{Keep, Math, ScopeGuard};
use crate::error::{Error, Result};
use crate::ndarray::{DType, NDArray};
use crate::tape::{InputGradients, KernelArgs, KernelNode};

impl Math {
    /// Repeats `reduced` (the last axis of `shape` reduced away) along that
    /// axis so it lines up with an array of `shape`.
    fn spread_last(&self, reduced: &NDArray, shape: &[usize]) -> Result<NDArray> {
        let Some((&cols, outer)) = shape.split_last() else {
            return Ok(reduced.clone());
        };
        if outer.is_empty() {
            return Ok(reduced.clone());
        }
        let rows: usize = outer.iter().product();
        // recorded reshapes keep the gradient path through `reduced`
        let column = if reduced.dtype() == DType::F32 {
            self.reshape(reduced, vec![rows, 1])?
        } else {
            reduced.as_type(DType::F32)?.reshape(vec![rows, 1])?
        };
        let ones = self.fill(vec![1, cols], 1.0);
        self.reshape(&self.matmul(&column, &ones)?, shape.to_vec())
    }

    fn softmax_forward(&self, logits: &NDArray) -> Result<NDArray> {
        let axis = logits.rank() - 1;
        let peak = self.max(logits, Some(axis))?;
        let shifted = self.subtract(logits, &self.spread_last(&peak, logits.shape())?)?;
        let e = self.exp(&shifted)?;
        let total = self.sum(&e, Some(axis))?;
        self.divide(&e, &self.spread_last(&total, logits.shape())?)
    }

    /// Softmax over the last axis, shifted by the maximum for stability.
    ///
    /// Recorded as one node with the closed-form gradient
    /// `y ⊙ (dy − Σ(dy ⊙ y))`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for a scalar or empty last axis,
    /// [`Error::UnsupportedType`] for boolean input.
    pub fn softmax(&self, logits: &NDArray) -> Result<NDArray> {
        if logits.rank() == 0 || logits.size() == 0 {
            return Err(Error::shape("softmax", logits.shape(), &[]));
        }
        let y = self.paused(|| self.scope(|_| self.softmax_forward(logits)))?;
        self.record(|| {
            KernelNode::new(
                "softmax",
                vec![("logits", logits.clone())],
                KernelArgs::None,
                y.clone(),
                |dy, y| {
                    let (dy, y) = (dy.clone(), y.clone());
                    InputGradients::new().with("logits", move |m| {
                        let weighted = m.multiply(&dy, &y)?;
                        let total = m.sum(&weighted, Some(y.rank() - 1))?;
                        let centered = m.subtract(&dy, &m.spread_last(&total, y.shape())?)?;
                        m.multiply(&y, &centered)
                    })
                },
            )
        })?;
        Ok(y)
    }

    /// `log(softmax(logits))` over the last axis, composed from recorded
    /// primitives. The shift by the maximum is treated as a constant, which
    /// leaves the gradient unchanged.
    ///
    /// # Errors
    ///
    /// Same as [`softmax`](Self::softmax).
    pub fn log_softmax(&self, logits: &NDArray) -> Result<NDArray> {
        if logits.rank() == 0 || logits.size() == 0 {
            return Err(Error::shape("log_softmax", logits.shape(), &[]));
        }
        let axis = logits.rank() - 1;
        let peak = self.max(logits, Some(axis))?;
        let shifted = self.subtract(logits, &self.spread_last(&peak, logits.shape())?)?;
        let total = self.sum(&self.exp(&shifted)?, Some(axis))?;
        let log_total = self.log(&total)?;
        self.subtract(&shifted, &self.spread_last(&log_total, logits.shape())?)
    }

    /// Whether `a` and `b` peak at the same position along the last axis,
    /// as a `Bool` array of the reduced shape.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn arg_max_equals(&self, a: &NDArray, b: &NDArray) -> Result<NDArray> {
        if a.shape() != b.shape() {
            return Err(Error::shape("arg_max_equals", a.shape(), b.shape()));
        }
        let (ia, ib) = (self.arg_max(a)?, self.arg_max(b)?);
        let data = ia.handle().with_host(|ia| {
            ib.handle().with_host(|ib| {
                ia.iter()
                    .zip(ib)
                    .map(|(x, y)| if x == y { 1.0 } else { 0.0 })
                    .collect::<Vec<f32>>()
            })
        })??;
        let out = self.array_of(ia.shape().to_vec(), DType::Bool, data)?;
        self.dispose(&ia)?;
        self.dispose(&ib)?;
        Ok(out)
    }

    /// Rows of `depth` zeros with a one at each index.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] for an index outside `[0, depth)`.
    pub fn one_hot(&self, indices: &NDArray, depth: usize) -> Result<NDArray> {
        self.one_hot_with(indices, depth, 1.0, 0.0)
    }

    /// Like [`one_hot`](Self::one_hot) with custom on and off values.
    ///
    /// # Errors
    ///
    /// Same as [`one_hot`](Self::one_hot).
    pub fn one_hot_with(&self, indices: &NDArray, depth: usize, on: f32, off: f32) -> Result<NDArray> {
        Ok(self.adopt(self.backend.one_hot(indices, depth, on, off)?))
    }

    /// Draws `num_samples` category indices from each row of `probs`.
    ///
    /// `probs` only needs to be proportional to a distribution; it is
    /// renormalised before sampling. Draws come from the context's random
    /// generator, so a [`seeded`](Self::seeded) context is reproducible.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDistribution`] for negative or non-finite weights or
    /// a zero total.
    pub fn multinomial(&self, probs: &NDArray, num_samples: usize) -> Result<NDArray> {
        let out = {
            let mut rng = self.rng();
            self.backend.multinomial(probs, num_samples, &mut *rng)?
        };
        Ok(self.adopt(out))
    }

    /// One step of a basic LSTM cell.
    ///
    /// `kernel` is `[input + units, 4 · units]` and `bias` is `[4 · units]`,
    /// with gate blocks ordered input, candidate, forget, output. `data` is
    /// `[1, input]`, `c` and `h` are `[1, units]`.
    ///
    /// ```text
    /// c' = c ⊙ σ(f + forget_bias) + σ(i) ⊙ tanh(j)
    /// h' = tanh(c') ⊙ σ(o)
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the operands do not line up.
    pub fn basic_lstm_cell(
        &self,
        forget_bias: &NDArray,
        kernel: &NDArray,
        bias: &NDArray,
        data: &NDArray,
        c: &NDArray,
        h: &NDArray,
    ) -> Result<(NDArray, NDArray)> {
        let units = h.shape().last().copied().unwrap_or(0);
        let inputs = data.shape().last().copied().unwrap_or(0);
        if kernel.shape() != [inputs + units, 4 * units] {
            return Err(Error::shape("basic_lstm_cell", &[inputs + units, 4 * units], kernel.shape()));
        }
        if bias.shape() != [4 * units] {
            return Err(Error::shape("basic_lstm_cell", &[4 * units], bias.shape()));
        }

        let combined = self.concat(data, h, 1)?;
        let weighted = self.matmul(&combined, kernel)?;
        let res = self.add(&weighted, bias)?;

        let gate = |k: usize| self.slice(&res, &[0, k * units], &[1, units]);
        let (i, j, f, o) = (gate(0)?, gate(1)?, gate(2)?, gate(3)?);

        let forget = self.sigmoid(&self.add(&f, forget_bias)?)?;
        let retained = self.multiply(c, &forget)?;
        let written = self.multiply(&self.sigmoid(&i)?, &self.tanh(&j)?)?;
        let new_c = self.add(&retained, &written)?;
        let new_h = self.multiply(&self.tanh(&new_c)?, &self.sigmoid(&o)?)?;
        Ok((new_c, new_h))
    }

    /// Runs a stack of LSTM cells for one step. Layer `k` reads the new
    /// hidden state of layer `k - 1`; the first layer reads `data`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the state does not have one entry per
    /// cell, or any error of [`basic_lstm_cell`](Self::basic_lstm_cell).
    pub fn multi_rnn_cell(&self, cells: &[LstmCell], data: &NDArray, state: &LstmState) -> Result<LstmState> {
        if state.c.len() != cells.len() || state.h.len() != cells.len() {
            return Err(Error::shape(
                "multi_rnn_cell",
                &[cells.len()],
                &[state.c.len(), state.h.len()],
            ));
        }
        let mut next = LstmState::default();
        let mut input = data.clone();
        for (k, cell) in cells.iter().enumerate() {
            let (c, h) = cell.step(self, &input, &state.c[k], &state.h[k])?;
            input = h.clone();
            next.c.push(c);
            next.h.push(h);
        }
        Ok(next)
    }
}

/// Weights of one LSTM layer.
#[derive(Debug, Clone)]
pub struct LstmCell {
    /// `[input + units, 4 · units]`
    pub kernel: NDArray,
    /// `[4 · units]`
    pub bias: NDArray,
    /// Scalar added to the forget gate before its sigmoid.
    pub forget_bias: NDArray,
}

impl LstmCell {
    /// Number of hidden units.
    #[must_use]
    pub fn units(&self) -> usize {
        self.bias.size() / 4
    }

    /// One step of this cell; see [`Math::basic_lstm_cell`].
    ///
    /// # Errors
    ///
    /// Same as [`Math::basic_lstm_cell`].
    pub fn step(&self, math: &Math, data: &NDArray, c: &NDArray, h: &NDArray) -> Result<(NDArray, NDArray)> {
        math.basic_lstm_cell(&self.forget_bias, &self.kernel, &self.bias, data, c, h)
    }
}

/// Cell and hidden state of every layer of a stacked LSTM.
#[derive(Debug, Clone, Default)]
pub struct LstmState {
    /// Cell state per layer.
    pub c: Vec<NDArray>,
    /// Hidden state per layer.
    pub h: Vec<NDArray>,
}

impl LstmState {
    /// Zero state for layers of the given widths, allocated through `math`.
    #[must_use]
    pub fn zeros(math: &Math, units: &[usize]) -> Self {
        Self {
            c: units.iter().map(|&u| math.zeros(vec![1, u])).collect(),
            h: units.iter().map(|&u| math.zeros(vec![1, u])).collect(),
        }
    }

    /// Every array of the state.
    pub fn arrays(&self) -> impl Iterator<Item = &NDArray> {
        self.c.iter().chain(&self.h)
    }
}

impl Keep for LstmState {
    fn keep(&self, scope: &ScopeGuard<'_>) -> Result<()> {
        self.arrays().try_for_each(|x| scope.keep(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;

    #[test]
    fn softmax_rows_sum_to_one() {
        let math = Math::cpu();
        let y = math.softmax(&array!([[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]])).unwrap();
        let d = y.data_sync().unwrap();
        assert!((d[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((d[3] - 1.0 / 3.0).abs() < 1e-6);
        assert!(d[2] > d[1] && d[1] > d[0]);
    }

    #[test]
    fn softmax_records_one_node() {
        let math = Math::cpu();
        math.start_tape().unwrap();
        let _ = math.softmax(&array!([1.0, 2.0])).unwrap();
        assert_eq!(math.finish_tape().unwrap().len(), 1);
    }

    #[test]
    fn log_softmax_matches_log_of_softmax() {
        let math = Math::cpu();
        let logits = array!([[0.5, -1.0, 2.0]]);
        let direct = math.log_softmax(&logits).unwrap().data_sync().unwrap();
        let composed = math.log(&math.softmax(&logits).unwrap()).unwrap().data_sync().unwrap();
        for (a, b) in direct.iter().zip(&composed) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn arg_max_equals_compares_rows() {
        let math = Math::cpu();
        let a = array!([[0.1, 0.9], [0.8, 0.2]]);
        let b = array!([[0.0, 1.0], [0.0, 1.0]]);
        let eq = math.arg_max_equals(&a, &b).unwrap();
        assert_eq!(eq.dtype(), DType::Bool);
        assert_eq!(eq.data_sync().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn zero_lstm_with_zero_weights_stays_zero() {
        let math = Math::cpu();
        let cell = LstmCell {
            kernel: math.zeros(vec![3, 8]),
            bias: math.zeros(vec![8]),
            forget_bias: math.scalar(1.0),
        };
        let state = LstmState::zeros(&math, &[2]);
        let next = math
            .multi_rnn_cell(&[cell], &array!([[1.0]]), &state)
            .unwrap();
        assert_eq!(next.c[0].data_sync().unwrap(), vec![0.0, 0.0]);
        assert_eq!(next.h[0].shape(), &[1, 2]);
    }
}
